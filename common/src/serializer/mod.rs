mod reader;
mod writer;

pub use reader::{Reader, ReaderError};
pub use writer::Writer;

// All wire integers are big-endian; every packet type of the replication
// protocol implements this trait so both sides agree byte-for-byte.
pub trait Serializer: Sized {
    fn write(&self, writer: &mut Writer);

    fn read(reader: &mut Reader) -> Result<Self, ReaderError>;

    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        self.write(&mut writer);
        writer.into_bytes()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, ReaderError> {
        let mut reader = Reader::new(bytes);
        let value = Self::read(&mut reader)?;
        if reader.size() != 0 {
            return Err(ReaderError::TrailingBytes(reader.size()));
        }
        Ok(value)
    }

    // Serialized size in bytes
    fn size(&self) -> usize {
        let mut writer = Writer::new();
        self.write(&mut writer);
        writer.total_write()
    }
}

impl Serializer for u8 {
    fn write(&self, writer: &mut Writer) {
        writer.write_u8(*self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_u8()
    }

    fn size(&self) -> usize {
        1
    }
}

impl Serializer for u16 {
    fn write(&self, writer: &mut Writer) {
        writer.write_u16(*self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_u16()
    }

    fn size(&self) -> usize {
        2
    }
}

impl Serializer for u32 {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(*self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_u32()
    }

    fn size(&self) -> usize {
        4
    }
}

impl Serializer for u64 {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(*self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_u64()
    }

    fn size(&self) -> usize {
        8
    }
}

impl Serializer for bool {
    fn write(&self, writer: &mut Writer) {
        writer.write_bool(*self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_bool()
    }

    fn size(&self) -> usize {
        1
    }
}

impl<const N: usize> Serializer for [u8; N] {
    fn write(&self, writer: &mut Writer) {
        writer.write_bytes(self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let bytes = reader.read_bytes_ref(N)?;
        let mut value = [0u8; N];
        value.copy_from_slice(bytes);
        Ok(value)
    }

    fn size(&self) -> usize {
        N
    }
}

impl<T: Serializer> Serializer for Option<T> {
    fn write(&self, writer: &mut Writer) {
        match self {
            Some(value) => {
                writer.write_bool(true);
                value.write(writer);
            }
            None => writer.write_bool(false),
        }
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        if reader.read_bool()? {
            Ok(Some(T::read(reader)?))
        } else {
            Ok(None)
        }
    }

    fn size(&self) -> usize {
        match self {
            Some(value) => 1 + value.size(),
            None => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_integers() {
        let mut writer = Writer::new();
        writer.write_u8(0x7f);
        writer.write_u16(0x835a);
        writer.write_u32(0x8374_0267);
        writer.write_u64(u64::MAX - 1);

        let bytes = writer.into_bytes();
        assert_eq!(bytes.len(), 1 + 2 + 4 + 8);

        let mut reader = Reader::new(&bytes);
        assert_eq!(reader.read_u8().unwrap(), 0x7f);
        assert_eq!(reader.read_u16().unwrap(), 0x835a);
        assert_eq!(reader.read_u32().unwrap(), 0x8374_0267);
        assert_eq!(reader.read_u64().unwrap(), u64::MAX - 1);
        assert_eq!(reader.size(), 0);
    }

    #[test]
    fn test_big_endian_layout() {
        let mut writer = Writer::new();
        writer.write_u32(0x8374_026B);
        assert_eq!(writer.as_bytes(), &[0x83, 0x74, 0x02, 0x6B]);
    }

    #[test]
    fn test_from_bytes_rejects_trailing() {
        let bytes = [0u8; 5];
        assert!(matches!(
            u32::from_bytes(&bytes),
            Err(ReaderError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_option_round_trip() {
        let value: Option<u64> = Some(42);
        let bytes = value.to_bytes();
        assert_eq!(Option::<u64>::from_bytes(&bytes).unwrap(), Some(42));

        let none: Option<u64> = None;
        assert_eq!(
            Option::<u64>::from_bytes(&none.to_bytes()).unwrap(),
            None
        );
    }
}
