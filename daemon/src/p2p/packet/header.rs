use crate::{
    config::{MAGIC_100, MAGIC_80, MAGIC_95},
    p2p::error::P2pError,
};

// Decoded packet header, independent of the wire variant that carried it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    pub cmd: u16,
    pub size: u32,
    pub vnr: i16,
}

// Header size on the wire for an agreed protocol version
pub fn header_size(agreed_pro_version: u32) -> usize {
    if agreed_pro_version >= 100 {
        16
    } else {
        8
    }
}

// v80: magic be32 | cmd be16 | length be16
// v95: magic be16 | cmd be16 | length be32
// v100: magic be32 | volume be16 | cmd be16 | length be32 | pad be32
pub fn encode_header(agreed_pro_version: u32, vnr: i16, cmd: u16, length: u32) -> Vec<u8> {
    let mut header = Vec::with_capacity(header_size(agreed_pro_version));
    if agreed_pro_version >= 100 {
        header.extend_from_slice(&MAGIC_100.to_be_bytes());
        header.extend_from_slice(&(vnr as u16).to_be_bytes());
        header.extend_from_slice(&cmd.to_be_bytes());
        header.extend_from_slice(&length.to_be_bytes());
        header.extend_from_slice(&0u32.to_be_bytes());
    } else if agreed_pro_version >= 95 {
        header.extend_from_slice(&MAGIC_95.to_be_bytes());
        header.extend_from_slice(&cmd.to_be_bytes());
        header.extend_from_slice(&length.to_be_bytes());
    } else {
        debug_assert!(length <= u16::MAX as u32);
        header.extend_from_slice(&MAGIC_80.to_be_bytes());
        header.extend_from_slice(&cmd.to_be_bytes());
        header.extend_from_slice(&(length as u16).to_be_bytes());
    }
    header
}

pub fn decode_header(agreed_pro_version: u32, header: &[u8]) -> Result<PacketInfo, P2pError> {
    debug_assert_eq!(header.len(), header_size(agreed_pro_version));
    if agreed_pro_version >= 100 {
        let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        if magic != MAGIC_100 {
            return Err(P2pError::InvalidMagic(magic, agreed_pro_version));
        }
        let pad = u32::from_be_bytes([header[12], header[13], header[14], header[15]]);
        if pad != 0 {
            return Err(P2pError::InvalidHeaderPadding);
        }
        Ok(PacketInfo {
            vnr: i16::from_be_bytes([header[4], header[5]]),
            cmd: u16::from_be_bytes([header[6], header[7]]),
            size: u32::from_be_bytes([header[8], header[9], header[10], header[11]]),
        })
    } else if agreed_pro_version >= 95 {
        let magic = u16::from_be_bytes([header[0], header[1]]);
        if magic != MAGIC_95 {
            return Err(P2pError::InvalidMagic(magic as u32, agreed_pro_version));
        }
        Ok(PacketInfo {
            cmd: u16::from_be_bytes([header[2], header[3]]),
            size: u32::from_be_bytes([header[4], header[5], header[6], header[7]]),
            vnr: 0,
        })
    } else {
        let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        if magic != MAGIC_80 {
            return Err(P2pError::InvalidMagic(magic, agreed_pro_version));
        }
        Ok(PacketInfo {
            cmd: u16::from_be_bytes([header[4], header[5]]),
            size: u16::from_be_bytes([header[6], header[7]]) as u32,
            vnr: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v100_round_trip() {
        let header = encode_header(110, 3, 0x16, 24);
        assert_eq!(header.len(), 16);
        let pi = decode_header(110, &header).unwrap();
        assert_eq!(pi.vnr, 3);
        assert_eq!(pi.cmd, 0x16);
        assert_eq!(pi.size, 24);
    }

    #[test]
    fn test_v95_round_trip() {
        let header = encode_header(96, 0, 0x03, 8);
        assert_eq!(header.len(), 8);
        let pi = decode_header(96, &header).unwrap();
        assert_eq!(pi.cmd, 0x03);
        assert_eq!(pi.size, 8);
        assert_eq!(pi.vnr, 0);
    }

    #[test]
    fn test_v80_round_trip() {
        let header = encode_header(86, 0, 0x0c, 48);
        assert_eq!(header.len(), 8);
        let pi = decode_header(86, &header).unwrap();
        assert_eq!(pi.cmd, 0x0c);
        assert_eq!(pi.size, 48);
    }

    #[test]
    fn test_bad_magic() {
        let mut header = encode_header(110, 0, 0x00, 0);
        header[0] ^= 0xff;
        assert!(matches!(
            decode_header(110, &header),
            Err(P2pError::InvalidMagic(..))
        ));
    }

    #[test]
    fn test_nonzero_padding() {
        let mut header = encode_header(110, 0, 0x00, 0);
        header[15] = 1;
        assert!(matches!(
            decode_header(110, &header),
            Err(P2pError::InvalidHeaderPadding)
        ));
    }

    #[test]
    fn test_negative_volume() {
        let header = encode_header(110, -1, 0x2e, 36);
        let pi = decode_header(110, &header).unwrap();
        assert_eq!(pi.vnr, -1);
    }
}
