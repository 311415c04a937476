use crate::config::SECTOR_SIZE;
use async_trait::async_trait;
use log::debug;
use std::{io, path::Path, sync::Arc};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O beyond end of device: sector {sector} + {size} bytes > capacity {capacity} sectors")]
    OutOfRange { sector: u64, size: u32, capacity: u64 },
    #[error("Unaligned I/O: sector {0}, {1} bytes")]
    Unaligned(u64, u32),
    #[error("Discard not supported by backing device")]
    DiscardUnsupported,
    #[error("Flush not supported by backing device")]
    FlushUnsupported,
    #[error(transparent)]
    Io(#[from] io::Error),
}

// The local block device behind a replicated volume. The replication
// engine only ever sees this trait; the real metadata store and activity
// log live behind their own collaborators.
#[async_trait]
pub trait BackingDevice: Send + Sync {
    // Capacity in 512-byte sectors
    fn capacity_sectors(&self) -> u64;

    fn supports_discard(&self) -> bool {
        false
    }

    async fn read_at(&self, sector: u64, buf: &mut [u8]) -> Result<(), StorageError>;

    async fn write_at(&self, sector: u64, data: &[u8]) -> Result<(), StorageError>;

    async fn flush(&self) -> Result<(), StorageError>;

    async fn discard(&self, sector: u64, size: u32) -> Result<(), StorageError>;

    async fn zeroout(&self, sector: u64, size: u32) -> Result<(), StorageError>;
}

pub fn check_range(
    sector: u64,
    size: u32,
    capacity: u64,
) -> Result<(), StorageError> {
    if size % SECTOR_SIZE != 0 {
        return Err(StorageError::Unaligned(sector, size));
    }
    let sectors = (size / SECTOR_SIZE) as u64;
    if sector + sectors > capacity {
        return Err(StorageError::OutOfRange { sector, size, capacity });
    }
    Ok(())
}

// Memory-backed volume, used by tests and by diskless configurations
pub struct MemDevice {
    capacity_sectors: u64,
    supports_discard: bool,
    data: Mutex<Vec<u8>>,
}

impl MemDevice {
    pub fn new(capacity_sectors: u64) -> Self {
        Self {
            capacity_sectors,
            supports_discard: true,
            data: Mutex::new(vec![0u8; (capacity_sectors * SECTOR_SIZE as u64) as usize]),
        }
    }

    pub fn without_discard(capacity_sectors: u64) -> Self {
        let mut device = Self::new(capacity_sectors);
        device.supports_discard = false;
        device
    }

    pub async fn snapshot(&self) -> Vec<u8> {
        self.data.lock().await.clone()
    }
}

#[async_trait]
impl BackingDevice for MemDevice {
    fn capacity_sectors(&self) -> u64 {
        self.capacity_sectors
    }

    fn supports_discard(&self) -> bool {
        self.supports_discard
    }

    async fn read_at(&self, sector: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        check_range(sector, buf.len() as u32, self.capacity_sectors)?;
        let data = self.data.lock().await;
        let offset = (sector * SECTOR_SIZE as u64) as usize;
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
        Ok(())
    }

    async fn write_at(&self, sector: u64, src: &[u8]) -> Result<(), StorageError> {
        check_range(sector, src.len() as u32, self.capacity_sectors)?;
        let mut data = self.data.lock().await;
        let offset = (sector * SECTOR_SIZE as u64) as usize;
        data[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    async fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn discard(&self, sector: u64, size: u32) -> Result<(), StorageError> {
        if !self.supports_discard {
            return Err(StorageError::DiscardUnsupported);
        }
        self.zeroout(sector, size).await
    }

    async fn zeroout(&self, sector: u64, size: u32) -> Result<(), StorageError> {
        check_range(sector, size, self.capacity_sectors)?;
        let mut data = self.data.lock().await;
        let offset = (sector * SECTOR_SIZE as u64) as usize;
        data[offset..offset + size as usize].fill(0);
        Ok(())
    }
}

// File-backed volume
pub struct FileDevice {
    capacity_sectors: u64,
    file: Mutex<tokio::fs::File>,
}

impl FileDevice {
    pub async fn open(path: &Path, capacity_sectors: u64) -> Result<Self, StorageError> {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .await?;
        file.set_len(capacity_sectors * SECTOR_SIZE as u64).await?;
        debug!(
            "opened backing file {} with {} sectors",
            path.display(),
            capacity_sectors
        );
        Ok(Self {
            capacity_sectors,
            file: Mutex::new(file),
        })
    }
}

#[async_trait]
impl BackingDevice for FileDevice {
    fn capacity_sectors(&self) -> u64 {
        self.capacity_sectors
    }

    async fn read_at(&self, sector: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};
        check_range(sector, buf.len() as u32, self.capacity_sectors)?;
        let mut file = self.file.lock().await;
        file.seek(io::SeekFrom::Start(sector * SECTOR_SIZE as u64))
            .await?;
        file.read_exact(buf).await?;
        Ok(())
    }

    async fn write_at(&self, sector: u64, data: &[u8]) -> Result<(), StorageError> {
        use tokio::io::{AsyncSeekExt, AsyncWriteExt};
        check_range(sector, data.len() as u32, self.capacity_sectors)?;
        let mut file = self.file.lock().await;
        file.seek(io::SeekFrom::Start(sector * SECTOR_SIZE as u64))
            .await?;
        file.write_all(data).await?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), StorageError> {
        let file = self.file.lock().await;
        file.sync_data().await?;
        Ok(())
    }

    async fn discard(&self, _sector: u64, _size: u32) -> Result<(), StorageError> {
        Err(StorageError::DiscardUnsupported)
    }

    async fn zeroout(&self, sector: u64, size: u32) -> Result<(), StorageError> {
        let zeroes = vec![0u8; size as usize];
        self.write_at(sector, &zeroes).await
    }
}

pub type SharedDevice = Arc<dyn BackingDevice>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mem_device_round_trip() {
        let device = MemDevice::new(64);
        let data = vec![0xabu8; 1024];
        device.write_at(4, &data).await.unwrap();

        let mut buf = vec![0u8; 1024];
        device.read_at(4, &mut buf).await.unwrap();
        assert_eq!(buf, data);
    }

    #[tokio::test]
    async fn test_mem_device_bounds() {
        let device = MemDevice::new(8);
        let data = vec![0u8; 1024];
        assert!(matches!(
            device.write_at(7, &data).await,
            Err(StorageError::OutOfRange { .. })
        ));
        assert!(matches!(
            device.write_at(0, &data[..100]).await,
            Err(StorageError::Unaligned(..))
        ));
    }

    #[tokio::test]
    async fn test_mem_device_zeroout() {
        let device = MemDevice::new(64);
        device.write_at(0, &vec![0xffu8; 4096]).await.unwrap();
        device.zeroout(2, 1024).await.unwrap();

        let mut buf = vec![0u8; 4096];
        device.read_at(0, &mut buf).await.unwrap();
        assert!(buf[..1024].iter().all(|b| *b == 0xff));
        assert!(buf[1024..2048].iter().all(|b| *b == 0));
        assert!(buf[2048..].iter().all(|b| *b == 0xff));
    }

    #[tokio::test]
    async fn test_file_device_round_trip() {
        let dir = tempdir::TempDir::new("replica-storage").unwrap();
        let path = dir.path().join("vol0.img");
        let device = FileDevice::open(&path, 128).await.unwrap();

        let data = vec![0x5au8; 2048];
        device.write_at(16, &data).await.unwrap();
        device.flush().await.unwrap();

        let mut buf = vec![0u8; 2048];
        device.read_at(16, &mut buf).await.unwrap();
        assert_eq!(buf, data);
    }
}
