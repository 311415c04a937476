pub mod bitmap;
pub mod storage;
pub mod uuids;
