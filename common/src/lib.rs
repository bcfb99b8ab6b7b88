pub mod error;
pub mod registry;
pub mod shared_kv;
pub mod storage;
pub mod utils;
