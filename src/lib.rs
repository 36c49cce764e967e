pub mod clock;
pub mod config;
pub mod fabric;
pub mod mgmtbus;
pub mod planner;
pub mod st;
pub mod storage_error;
pub mod trace;
pub mod uuid_bytes;

pub use config::MineMeldConfig;
pub use fabric::{Fabric, FabricConfig, FabricError};
pub use storage_error::StorageError;

#[cfg(test)]
pub mod tests;
