//! Day-partitioned trace log storage and the query service on top of it.

pub mod processor;
pub mod query;
pub mod store;
pub mod table;
pub mod writer;

pub use processor::{QueryConfig, QueryProcessor, TRACED_ADDRESS};
pub use query::{Query, QueryError, QueryFilter, QueryParams};
pub use store::{BackwardScan, Priority, ScanItem, Store, StoreConfig, TableLease};
pub use table::{LogRecord, Table};
pub use writer::{LOG_TOPIC, LogWriter};
