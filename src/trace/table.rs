use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::Arc,
};

use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use crate::storage_error::StorageError;

const LOG_TABLE: TableDefinition<&str, &str> = TableDefinition::new("log");
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");
const MAX_COUNTER: &str = "max_counter";

pub const DAY_MS: u64 = 86_400_000;

/// Table name for the day containing `timestamp` (ms): 16 hex digits of the
/// day start in seconds.
pub fn day_name(timestamp: u64) -> String {
    format!("{:016x}", day_of(timestamp) / 1000)
}

/// Start of the day containing `timestamp`, in ms.
pub fn day_of(timestamp: u64) -> u64 {
    timestamp - timestamp % DAY_MS
}

pub fn record_key(timestamp: u64, counter: u64) -> String {
    format!("{timestamp:016x}{counter:016x}")
}

pub fn parse_record_key(key: &str) -> Result<(u64, u64), StorageError> {
    let bad = || StorageError::Codec(format!("bad trace key {key:?}"));
    if key.len() != 32 {
        return Err(bad());
    }
    let ts = u64::from_str_radix(&key[..16], 16).map_err(|_| bad())?;
    let counter = u64::from_str_radix(&key[16..], 16).map_err(|_| bad())?;
    Ok((ts, counter))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub timestamp: u64,
    pub counter: u64,
    pub log: String,
}

/// One day of trace records in its own redb file.
pub struct Table {
    name: String,
    path: PathBuf,
    db: Database,
}

impl Table {
    pub fn path_for(dir: &Path, name: &str) -> PathBuf {
        dir.join(name)
    }

    pub fn exists(dir: &Path, name: &str) -> bool {
        Self::path_for(dir, name).exists()
    }

    /// `TableNotFound` when the file is missing and `create_if_missing` is off.
    pub fn open(dir: &Path, name: &str, create_if_missing: bool) -> Result<Self, StorageError> {
        let path = Self::path_for(dir, name);
        let db = if path.exists() {
            Database::open(&path)?
        } else if create_if_missing {
            std::fs::create_dir_all(dir)?;
            let db = Database::create(&path)?;
            let txn = db.begin_write()?;
            txn.open_table(LOG_TABLE)?;
            txn.open_table(META_TABLE)?;
            txn.commit()?;
            db
        } else {
            return Err(StorageError::TableNotFound(name.to_string()));
        };
        debug!(%name, "trace: table opened");
        Ok(Self {
            name: name.to_string(),
            path,
            db,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_counter(&self) -> Result<u64, StorageError> {
        let txn = self.db.begin_read()?;
        let meta = txn.open_table(META_TABLE)?;
        Ok(meta.get(MAX_COUNTER)?.map(|v| v.value()).unwrap_or(0))
    }

    /// Store `log` and bump the per-table counter in one transaction.
    /// Returns the counter assigned to the record.
    pub fn put(&self, timestamp: u64, log: &str) -> Result<u64, StorageError> {
        let txn = self.db.begin_write()?;
        let counter = {
            let mut meta = txn.open_table(META_TABLE)?;
            let current = meta.get(MAX_COUNTER)?.map(|v| v.value()).unwrap_or(0);
            let next = current
                .checked_add(1)
                .ok_or_else(|| StorageError::CorruptCounter(self.name.clone()))?;
            meta.insert(MAX_COUNTER, next)?;
            next
        };
        {
            let mut t = txn.open_table(LOG_TABLE)?;
            t.insert(record_key(timestamp, counter).as_str(), log)?;
        }
        txn.commit()?;
        Ok(counter)
    }

    /// Descending scan from `(timestamp, counter)` inclusive.
    pub fn backwards(self: &Arc<Self>, timestamp: u64, counter: u64, batch: usize) -> Backwards {
        Backwards {
            table: self.clone(),
            upper: Some(record_key(timestamp, counter)),
            inclusive: true,
            batch: batch.max(1),
            buf: VecDeque::new(),
        }
    }

    fn read_page(
        &self,
        upper: &str,
        inclusive: bool,
        batch: usize,
    ) -> Result<Vec<LogRecord>, StorageError> {
        let txn = self.db.begin_read()?;
        let t = txn.open_table(LOG_TABLE)?;
        let range = if inclusive {
            t.range::<&str>(..=upper)?
        } else {
            t.range::<&str>(..upper)?
        };
        let mut out = Vec::with_capacity(batch);
        for item in range.rev().take(batch) {
            let (k, v) = item?;
            let (timestamp, counter) = parse_record_key(k.value())?;
            out.push(LogRecord {
                timestamp,
                counter,
                log: v.value().to_string(),
            });
        }
        Ok(out)
    }
}

/// Lazy descending iterator over one table; reads `batch` records at a time.
pub struct Backwards {
    table: Arc<Table>,
    upper: Option<String>,
    inclusive: bool,
    batch: usize,
    buf: VecDeque<LogRecord>,
}

impl Iterator for Backwards {
    type Item = Result<LogRecord, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(r) = self.buf.pop_front() {
            return Some(Ok(r));
        }
        let upper = self.upper.take()?;
        match self.table.read_page(&upper, self.inclusive, self.batch) {
            Ok(page) => {
                if page.len() == self.batch {
                    if let Some(last) = page.last() {
                        self.upper = Some(record_key(last.timestamp, last.counter));
                        self.inclusive = false;
                    }
                }
                self.buf.extend(page);
                self.buf.pop_front().map(Ok)
            }
            Err(e) => Some(Err(e)),
        }
    }
}
