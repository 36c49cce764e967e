use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::{Arc, Mutex},
};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::{
    storage_error::StorageError,
    trace::table::{Backwards, LogRecord, Table, day_name, day_of},
};

/// Holder name used for writes.
pub const WRITER: &str = "writer";

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Tables open at the same time.
    pub max_tables: usize,
    /// Records read per table access while scanning.
    pub read_batch: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("traced"),
            max_tables: 5,
            read_batch: 256,
        }
    }
}

/// Queue order for table slots: writers first, then FIFO.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Write,
    Read,
}

struct OpenTable {
    table: Arc<Table>,
    refs: HashMap<String, usize>,
    last_used: u64,
}

impl OpenTable {
    fn ref_count(&self) -> usize {
        self.refs.values().sum()
    }
}

#[derive(Default)]
struct StoreState {
    tables: HashMap<String, OpenTable>,
    waiters: BTreeMap<(Priority, u64), oneshot::Sender<()>>,
    tick: u64,
    seq: u64,
}

impl StoreState {
    /// Close the least recently used table nobody references.
    fn evict_lru(&mut self) -> bool {
        let victim = self
            .tables
            .iter()
            .filter(|(_, t)| t.ref_count() == 0)
            .min_by_key(|(_, t)| t.last_used)
            .map(|(name, _)| name.clone());
        match victim {
            Some(name) => {
                self.tables.remove(&name);
                debug!(%name, "trace: table evicted");
                true
            }
            None => false,
        }
    }

    fn wake_one(&mut self) {
        while let Some((_, tx)) = self.waiters.pop_first() {
            if tx.send(()).is_ok() {
                return;
            }
        }
    }
}

/// Day-partitioned trace store with a bounded set of open tables.
pub struct Store {
    cfg: StoreConfig,
    state: Mutex<StoreState>,
}

impl Store {
    pub fn new(cfg: StoreConfig) -> Arc<Self> {
        info!(path = %cfg.path.display(), max_tables = cfg.max_tables, "trace: store ready");
        Arc::new(Self {
            cfg,
            state: Mutex::new(StoreState::default()),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.cfg
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Reference `name` on behalf of `holder`, opening it if needed. When the
    /// table budget is exhausted and every open table is referenced, waits in
    /// `priority` order for a release.
    pub async fn acquire(
        self: &Arc<Self>,
        name: &str,
        holder: &str,
        priority: Priority,
        create_if_missing: bool,
    ) -> Result<TableLease, StorageError> {
        loop {
            let wait = {
                let mut st = self.lock();
                st.tick += 1;
                let tick = st.tick;

                if let Some(open) = st.tables.get_mut(name) {
                    *open.refs.entry(holder.to_string()).or_default() += 1;
                    open.last_used = tick;
                    return Ok(self.lease(name, holder, open.table.clone()));
                }

                if !create_if_missing && !Table::exists(&self.cfg.path, name) {
                    return Err(StorageError::TableNotFound(name.to_string()));
                }

                if st.tables.len() >= self.cfg.max_tables.max(1) && !st.evict_lru() {
                    st.seq += 1;
                    let seq = st.seq;
                    let (tx, rx) = oneshot::channel();
                    st.waiters.insert((priority, seq), tx);
                    debug!(%name, %holder, ?priority, "trace: waiting for a table slot");
                    Some(rx)
                } else {
                    let table = Arc::new(Table::open(&self.cfg.path, name, create_if_missing)?);
                    st.tables.insert(
                        name.to_string(),
                        OpenTable {
                            table: table.clone(),
                            refs: HashMap::from([(holder.to_string(), 1)]),
                            last_used: tick,
                        },
                    );
                    return Ok(self.lease(name, holder, table));
                }
            };
            if let Some(rx) = wait {
                // A dropped sender just means retry.
                let _ = rx.await;
            }
        }
    }

    fn lease(self: &Arc<Self>, name: &str, holder: &str, table: Arc<Table>) -> TableLease {
        TableLease {
            store: self.clone(),
            name: name.to_string(),
            holder: holder.to_string(),
            table,
        }
    }

    fn release(&self, name: &str, holder: &str) {
        let mut st = self.lock();
        let Some(open) = st.tables.get_mut(name) else {
            return;
        };
        let Some(n) = open.refs.get_mut(holder) else {
            return;
        };
        *n -= 1;
        if *n == 0 {
            open.refs.remove(holder);
        }
        if open.ref_count() == 0 {
            st.wake_one();
        }
    }

    /// Drop every reference `holder` still has, on every table.
    pub fn release_all(&self, holder: &str) {
        let mut st = self.lock();
        let mut freed = 0;
        for open in st.tables.values_mut() {
            if open.refs.remove(holder).is_some() && open.ref_count() == 0 {
                freed += 1;
            }
        }
        if freed > 0 {
            debug!(%holder, freed, "trace: references released");
        }
        for _ in 0..freed {
            st.wake_one();
        }
    }

    /// Append one record to the table of its day.
    pub async fn write(self: &Arc<Self>, timestamp: u64, log: &str) -> Result<u64, StorageError> {
        let lease = self
            .acquire(&day_name(timestamp), WRITER, Priority::Write, true)
            .await?;
        lease.table().put(timestamp, log)
    }

    /// Records at or before `(timestamp, counter)`, newest first, across the
    /// days that have a table on disk.
    pub fn iterate_backwards(
        self: &Arc<Self>,
        holder: &str,
        timestamp: u64,
        counter: u64,
    ) -> Result<BackwardScan, StorageError> {
        let first = day_of(timestamp);
        let mut days: Vec<u64> = self
            .existing_days()?
            .into_iter()
            .filter(|d| *d <= first)
            .collect();
        days.reverse();
        debug!(%holder, days = days.len(), "trace: backward scan");
        Ok(BackwardScan {
            store: self.clone(),
            holder: holder.to_string(),
            start: (timestamp, counter),
            days: days.into_iter(),
            current: None,
            entered: 0,
            done: false,
        })
    }

    /// Day starts (ms) of every table on disk, ascending.
    pub fn existing_days(&self) -> Result<Vec<u64>, StorageError> {
        let entries = match std::fs::read_dir(&self.cfg.path) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut days = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.len() != 16 {
                continue;
            }
            if let Ok(secs) = u64::from_str_radix(name, 16) {
                days.push(secs * 1000);
            }
        }
        days.sort_unstable();
        Ok(days)
    }

    /// Live references to `name` across all holders.
    pub fn ref_count(&self, name: &str) -> usize {
        self.lock().tables.get(name).map_or(0, OpenTable::ref_count)
    }

    pub fn open_tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().tables.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Scoped table reference; released on drop.
pub struct TableLease {
    store: Arc<Store>,
    name: String,
    holder: String,
    table: Arc<Table>,
}

impl TableLease {
    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for TableLease {
    fn drop(&mut self) {
        self.store.release(&self.name, &self.holder);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScanItem {
    /// Scan moved on to the day starting at `timestamp` (ms).
    Progress { timestamp: u64 },
    Record(LogRecord),
}

/// Cross-day backward scan. One table is referenced at a time.
pub struct BackwardScan {
    store: Arc<Store>,
    holder: String,
    start: (u64, u64),
    days: std::vec::IntoIter<u64>,
    current: Option<(TableLease, Backwards)>,
    entered: usize,
    done: bool,
}

impl BackwardScan {
    pub async fn next(&mut self) -> Option<Result<ScanItem, StorageError>> {
        loop {
            if self.done {
                return None;
            }

            if let Some((_, rows)) = self.current.as_mut() {
                match rows.next() {
                    Some(Ok(r)) => return Some(Ok(ScanItem::Record(r))),
                    Some(Err(e)) => {
                        self.finish();
                        return Some(Err(e));
                    }
                    None => self.current = None,
                }
            }

            let Some(day) = self.days.next() else {
                self.finish();
                return None;
            };
            let (ts, counter) = if day == day_of(self.start.0) {
                self.start
            } else {
                (u64::MAX, u64::MAX)
            };
            match self
                .store
                .acquire(&day_name(day), &self.holder, Priority::Read, false)
                .await
            {
                Ok(lease) => {
                    let rows = lease
                        .table()
                        .backwards(ts, counter, self.store.cfg.read_batch);
                    self.current = Some((lease, rows));
                }
                // Removed since the scan started.
                Err(e) if e.is_table_not_found() => continue,
                Err(e) => {
                    warn!(holder = %self.holder, error = %e, "trace: scan failed");
                    self.finish();
                    return Some(Err(e));
                }
            }
            self.entered += 1;
            if self.entered > 1 {
                return Some(Ok(ScanItem::Progress { timestamp: day }));
            }
        }
    }

    fn finish(&mut self) {
        self.done = true;
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::trace::table::DAY_MS;
    use tempfile::tempdir;

    fn store(dir: &tempfile::TempDir, max_tables: usize) -> Arc<Store> {
        Store::new(StoreConfig {
            path: dir.path().to_path_buf(),
            max_tables,
            read_batch: 2,
        })
    }

    #[tokio::test]
    async fn evicts_least_recently_used_idle_table() {
        let dir = tempdir().unwrap();
        let s = store(&dir, 2);

        drop(s.acquire("a", "q", Priority::Read, true).await.unwrap());
        drop(s.acquire("b", "q", Priority::Read, true).await.unwrap());
        drop(s.acquire("a", "q", Priority::Read, true).await.unwrap());
        // b is now the LRU idle table.
        let _c = s.acquire("c", "q", Priority::Read, true).await.unwrap();
        assert_eq!(s.open_tables(), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn referenced_table_is_never_evicted() {
        let dir = tempdir().unwrap();
        let s = store(&dir, 2);

        let held = s.acquire("a", "q1", Priority::Read, true).await.unwrap();
        drop(s.acquire("b", "q2", Priority::Read, true).await.unwrap());
        let _c = s.acquire("c", "q2", Priority::Read, true).await.unwrap();

        assert_eq!(s.open_tables(), vec!["a", "c"]);
        assert_eq!(s.ref_count("a"), 1);
        drop(held);
        assert_eq!(s.ref_count("a"), 0);
    }

    #[tokio::test]
    async fn missing_table_is_not_created_for_readers() {
        let dir = tempdir().unwrap();
        let s = store(&dir, 1);
        let err = s.acquire("nope", "q", Priority::Read, false).await.err().unwrap();
        assert!(err.is_table_not_found());
        assert!(s.open_tables().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_resume_when_a_table_frees_up() {
        let dir = tempdir().unwrap();
        let s = store(&dir, 1);
        let held = s.acquire("a", "q1", Priority::Read, true).await.unwrap();

        let waiter = {
            let s = s.clone();
            tokio::spawn(async move {
                let lease = s.acquire("b", "q2", Priority::Read, true).await.unwrap();
                lease.name().to_string()
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(held);
        assert_eq!(waiter.await.unwrap(), "b");
        assert_eq!(s.open_tables(), vec!["b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_writer_is_served_before_earlier_reader() {
        let dir = tempdir().unwrap();
        let s = store(&dir, 1);
        let held = s.acquire("a", "q1", Priority::Read, true).await.unwrap();

        let reader = {
            let s = s.clone();
            tokio::spawn(async move { s.acquire("b", "q2", Priority::Read, true).await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let writer = {
            let s = s.clone();
            tokio::spawn(async move { s.acquire("c", WRITER, Priority::Write, true).await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reader.is_finished());
        assert!(!writer.is_finished());

        drop(held);
        let written = writer.await.unwrap();
        assert_eq!(written.name(), "c");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reader.is_finished());
        assert_eq!(s.open_tables(), vec!["c"]);

        drop(written);
        assert_eq!(reader.await.unwrap().name(), "b");
        assert_eq!(s.open_tables(), vec!["b"]);
    }

    #[tokio::test]
    async fn release_all_drops_every_reference_of_holder() {
        let dir = tempdir().unwrap();
        let s = store(&dir, 3);
        let l1 = s.acquire("a", "q", Priority::Read, true).await.unwrap();
        let l2 = s.acquire("a", "q", Priority::Read, true).await.unwrap();
        let l3 = s.acquire("b", "q", Priority::Read, true).await.unwrap();
        let other = s.acquire("b", "r", Priority::Read, true).await.unwrap();

        s.release_all("q");
        assert_eq!(s.ref_count("a"), 0);
        assert_eq!(s.ref_count("b"), 1);

        // Late lease drops are no-ops.
        drop((l1, l2, l3));
        assert_eq!(s.ref_count("b"), 1);
        drop(other);
        assert_eq!(s.ref_count("b"), 0);
    }

    #[tokio::test]
    async fn backward_scan_crosses_days_with_progress() {
        let dir = tempdir().unwrap();
        let s = store(&dir, 2);
        let day0 = 10 * DAY_MS;
        s.write(day0 + 1, "d0-a").await.unwrap();
        s.write(day0 + 2, "d0-b").await.unwrap();
        // The day in between has no table.
        s.write(day0 + 2 * DAY_MS + 5, "d2-a").await.unwrap();
        s.write(day0 + 2 * DAY_MS + 6, "d2-b").await.unwrap();
        s.write(day0 + 2 * DAY_MS + 7, "d2-c").await.unwrap();

        let mut scan = s
            .iterate_backwards("q", day0 + 2 * DAY_MS + 6, u64::MAX)
            .unwrap();
        let mut seen = Vec::new();
        while let Some(item) = scan.next().await {
            match item.unwrap() {
                ScanItem::Record(r) => seen.push(r.log),
                ScanItem::Progress { timestamp } => seen.push(format!("@{}", timestamp / DAY_MS)),
            }
        }
        assert_eq!(seen, vec!["d2-b", "d2-a", "@10", "d0-b", "d0-a"]);
        assert_eq!(s.ref_count(&day_name(day0)), 0);
    }
}
