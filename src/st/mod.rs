//! Segment tree over `[0, 2^epsize - 1]` answering "which stored intervals
//! contain point v", persisted in redb.
//!
//! Each interval is stored as its canonical dyadic sub-ranges plus one START
//! and one END endpoint record. `cover` walks root to leaf and scans the
//! entries of every node on the path.

pub mod keys;

use std::{collections::VecDeque, path::Path};

use redb::{Database, ReadOnlyTable, ReadableTableMetadata, TableDefinition};
use smallvec::SmallVec;
use tracing::{debug, info};

use crate::{storage_error::StorageError, uuid_bytes::UuidBytes};
use keys::{
    ENDPOINT_PREFIX, EndpointKind, LEVEL_SENTINEL, decode_endpoint_key, decode_segment_key,
    decode_value, encode_value, endpoint_floor, endpoint_key, segment_key,
};

const ST_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("st");
const PAGE: usize = 256;
const EMPTY: &[u8] = &[];

#[derive(Clone, Debug)]
pub struct StConfig {
    /// Bits per endpoint, 1..=64.
    pub epsize: u8,
    /// Drop any existing index on open.
    pub truncate: bool,
}

impl Default for StConfig {
    fn default() -> Self {
        Self {
            epsize: 32,
            truncate: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoverEntry {
    pub uuid: UuidBytes,
    pub level: u8,
    pub start: u64,
    pub end: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub value: u64,
    pub level: u8,
    pub kind: EndpointKind,
    pub uuid: UuidBytes,
}

/// Endpoint range scan; `None` bounds are open.
#[derive(Clone, Debug, Default)]
pub struct EndpointQuery {
    pub start: Option<u64>,
    pub stop: Option<u64>,
    pub reverse: bool,
    pub include_start: bool,
    pub include_stop: bool,
}

pub struct St {
    db: Database,
    epsize: u8,
    max_endpoint: u64,
}

impl St {
    pub fn open(path: impl AsRef<Path>, cfg: StConfig) -> Result<Self, StorageError> {
        if cfg.epsize == 0 || cfg.epsize > 64 {
            return Err(StorageError::Other(format!(
                "epsize must be 1..=64, got {}",
                cfg.epsize
            )));
        }
        let path = path.as_ref();
        if cfg.truncate && path.exists() {
            info!(path = %path.display(), "st: truncating index");
            std::fs::remove_file(path)?;
        }
        let db = Database::create(path)?;
        {
            let txn = db.begin_write()?;
            txn.open_table(ST_TABLE)?;
            txn.commit()?;
        }
        let max_endpoint = if cfg.epsize == 64 {
            u64::MAX
        } else {
            (1u64 << cfg.epsize) - 1
        };
        Ok(Self {
            db,
            epsize: cfg.epsize,
            max_endpoint,
        })
    }

    pub fn epsize(&self) -> u8 {
        self.epsize
    }

    pub fn max_endpoint(&self) -> u64 {
        self.max_endpoint
    }

    fn check(&self, start: u64, end: u64, level: u8) -> Result<(), StorageError> {
        if start > end || end > self.max_endpoint || level == LEVEL_SENTINEL {
            return Err(StorageError::InvalidInterval { start, end, level });
        }
        Ok(())
    }

    /// Canonical dyadic sub-ranges exactly covering `[start, end]`.
    pub fn split_interval(&self, start: u64, end: u64) -> SmallVec<[(u64, u64); 32]> {
        let mut out = SmallVec::new();
        let mut stack: SmallVec<[(u64, u64); 64]> = SmallVec::new();
        stack.push((0, self.max_endpoint));
        while let Some((lower, upper)) = stack.pop() {
            if start <= lower && upper <= end {
                out.push((lower, upper));
                continue;
            }
            let mid = lower + (upper - lower) / 2;
            if end > mid {
                stack.push((mid + 1, upper));
            }
            if start <= mid {
                stack.push((lower, mid));
            }
        }
        out
    }

    /// Index `[start, end]` under `uuid` at `level`, in one transaction.
    pub fn put(&self, uuid: UuidBytes, start: u64, end: u64, level: u8) -> Result<(), StorageError> {
        self.check(start, end, level)?;
        let value = encode_value(start, end);
        let id = uuid.as_bytes();
        let txn = self.db.begin_write()?;
        {
            let mut t = txn.open_table(ST_TABLE)?;
            for (lower, upper) in self.split_interval(start, end) {
                t.insert(segment_key(lower, upper, level, id).as_slice(), value.as_slice())?;
            }
            t.insert(
                endpoint_key(start, level, EndpointKind::Start, id).as_slice(),
                EMPTY,
            )?;
            t.insert(
                endpoint_key(end, level, EndpointKind::End, id).as_slice(),
                EMPTY,
            )?;
        }
        txn.commit()?;
        debug!(%uuid, start, end, level, "st: put");
        Ok(())
    }

    /// Remove an interval; arguments must match the original `put`.
    pub fn delete(
        &self,
        uuid: UuidBytes,
        start: u64,
        end: u64,
        level: u8,
    ) -> Result<(), StorageError> {
        self.check(start, end, level)?;
        let id = uuid.as_bytes();
        let txn = self.db.begin_write()?;
        {
            let mut t = txn.open_table(ST_TABLE)?;
            for (lower, upper) in self.split_interval(start, end) {
                t.remove(segment_key(lower, upper, level, id).as_slice())?;
            }
            t.remove(endpoint_key(start, level, EndpointKind::Start, id).as_slice())?;
            t.remove(endpoint_key(end, level, EndpointKind::End, id).as_slice())?;
        }
        txn.commit()?;
        debug!(%uuid, start, end, level, "st: delete");
        Ok(())
    }

    fn read_table(&self) -> Result<ReadOnlyTable<&'static [u8], &'static [u8]>, StorageError> {
        Ok(self.db.begin_read()?.open_table(ST_TABLE)?)
    }

    /// Intervals containing `value`, root to leaf; within a tree node by
    /// descending level, then reverse uuid order.
    pub fn cover(&self, value: u64) -> Result<Cover, StorageError> {
        if value > self.max_endpoint {
            return Err(StorageError::InvalidInterval {
                start: value,
                end: value,
                level: 0,
            });
        }
        Ok(Cover {
            table: self.read_table()?,
            value,
            node: Some((0, self.max_endpoint)),
            buf: VecDeque::new(),
        })
    }

    pub fn query_endpoints(&self, q: EndpointQuery) -> Result<Endpoints, StorageError> {
        let lower = match q.start {
            None => vec![ENDPOINT_PREFIX],
            Some(s) if q.include_start => endpoint_floor(s),
            Some(s) => match s.checked_add(1) {
                Some(next) => endpoint_floor(next),
                None => vec![ENDPOINT_PREFIX + 1],
            },
        };
        let upper = match q.stop {
            None => vec![ENDPOINT_PREFIX + 1],
            Some(s) if q.include_stop => match s.checked_add(1) {
                Some(next) => endpoint_floor(next),
                None => vec![ENDPOINT_PREFIX + 1],
            },
            Some(s) => endpoint_floor(s),
        };
        Ok(Endpoints {
            table: self.read_table()?,
            lower,
            upper,
            reverse: q.reverse,
            buf: VecDeque::new(),
            done: false,
        })
    }

    /// Stored intervals, counted by their START records.
    pub fn num_entries(&self) -> Result<u64, StorageError> {
        let t = self.read_table()?;
        let lower = [ENDPOINT_PREFIX];
        let upper = [ENDPOINT_PREFIX + 1];
        let mut n = 0;
        for item in t.range(lower.as_slice()..upper.as_slice())? {
            let (k, _) = item?;
            if decode_endpoint_key(k.value())?.kind == EndpointKind::Start {
                n += 1;
            }
        }
        Ok(n)
    }

    /// Raw key count, both segment and endpoint records.
    pub fn num_keys(&self) -> Result<u64, StorageError> {
        Ok(self.read_table()?.len()?)
    }
}

/*──────────────────────── iterators ───────────────────────*/

/// Lazy `cover` result; reads one tree node at a time.
pub struct Cover {
    table: ReadOnlyTable<&'static [u8], &'static [u8]>,
    value: u64,
    node: Option<(u64, u64)>,
    buf: VecDeque<CoverEntry>,
}

impl Cover {
    fn scan_node(&mut self, lower: u64, upper: u64) -> Result<(), StorageError> {
        let from = segment_key(lower, upper, 0, &[]);
        let to = segment_key(lower, upper, LEVEL_SENTINEL, &[]);
        for item in self.table.range(from.as_slice()..to.as_slice())?.rev() {
            let (k, v) = item?;
            let key = decode_segment_key(k.value())?;
            let (start, end) = decode_value(v.value())?;
            self.buf.push_back(CoverEntry {
                uuid: key.uuid,
                level: key.level,
                start,
                end,
            });
        }
        Ok(())
    }
}

impl Iterator for Cover {
    type Item = Result<CoverEntry, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(e) = self.buf.pop_front() {
                return Some(Ok(e));
            }
            let (lower, upper) = self.node.take()?;
            if lower < upper {
                let mid = lower + (upper - lower) / 2;
                self.node = Some(if self.value <= mid {
                    (lower, mid)
                } else {
                    (mid + 1, upper)
                });
            }
            if let Err(e) = self.scan_node(lower, upper) {
                self.node = None;
                return Some(Err(e));
            }
        }
    }
}

/// Lazy endpoint scan, paged.
pub struct Endpoints {
    table: ReadOnlyTable<&'static [u8], &'static [u8]>,
    lower: Vec<u8>,
    upper: Vec<u8>,
    reverse: bool,
    buf: VecDeque<Endpoint>,
    done: bool,
}

impl Endpoints {
    fn fill(&mut self) -> Result<(), StorageError> {
        if self.lower >= self.upper {
            self.done = true;
            return Ok(());
        }
        let range = self.table.range(self.lower.as_slice()..self.upper.as_slice())?;
        let mut last: Option<Vec<u8>> = None;
        let mut n = 0;
        let mut push = |k: &[u8], buf: &mut VecDeque<Endpoint>| -> Result<(), StorageError> {
            let d = decode_endpoint_key(k)?;
            buf.push_back(Endpoint {
                value: d.value,
                level: d.level,
                kind: d.kind,
                uuid: d.uuid,
            });
            last = Some(k.to_vec());
            n += 1;
            Ok(())
        };
        if self.reverse {
            for item in range.rev().take(PAGE) {
                let (k, _) = item?;
                push(k.value(), &mut self.buf)?;
            }
        } else {
            for item in range.take(PAGE) {
                let (k, _) = item?;
                push(k.value(), &mut self.buf)?;
            }
        }
        if n < PAGE {
            self.done = true;
        }
        match last {
            Some(k) if self.reverse => self.upper = k,
            Some(mut k) => {
                // successor of k
                k.push(0);
                self.lower = k;
            }
            None => self.done = true,
        }
        Ok(())
    }
}

impl Iterator for Endpoints {
    type Item = Result<Endpoint, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(e) = self.buf.pop_front() {
                return Some(Ok(e));
            }
            if self.done {
                return None;
            }
            if let Err(e) = self.fill() {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng, rngs::StdRng};
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn open(dir: &tempfile::TempDir, epsize: u8) -> St {
        St::open(
            dir.path().join("st.redb"),
            StConfig {
                epsize,
                truncate: false,
            },
        )
        .unwrap()
    }

    fn covered(st: &St, v: u64) -> BTreeSet<UuidBytes> {
        st.cover(v).unwrap().map(|e| e.unwrap().uuid).collect()
    }

    #[test]
    fn split_is_minimal_and_exact() {
        let dir = tempdir().unwrap();
        let st = open(&dir, 4);
        let mut parts: Vec<(u64, u64)> = st.split_interval(1, 14).into_vec();
        parts.sort();
        assert_eq!(parts, vec![(1, 1), (2, 3), (4, 7), (8, 11), (12, 13), (14, 14)]);
        assert_eq!(st.split_interval(0, 15).into_vec(), vec![(0, 15)]);
    }

    #[test]
    fn cover_matches_brute_force() {
        let dir = tempdir().unwrap();
        let st = open(&dir, 8);
        let mut rng = StdRng::seed_from_u64(7);
        let mut stored = Vec::new();
        for _ in 0..60 {
            let a: u64 = rng.random_range(0..=255);
            let b: u64 = rng.random_range(0..=255);
            let (start, end) = (a.min(b), a.max(b));
            let level: u8 = rng.random_range(0..=254);
            let id = UuidBytes::new();
            st.put(id, start, end, level).unwrap();
            stored.push((id, start, end, level));
        }
        for v in 0..=255u64 {
            let want: BTreeSet<UuidBytes> = stored
                .iter()
                .filter(|(_, s, e, _)| *s <= v && v <= *e)
                .map(|(id, ..)| *id)
                .collect();
            assert_eq!(covered(&st, v), want, "point {v}");
        }
        assert_eq!(st.num_entries().unwrap(), 60);
    }

    #[test]
    fn put_then_delete_restores_cover() {
        let dir = tempdir().unwrap();
        let st = open(&dir, 16);
        let base = UuidBytes::new();
        st.put(base, 100, 200, 5).unwrap();
        let before: Vec<BTreeSet<UuidBytes>> = (90..210).map(|v| covered(&st, v)).collect();
        let keys_before = st.num_keys().unwrap();

        let extra = UuidBytes::new();
        st.put(extra, 150, 1000, 9).unwrap();
        assert!(covered(&st, 160).contains(&extra));

        st.delete(extra, 150, 1000, 9).unwrap();
        let after: Vec<BTreeSet<UuidBytes>> = (90..210).map(|v| covered(&st, v)).collect();
        assert_eq!(before, after);
        assert_eq!(st.num_keys().unwrap(), keys_before);
    }

    #[test]
    fn cover_orders_root_to_leaf_then_level_desc() {
        let dir = tempdir().unwrap();
        let st = open(&dir, 4);
        let whole_low = UuidBytes::from_bytes([1; 16]);
        let whole_high = UuidBytes::from_bytes([2; 16]);
        let leaf = UuidBytes::from_bytes([3; 16]);
        let a = UuidBytes::from_bytes([4; 16]);
        let b = UuidBytes::from_bytes([5; 16]);
        st.put(whole_low, 0, 15, 1).unwrap();
        st.put(whole_high, 0, 15, 9).unwrap();
        st.put(leaf, 6, 6, 200).unwrap();
        st.put(a, 4, 7, 3).unwrap();
        st.put(b, 4, 7, 3).unwrap();

        let got: Vec<UuidBytes> = st.cover(6).unwrap().map(|e| e.unwrap().uuid).collect();
        assert_eq!(got, vec![whole_high, whole_low, b, a, leaf]);

        let e = st.cover(6).unwrap().next().unwrap().unwrap();
        assert_eq!((e.start, e.end, e.level), (0, 15, 9));
    }

    #[test]
    fn invalid_intervals_are_rejected() {
        let dir = tempdir().unwrap();
        let st = open(&dir, 8);
        let id = UuidBytes::new();
        assert!(matches!(
            st.put(id, 5, 4, 0),
            Err(StorageError::InvalidInterval { .. })
        ));
        assert!(st.put(id, 0, 256, 0).is_err());
        assert!(st.put(id, 0, 1, LEVEL_SENTINEL).is_err());
        assert!(st.cover(256).is_err());
        assert!(St::open(dir.path().join("x"), StConfig { epsize: 65, truncate: false }).is_err());
    }

    #[test]
    fn endpoints_mark_containment_changes() {
        let dir = tempdir().unwrap();
        let st = open(&dir, 8);
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..25 {
            let a: u64 = rng.random_range(1..=254);
            let b: u64 = rng.random_range(1..=254);
            st.put(UuidBytes::new(), a.min(b), a.max(b), rng.random_range(0..10))
                .unwrap();
        }

        for ep in st.query_endpoints(EndpointQuery::default()).unwrap() {
            let ep = ep.unwrap();
            let here = covered(&st, ep.value);
            assert!(here.contains(&ep.uuid));
            let neighbour = match ep.kind {
                EndpointKind::Start => ep.value - 1,
                EndpointKind::End => ep.value + 1,
            };
            assert!(!covered(&st, neighbour).contains(&ep.uuid));
            assert_ne!(here, covered(&st, neighbour));
        }
    }

    #[test]
    fn endpoint_bounds_and_direction() {
        let dir = tempdir().unwrap();
        let st = open(&dir, 16);
        for i in 0..600u64 {
            st.put(UuidBytes::new(), i * 10, i * 10 + 5, 0).unwrap();
        }
        let all: Vec<Endpoint> = st
            .query_endpoints(EndpointQuery::default())
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(all.len(), 1200);
        assert!(all.windows(2).all(|w| w[0].value <= w[1].value));

        let q = |start, stop, include_start, include_stop, reverse| {
            st.query_endpoints(EndpointQuery {
                start: Some(start),
                stop: Some(stop),
                reverse,
                include_start,
                include_stop,
            })
            .unwrap()
            .map(|e| e.unwrap().value)
            .collect::<Vec<u64>>()
        };
        assert_eq!(q(10, 25, true, true, false), vec![10, 15, 20, 25]);
        assert_eq!(q(10, 25, false, false, false), vec![15, 20]);
        assert_eq!(q(10, 25, true, true, true), vec![25, 20, 15, 10]);

        let rev: Vec<u64> = st
            .query_endpoints(EndpointQuery {
                reverse: true,
                ..Default::default()
            })
            .unwrap()
            .map(|e| e.unwrap().value)
            .collect();
        assert_eq!(rev.len(), 1200);
        assert_eq!(rev[0], 5995);
        assert!(rev.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn truncate_clears_existing_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("st.redb");
        {
            let st = St::open(&path, StConfig { epsize: 8, truncate: false }).unwrap();
            st.put(UuidBytes::new(), 1, 2, 0).unwrap();
        }
        let st = St::open(&path, StConfig { epsize: 8, truncate: false }).unwrap();
        assert_eq!(st.num_entries().unwrap(), 1);
        drop(st);
        let st = St::open(&path, StConfig { epsize: 8, truncate: true }).unwrap();
        assert_eq!(st.num_entries().unwrap(), 0);
    }
}
