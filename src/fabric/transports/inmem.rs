use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use dashmap::DashMap;
use tokio::sync::{Notify, mpsc, watch};
use tracing::{debug, warn};

use crate::fabric::transports::{LogTransport, MessageTransport, TransportError};

/*──────────────────────────────────────────────────────────────────────────────*/
/* Topic log                                                                    */
/*──────────────────────────────────────────────────────────────────────────────*/

#[derive(Default)]
struct TopicLog {
    segments: Mutex<BTreeMap<u64, Vec<Vec<u8>>>>,
    subscribers: Mutex<Vec<u64>>,
    appended: Notify,
}

/*──────────────────────────────────────────────────────────────────────────────*/
/* Hub                                                                          */
/*──────────────────────────────────────────────────────────────────────────────*/

/// In-process transport. Every `Fabric` built on the same hub can reach every
/// other one; use a fresh hub per test for isolation.
pub struct InMemHub {
    mailbox_depth: usize,
    mailboxes: DashMap<String, mpsc::Sender<Vec<u8>>>,
    groups: DashMap<String, Vec<String>>,
    topics: DashMap<String, Arc<TopicLog>>,
    closed: watch::Sender<bool>,
}

impl InMemHub {
    pub fn new() -> Arc<Self> {
        Self::with_mailbox_depth(1024)
    }

    pub fn with_mailbox_depth(mailbox_depth: usize) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            mailbox_depth,
            mailboxes: DashMap::new(),
            groups: DashMap::new(),
            topics: DashMap::new(),
            closed,
        })
    }

    /// Simulate losing the connection: wakes `closed()` waiters and drops all mailboxes.
    pub fn fail(&self) {
        warn!("inmem: connection failure injected");
        self.closed.send_replace(true);
        self.mailboxes.clear();
    }

    /// Topics with a live log.
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    fn topic(&self, topic: &str) -> Arc<TopicLog> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(TopicLog::default()))
            .clone()
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if *self.closed.borrow() {
            Err(TransportError::ConnectionClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl MessageTransport for InMemHub {
    async fn bind(&self, address: &str) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        self.check_open()?;
        if let Some(existing) = self.mailboxes.get(address) {
            if !existing.is_closed() {
                return Err(TransportError::AlreadyBound(address.to_string()));
            }
        }
        let (tx, rx) = mpsc::channel(self.mailbox_depth);
        self.mailboxes.insert(address.to_string(), tx);
        debug!(%address, "inmem: bound");
        Ok(rx)
    }

    async fn send(&self, address: &str, frame: Vec<u8>) -> Result<(), TransportError> {
        self.check_open()?;
        // Clone the sender so no map guard is held across the await.
        let tx = self
            .mailboxes
            .get(address)
            .map(|tx| tx.clone())
            .ok_or_else(|| TransportError::UnknownAddress(address.to_string()))?;
        tx.send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn join(&self, group: &str, address: &str) -> Result<(), TransportError> {
        self.check_open()?;
        let mut members = self.groups.entry(group.to_string()).or_default();
        if !members.iter().any(|m| m == address) {
            members.push(address.to_string());
        }
        Ok(())
    }

    async fn broadcast(&self, group: &str, frame: Vec<u8>) -> Result<usize, TransportError> {
        self.check_open()?;
        let members: Vec<String> = self
            .groups
            .get(group)
            .map(|m| m.clone())
            .unwrap_or_default();
        let mut delivered = 0;
        for member in members {
            match self.send(&member, frame.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(%group, %member, error = %e, "inmem: broadcast member unreachable"),
            }
        }
        Ok(delivered)
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[async_trait::async_trait]
impl LogTransport for InMemHub {
    async fn append(&self, topic: &str, segment: u64, frame: Vec<u8>) -> Result<(), TransportError> {
        self.check_open()?;
        let log = self.topic(topic);
        log.segments
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(segment)
            .or_default()
            .push(frame);
        log.appended.notify_waiters();
        Ok(())
    }

    async fn read(
        &self,
        topic: &str,
        segment: u64,
        from: u64,
    ) -> Result<Vec<Vec<u8>>, TransportError> {
        self.check_open()?;
        let log = self.topic(topic);
        let segments = log.segments.lock().unwrap_or_else(|p| p.into_inner());
        Ok(segments
            .get(&segment)
            .map(|frames| frames.iter().skip(from as usize).cloned().collect())
            .unwrap_or_default())
    }

    async fn segments(&self, topic: &str) -> Result<Vec<u64>, TransportError> {
        self.check_open()?;
        let log = self.topic(topic);
        let segments = log.segments.lock().unwrap_or_else(|p| p.into_inner());
        Ok(segments.keys().copied().collect())
    }

    async fn delete_segment(&self, topic: &str, segment: u64) -> Result<(), TransportError> {
        self.check_open()?;
        let log = self.topic(topic);
        log.segments
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&segment);
        Ok(())
    }

    async fn drop_topic(&self, topic: &str) -> Result<(), TransportError> {
        self.check_open()?;
        if let Some((_, log)) = self.topics.remove(topic) {
            // Wake anyone parked on the dropped log.
            log.appended.notify_waiters();
        }
        Ok(())
    }

    async fn register_subscriber(&self, topic: &str) -> Result<usize, TransportError> {
        self.check_open()?;
        let log = self.topic(topic);
        let mut subs = log.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        subs.push(0);
        Ok(subs.len() - 1)
    }

    async fn set_subscriber_offset(
        &self,
        topic: &str,
        slot: usize,
        offset: u64,
    ) -> Result<(), TransportError> {
        self.check_open()?;
        let log = self.topic(topic);
        let mut subs = log.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        let entry = subs
            .get_mut(slot)
            .ok_or_else(|| TransportError::Io(format!("no subscriber slot {slot} on {topic}")))?;
        *entry = offset;
        Ok(())
    }

    async fn subscriber_offsets(&self, topic: &str) -> Result<Vec<u64>, TransportError> {
        self.check_open()?;
        let log = self.topic(topic);
        let subs = log.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        Ok(subs.clone())
    }

    async fn wait_for_append(&self, topic: &str, timeout: Duration) {
        let log = self.topic(topic);
        let _ = tokio::time::timeout(timeout, log.appended.notified()).await;
    }
}

/*──────────────────────────────────────────────────────────────────────────────*/
/* Tests                                                                        */
/*──────────────────────────────────────────────────────────────────────────────*/
