use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::fabric::{
    FabricError,
    dispatch::Dispatch,
    envelope::{self, PubEnvelope},
    transports::LogTransport,
};

/*──────────────────────── config ───────────────────────*/

#[derive(Clone, Debug)]
pub struct PubSubConfig {
    /// Entries per log segment.
    pub segment_size: u64,
    /// Publishes between two lagger checks.
    pub lagger_check_interval: u64,
    /// Maximum allowed distance between publisher and slowest subscriber.
    pub max_lag: u64,
    pub backpressure_backoff: Duration,
    /// Subscriber idle poll when no append notification arrives.
    pub poll_interval: Duration,
    /// How long a released publisher waits for subscribers to catch up.
    pub drain_timeout: Duration,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            segment_size: 4096,
            lagger_check_interval: 128,
            max_lag: 1024,
            backpressure_backoff: Duration::from_millis(100),
            poll_interval: Duration::from_millis(100),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/*──────────────────────── publisher ───────────────────────*/

pub struct PubChannel {
    topic: String,
    log: Arc<dyn LogTransport>,
    cfg: PubSubConfig,
    // Serialises publishes so sequence numbers stay dense.
    num_publish: Mutex<u64>,
    published: AtomicU64,
}

impl PubChannel {
    pub(crate) fn new(topic: &str, log: Arc<dyn LogTransport>, cfg: PubSubConfig) -> Self {
        Self {
            topic: topic.to_string(),
            log,
            cfg,
            num_publish: Mutex::new(0),
            published: AtomicU64::new(0),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Entries appended so far. Readable while a publish is blocked.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }

    /// Appends `{method, params}` and returns its sequence number. Waits while
    /// the slowest subscriber is more than `max_lag` entries behind.
    pub async fn publish(&self, method: &str, params: Value) -> Result<u64, FabricError> {
        let frame = envelope::encode(&PubEnvelope {
            method: method.to_string(),
            params,
        })?;

        let segment_size = self.cfg.segment_size.max(1);
        let check = self.cfg.lagger_check_interval.max(1);

        let mut num_publish = self.num_publish.lock().await;
        let seq = *num_publish;

        if seq % check == check - 1 {
            self.wait_for_laggers(seq).await?;
        }

        self.log.append(&self.topic, seq / segment_size, frame).await?;
        *num_publish = seq + 1;
        self.published.store(seq + 1, Ordering::Release);

        if seq % segment_size == segment_size - 1 {
            let lagger = self.lagger(seq + 1).await?;
            self.collect_garbage(lagger, segment_size).await?;
        }
        Ok(seq)
    }

    /// Minimum subscriber offset, or `position` when nobody subscribes.
    async fn lagger(&self, position: u64) -> Result<u64, FabricError> {
        let offsets = self.log.subscriber_offsets(&self.topic).await?;
        Ok(offsets.into_iter().min().unwrap_or(position))
    }

    async fn wait_for_laggers(&self, seq: u64) -> Result<(), FabricError> {
        loop {
            let lagger = self.lagger(seq).await?;
            if seq.saturating_sub(lagger) <= self.cfg.max_lag {
                return Ok(());
            }
            debug!(topic = %self.topic, seq, lagger, "pubsub: backpressure");
            tokio::time::sleep(self.cfg.backpressure_backoff).await;
        }
    }

    /// Waits until every subscriber has read all published entries or
    /// `drain_timeout` passes. Returns whether they caught up.
    pub async fn drain(&self) -> Result<bool, FabricError> {
        let published = self.published();
        let caught_up = async {
            while self.lagger(published).await? < published {
                tokio::time::sleep(self.cfg.backpressure_backoff).await;
            }
            Ok::<_, FabricError>(())
        };
        match tokio::time::timeout(self.cfg.drain_timeout, caught_up).await {
            Ok(res) => res.map(|()| true),
            Err(_) => {
                debug!(topic = %self.topic, published, "pubsub: drain timed out");
                Ok(false)
            }
        }
    }

    async fn collect_garbage(&self, lagger: u64, segment_size: u64) -> Result<(), FabricError> {
        for segment in self.log.segments(&self.topic).await? {
            if (segment + 1) * segment_size <= lagger {
                debug!(topic = %self.topic, segment, "pubsub: dropping consumed segment");
                self.log.delete_segment(&self.topic, segment).await?;
            }
        }
        Ok(())
    }
}

/*──────────────────────── subscriber ───────────────────────*/

pub(crate) struct SubChannel {
    pub topic: String,
    pub name: String,
    pub dispatch: Dispatch,
}

impl SubChannel {
    /// Consume the topic from offset 0, publishing our offset after each batch.
    #[instrument(skip_all, fields(topic = %self.topic, name = %self.name))]
    pub async fn run(self, log: Arc<dyn LogTransport>, slot: usize, cfg: PubSubConfig) {
        let segment_size = cfg.segment_size.max(1);
        let mut offset: u64 = 0;
        loop {
            let segment = offset / segment_size;
            let frames = match log.read(&self.topic, segment, offset % segment_size).await {
                Ok(f) => f,
                Err(e) => {
                    warn!(error = %e, "pubsub: read failed, subscriber exiting");
                    return;
                }
            };

            if frames.is_empty() {
                // A segment we never saw may already be collected; skip ahead.
                if let Ok(segments) = log.segments(&self.topic).await {
                    if let Some(first) = segments.first() {
                        if *first > segment {
                            offset = first * segment_size;
                            continue;
                        }
                    }
                }
                log.wait_for_append(&self.topic, cfg.poll_interval).await;
                continue;
            }

            for frame in frames {
                offset += 1;
                let env: PubEnvelope = match envelope::decode(&frame) {
                    Ok(env) => env,
                    Err(e) => {
                        warn!(error = %e, "pubsub: malformed envelope dropped");
                        continue;
                    }
                };
                if !self.dispatch.is_allowed(&env.method) {
                    warn!(method = %env.method, "pubsub: method not allowed, dropped");
                    continue;
                }
                if let Err(e) = self.dispatch.invoke(&env.method, env.params).await {
                    warn!(method = %env.method, error = %e, "pubsub: handler failed");
                }
            }

            if let Err(e) = log.set_subscriber_offset(&self.topic, slot, offset).await {
                warn!(error = %e, "pubsub: offset update failed, subscriber exiting");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::transports::inmem::InMemHub;
    use serde_json::json;

    fn small_cfg() -> PubSubConfig {
        PubSubConfig {
            segment_size: 8,
            lagger_check_interval: 4,
            max_lag: 8,
            backpressure_backoff: Duration::from_millis(10),
            poll_interval: Duration::from_millis(10),
            drain_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn sequence_numbers_are_dense_and_segmented() {
        let hub = InMemHub::new();
        hub.register_subscriber("t").await.unwrap();
        let ch = PubChannel::new("t", hub.clone(), small_cfg());
        for i in 0..10u64 {
            assert_eq!(ch.publish("log", json!({ "i": i })).await.unwrap(), i);
        }
        assert_eq!(hub.segments("t").await.unwrap(), vec![0, 1]);
        assert_eq!(hub.read("t", 1, 0).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn without_subscribers_segments_are_collected() {
        let hub = InMemHub::new();
        let ch = PubChannel::new("t", hub.clone(), small_cfg());
        for _ in 0..16 {
            ch.publish("log", Value::Null).await.unwrap();
        }
        // Lagger is the publisher itself: both full segments are gone.
        assert!(hub.segments("t").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn publisher_blocks_on_lagger_and_resumes() {
        let hub = InMemHub::new();
        let slot = hub.register_subscriber("t").await.unwrap();
        let ch = Arc::new(PubChannel::new("t", hub.clone(), small_cfg()));

        let publisher = {
            let ch = ch.clone();
            tokio::spawn(async move {
                for _ in 0..20 {
                    ch.publish("log", Value::Null).await.unwrap();
                }
            })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        // seq 11 is a check point with a gap of 11 > 8.
        assert_eq!(ch.published(), 11);
        assert!(!publisher.is_finished());

        hub.set_subscriber_offset("t", slot, 11).await.unwrap();
        publisher.await.unwrap();
        assert_eq!(ch.published(), 20);
        assert_eq!(hub.segments("t").await.unwrap(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_the_slowest_subscriber() {
        let hub = InMemHub::new();
        let ch = PubChannel::new("t", hub.clone(), small_cfg());
        assert!(ch.drain().await.unwrap());

        let slot = hub.register_subscriber("t").await.unwrap();
        ch.publish("log", Value::Null).await.unwrap();
        ch.publish("log", Value::Null).await.unwrap();
        // Nobody reads: gives up after the timeout.
        assert!(!ch.drain().await.unwrap());

        hub.set_subscriber_offset("t", slot, 2).await.unwrap();
        assert!(ch.drain().await.unwrap());
    }
}
