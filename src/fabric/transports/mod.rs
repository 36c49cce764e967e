pub mod inmem;

use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    ConnectionClosed,
    UnknownAddress(String),
    AlreadyBound(String),
    Io(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::ConnectionClosed => write!(f, "connection closed"),
            TransportError::UnknownAddress(a) => write!(f, "unknown address: {a}"),
            TransportError::AlreadyBound(a) => write!(f, "address already bound: {a}"),
            TransportError::Io(e) => write!(f, "io: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

/*──────── direct messaging (RPC substrate) ──────────*/

/// Point-to-point mailboxes plus broadcast groups.
///
/// RPC servers `bind` a logical address and fanout servers additionally
/// `join` a group; fanout clients `broadcast` one frame to every member.
#[async_trait::async_trait]
pub trait MessageTransport: Send + Sync {
    async fn bind(&self, address: &str) -> Result<mpsc::Receiver<Vec<u8>>, TransportError>;
    async fn send(&self, address: &str, frame: Vec<u8>) -> Result<(), TransportError>;
    async fn join(&self, group: &str, address: &str) -> Result<(), TransportError>;
    /// Returns how many members the frame was handed to.
    async fn broadcast(&self, group: &str, frame: Vec<u8>) -> Result<usize, TransportError>;
    /// Resolves once the underlying connection is lost.
    async fn closed(&self);
}

/*──────── ordered log (pub/sub substrate) ──────────*/

/// Segmented append-only log per topic, with a shared list of subscriber
/// offsets so publishers can find the lagger without talking to subscribers.
#[async_trait::async_trait]
pub trait LogTransport: Send + Sync {
    async fn append(&self, topic: &str, segment: u64, frame: Vec<u8>) -> Result<(), TransportError>;
    /// Frames of `segment` starting at index `from`.
    async fn read(&self, topic: &str, segment: u64, from: u64)
    -> Result<Vec<Vec<u8>>, TransportError>;
    async fn segments(&self, topic: &str) -> Result<Vec<u64>, TransportError>;
    async fn delete_segment(&self, topic: &str, segment: u64) -> Result<(), TransportError>;
    /// Forgets `topic` entirely: segments and subscriber offsets.
    async fn drop_topic(&self, topic: &str) -> Result<(), TransportError>;

    /// Adds a subscriber at offset 0 and returns its slot.
    async fn register_subscriber(&self, topic: &str) -> Result<usize, TransportError>;
    async fn set_subscriber_offset(
        &self,
        topic: &str,
        slot: usize,
        offset: u64,
    ) -> Result<(), TransportError>;
    async fn subscriber_offsets(&self, topic: &str) -> Result<Vec<u64>, TransportError>;

    /// Waits for an append on `topic` or for `timeout`, whichever comes first.
    async fn wait_for_append(&self, topic: &str, timeout: Duration);
}
