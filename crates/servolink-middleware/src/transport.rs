//! The transport seam and its in-process implementation.
//!
//! A [`Transport`] moves opaque encoded payloads between named topics.
//! [`LocalTransport`] realises every topic as its own
//! [`tokio::sync::broadcast`] lane so each reader sees every message
//! without a slow reader blocking the others. A production DDS binding
//! plugs in through [`TransportContext::init_with`][crate::TransportContext::init_with].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use servolink_types::LinkError;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Encoded message as handed to the transport.
pub type Payload = Arc<[u8]>;

/// Default per-topic buffer (messages) before slow readers start lagging.
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// A shared communication substrate carrying payloads between topics.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Make sure `topic` exists. Creating an existing topic is a no-op.
    fn create_topic(&self, topic: &str, type_name: &str) -> Result<(), LinkError>;

    /// A write end for `topic`. The topic must have been created.
    fn writer(&self, topic: &str) -> Result<Arc<dyn TopicWriter>, LinkError>;

    /// A read end for `topic`. It only observes payloads written after it
    /// was created.
    fn reader(&self, topic: &str) -> Result<Box<dyn TopicReader>, LinkError>;

    /// Close every topic. Readers drain and return `None`; writes fail.
    fn shutdown(&self);
}

pub trait TopicWriter: Send + Sync {
    /// Hand `payload` to the transport. Success means hand-off, not
    /// delivery.
    fn write(&self, payload: Payload) -> Result<(), LinkError>;

    fn topic(&self) -> &str;
}

#[async_trait]
pub trait TopicReader: Send {
    /// Wait for the next payload. `None` once the topic is closed.
    async fn recv(&mut self) -> Option<Payload>;

    fn topic(&self) -> &str;
}

// ────────────────────────────────────────────────────────────────────────────
// LocalTransport
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Lanes {
    closed: AtomicBool,
    senders: RwLock<HashMap<String, broadcast::Sender<Payload>>>,
}

/// In-process transport with one bounded broadcast lane per topic.
///
/// Cheap to clone; clones share the same lanes.
#[derive(Clone, Debug)]
pub struct LocalTransport {
    queue_depth: usize,
    lanes: Arc<Lanes>,
}

impl LocalTransport {
    /// Create a transport whose lanes buffer `queue_depth` messages each.
    pub fn new(queue_depth: usize) -> Result<Self, LinkError> {
        if queue_depth == 0 {
            return Err(LinkError::Initialization(
                "queue depth must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            queue_depth,
            lanes: Arc::new(Lanes::default()),
        })
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth
    }

    /// Number of readers currently attached to `topic`.
    pub fn reader_count(&self, topic: &str) -> usize {
        self.lanes
            .senders
            .read()
            .get(topic)
            .map_or(0, |s| s.receiver_count())
    }

    pub fn is_closed(&self) -> bool {
        self.lanes.closed.load(Ordering::SeqCst)
    }

    fn closed_error(topic: &str) -> LinkError {
        LinkError::TransportWrite {
            topic: topic.to_string(),
            details: "transport has been shut down".to_string(),
        }
    }

    fn unknown_topic(topic: &str) -> LinkError {
        LinkError::Initialization(format!("topic {topic} has not been created"))
    }
}

impl Transport for LocalTransport {
    fn create_topic(&self, topic: &str, type_name: &str) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::Initialization(format!(
                "cannot create topic {topic}: transport has been shut down"
            )));
        }
        let mut senders = self.lanes.senders.write();
        if !senders.contains_key(topic) {
            let (sender, _) = broadcast::channel(self.queue_depth);
            senders.insert(topic.to_string(), sender);
            debug!(topic, type_name, depth = self.queue_depth, "topic created");
        }
        Ok(())
    }

    fn writer(&self, topic: &str) -> Result<Arc<dyn TopicWriter>, LinkError> {
        if !self.lanes.senders.read().contains_key(topic) {
            return Err(Self::unknown_topic(topic));
        }
        Ok(Arc::new(LocalWriter {
            topic: topic.to_string(),
            lanes: Arc::clone(&self.lanes),
        }))
    }

    fn reader(&self, topic: &str) -> Result<Box<dyn TopicReader>, LinkError> {
        let senders = self.lanes.senders.read();
        let sender = senders.get(topic).ok_or_else(|| Self::unknown_topic(topic))?;
        Ok(Box::new(LocalReader {
            topic: topic.to_string(),
            receiver: sender.subscribe(),
        }))
    }

    fn shutdown(&self) {
        if self.lanes.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping every sender closes the lanes and wakes blocked readers.
        let dropped = {
            let mut senders = self.lanes.senders.write();
            let n = senders.len();
            senders.clear();
            n
        };
        debug!(topics = dropped, "local transport shut down");
    }
}

struct LocalWriter {
    topic: String,
    lanes: Arc<Lanes>,
}

impl TopicWriter for LocalWriter {
    fn write(&self, payload: Payload) -> Result<(), LinkError> {
        let senders = self.lanes.senders.read();
        let sender = senders
            .get(&self.topic)
            .ok_or_else(|| LocalTransport::closed_error(&self.topic))?;
        // A lane with no readers rejects the send; that is not a failure of
        // the hand-off.
        let _ = sender.send(payload);
        Ok(())
    }

    fn topic(&self) -> &str {
        &self.topic
    }
}

struct LocalReader {
    topic: String,
    receiver: broadcast::Receiver<Payload>,
}

#[async_trait]
impl TopicReader for LocalReader {
    async fn recv(&mut self) -> Option<Payload> {
        loop {
            match self.receiver.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = %self.topic, lagged_by = n, "reader lagged, messages skipped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn topic(&self) -> &str {
        &self.topic
    }
}
