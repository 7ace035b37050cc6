//! Typed outbound endpoint.

use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use servolink_types::LinkError;
use tracing::{debug, warn};

use crate::codec;
use crate::context::TransportContext;
use crate::transport::TopicWriter;

/// Point-in-time counters of an [`OutChannel`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub sent: u64,
    pub failed: u64,
}

/// Publisher bound to one topic.
///
/// `send` is non-blocking and may be called from several threads at once.
/// Nothing is buffered beyond what the transport itself buffers.
pub struct OutChannel<T> {
    ctx: TransportContext,
    topic: String,
    writer: RwLock<Option<Arc<dyn TopicWriter>>>,
    sent: AtomicU64,
    failed: AtomicU64,
    _message: PhantomData<fn(&T)>,
}

impl<T> fmt::Debug for OutChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutChannel")
            .field("topic", &self.topic)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl<T> OutChannel<T> {
    pub fn is_initialized(&self) -> bool {
        self.writer.read().is_some()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl<T: Serialize> OutChannel<T> {
    pub fn new(ctx: &TransportContext, topic: impl Into<String>) -> Self {
        Self {
            ctx: ctx.clone(),
            topic: topic.into(),
            writer: RwLock::new(None),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            _message: PhantomData,
        }
    }

    /// Register the topic with the context and obtain a writer.
    ///
    /// Idempotent. Fails when the context is not initialised or the topic is
    /// already bound to another message type.
    pub fn init(&self) -> Result<(), LinkError> {
        let mut writer = self.writer.write();
        if writer.is_some() {
            return Ok(());
        }
        let transport = self.ctx.register_topic(&self.topic, type_name::<T>())?;
        *writer = Some(transport.writer(&self.topic)?);
        debug!(topic = %self.topic, message = type_name::<T>(), "publisher ready");
        Ok(())
    }

    /// Encode `msg` and hand it to the transport.
    pub fn try_send(&self, msg: &T) -> Result<(), LinkError> {
        let result = self.write(msg);
        match &result {
            Ok(()) => self.sent.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.failed.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    /// Boolean form of [`try_send`](Self::try_send); failures are logged.
    pub fn send(&self, msg: &T) -> bool {
        match self.try_send(msg) {
            Ok(()) => true,
            Err(e) => {
                warn!(topic = %self.topic, error = %e, "send failed");
                false
            }
        }
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn write(&self, msg: &T) -> Result<(), LinkError> {
        let writer = self
            .writer
            .read()
            .clone()
            .ok_or_else(|| LinkError::TransportWrite {
                topic: self.topic.clone(),
                details: "publisher not initialised".to_string(),
            })?;
        let payload = codec::encode(msg)?;
        writer.write(payload)
    }
}
