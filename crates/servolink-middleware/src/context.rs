//! Process-wide transport handle.
//!
//! [`TransportContext`] is an explicit, cloneable handle rather than a
//! global: every clone shares the same state, and every channel holds one.
//! The context owns the transport, serialises init/release, and records the
//! message type bound to each topic name.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use servolink_types::LinkError;
use tracing::{debug, info};

use crate::transport::{DEFAULT_QUEUE_DEPTH, LocalTransport, Transport};

/// Settings for [`TransportContext::init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Numeric context selector; peers only see each other within a domain.
    pub domain_id: u32,
    /// Per-topic in-flight buffer.
    pub queue_depth: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            domain_id: 0,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

impl TransportConfig {
    pub fn with_domain(domain_id: u32) -> Self {
        Self {
            domain_id,
            ..Self::default()
        }
    }
}

struct Active {
    domain_id: u32,
    transport: Arc<dyn Transport>,
    // topic name -> message type name
    bindings: HashMap<String, String>,
}

#[derive(Clone, Default)]
pub struct TransportContext {
    active: Arc<Mutex<Option<Active>>>,
}

impl fmt::Debug for TransportContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let active = self.active.lock();
        f.debug_struct("TransportContext")
            .field("initialized", &active.is_some())
            .field("domain_id", &active.as_ref().map(|a| a.domain_id))
            .finish()
    }
}

impl TransportContext {
    /// An uninitialised context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring up the in-process [`LocalTransport`].
    ///
    /// Calling this on an initialised context is a no-op that succeeds, even
    /// if `config` differs from the active one.
    pub fn init(&self, config: &TransportConfig) -> Result<(), LinkError> {
        let mut active = self.active.lock();
        if let Some(current) = active.as_ref() {
            debug!(domain_id = current.domain_id, "transport context already initialised");
            return Ok(());
        }
        let transport = LocalTransport::new(config.queue_depth)?;
        *active = Some(Active {
            domain_id: config.domain_id,
            transport: Arc::new(transport),
            bindings: HashMap::new(),
        });
        info!(
            domain_id = config.domain_id,
            queue_depth = config.queue_depth,
            "transport context initialised"
        );
        Ok(())
    }

    /// Install an externally constructed transport.
    ///
    /// Same idempotency as [`init`](Self::init): an already initialised
    /// context keeps its current transport.
    pub fn init_with(&self, domain_id: u32, transport: Arc<dyn Transport>) -> Result<(), LinkError> {
        let mut active = self.active.lock();
        if active.is_some() {
            debug!(domain_id, "transport context already initialised");
            return Ok(());
        }
        *active = Some(Active {
            domain_id,
            transport,
            bindings: HashMap::new(),
        });
        info!(domain_id, "transport context initialised with external transport");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Active domain, `None` when uninitialised.
    pub fn domain_id(&self) -> Option<u32> {
        self.active.lock().as_ref().map(|a| a.domain_id)
    }

    /// Shut the transport down and forget every topic binding. Idempotent.
    ///
    /// Channels created before the release fail fast afterwards; their
    /// receive threads observe the closed topics and exit.
    pub fn release(&self) {
        let released = self.active.lock().take();
        if let Some(active) = released {
            active.transport.shutdown();
            info!(
                domain_id = active.domain_id,
                topics = active.bindings.len(),
                "transport context released"
            );
        }
    }

    /// The active transport.
    pub fn transport(&self) -> Result<Arc<dyn Transport>, LinkError> {
        self.active
            .lock()
            .as_ref()
            .map(|a| Arc::clone(&a.transport))
            .ok_or_else(Self::not_initialised)
    }

    /// Bind `topic` to `type_name` and create it on the transport.
    ///
    /// The first binding of a name wins; binding it again with a different
    /// type fails.
    pub fn register_topic(&self, topic: &str, type_name: &str) -> Result<Arc<dyn Transport>, LinkError> {
        let mut guard = self.active.lock();
        let active = guard.as_mut().ok_or_else(Self::not_initialised)?;
        match active.bindings.get(topic) {
            Some(bound) if bound != type_name => {
                return Err(LinkError::Initialization(format!(
                    "topic {topic} is bound to {bound}, cannot rebind as {type_name}"
                )));
            }
            Some(_) => {}
            None => {
                active.transport.create_topic(topic, type_name)?;
                active
                    .bindings
                    .insert(topic.to_string(), type_name.to_string());
            }
        }
        Ok(Arc::clone(&active.transport))
    }

    /// Message type bound to `topic`, if any.
    pub fn topic_type(&self, topic: &str) -> Option<String> {
        self.active
            .lock()
            .as_ref()
            .and_then(|a| a.bindings.get(topic).cloned())
    }

    fn not_initialised() -> LinkError {
        LinkError::Initialization("transport context is not initialised".to_string())
    }
}
