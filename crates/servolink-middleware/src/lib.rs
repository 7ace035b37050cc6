//! `servolink-middleware` – typed publish/subscribe over a pluggable
//! transport.
//!
//! # Layers
//!
//! | Module | Role |
//! |---|---|
//! | [`context`] | [`TransportContext`]: process-wide handle, topic registry, init/release |
//! | [`transport`] | [`Transport`] seam and the in-process [`LocalTransport`] |
//! | [`codec`] | JSON encoding of messages before hand-off |
//! | [`publisher`] | [`OutChannel<T>`]: non-blocking typed send |
//! | [`subscriber`] | [`InChannel<T>`]: dedicated receive thread per topic |
//! | [`cancel`] | [`CancelToken`] shared by every loop in the workspace |
//!
//! Channels never talk to a transport directly: they ask the context for
//! it, so a released context makes every later operation fail fast.

pub mod cancel;
pub mod codec;
pub mod context;
pub mod publisher;
pub mod subscriber;
pub mod transport;

pub use cancel::CancelToken;
pub use context::{TransportConfig, TransportContext};
pub use publisher::{OutChannel, PublisherStats};
pub use subscriber::{InChannel, SubscriberStats};
pub use transport::{LocalTransport, Payload, TopicReader, TopicWriter, Transport};

/// Default topic names of the reference deployment.
pub mod topics {
    pub const LOW_STATE: &str = "rt/lowstate";
    pub const CONTROL_MODE_STATE: &str = "rt/controlmodestate";
    pub const LOW_CMD: &str = "rt/lowcmd";
    pub const BMS_INIT_REQUEST: &str = "rt/service/bms_init/request";
    pub const BMS_INIT_RESPONSE: &str = "rt/service/bms_init/response";
    pub const TORQUE_REQUEST: &str = "rt/service/torque/request";
    pub const TORQUE_RESPONSE: &str = "rt/service/torque/response";
    pub const CONTROL_MODE_REQUEST: &str = "rt/service/control_mode/request";
    pub const CONTROL_MODE_RESPONSE: &str = "rt/service/control_mode/response";
}
