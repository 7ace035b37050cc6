//! `servolink-runtime` – request/response correlation and real-time
//! command streaming on top of `servolink-middleware`.
//!
//! # Modules
//!
//! - [`service_client`] – [`ServiceEndpoint`]: turns a request topic and a
//!   response topic into a blocking call with a deadline or a deferred
//!   [`ResponseHandle`]; [`RobotClient`] bundles the three robot services.
//! - [`control_loop`] – [`RealtimeControlLoop`]: fixed-period publisher
//!   sleeping to absolute deadlines, with overrun accounting.
//! - [`command_builder`] – the [`CommandBuilder`] seam and the PD position
//!   builder used for the reference robot.
//! - [`monitor`] – [`StateMonitor`]: latest-value cache of a telemetry topic.
//! - [`session`] – [`LowLevelSession`]: switches control ownership and
//!   seeds targets from measured state.
//! - [`state`] – [`SharedState`]: lock-guarded value with copy-out reads.
//! - [`telemetry`] – [`init_tracing`]: subscriber and optional OTLP export.

pub mod command_builder;
pub mod control_loop;
pub mod monitor;
pub mod service_client;
pub mod session;
pub mod state;
pub mod telemetry;

pub use command_builder::{CommandBuilder, GainTable, JointTargets, PdCommandBuilder};
pub use control_loop::{ControlLoopConfig, DEFAULT_PERIOD, LoopState, LoopStats, RealtimeControlLoop};
pub use monitor::StateMonitor;
pub use service_client::{
    CorrelationIds, DEFAULT_SERVICE_TIMEOUT, EndpointStats, ResponseHandle, RobotClient,
    ServiceEndpoint, ServiceTopics,
};
pub use session::{JointControlLoop, LowLevelSession};
pub use state::SharedState;
pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing};
