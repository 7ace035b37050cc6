//! `servolink-types` – shared message schema and error type.
//!
//! Every crate in the workspace speaks in terms of the types defined here:
//!
//! - [`command`] – actuation messages published by the control loop
//!   ([`LowCmd`], [`MotorCmd`]).
//! - [`state`] – telemetry snapshots published by the robot ([`LowState`],
//!   [`ControlModeState`]) and the [`MotorFault`] flag set.
//! - [`service`] – correlated request/response messages for the three
//!   service kinds (BMS init, torque, control mode).
//! - [`joint`] – joint index constants for the 31-joint platform.
//! - [`util`] – small numeric helpers and the command checksum.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod command;
pub mod joint;
pub mod service;
pub mod state;
pub mod util;

pub use command::{KinematicMode, LowCmd, MotorCmd};
pub use joint::N_JOINTS;
pub use service::{
    BmsInitCmd, BmsInitType, ControlMode, ControlModeCmd, Correlated, ServiceResponse, TorqueCmd,
    TorqueType,
};
pub use state::{ControlModeState, ImuState, JointState, LowState, MotorFault, MotorState};

/// Crate-wide error type covering channel setup, transport hand-off, request
/// correlation and receive-path failures.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkError {
    /// The transport context or a channel could not be set up.
    #[error("Initialization Error: {0}")]
    Initialization(String),

    /// A message could not be handed to the transport.
    #[error("Transport Write Error on {topic}: {details}")]
    TransportWrite { topic: String, details: String },

    /// No matching response arrived before the request's deadline.
    #[error("Timeout: no response to {kind} request {request_id}")]
    Timeout { kind: String, request_id: String },

    /// A request of the same kind is already outstanding.
    #[error("Busy: a {0} request is already outstanding")]
    Busy(String),

    /// A receive-path handler failed while processing a message.
    #[error("Handler Fault on {topic}: {details}")]
    HandlerFault { topic: String, details: String },

    /// A message could not be encoded or decoded.
    #[error("Codec Error: {0}")]
    Codec(String),

    /// Invalid or unreadable configuration.
    #[error("Config Error: {0}")]
    Config(String),
}

impl LinkError {
    /// `true` for failures that only affect the local wait or hand-off and
    /// may be retried by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LinkError::TransportWrite { .. } | LinkError::Timeout { .. } | LinkError::Busy(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_error_display() {
        let err = LinkError::Busy("torque".to_string());
        assert!(err.to_string().contains("already outstanding"));

        let err = LinkError::Timeout {
            kind: "bms_init".to_string(),
            request_id: "req-7".to_string(),
        };
        assert!(err.to_string().contains("req-7"));
        assert!(err.to_string().contains("bms_init"));
    }

    #[test]
    fn retryable_classification() {
        assert!(LinkError::Busy("x".into()).is_retryable());
        assert!(
            LinkError::TransportWrite {
                topic: "rt/lowcmd".into(),
                details: "closed".into()
            }
            .is_retryable()
        );
        assert!(!LinkError::Initialization("no context".into()).is_retryable());
        assert!(!LinkError::Codec("bad json".into()).is_retryable());
    }

    #[test]
    fn link_error_roundtrip() {
        let err = LinkError::HandlerFault {
            topic: "rt/lowstate".to_string(),
            details: "panicked".to_string(),
        };
        let json = serde_json::to_string(&err).unwrap();
        let back: LinkError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }
}
