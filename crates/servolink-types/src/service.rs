//! Correlated request/response messages for the robot's services.
//!
//! Each request kind travels on its own request topic and is answered on
//! its own response topic with a [`ServiceResponse`] carrying the same
//! `request_id`.

use serde::{Deserialize, Serialize};

/// A message carrying an embedded correlation id.
pub trait Correlated {
    fn request_id(&self) -> &str;
}

/// What the battery-management init service should bring up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BmsInitType {
    /// Power everything down.
    #[default]
    None,
    Bms,
    Motor,
    BmsAndMotor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TorqueType {
    On,
    #[default]
    Off,
}

/// Who owns the actuators: the robot's own controller (`HighLevel`) or an
/// external client streaming [`LowCmd`][crate::LowCmd]s (`LowLevel`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ControlMode {
    LowLevel,
    #[default]
    HighLevel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BmsInitCmd {
    pub request_id: String,
    pub init: BmsInitType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorqueCmd {
    pub request_id: String,
    pub torque: TorqueType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlModeCmd {
    pub request_id: String,
    pub mode: ControlMode,
}

/// Reply to any service request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceResponse {
    pub request_id: String,
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

impl ServiceResponse {
    pub fn ok(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            success: true,
            message: String::new(),
        }
    }

    pub fn failed(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            message: message.into(),
        }
    }
}

impl Correlated for BmsInitCmd {
    fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Correlated for TorqueCmd {
    fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Correlated for ControlModeCmd {
    fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Correlated for ServiceResponse {
    fn request_id(&self) -> &str {
        &self.request_id
    }
}
