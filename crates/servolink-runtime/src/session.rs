//! Hand-over between the robot's own controller and streamed commands.
//!
//! Entering low-level mode seeds the joint targets from the latest measured
//! positions before publishing is enabled, so the first streamed command
//! holds the robot where it is instead of snapping it to stale targets.

use std::sync::Arc;
use std::time::Duration;

use servolink_types::{ControlMode, KinematicMode, LinkError, LowState, ServiceResponse};
use tracing::{info, warn};

use crate::command_builder::{JointTargets, PdCommandBuilder};
use crate::control_loop::RealtimeControlLoop;
use crate::service_client::RobotClient;
use crate::state::SharedState;

pub type JointControlLoop = RealtimeControlLoop<PdCommandBuilder>;

#[derive(Debug, Clone)]
pub struct LowLevelSession {
    client: Arc<RobotClient>,
    latest: SharedState<Option<LowState>>,
    control: Arc<JointControlLoop>,
}

impl LowLevelSession {
    pub fn new(
        client: Arc<RobotClient>,
        latest: SharedState<Option<LowState>>,
        control: Arc<JointControlLoop>,
    ) -> Self {
        Self {
            client,
            latest,
            control,
        }
    }

    /// Ask the robot for low-level control and start streaming commands.
    ///
    /// Fails without contacting the robot if no telemetry has arrived yet.
    /// A response with `success == false` is returned as-is and publishing
    /// stays off.
    pub fn enter_low_level(&self, timeout: Duration) -> Result<ServiceResponse, LinkError> {
        if self.latest.with(Option::is_none) {
            return Err(LinkError::Initialization(
                "no telemetry received yet, cannot seed joint targets".to_string(),
            ));
        }

        let response = self.client.set_control_mode(ControlMode::LowLevel, timeout)?;
        if !response.success {
            warn!(message = %response.message, "robot refused low-level mode");
            return Ok(response);
        }

        // Copy out first; the targets lock is taken only after this one is
        // released.
        let measured = self.latest.snapshot().ok_or_else(|| {
            LinkError::Initialization("telemetry disappeared during hand-over".to_string())
        })?;
        self.control
            .targets()
            .update(|targets| seed_targets(targets, &measured));
        self.control.set_enabled(true);
        info!(request_id = %response.request_id, "low-level control active");
        Ok(response)
    }

    /// Stop streaming and return control to the robot.
    ///
    /// Publishing is disabled before the request goes out, whatever the
    /// outcome.
    pub fn leave_low_level(&self, timeout: Duration) -> Result<ServiceResponse, LinkError> {
        self.control.set_enabled(false);
        let response = self.client.set_control_mode(ControlMode::HighLevel, timeout)?;
        info!(success = response.success, "high-level control requested");
        Ok(response)
    }

    pub fn set_mode(&self, mode: ControlMode, timeout: Duration) -> Result<ServiceResponse, LinkError> {
        match mode {
            ControlMode::LowLevel => self.enter_low_level(timeout),
            ControlMode::HighLevel => self.leave_low_level(timeout),
        }
    }

    /// `true` while commands are being streamed.
    pub fn is_low_level(&self) -> bool {
        self.control.is_enabled()
    }

    /// Set one joint's target position.
    pub fn set_target(&self, joint: usize, q: f32) -> Result<(), LinkError> {
        self.control.targets().update(|targets| match targets.q.get_mut(joint) {
            Some(slot) => {
                *slot = q;
                Ok(())
            }
            None => Err(LinkError::Config(format!("joint index {joint} out of range"))),
        })
    }

    pub fn targets(&self) -> JointTargets {
        self.control.targets().snapshot()
    }
}

fn seed_targets(targets: &mut JointTargets, measured: &LowState) {
    let positions = match targets.mode {
        KinematicMode::MotorSpace => measured.motor_positions(),
        KinematicMode::JointSpace => measured.joint_positions(),
    };
    *targets = JointTargets::from_positions(targets.mode, &positions);
}
