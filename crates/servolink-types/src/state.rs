//! Telemetry snapshots published by the robot.

use serde::{Deserialize, Serialize};

use crate::joint::N_JOINTS;
use crate::service::ControlMode;

/// Fault bits reported in [`MotorState::status_bits`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MotorFault(pub u32);

impl MotorFault {
    pub const NONE: MotorFault = MotorFault(0x0000_0000);
    pub const INITIALIZE: MotorFault = MotorFault(0x0000_0001);
    pub const PACKET_NOT_RECEIVED: MotorFault = MotorFault(0x0000_0002);
    /// Faults raised by the robot controller rather than the motor driver.
    pub const ROBOT_LEVEL_MASK: MotorFault = MotorFault(0x0000_0003);
    pub const MOTOR_STALL: MotorFault = MotorFault(0x0000_0004);
    pub const LOW_VOLTAGE: MotorFault = MotorFault(0x0000_0008);
    pub const OVER_VOLTAGE: MotorFault = MotorFault(0x0000_0010);
    pub const OVER_CURRENT: MotorFault = MotorFault(0x0000_0020);
    pub const POWER_OVERRUN: MotorFault = MotorFault(0x0000_0040);
    pub const CALIBRATION_WRITE: MotorFault = MotorFault(0x0000_0080);
    pub const SPEEDING: MotorFault = MotorFault(0x0000_0100);
    pub const COMPONENT_OVERTEMPERATURE: MotorFault = MotorFault(0x0000_0200);
    pub const MOTOR_OVERTEMPERATURE: MotorFault = MotorFault(0x0000_0400);
    pub const ENCODER_CALIBRATION: MotorFault = MotorFault(0x0000_0800);
    pub const ENCODER_DATA: MotorFault = MotorFault(0x0000_1000);
    pub const BRAKE_VOLTAGE_TOO_HIGH: MotorFault = MotorFault(0x0000_2000);
    pub const DRV_DRIVE: MotorFault = MotorFault(0x0000_4000);

    const TABLE: [(MotorFault, &'static str); 15] = [
        (Self::INITIALIZE, "initialize"),
        (Self::PACKET_NOT_RECEIVED, "packet_not_received"),
        (Self::MOTOR_STALL, "motor_stall"),
        (Self::LOW_VOLTAGE, "low_voltage"),
        (Self::OVER_VOLTAGE, "over_voltage"),
        (Self::OVER_CURRENT, "over_current"),
        (Self::POWER_OVERRUN, "power_overrun"),
        (Self::CALIBRATION_WRITE, "calibration_write"),
        (Self::SPEEDING, "speeding"),
        (Self::COMPONENT_OVERTEMPERATURE, "component_overtemperature"),
        (Self::MOTOR_OVERTEMPERATURE, "motor_overtemperature"),
        (Self::ENCODER_CALIBRATION, "encoder_calibration"),
        (Self::ENCODER_DATA, "encoder_data"),
        (Self::BRAKE_VOLTAGE_TOO_HIGH, "brake_voltage_too_high"),
        (Self::DRV_DRIVE, "drv_drive"),
    ];

    pub fn contains(self, other: MotorFault) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// `true` when any robot-level (controller side) fault is set.
    pub fn is_robot_level(self) -> bool {
        self.0 & Self::ROBOT_LEVEL_MASK.0 != 0
    }

    /// Names of every set fault bit, lowest bit first.
    pub fn names(self) -> Vec<&'static str> {
        Self::TABLE
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl std::ops::BitOr for MotorFault {
    type Output = MotorFault;

    fn bitor(self, rhs: MotorFault) -> MotorFault {
        MotorFault(self.0 | rhs.0)
    }
}

/// Measured state of one motor.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MotorState {
    pub id: u16,
    pub q: f32,
    pub dq: f32,
    pub tau_est: f32,
    pub temperature: f32,
    pub status_bits: u32,
}

impl MotorState {
    pub fn faults(&self) -> MotorFault {
        MotorFault(self.status_bits)
    }
}

/// Measured state of one joint (after the parallel-mechanism mapping).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct JointState {
    pub id: u16,
    pub q: f32,
    pub dq: f32,
    pub tau_est: f32,
}

/// Inertial measurement unit reading.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ImuState {
    /// `[w, x, y, z]`
    pub quaternion: [f32; 4],
    pub gyroscope: [f32; 3],
    pub accelerometer: [f32; 3],
    /// Roll, pitch, yaw in radians.
    pub rpy: [f32; 3],
}

/// Full state snapshot broadcast on the telemetry topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LowState {
    /// Robot-side sequence counter.
    pub tick: u64,
    pub motor_state: Vec<MotorState>,
    pub joint_state: Vec<JointState>,
    pub imu_state: ImuState,
}

impl Default for LowState {
    fn default() -> Self {
        Self {
            tick: 0,
            motor_state: (0..N_JOINTS)
                .map(|i| MotorState {
                    id: i as u16,
                    ..MotorState::default()
                })
                .collect(),
            joint_state: (0..N_JOINTS)
                .map(|i| JointState {
                    id: i as u16,
                    ..JointState::default()
                })
                .collect(),
            imu_state: ImuState::default(),
        }
    }
}

impl LowState {
    /// Motor positions in index order.
    pub fn motor_positions(&self) -> Vec<f32> {
        self.motor_state.iter().map(|m| m.q).collect()
    }

    /// Joint positions in index order.
    pub fn joint_positions(&self) -> Vec<f32> {
        self.joint_state.iter().map(|j| j.q).collect()
    }

    /// `(motor id, faults)` for every motor reporting a fault.
    pub fn faulted_motors(&self) -> Vec<(u16, MotorFault)> {
        self.motor_state
            .iter()
            .filter(|m| m.status_bits != 0)
            .map(|m| (m.id, m.faults()))
            .collect()
    }
}

/// Control mode currently active on the robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ControlModeState {
    pub mode: ControlMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_names_follow_bit_order() {
        let faults = MotorFault::OVER_CURRENT | MotorFault::LOW_VOLTAGE;
        assert_eq!(faults.names(), vec!["low_voltage", "over_current"]);
        assert!(!faults.is_robot_level());
    }

    #[test]
    fn robot_level_mask_matches_controller_faults() {
        assert!(MotorFault::PACKET_NOT_RECEIVED.is_robot_level());
        assert!(MotorFault::INITIALIZE.is_robot_level());
        assert!(!MotorFault::DRV_DRIVE.is_robot_level());
        assert!(MotorFault::NONE.is_empty());
        assert!(!MotorFault::NONE.contains(MotorFault::NONE));
    }

    #[test]
    fn faulted_motors_lists_only_nonzero_status() {
        let mut state = LowState::default();
        state.motor_state[4].status_bits = MotorFault::ENCODER_DATA.0;
        let faulted = state.faulted_motors();
        assert_eq!(faulted.len(), 1);
        assert_eq!(faulted[0].0, 4);
        assert!(faulted[0].1.contains(MotorFault::ENCODER_DATA));
    }

    #[test]
    fn default_state_positions_have_joint_count() {
        let state = LowState::default();
        assert_eq!(state.motor_positions().len(), N_JOINTS);
        assert_eq!(state.joint_positions().len(), N_JOINTS);
    }
}
