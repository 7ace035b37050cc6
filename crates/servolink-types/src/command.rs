//! Actuation messages published on the command topic.

use serde::{Deserialize, Serialize};

use crate::joint::N_JOINTS;
use crate::util::crc32_core;

/// How the robot interprets the per-motor targets of a [`LowCmd`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum KinematicMode {
    /// Motor space: targets are raw motor positions.
    #[default]
    MotorSpace,
    /// Parallel joint space: targets are joint angles.
    JointSpace,
}

impl KinematicMode {
    fn code(self) -> u32 {
        match self {
            KinematicMode::MotorSpace => 0,
            KinematicMode::JointSpace => 1,
        }
    }
}

/// Command for a single motor: position / velocity / feed-forward torque
/// targets plus the PD gains the motor driver should apply.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MotorCmd {
    pub id: u16,
    pub q: f32,
    pub dq: f32,
    pub tau: f32,
    pub kp: f32,
    pub kd: f32,
}

impl MotorCmd {
    pub fn new(id: u16, q: f32, dq: f32, tau: f32, kp: f32, kd: f32) -> Self {
        Self {
            id,
            q,
            dq,
            tau,
            kp,
            kd,
        }
    }

    fn words(&self) -> [u32; 6] {
        [
            u32::from(self.id),
            self.q.to_bits(),
            self.dq.to_bits(),
            self.tau.to_bits(),
            self.kp.to_bits(),
            self.kd.to_bits(),
        ]
    }
}

/// Full actuation snapshot for every motor, sealed with a checksum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LowCmd {
    pub kinematic_mode: KinematicMode,
    pub motors: Vec<MotorCmd>,
    /// Checksum over the numeric fields; see [`LowCmd::seal`].
    pub crc: u32,
}

impl Default for LowCmd {
    /// A zero-gain command for every joint, with motor ids filled in.
    fn default() -> Self {
        Self {
            kinematic_mode: KinematicMode::default(),
            motors: (0..N_JOINTS)
                .map(|i| MotorCmd {
                    id: i as u16,
                    ..MotorCmd::default()
                })
                .collect(),
            crc: 0,
        }
    }
}

impl LowCmd {
    /// Compute the checksum of the current contents.
    pub fn checksum(&self) -> u32 {
        let mut words = Vec::with_capacity(1 + self.motors.len() * 6);
        words.push(self.kinematic_mode.code());
        for motor in &self.motors {
            words.extend_from_slice(&motor.words());
        }
        crc32_core(&words)
    }

    /// Fill in [`LowCmd::crc`] and return the sealed command.
    pub fn seal(mut self) -> Self {
        self.crc = self.checksum();
        self
    }

    /// `true` when the stored checksum matches the contents.
    pub fn verify(&self) -> bool {
        self.crc == self.checksum()
    }
}
