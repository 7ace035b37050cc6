//! Mapping from joint targets to outbound actuation commands.

use serde::{Deserialize, Serialize};
use servolink_types::{KinematicMode, LinkError, LowCmd, MotorCmd, N_JOINTS};

/// Turns a copy of the shared targets into the command published on one
/// tick. Runs on the control thread without holding any lock.
pub trait CommandBuilder: Send + 'static {
    type Targets: Clone + Send + 'static;
    type Command: Serialize + Clone + Send + 'static;

    fn build(&self, targets: &Self::Targets) -> Self::Command;
}

/// Desired joint positions for every joint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JointTargets {
    pub mode: KinematicMode,
    pub q: [f32; N_JOINTS],
}

impl Default for JointTargets {
    fn default() -> Self {
        Self {
            mode: KinematicMode::MotorSpace,
            q: [0.0; N_JOINTS],
        }
    }
}

impl JointTargets {
    /// Targets from the first [`N_JOINTS`] entries of `positions`; missing
    /// entries stay at zero.
    pub fn from_positions(mode: KinematicMode, positions: &[f32]) -> Self {
        let mut q = [0.0; N_JOINTS];
        for (slot, value) in q.iter_mut().zip(positions) {
            *slot = *value;
        }
        Self { mode, q }
    }
}

/// Per-joint proportional and derivative gains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GainTable {
    kp: Vec<f32>,
    kd: Vec<f32>,
}

impl Default for GainTable {
    /// Zero gains: the motors hold no position.
    fn default() -> Self {
        Self::uniform(0.0, 0.0)
    }
}

impl GainTable {
    pub fn new(kp: Vec<f32>, kd: Vec<f32>) -> Result<Self, LinkError> {
        if kp.len() != N_JOINTS || kd.len() != N_JOINTS {
            return Err(LinkError::Config(format!(
                "gain table needs {N_JOINTS} kp and kd entries, got {} and {}",
                kp.len(),
                kd.len()
            )));
        }
        Ok(Self { kp, kd })
    }

    pub fn uniform(kp: f32, kd: f32) -> Self {
        Self {
            kp: vec![kp; N_JOINTS],
            kd: vec![kd; N_JOINTS],
        }
    }

    /// `(kp, kd)` of joint `index`; zero past the table.
    pub fn gains(&self, index: usize) -> (f32, f32) {
        (
            self.kp.get(index).copied().unwrap_or(0.0),
            self.kd.get(index).copied().unwrap_or(0.0),
        )
    }
}

/// Position-hold PD command: `q` from the targets, zero velocity and
/// feed-forward torque, gains from the table. Output is sealed.
#[derive(Debug, Clone, Default)]
pub struct PdCommandBuilder {
    gains: GainTable,
}

impl PdCommandBuilder {
    pub fn new(gains: GainTable) -> Self {
        Self { gains }
    }
}

impl CommandBuilder for PdCommandBuilder {
    type Targets = JointTargets;
    type Command = LowCmd;

    fn build(&self, targets: &JointTargets) -> LowCmd {
        let motors = targets
            .q
            .iter()
            .enumerate()
            .map(|(i, &q)| {
                let (kp, kd) = self.gains.gains(i);
                MotorCmd::new(i as u16, q, 0.0, 0.0, kp, kd)
            })
            .collect();
        LowCmd {
            kinematic_mode: targets.mode,
            motors,
            crc: 0,
        }
        .seal()
    }
}
