//! Joint indices for the 31-joint platform.
//!
//! Indices are shared between motor space and joint space; the kinematic
//! mode of a [`LowCmd`][crate::LowCmd] decides how the values are
//! interpreted by the robot.

/// Number of actuated joints.
pub const N_JOINTS: usize = 31;

// Left leg
pub const L_HIP_PITCH: usize = 0;
pub const L_HIP_ROLL: usize = 1;
pub const L_HIP_YAW: usize = 2;
pub const L_KNEE: usize = 3;
pub const L_ANKLE_PITCH: usize = 4;
pub const L_ANKLE_ROLL: usize = 5;

// Right leg
pub const R_HIP_PITCH: usize = 6;
pub const R_HIP_ROLL: usize = 7;
pub const R_HIP_YAW: usize = 8;
pub const R_KNEE: usize = 9;
pub const R_ANKLE_PITCH: usize = 10;
pub const R_ANKLE_ROLL: usize = 11;

// Waist
pub const WAIST_YAW: usize = 12;
pub const WAIST_ROLL: usize = 13;
pub const WAIST_PITCH: usize = 14;

// Left arm
pub const L_SHOULDER_PITCH: usize = 15;
pub const L_SHOULDER_ROLL: usize = 16;
pub const L_SHOULDER_YAW: usize = 17;
pub const L_ELBOW: usize = 18;
pub const L_WRIST_ROLL: usize = 19;
pub const L_WRIST_PITCH: usize = 20;
pub const L_WRIST_YAW: usize = 21;
pub const L_HAND: usize = 22;

// Right arm
pub const R_SHOULDER_PITCH: usize = 23;
pub const R_SHOULDER_ROLL: usize = 24;
pub const R_SHOULDER_YAW: usize = 25;
pub const R_ELBOW: usize = 26;
pub const R_WRIST_ROLL: usize = 27;
pub const R_WRIST_PITCH: usize = 28;
pub const R_WRIST_YAW: usize = 29;
pub const R_HAND: usize = 30;

const NAMES: [&str; N_JOINTS] = [
    "l_hip_pitch",
    "l_hip_roll",
    "l_hip_yaw",
    "l_knee",
    "l_ankle_pitch",
    "l_ankle_roll",
    "r_hip_pitch",
    "r_hip_roll",
    "r_hip_yaw",
    "r_knee",
    "r_ankle_pitch",
    "r_ankle_roll",
    "waist_yaw",
    "waist_roll",
    "waist_pitch",
    "l_shoulder_pitch",
    "l_shoulder_roll",
    "l_shoulder_yaw",
    "l_elbow",
    "l_wrist_roll",
    "l_wrist_pitch",
    "l_wrist_yaw",
    "l_hand",
    "r_shoulder_pitch",
    "r_shoulder_roll",
    "r_shoulder_yaw",
    "r_elbow",
    "r_wrist_roll",
    "r_wrist_pitch",
    "r_wrist_yaw",
    "r_hand",
];

/// Human-readable name of joint `index`, or `None` when out of range.
pub fn name(index: usize) -> Option<&'static str> {
    NAMES.get(index).copied()
}

/// Resolve a joint by name (case-insensitive) or by numeric index.
pub fn lookup(key: &str) -> Option<usize> {
    if let Ok(index) = key.parse::<usize>() {
        return (index < N_JOINTS).then_some(index);
    }
    let key = key.to_ascii_lowercase();
    NAMES.iter().position(|n| *n == key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_cover_every_joint() {
        assert_eq!(name(L_HIP_PITCH), Some("l_hip_pitch"));
        assert_eq!(name(WAIST_PITCH), Some("waist_pitch"));
        assert_eq!(name(R_HAND), Some("r_hand"));
        assert_eq!(name(N_JOINTS), None);
    }

    #[test]
    fn lookup_by_name_or_index() {
        assert_eq!(lookup("L_ELBOW"), Some(L_ELBOW));
        assert_eq!(lookup("26"), Some(R_ELBOW));
        assert_eq!(lookup("31"), None);
        assert_eq!(lookup("tail"), None);
    }
}
