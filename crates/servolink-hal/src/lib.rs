//! `servolink-hal` – hardware-side peers.
//!
//! - [`sim`] – [`SimRobot`]: an in-process robot that answers the service
//!   requests, applies streamed commands and publishes telemetry, so the
//!   whole stack runs in tests and in the CLI's `--sim` mode without
//!   hardware.

pub mod sim;

pub use sim::{SimRobot, SimRobotBuilder, SimStats, SimTopics};
