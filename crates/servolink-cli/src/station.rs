//! Everything the operator shell drives, wired up from one [`Config`].

use std::sync::Arc;
use std::time::Duration;

use servolink_hal::SimRobot;
use servolink_middleware::{TransportConfig, TransportContext};
use servolink_runtime::{
    ControlLoopConfig, JointControlLoop, JointTargets, LowLevelSession, PdCommandBuilder,
    RobotClient, SharedState, StateMonitor,
};
use servolink_types::{ControlModeState, LinkError, LowState};
use tracing::info;

use crate::config::Config;

/// A running station: transport context, optional simulated robot, service
/// client, telemetry monitors and the command loop.
pub struct Station {
    pub ctx: TransportContext,
    pub sim: Option<SimRobot>,
    pub client: Arc<RobotClient>,
    pub low_state: StateMonitor<LowState>,
    pub mode_state: StateMonitor<ControlModeState>,
    pub control: Arc<JointControlLoop>,
    pub session: LowLevelSession,
    pub timeout: Duration,
}

impl Station {
    /// Initialise a fresh transport context from `cfg` and bring everything
    /// up on it. With `sim`, a simulated robot answers on the same domain.
    pub fn bring_up(cfg: &Config, sim: bool) -> Result<Self, LinkError> {
        cfg.validate()?;
        let ctx = TransportContext::new();
        ctx.init(&TransportConfig::with_domain(cfg.domain_id))?;
        Self::bring_up_on(ctx, cfg, sim)
    }

    /// Bring the station up on an already initialised context.
    pub fn bring_up_on(ctx: TransportContext, cfg: &Config, sim: bool) -> Result<Self, LinkError> {
        let sim = if sim {
            Some(
                SimRobot::builder()
                    .topics(cfg.topics.sim_topics())
                    .start(&ctx)?,
            )
        } else {
            None
        };

        let client = Arc::new(RobotClient::new(&ctx, &cfg.topics.services)?);
        client.set_timeout(cfg.service_timeout());

        let low_state = StateMonitor::start(&ctx, &cfg.topics.low_state)?;
        let mode_state = StateMonitor::start(&ctx, &cfg.topics.control_mode_state)?;

        let control = Arc::new(JointControlLoop::new(
            &ctx,
            ControlLoopConfig {
                period: cfg.period(),
                topic: cfg.topics.low_cmd.clone(),
                enabled: false,
            },
            PdCommandBuilder::new(cfg.gain_table()?),
            SharedState::new(JointTargets::default()),
        ));
        control.start()?;

        let session = LowLevelSession::new(
            Arc::clone(&client),
            low_state.shared(),
            Arc::clone(&control),
        );

        info!(
            domain_id = cfg.domain_id,
            period_us = cfg.period_us,
            sim = sim.is_some(),
            "station up"
        );
        Ok(Self {
            ctx,
            sim,
            client,
            low_state,
            mode_state,
            control,
            session,
            timeout: cfg.service_timeout(),
        })
    }

    /// Stop publishing, then tear everything down in reverse order of
    /// bring-up. Idempotent.
    pub fn shutdown(&self) {
        self.control.set_enabled(false);
        self.control.stop();
        self.low_state.stop();
        self.mode_state.stop();
        self.client.shutdown();
        if let Some(sim) = &self.sim {
            sim.stop();
        }
        self.ctx.release();
    }
}

impl Drop for Station {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use servolink_runtime::LoopState;
    use servolink_types::ControlMode;

    fn sim_config() -> Config {
        Config {
            period_us: 5_000,
            service_timeout_ms: 2_000,
            ..Config::default()
        }
    }

    #[test]
    fn sim_station_enters_and_leaves_low_level() -> Result<(), Box<dyn std::error::Error>> {
        let station = Station::bring_up(&sim_config(), true)?;
        assert!(station.low_state.wait_for_first_state(Duration::from_secs(2)).is_some());

        let response = station.session.enter_low_level(station.timeout)?;
        assert!(response.success);
        assert!(station.session.is_low_level());

        let sim = station.sim.as_ref().ok_or("sim missing")?;
        assert_eq!(sim.control_mode(), ControlMode::LowLevel);

        station.session.leave_low_level(station.timeout)?;
        assert!(!station.session.is_low_level());
        station.shutdown();
        Ok(())
    }

    #[test]
    fn shutdown_stops_loop_and_releases_context() -> Result<(), Box<dyn std::error::Error>> {
        let station = Station::bring_up(&sim_config(), true)?;
        station.shutdown();
        assert_eq!(station.control.state(), LoopState::Stopped);
        assert!(!station.ctx.is_initialized());
        station.shutdown();
        Ok(())
    }

    #[test]
    fn invalid_config_fails_bring_up() {
        let mut cfg = sim_config();
        cfg.gains.kp.truncate(3);
        assert!(matches!(
            Station::bring_up(&cfg, false),
            Err(LinkError::Config(_))
        ));
    }
}
