//! In-process simulated robot for CI and demos.
//!
//! [`SimRobot`] plays the robot's side of every topic:
//!
//! - answers BMS-init, torque and control-mode requests with a
//!   [`ServiceResponse`] after a configurable latency (or never, when
//!   muted),
//! - applies the joint positions of every [`LowCmd`] whose checksum
//!   verifies, and counts the ones that do not,
//! - publishes [`LowState`] and [`ControlModeState`] at a fixed rate.
//!
//! # Example
//!
//! ```rust,no_run
//! use servolink_hal::SimRobot;
//! use servolink_middleware::{TransportConfig, TransportContext};
//! use std::time::Duration;
//!
//! let ctx = TransportContext::new();
//! ctx.init(&TransportConfig::default()).unwrap();
//! let sim = SimRobot::builder()
//!     .latency(Duration::from_millis(20))
//!     .start(&ctx)
//!     .unwrap();
//! assert_eq!(sim.stats().commands, 0);
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use servolink_middleware::{CancelToken, InChannel, OutChannel, TransportContext, topics};
use servolink_types::{
    BmsInitCmd, BmsInitType, ControlMode, ControlModeCmd, ControlModeState, Correlated, ImuState,
    LinkError, LowCmd, LowState, MotorFault, N_JOINTS, ServiceResponse, TorqueCmd, TorqueType,
};
use tracing::{debug, info, warn};

/// Idle motor temperature reported by the simulator, °C.
const AMBIENT_TEMPERATURE: f32 = 30.0;

/// Topic names the simulator serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimTopics {
    pub low_state: String,
    pub control_mode_state: String,
    pub low_cmd: String,
    pub bms_init_request: String,
    pub bms_init_response: String,
    pub torque_request: String,
    pub torque_response: String,
    pub control_mode_request: String,
    pub control_mode_response: String,
}

impl Default for SimTopics {
    fn default() -> Self {
        Self {
            low_state: topics::LOW_STATE.to_string(),
            control_mode_state: topics::CONTROL_MODE_STATE.to_string(),
            low_cmd: topics::LOW_CMD.to_string(),
            bms_init_request: topics::BMS_INIT_REQUEST.to_string(),
            bms_init_response: topics::BMS_INIT_RESPONSE.to_string(),
            torque_request: topics::TORQUE_REQUEST.to_string(),
            torque_response: topics::TORQUE_RESPONSE.to_string(),
            control_mode_request: topics::CONTROL_MODE_REQUEST.to_string(),
            control_mode_response: topics::CONTROL_MODE_RESPONSE.to_string(),
        }
    }
}

/// Point-in-time counters of a [`SimRobot`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    /// Service requests received, answered or not.
    pub requests: u64,
    /// Commands that passed checksum verification and were applied.
    pub commands: u64,
    pub crc_rejects: u64,
    /// Telemetry snapshots published.
    pub states_published: u64,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    commands: AtomicU64,
    crc_rejects: AtomicU64,
    states_published: AtomicU64,
}

struct World {
    bms: BmsInitType,
    torque: TorqueType,
    mode: ControlMode,
    q: [f32; N_JOINTS],
    faults: [u32; N_JOINTS],
    tick: u64,
}

impl Default for World {
    fn default() -> Self {
        Self {
            bms: BmsInitType::None,
            torque: TorqueType::Off,
            mode: ControlMode::HighLevel,
            q: [0.0; N_JOINTS],
            faults: [0; N_JOINTS],
            tick: 0,
        }
    }
}

impl World {
    fn low_state(&mut self) -> LowState {
        self.tick += 1;
        let mut state = LowState {
            tick: self.tick,
            imu_state: ImuState {
                quaternion: [1.0, 0.0, 0.0, 0.0],
                accelerometer: [0.0, 0.0, 9.81],
                ..ImuState::default()
            },
            ..LowState::default()
        };
        for (i, motor) in state.motor_state.iter_mut().enumerate() {
            motor.q = self.q[i];
            motor.temperature = AMBIENT_TEMPERATURE;
            motor.status_bits = self.faults[i];
        }
        for (i, joint) in state.joint_state.iter_mut().enumerate() {
            joint.q = self.q[i];
        }
        state
    }
}

/// Shared by every request handler.
#[derive(Clone)]
struct Responder {
    latency: Duration,
    muted: Arc<AtomicBool>,
    world: Arc<Mutex<World>>,
    counters: Arc<Counters>,
}

impl Responder {
    /// Subscribe to `request_topic` and answer on `response_topic`; `apply`
    /// updates the world and returns the response message.
    fn serve<Req>(
        &self,
        ctx: &TransportContext,
        request_topic: &str,
        response_topic: &str,
        apply: impl Fn(&Req, &mut World) -> String + Send + 'static,
    ) -> Result<InChannel<Req>, LinkError>
    where
        Req: DeserializeOwned + Correlated + fmt::Debug + Send + 'static,
    {
        let replies: OutChannel<ServiceResponse> = OutChannel::new(ctx, response_topic);
        replies.init()?;
        let requests = InChannel::new(ctx, request_topic);
        let this = self.clone();
        requests.start(move |request: Req| {
            this.counters.requests.fetch_add(1, Ordering::Relaxed);
            if this.muted.load(Ordering::SeqCst) {
                debug!(?request, "sim muted, request ignored");
                return;
            }
            if !this.latency.is_zero() {
                thread::sleep(this.latency);
            }
            let message = apply(&request, &mut this.world.lock());
            debug!(?request, %message, "sim answering request");
            replies.send(&ServiceResponse {
                request_id: request.request_id().to_string(),
                success: true,
                message,
            });
        })?;
        Ok(requests)
    }
}

/// Builder for [`SimRobot`].
#[derive(Debug, Clone)]
pub struct SimRobotBuilder {
    latency: Duration,
    state_period: Duration,
    muted: bool,
    topics: SimTopics,
}

impl Default for SimRobotBuilder {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(10),
            state_period: Duration::from_millis(10),
            muted: false,
            topics: SimTopics::default(),
        }
    }
}

impl SimRobotBuilder {
    /// Delay before each service response.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Interval between telemetry snapshots.
    pub fn state_period(mut self, period: Duration) -> Self {
        self.state_period = period;
        self
    }

    /// Start without answering service requests.
    pub fn muted(mut self, muted: bool) -> Self {
        self.muted = muted;
        self
    }

    pub fn topics(mut self, topics: SimTopics) -> Self {
        self.topics = topics;
        self
    }

    /// Subscribe to every request and command topic and start publishing
    /// telemetry.
    pub fn start(self, ctx: &TransportContext) -> Result<SimRobot, LinkError> {
        if self.state_period.is_zero() {
            return Err(LinkError::Config(
                "sim state period must be non-zero".to_string(),
            ));
        }
        let world = Arc::new(Mutex::new(World::default()));
        let counters = Arc::new(Counters::default());
        let muted = Arc::new(AtomicBool::new(self.muted));
        let responder = Responder {
            latency: self.latency,
            muted: Arc::clone(&muted),
            world: Arc::clone(&world),
            counters: Arc::clone(&counters),
        };
        let t = &self.topics;

        let bms_init = responder.serve(
            ctx,
            &t.bms_init_request,
            &t.bms_init_response,
            |cmd: &BmsInitCmd, world: &mut World| {
                world.bms = cmd.init;
                format!("bms init {:?}", cmd.init)
            },
        )?;
        let torque = responder.serve(
            ctx,
            &t.torque_request,
            &t.torque_response,
            |cmd: &TorqueCmd, world: &mut World| {
                world.torque = cmd.torque;
                format!("torque {:?}", cmd.torque)
            },
        )?;
        let control_mode = responder.serve(
            ctx,
            &t.control_mode_request,
            &t.control_mode_response,
            |cmd: &ControlModeCmd, world: &mut World| {
                world.mode = cmd.mode;
                format!("control mode {:?}", cmd.mode)
            },
        )?;

        let commands = InChannel::new(ctx, t.low_cmd.clone());
        let sink = Arc::clone(&world);
        let tally = Arc::clone(&counters);
        commands.start(move |cmd: LowCmd| {
            if !cmd.verify() {
                let rejects = tally.crc_rejects.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(rejects, "sim rejected command with bad checksum");
                return;
            }
            tally.commands.fetch_add(1, Ordering::Relaxed);
            let mut world = sink.lock();
            for motor in &cmd.motors {
                if let Some(q) = world.q.get_mut(usize::from(motor.id)) {
                    *q = motor.q;
                }
            }
        })?;

        let low_state: OutChannel<LowState> = OutChannel::new(ctx, t.low_state.clone());
        low_state.init()?;
        let mode_state: OutChannel<ControlModeState> =
            OutChannel::new(ctx, t.control_mode_state.clone());
        mode_state.init()?;

        let cancel = CancelToken::new();
        let publisher = StatePublisher {
            period: self.state_period,
            low_state,
            mode_state,
            world: Arc::clone(&world),
            counters: Arc::clone(&counters),
            cancel: cancel.clone(),
        };
        let handle = thread::Builder::new()
            .name("sim-state".to_string())
            .spawn(move || publisher.run())
            .map_err(|e| LinkError::Initialization(format!("spawn sim state thread: {e}")))?;

        info!(
            latency = ?self.latency,
            state_period = ?self.state_period,
            muted = self.muted,
            "sim robot started"
        );
        Ok(SimRobot {
            world,
            counters,
            muted,
            bms_init,
            torque,
            control_mode,
            commands,
            cancel,
            publisher: Mutex::new(Some(handle)),
        })
    }
}

struct StatePublisher {
    period: Duration,
    low_state: OutChannel<LowState>,
    mode_state: OutChannel<ControlModeState>,
    world: Arc<Mutex<World>>,
    counters: Arc<Counters>,
    cancel: CancelToken,
}

impl StatePublisher {
    fn run(self) {
        loop {
            let (state, mode) = {
                let mut world = self.world.lock();
                (world.low_state(), world.mode)
            };
            if self.low_state.send(&state) {
                self.counters.states_published.fetch_add(1, Ordering::Relaxed);
            }
            self.mode_state.send(&ControlModeState { mode });
            if !self.cancel.sleep_cancellable(self.period) {
                break;
            }
        }
        debug!("sim state publisher exiting");
    }
}

/// Running simulated robot. Stops on drop.
pub struct SimRobot {
    world: Arc<Mutex<World>>,
    counters: Arc<Counters>,
    muted: Arc<AtomicBool>,
    bms_init: InChannel<BmsInitCmd>,
    torque: InChannel<TorqueCmd>,
    control_mode: InChannel<ControlModeCmd>,
    commands: InChannel<LowCmd>,
    cancel: CancelToken,
    publisher: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for SimRobot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimRobot")
            .field("control_mode", &self.control_mode())
            .field("stats", &self.stats())
            .finish()
    }
}

impl SimRobot {
    pub fn builder() -> SimRobotBuilder {
        SimRobotBuilder::default()
    }

    /// Stop or resume answering service requests.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    pub fn bms(&self) -> BmsInitType {
        self.world.lock().bms
    }

    pub fn torque(&self) -> TorqueType {
        self.world.lock().torque
    }

    pub fn control_mode(&self) -> ControlMode {
        self.world.lock().mode
    }

    /// Current position of every joint.
    pub fn positions(&self) -> [f32; N_JOINTS] {
        self.world.lock().q
    }

    /// Report `fault` on `motor` in subsequent telemetry. `MotorFault::NONE`
    /// clears it.
    pub fn inject_fault(&self, motor: usize, fault: MotorFault) -> Result<(), LinkError> {
        let mut world = self.world.lock();
        let slot = world
            .faults
            .get_mut(motor)
            .ok_or_else(|| LinkError::Config(format!("motor index {motor} out of range")))?;
        *slot = fault.0;
        Ok(())
    }

    pub fn stats(&self) -> SimStats {
        SimStats {
            requests: self.counters.requests.load(Ordering::Relaxed),
            commands: self.counters.commands.load(Ordering::Relaxed),
            crc_rejects: self.counters.crc_rejects.load(Ordering::Relaxed),
            states_published: self.counters.states_published.load(Ordering::Relaxed),
        }
    }

    /// Stop every subscriber and the telemetry thread. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.publisher.lock().take() {
            if handle.join().is_err() {
                warn!("sim state publisher panicked");
            }
        }
        self.bms_init.stop();
        self.torque.stop();
        self.control_mode.stop();
        self.commands.stop();
    }
}

impl Drop for SimRobot {
    fn drop(&mut self) {
        self.stop();
    }
}
