//! Fixed-period command publisher.
//!
//! [`RealtimeControlLoop`] runs on its own thread (`rt-control`). Each tick
//! copies the shared targets out, builds a command with a
//! [`CommandBuilder`], publishes it, then sleeps to an absolute deadline on
//! a fixed grid: `next = previous + period`, regardless of how long the
//! tick took.
//!
//! # Overruns
//!
//! When a deadline has already passed, the loop counts an overrun, snaps
//! the deadline to the latest grid point not after *now* and runs exactly
//! one tick immediately. Missed ticks are skipped, never replayed.
//!
//! # States
//!
//! `Idle → Running → Stopping → Stopped`. A stopped loop is not restartable.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use servolink_middleware::{CancelToken, OutChannel, TransportContext};
use servolink_types::LinkError;
use tracing::{debug, error, info, warn};

use crate::command_builder::CommandBuilder;
use crate::state::SharedState;

/// Default control period (500 Hz).
pub const DEFAULT_PERIOD: Duration = Duration::from_micros(2000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum LoopState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl LoopState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LoopState::Idle,
            1 => LoopState::Running,
            2 => LoopState::Stopping,
            _ => LoopState::Stopped,
        }
    }
}

/// Static settings of a [`RealtimeControlLoop`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlLoopConfig {
    pub period: Duration,
    /// Command topic.
    pub topic: String,
    /// Whether publishing is enabled when the loop starts.
    pub enabled: bool,
}

impl Default for ControlLoopConfig {
    fn default() -> Self {
        Self {
            period: DEFAULT_PERIOD,
            topic: servolink_middleware::topics::LOW_CMD.to_string(),
            enabled: false,
        }
    }
}

/// Point-in-time counters of a [`RealtimeControlLoop`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    /// Loop iterations, enabled or not.
    pub ticks: u64,
    /// Commands handed to the transport.
    pub published: u64,
    pub publish_failures: u64,
    /// Ticks whose deadline had already passed.
    pub overruns: u64,
}

#[derive(Default)]
struct Counters {
    ticks: AtomicU64,
    published: AtomicU64,
    publish_failures: AtomicU64,
    overruns: AtomicU64,
}

struct Shared {
    state: AtomicU8,
    enabled: AtomicBool,
    counters: Counters,
}

impl Shared {
    fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: LoopState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

pub struct RealtimeControlLoop<B: CommandBuilder> {
    ctx: TransportContext,
    config: ControlLoopConfig,
    targets: SharedState<B::Targets>,
    last_command: SharedState<Option<B::Command>>,
    shared: Arc<Shared>,
    cancel: CancelToken,
    builder: Mutex<Option<B>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<B: CommandBuilder> fmt::Debug for RealtimeControlLoop<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeControlLoop")
            .field("topic", &self.config.topic)
            .field("period", &self.config.period)
            .field("state", &self.state())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl<B: CommandBuilder> RealtimeControlLoop<B> {
    /// A loop in the `Idle` state reading `targets` on every tick.
    pub fn new(
        ctx: &TransportContext,
        config: ControlLoopConfig,
        builder: B,
        targets: SharedState<B::Targets>,
    ) -> Self {
        let enabled = config.enabled;
        Self {
            ctx: ctx.clone(),
            config,
            targets,
            last_command: SharedState::new(None),
            shared: Arc::new(Shared {
                state: AtomicU8::new(LoopState::Idle as u8),
                enabled: AtomicBool::new(enabled),
                counters: Counters::default(),
            }),
            cancel: CancelToken::new(),
            builder: Mutex::new(Some(builder)),
            worker: Mutex::new(None),
        }
    }

    /// Start the scheduling thread.
    ///
    /// Fails when the loop is not `Idle`, the period is zero, or the command
    /// topic cannot be set up (for instance because the context is not
    /// initialised). A failed start leaves the loop `Idle`.
    pub fn start(&self) -> Result<(), LinkError> {
        if self
            .shared
            .state
            .compare_exchange(
                LoopState::Idle as u8,
                LoopState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(LinkError::Initialization(format!(
                "control loop cannot start from {:?}",
                self.state()
            )));
        }
        self.spawn().inspect_err(|e| {
            self.shared.set_state(LoopState::Idle);
            error!(error = %e, "control loop failed to start");
        })
    }

    fn spawn(&self) -> Result<(), LinkError> {
        let period = self.config.period;
        if period.is_zero() {
            return Err(LinkError::Initialization(
                "control period must be non-zero".to_string(),
            ));
        }
        let publisher = OutChannel::new(&self.ctx, self.config.topic.clone());
        publisher.init()?;
        let builder = self
            .builder
            .lock()
            .take()
            .ok_or_else(|| LinkError::Initialization("control loop builder missing".to_string()))?;

        let ticker = Ticker {
            period,
            builder,
            publisher,
            targets: self.targets.clone(),
            last_command: self.last_command.clone(),
            shared: Arc::clone(&self.shared),
            cancel: self.cancel.clone(),
            failing: false,
        };
        let handle = thread::Builder::new()
            .name("rt-control".to_string())
            .spawn(move || ticker.run())
            .map_err(|e| LinkError::Initialization(format!("spawn control thread: {e}")))?;
        *self.worker.lock() = Some(handle);
        info!(topic = %self.config.topic, ?period, "control loop started");
        Ok(())
    }

    /// Stop the loop and wait for the thread to exit.
    ///
    /// After return no further tick runs. Idempotent and callable from any
    /// thread; from the loop thread itself it only signals.
    pub fn stop(&self) {
        let _ = self.shared.state.compare_exchange(
            LoopState::Running as u8,
            LoopState::Stopping as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        // An idle loop goes straight to Stopped.
        let _ = self.shared.state.compare_exchange(
            LoopState::Idle as u8,
            LoopState::Stopped as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.cancel.cancel();

        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!("control thread panicked");
        }
        self.shared.set_state(LoopState::Stopped);
        info!(stats = ?self.stats(), "control loop stopped");
    }

    /// Toggle publishing. The loop keeps ticking while disabled.
    pub fn set_enabled(&self, enabled: bool) {
        let was = self.shared.enabled.swap(enabled, Ordering::SeqCst);
        if was != enabled {
            info!(enabled, "control loop publishing toggled");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> LoopState {
        self.shared.state()
    }

    pub fn period(&self) -> Duration {
        self.config.period
    }

    /// Handle to the targets read on every tick.
    pub fn targets(&self) -> SharedState<B::Targets> {
        self.targets.clone()
    }

    /// Copy of the most recently published command.
    pub fn last_command(&self) -> Option<B::Command> {
        self.last_command.snapshot()
    }

    pub fn stats(&self) -> LoopStats {
        let c = &self.shared.counters;
        LoopStats {
            ticks: c.ticks.load(Ordering::Relaxed),
            published: c.published.load(Ordering::Relaxed),
            publish_failures: c.publish_failures.load(Ordering::Relaxed),
            overruns: c.overruns.load(Ordering::Relaxed),
        }
    }
}

impl<B: CommandBuilder> Drop for RealtimeControlLoop<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Scheduling thread
// ────────────────────────────────────────────────────────────────────────────

struct Ticker<B: CommandBuilder> {
    period: Duration,
    builder: B,
    publisher: OutChannel<B::Command>,
    targets: SharedState<B::Targets>,
    last_command: SharedState<Option<B::Command>>,
    shared: Arc<Shared>,
    cancel: CancelToken,
    // Last publish failed; failures are logged on the edge only.
    failing: bool,
}

impl<B: CommandBuilder> Ticker<B> {
    fn run(mut self) {
        let mut deadline = Instant::now();
        loop {
            if self.cancel.is_cancelled() || self.shared.state() != LoopState::Running {
                break;
            }
            if self.shared.enabled.load(Ordering::SeqCst) {
                self.tick();
            }
            self.shared.counters.ticks.fetch_add(1, Ordering::Relaxed);

            deadline = next_deadline(deadline, self.period, Instant::now(), || {
                self.shared.counters.overruns.fetch_add(1, Ordering::Relaxed);
            });
            if !self.cancel.sleep_until(deadline) {
                break;
            }
        }
        self.shared.set_state(LoopState::Stopped);
        debug!("control thread exiting");
    }

    fn tick(&mut self) {
        let targets = self.targets.snapshot();
        let command = self.builder.build(&targets);
        match self.publisher.try_send(&command) {
            Ok(()) => {
                self.shared.counters.published.fetch_add(1, Ordering::Relaxed);
                if self.failing {
                    info!(topic = %self.publisher.topic(), "command publishing recovered");
                    self.failing = false;
                }
            }
            Err(e) => {
                self.shared
                    .counters
                    .publish_failures
                    .fetch_add(1, Ordering::Relaxed);
                if !self.failing {
                    warn!(topic = %self.publisher.topic(), error = %e, "command publish failed");
                    self.failing = true;
                }
            }
        }
        self.last_command.set(Some(command));
    }
}

/// Deadline following `previous` on the grid of `period`.
///
/// Normally `previous + period`. If that is not after `now` the tick
/// overran: `on_overrun` fires and the result is the latest grid point not
/// after `now`, so the caller runs one tick immediately and then falls back
/// onto the grid.
fn next_deadline(
    previous: Instant,
    period: Duration,
    now: Instant,
    on_overrun: impl FnOnce(),
) -> Instant {
    let next = previous + period;
    if next > now {
        return next;
    }
    on_overrun();
    let missed = (now - next).as_nanos() / period.as_nanos();
    let skip = u64::try_from(period.as_nanos() * missed).unwrap_or(u64::MAX);
    next + Duration::from_nanos(skip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_builder::{JointTargets, PdCommandBuilder};
    use servolink_middleware::{InChannel, TransportConfig};
    use servolink_types::LowCmd;
    use std::sync::mpsc;

    const TOPIC: &str = "test/lowcmd";

    fn context() -> TransportContext {
        let ctx = TransportContext::new();
        ctx.init(&TransportConfig::default()).unwrap();
        ctx
    }

    fn config(period_ms: u64, enabled: bool) -> ControlLoopConfig {
        ControlLoopConfig {
            period: Duration::from_millis(period_ms),
            topic: TOPIC.to_string(),
            enabled,
        }
    }

    /// Emits its tick index; sleeps `delay` on every tick, or `spike` on the
    /// tick numbered `spike_at`.
    struct TimedBuilder {
        delay: Duration,
        spike_at: Option<(u64, Duration)>,
        calls: AtomicU64,
    }

    impl TimedBuilder {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                spike_at: None,
                calls: AtomicU64::new(0),
            }
        }
    }

    impl CommandBuilder for TimedBuilder {
        type Targets = u32;
        type Command = u64;

        fn build(&self, _targets: &u32) -> u64 {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.spike_at {
                Some((at, spike)) if at == n => thread::sleep(spike),
                _ => thread::sleep(self.delay),
            }
            n
        }
    }

    #[test]
    fn next_deadline_stays_on_grid() {
        let t0 = Instant::now();
        let p = Duration::from_millis(10);
        let mut overran = false;
        let next = next_deadline(t0, p, t0 + Duration::from_millis(3), || overran = true);
        assert_eq!(next, t0 + p);
        assert!(!overran);
    }

    #[test]
    fn next_deadline_snaps_forward_after_overrun() {
        let t0 = Instant::now();
        let p = Duration::from_millis(10);
        let mut overruns = 0;
        let now = t0 + Duration::from_millis(37);
        let next = next_deadline(t0, p, now, || overruns += 1);
        assert_eq!(overruns, 1);
        // Latest grid point not after `now`.
        assert_eq!(next, t0 + Duration::from_millis(30));
        // The following deadline is back in the future.
        let after = next_deadline(next, p, now, || overruns += 1);
        assert_eq!(after, t0 + Duration::from_millis(40));
        assert_eq!(overruns, 1);
    }

    #[test]
    fn start_without_context_fails_and_stays_idle() {
        let ctx = TransportContext::new();
        let control = RealtimeControlLoop::new(
            &ctx,
            config(10, true),
            PdCommandBuilder::default(),
            SharedState::new(JointTargets::default()),
        );
        assert!(matches!(control.start(), Err(LinkError::Initialization(_))));
        assert_eq!(control.state(), LoopState::Idle);

        ctx.init(&TransportConfig::default()).unwrap();
        control.start().unwrap();
        assert_eq!(control.state(), LoopState::Running);
        control.stop();
    }

    #[test]
    fn publish_count_tracks_elapsed_periods_despite_slow_ticks() {
        let ctx = context();
        let period = Duration::from_millis(20);
        let control = RealtimeControlLoop::new(
            &ctx,
            config(20, true),
            TimedBuilder::new(period / 2),
            SharedState::new(0u32),
        );

        let start = Instant::now();
        control.start().unwrap();
        thread::sleep(Duration::from_secs(1));
        control.stop();
        let elapsed = start.elapsed();

        let expected = (elapsed.as_secs_f64() / period.as_secs_f64()).round() as i64;
        let published = control.stats().published as i64;
        assert!(
            (published - expected).abs() <= 1,
            "published {published}, expected about {expected}"
        );
        assert_eq!(control.stats().publish_failures, 0);
    }

    #[test]
    fn overrun_skips_missed_ticks_without_burst() {
        let ctx = context();
        let period = Duration::from_millis(10);
        let builder = TimedBuilder {
            delay: Duration::ZERO,
            spike_at: Some((5, Duration::from_millis(65))),
            calls: AtomicU64::new(0),
        };
        let control =
            RealtimeControlLoop::new(&ctx, config(10, true), builder, SharedState::new(0u32));

        let start = Instant::now();
        control.start().unwrap();
        thread::sleep(Duration::from_millis(300));
        control.stop();
        let elapsed = start.elapsed();

        let stats = control.stats();
        assert!(stats.overruns >= 1);
        let grid_points = (elapsed.as_secs_f64() / period.as_secs_f64()).round() as u64;
        // The periods swallowed by the spike are not replayed.
        assert!(
            stats.published <= grid_points - 2,
            "published {} of {grid_points} grid points",
            stats.published
        );
    }

    #[test]
    fn disabled_loop_ticks_without_publishing() {
        let ctx = context();
        let control = RealtimeControlLoop::new(
            &ctx,
            config(5, false),
            TimedBuilder::new(Duration::ZERO),
            SharedState::new(0u32),
        );
        control.start().unwrap();
        thread::sleep(Duration::from_millis(60));
        let stats = control.stats();
        assert!(stats.ticks > 0);
        assert_eq!(stats.published, 0);
        assert!(control.last_command().is_none());

        control.set_enabled(true);
        thread::sleep(Duration::from_millis(60));
        control.stop();
        assert!(control.stats().published > 0);
        assert!(control.last_command().is_some());
    }

    #[test]
    fn published_commands_follow_targets() {
        let ctx = context();
        let (tx, rx) = mpsc::channel();
        let sub: InChannel<LowCmd> = InChannel::new(&ctx, TOPIC);
        sub.start(move |cmd: LowCmd| {
            let _ = tx.send(cmd);
        })
        .unwrap();

        let targets = SharedState::new(JointTargets::default());
        let control =
            RealtimeControlLoop::new(&ctx, config(5, true), PdCommandBuilder::default(), targets.clone());
        control.start().unwrap();
        targets.update(|t| t.q[3] = 0.5);

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut seen = false;
        while Instant::now() < deadline {
            if let Ok(cmd) = rx.recv_timeout(Duration::from_millis(100)) {
                assert!(cmd.verify());
                if (cmd.motors[3].q - 0.5).abs() < f32::EPSILON {
                    seen = true;
                    break;
                }
            }
        }
        control.stop();
        sub.stop();
        assert!(seen, "target change never reached the wire");
    }

    #[test]
    fn stop_is_idempotent_and_final() {
        let ctx = context();
        let control = Arc::new(RealtimeControlLoop::new(
            &ctx,
            config(5, true),
            TimedBuilder::new(Duration::ZERO),
            SharedState::new(0u32),
        ));
        control.start().unwrap();
        thread::sleep(Duration::from_millis(30));

        let other = Arc::clone(&control);
        thread::spawn(move || other.stop()).join().unwrap();
        control.stop();
        assert_eq!(control.state(), LoopState::Stopped);

        let ticks = control.stats().ticks;
        thread::sleep(Duration::from_millis(30));
        assert_eq!(control.stats().ticks, ticks);
        assert!(control.start().is_err());
    }

    #[test]
    fn publish_failure_is_not_fatal() {
        let ctx = context();
        let control = RealtimeControlLoop::new(
            &ctx,
            config(5, true),
            TimedBuilder::new(Duration::ZERO),
            SharedState::new(0u32),
        );
        control.start().unwrap();
        thread::sleep(Duration::from_millis(20));
        ctx.release();
        thread::sleep(Duration::from_millis(40));

        assert_eq!(control.state(), LoopState::Running);
        assert!(control.stats().publish_failures > 0);
        control.stop();
        assert_eq!(control.state(), LoopState::Stopped);
    }

    #[test]
    fn stopping_an_idle_loop_prevents_start() {
        let ctx = context();
        let control = RealtimeControlLoop::new(
            &ctx,
            config(5, true),
            TimedBuilder::new(Duration::ZERO),
            SharedState::new(0u32),
        );
        control.stop();
        assert_eq!(control.state(), LoopState::Stopped);
        assert!(control.start().is_err());
    }
}
