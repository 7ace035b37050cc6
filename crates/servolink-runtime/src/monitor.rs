//! Latest-value tracking for telemetry topics.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::de::DeserializeOwned;
use servolink_middleware::{InChannel, TransportContext};
use servolink_types::LinkError;
use tracing::info;

use crate::state::SharedState;

#[derive(Default)]
struct FirstArrival {
    arrived: Mutex<bool>,
    signal: Condvar,
}

impl FirstArrival {
    fn mark(&self) -> bool {
        let mut arrived = self.arrived.lock();
        if *arrived {
            return false;
        }
        *arrived = true;
        self.signal.notify_all();
        true
    }

    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut arrived = self.arrived.lock();
        while !*arrived {
            if self.signal.wait_until(&mut arrived, deadline).timed_out() {
                break;
            }
        }
        *arrived
    }
}

/// Owns the subscriber of one telemetry topic and keeps the most recent
/// message in a [`SharedState`].
///
/// Other consumers of the same topic hang off the optional observer instead
/// of opening a second subscriber.
pub struct StateMonitor<T> {
    channel: InChannel<T>,
    latest: SharedState<Option<T>>,
    first: Arc<FirstArrival>,
}

impl<T> fmt::Debug for StateMonitor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMonitor")
            .field("topic", &self.topic())
            .field("version", &self.latest.version())
            .finish()
    }
}

impl<T> StateMonitor<T>
where
    T: DeserializeOwned + Clone + Send + 'static,
{
    pub fn start(ctx: &TransportContext, topic: &str) -> Result<Self, LinkError> {
        Self::start_with_observer(ctx, topic, |_: &T| {})
    }

    /// Start tracking `topic`; `observer` sees every message after the
    /// latest value has been updated.
    pub fn start_with_observer(
        ctx: &TransportContext,
        topic: &str,
        mut observer: impl FnMut(&T) + Send + 'static,
    ) -> Result<Self, LinkError> {
        let latest = SharedState::new(None);
        let first = Arc::new(FirstArrival::default());
        let channel = InChannel::new(ctx, topic);

        let sink = latest.clone();
        let arrival = Arc::clone(&first);
        let name = topic.to_string();
        channel.start(move |msg: T| {
            sink.set(Some(msg.clone()));
            if arrival.mark() {
                info!(topic = %name, "first message received");
            }
            observer(&msg);
        })?;

        Ok(Self {
            channel,
            latest,
            first,
        })
    }

    /// Copy of the most recent message.
    pub fn latest(&self) -> Option<T> {
        self.latest.snapshot()
    }

    /// Block until a first message arrived or `timeout` passed.
    pub fn wait_for_first_state(&self, timeout: Duration) -> Option<T> {
        if self.first.wait(timeout) {
            self.latest()
        } else {
            None
        }
    }
}

impl<T> StateMonitor<T> {
    pub fn topic(&self) -> &str {
        self.channel.topic()
    }

    /// Handle to the latest-value cell, for readers on other threads.
    pub fn shared(&self) -> SharedState<Option<T>> {
        self.latest.clone()
    }

    pub fn has_state(&self) -> bool {
        *self.first.arrived.lock()
    }

    /// Messages received so far.
    pub fn received(&self) -> u64 {
        self.channel.stats().received
    }

    pub fn stop(&self) {
        self.channel.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use servolink_middleware::{OutChannel, TransportConfig};
    use servolink_types::{ControlMode, ControlModeState, LowState};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;

    fn context() -> TransportContext {
        let ctx = TransportContext::new();
        ctx.init(&TransportConfig::default()).unwrap();
        ctx
    }

    #[test]
    fn keeps_latest_and_signals_first_arrival() -> Result<(), LinkError> {
        let ctx = context();
        let monitor: StateMonitor<LowState> = StateMonitor::start(&ctx, "test/lowstate")?;
        assert!(!monitor.has_state());
        assert!(monitor.wait_for_first_state(Duration::from_millis(20)).is_none());

        let publisher: OutChannel<LowState> = OutChannel::new(&ctx, "test/lowstate");
        publisher.init()?;
        let publishing = thread::spawn(move || {
            for tick in 1..=3 {
                let state = LowState {
                    tick,
                    ..LowState::default()
                };
                publisher.try_send(&state).unwrap();
            }
        });

        let first = monitor
            .wait_for_first_state(Duration::from_secs(2))
            .expect("telemetry arrives");
        assert!(first.tick >= 1);
        publishing.join().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while monitor.received() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(monitor.received(), 3);
        assert_eq!(monitor.latest().map(|s| s.tick), Some(3));
        assert!(monitor.has_state());
        monitor.stop();
        Ok(())
    }

    #[test]
    fn debug_names_the_topic() -> Result<(), LinkError> {
        let ctx = context();
        let monitor: StateMonitor<LowState> = StateMonitor::start(&ctx, "test/debug")?;
        let shown = format!("{monitor:?}");
        assert!(shown.contains("test/debug"), "{shown}");
        assert_eq!(monitor.topic(), "test/debug");
        monitor.stop();
        Ok(())
    }

    #[test]
    fn observer_sees_every_message() -> Result<(), LinkError> {
        let ctx = context();
        let seen = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&seen);
        let monitor: StateMonitor<ControlModeState> =
            StateMonitor::start_with_observer(&ctx, "test/mode", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })?;

        let publisher: OutChannel<ControlModeState> = OutChannel::new(&ctx, "test/mode");
        publisher.init()?;
        for _ in 0..4 {
            publisher.try_send(&ControlModeState {
                mode: ControlMode::LowLevel,
            })?;
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while seen.load(Ordering::SeqCst) < 4 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(seen.load(Ordering::SeqCst), 4);
        assert_eq!(
            monitor.shared().snapshot().map(|s| s.mode),
            Some(ControlMode::LowLevel)
        );
        Ok(())
    }
}
