//! Lock-guarded shared state with copy-out reads.
//!
//! [`SharedState`] carries the values the runtime hands between threads:
//! the latest telemetry snapshot and the joint targets read by the control
//! loop. Readers never hold the lock beyond a clone, and a version counter
//! lets observers detect change without comparing values.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

struct Versioned<T> {
    value: T,
    version: u64,
}

/// Cloneable handle to a value guarded by its own lock.
pub struct SharedState<T> {
    inner: Arc<Mutex<Versioned<T>>>,
}

impl<T> Clone for SharedState<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Default> Default for SharedState<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for SharedState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.inner.lock();
        f.debug_struct("SharedState")
            .field("value", &guard.value)
            .field("version", &guard.version)
            .finish()
    }
}

impl<T> SharedState<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Versioned { value, version: 0 })),
        }
    }

    /// Mutate in place under the lock. Bumps the version.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.inner.lock();
        let out = f(&mut guard.value);
        guard.version += 1;
        out
    }

    /// Replace the value. Bumps the version.
    pub fn set(&self, value: T) {
        self.update(|v| *v = value);
    }

    /// Read through a borrow without cloning. Keep `f` short.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.lock().value)
    }

    /// Number of writes since construction.
    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }
}

impl<T: Clone> SharedState<T> {
    /// Copy of the current value.
    pub fn snapshot(&self) -> T {
        self.inner.lock().value.clone()
    }

    /// Copy of the current value together with its version.
    pub fn versioned_snapshot(&self) -> (T, u64) {
        let guard = self.inner.lock();
        (guard.value.clone(), guard.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn writes_bump_version() {
        let state = SharedState::new(0u32);
        assert_eq!(state.version(), 0);
        state.set(5);
        state.update(|v| *v += 1);
        assert_eq!(state.snapshot(), 6);
        assert_eq!(state.versioned_snapshot(), (6, 2));
    }

    #[test]
    fn clones_share_the_value() {
        let state: SharedState<Vec<u8>> = SharedState::default();
        let other = state.clone();
        other.update(|v| v.push(1));
        assert_eq!(state.snapshot(), vec![1]);
        assert_eq!(state.with(|v| v.len()), 1);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let state = SharedState::new(0u64);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = state.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        s.update(|v| *v += 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(state.snapshot(), 8000);
        assert_eq!(state.version(), 8000);
    }
}
