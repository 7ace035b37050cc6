//! Typed inbound endpoint with a dedicated receive thread.
//!
//! Each started [`InChannel`] owns one OS thread named `rx:<topic>`. The
//! thread drives a current-thread tokio runtime that races the channel's
//! [`CancelToken`] against the next payload, so `stop()` never waits for
//! traffic to arrive. Handlers run synchronously on that thread, one message
//! at a time, in transport order.

use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use servolink_types::LinkError;
use tracing::{debug, error, warn};

use crate::cancel::CancelToken;
use crate::codec;
use crate::context::TransportContext;
use crate::transport::TopicReader;

/// Point-in-time counters of an [`InChannel`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriberStats {
    /// Messages decoded and handed to the handler.
    pub received: u64,
    /// Handler invocations that panicked.
    pub handler_faults: u64,
    /// Payloads that failed to decode and were skipped.
    pub decode_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    handler_faults: AtomicU64,
    decode_errors: AtomicU64,
}

struct Worker {
    cancel: CancelToken,
    handle: JoinHandle<()>,
}

impl Worker {
    fn thread_id(&self) -> ThreadId {
        self.handle.thread().id()
    }
}

/// Subscriber bound to one topic.
///
/// One `InChannel` per topic per process is the intended usage; fan out to
/// several consumers from the handler.
pub struct InChannel<T> {
    ctx: TransportContext,
    topic: String,
    worker: Mutex<Option<Worker>>,
    counters: Arc<Counters>,
    _message: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for InChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InChannel")
            .field("topic", &self.topic)
            .field("running", &self.worker.lock().is_some())
            .finish()
    }
}

impl<T> InChannel<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub fn new(ctx: &TransportContext, topic: impl Into<String>) -> Self {
        Self {
            ctx: ctx.clone(),
            topic: topic.into(),
            worker: Mutex::new(None),
            counters: Arc::new(Counters::default()),
            _message: PhantomData,
        }
    }

    /// Start the receive thread, invoking `handler` for every message.
    ///
    /// The subscription is live when this returns: anything published
    /// afterwards reaches the handler. Fails when the context is not
    /// initialised or the channel is already running. A stopped channel may
    /// be started again.
    pub fn start<F>(&self, handler: F) -> Result<(), LinkError>
    where
        F: FnMut(T) + Send + 'static,
    {
        let mut worker = self.worker.lock();
        if let Some(current) = worker.take() {
            if !current.handle.is_finished() {
                *worker = Some(current);
                return Err(LinkError::Initialization(format!(
                    "subscriber on {} is already running",
                    self.topic
                )));
            }
            // The previous loop ended on its own (transport closed).
            let _ = current.handle.join();
        }

        let transport = self.ctx.register_topic(&self.topic, type_name::<T>())?;
        let reader = transport.reader(&self.topic)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .map_err(|e| LinkError::Initialization(format!("receive runtime: {e}")))?;

        let cancel = CancelToken::new();
        let receive = ReceiveLoop {
            topic: self.topic.clone(),
            cancel: cancel.clone(),
            counters: Arc::clone(&self.counters),
        };
        let handle = thread::Builder::new()
            .name(format!("rx:{}", self.topic))
            .spawn(move || runtime.block_on(receive.run(reader, handler)))
            .map_err(|e| LinkError::Initialization(format!("spawn receive thread: {e}")))?;

        debug!(topic = %self.topic, message = type_name::<T>(), "subscriber started");
        *worker = Some(Worker { cancel, handle });
        Ok(())
    }
}

impl<T> InChannel<T> {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Stop the receive thread and wait for it to exit.
    ///
    /// Once this returns the handler is never invoked again. Idempotent and
    /// callable from any thread; called from the handler itself it only
    /// signals, and the thread exits when the handler returns.
    pub fn stop(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        worker.cancel.cancel();
        if worker.thread_id() == thread::current().id() {
            debug!(topic = %self.topic, "subscriber stop requested from its own handler");
            return;
        }
        if worker.handle.join().is_err() {
            error!(topic = %self.topic, "receive thread panicked outside the handler");
        }
        debug!(topic = %self.topic, "subscriber stopped");
    }

    /// `true` while a receive thread is alive.
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    pub fn stats(&self) -> SubscriberStats {
        SubscriberStats {
            received: self.counters.received.load(Ordering::Relaxed),
            handler_faults: self.counters.handler_faults.load(Ordering::Relaxed),
            decode_errors: self.counters.decode_errors.load(Ordering::Relaxed),
        }
    }
}

impl<T> Drop for InChannel<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Receive loop
// ────────────────────────────────────────────────────────────────────────────

struct ReceiveLoop {
    topic: String,
    cancel: CancelToken,
    counters: Arc<Counters>,
}

impl ReceiveLoop {
    async fn run<T, F>(self, mut reader: Box<dyn TopicReader>, mut handler: F)
    where
        T: DeserializeOwned,
        F: FnMut(T),
    {
        loop {
            let payload = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = reader.recv() => match next {
                    Some(payload) => payload,
                    None => {
                        debug!(topic = %self.topic, "topic closed, receive loop exiting");
                        break;
                    }
                },
            };
            if self.cancel.is_cancelled() {
                break;
            }

            let msg = match codec::decode::<T>(&payload) {
                Ok(msg) => msg,
                Err(e) => {
                    self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(topic = %self.topic, error = %e, "dropping undecodable message");
                    continue;
                }
            };
            self.counters.received.fetch_add(1, Ordering::Relaxed);

            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(msg))) {
                self.counters.handler_faults.fetch_add(1, Ordering::Relaxed);
                let fault = LinkError::HandlerFault {
                    topic: self.topic.clone(),
                    details: panic_message(panic.as_ref()),
                };
                error!(error = %fault, "handler failed, still listening");
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
