//! Correlated request/response over fire-and-forget topics.
//!
//! A [`ServiceEndpoint`] owns, for one request kind, the request
//! [`OutChannel`], the response [`InChannel`] and the pending-request table.
//! Every request embeds a fresh correlation id; the response thread looks
//! the id up in the table and resolves the matching [`ResponseHandle`].
//!
//! # Lifecycle of a request
//!
//! 1. Expired entries are swept, then the table is checked: a non-empty
//!    table means the kind is busy and the call fails with
//!    [`LinkError::Busy`] without touching the transport.
//! 2. The pending entry is inserted *before* the request is sent, so a fast
//!    responder can never race the bookkeeping.
//! 3. A failed send removes the entry and resolves the handle with
//!    [`LinkError::TransportWrite`].
//! 4. Whoever removes the entry (responder, waiter on timeout, sweep)
//!    resolves the handle, outside the table lock. Removal happens exactly
//!    once, so resolution does too.
//!
//! Responses whose id is not pending are dropped and counted as late.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use servolink_middleware::{InChannel, OutChannel, TransportContext, topics};
use servolink_types::{
    BmsInitCmd, BmsInitType, ControlMode, ControlModeCmd, LinkError, ServiceResponse, TorqueCmd,
    TorqueType,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default deadline for requests issued without an explicit timeout.
pub const DEFAULT_SERVICE_TIMEOUT: Duration = Duration::from_secs(5);

type CallResult = Result<ServiceResponse, LinkError>;

/// Stand-in for "no deadline" when `now + timeout` overflows.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

// ────────────────────────────────────────────────────────────────────────────
// Correlation ids
// ────────────────────────────────────────────────────────────────────────────

/// Generator of `"<prefix>-<n>"` correlation ids.
///
/// The default prefix is a process-scoped salt taken from a v4 UUID so ids
/// from two processes sharing a topic do not collide.
#[derive(Debug)]
pub struct CorrelationIds {
    prefix: String,
    next: AtomicU64,
}

impl Default for CorrelationIds {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationIds {
    pub fn new() -> Self {
        let salt = Uuid::new_v4().simple().to_string();
        Self::starting_at(&salt[..8], 1)
    }

    /// Ids `"<prefix>-<first>"`, `"<prefix>-<first + 1>"`, ...
    pub fn starting_at(prefix: &str, first: u64) -> Self {
        Self {
            prefix: prefix.to_string(),
            next: AtomicU64::new(first),
        }
    }

    pub fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.prefix, n)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Result slot
// ────────────────────────────────────────────────────────────────────────────

/// Single-use result cell shared by a pending entry and its handle.
#[derive(Default)]
struct ResultSlot {
    result: Mutex<Option<CallResult>>,
    ready: Condvar,
}

impl ResultSlot {
    /// Store `result` unless the slot already holds one. `counter` is bumped
    /// under the slot lock, so a woken waiter always sees it.
    fn resolve(&self, result: CallResult, counter: Option<&AtomicU64>) -> bool {
        let mut slot = self.result.lock();
        if slot.is_some() {
            return false;
        }
        if let Some(counter) = counter {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        *slot = Some(result);
        self.ready.notify_all();
        true
    }

    fn peek(&self) -> Option<CallResult> {
        self.result.lock().clone()
    }

    fn wait_until(&self, deadline: Instant) -> Option<CallResult> {
        let mut slot = self.result.lock();
        while slot.is_none() {
            if self.ready.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        slot.clone()
    }

    fn wait(&self) -> CallResult {
        let mut slot = self.result.lock();
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            self.ready.wait(&mut slot);
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Pending table
// ────────────────────────────────────────────────────────────────────────────

struct PendingRequest {
    deadline: Instant,
    slot: Arc<ResultSlot>,
}

#[derive(Default)]
struct Counters {
    issued: AtomicU64,
    completed: AtomicU64,
    timed_out: AtomicU64,
    rejected_busy: AtomicU64,
    send_failures: AtomicU64,
    late_responses: AtomicU64,
}

/// Point-in-time counters of a [`ServiceEndpoint`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EndpointStats {
    pub issued: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub rejected_busy: u64,
    pub send_failures: u64,
    pub late_responses: u64,
    pub pending: usize,
}

struct EndpointCore {
    kind: String,
    pending: Mutex<HashMap<String, PendingRequest>>,
    counters: Counters,
}

impl EndpointCore {
    fn timeout_error(&self, request_id: &str) -> LinkError {
        LinkError::Timeout {
            kind: self.kind.clone(),
            request_id: request_id.to_string(),
        }
    }

    /// Remove every entry whose deadline is at or before `now`.
    fn drain_expired(
        table: &mut HashMap<String, PendingRequest>,
        now: Instant,
    ) -> Vec<(String, PendingRequest)> {
        let overdue: Vec<String> = table
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        overdue
            .into_iter()
            .filter_map(|id| table.remove_entry(&id))
            .collect()
    }

    fn resolve_expired(&self, expired: Vec<(String, PendingRequest)>) -> usize {
        let n = expired.len();
        for (id, entry) in expired {
            entry
                .slot
                .resolve(Err(self.timeout_error(&id)), Some(&self.counters.timed_out));
            debug!(kind = %self.kind, request_id = %id, "pending request expired");
        }
        n
    }

    /// Response-thread entry point. Overdue entries are swept before the
    /// lookup, so a response past its deadline counts as late.
    fn complete(&self, response: ServiceResponse) {
        let (entry, expired) = {
            let mut table = self.pending.lock();
            let expired = Self::drain_expired(&mut table, Instant::now());
            (table.remove(&response.request_id), expired)
        };
        self.resolve_expired(expired);

        match entry {
            Some(entry) => {
                debug!(
                    kind = %self.kind,
                    request_id = %response.request_id,
                    success = response.success,
                    "response matched"
                );
                entry
                    .slot
                    .resolve(Ok(response), Some(&self.counters.completed));
            }
            None => {
                self.counters.late_responses.fetch_add(1, Ordering::Relaxed);
                debug!(
                    kind = %self.kind,
                    request_id = %response.request_id,
                    "dropping response with no pending request"
                );
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ResponseHandle
// ────────────────────────────────────────────────────────────────────────────

/// Deferred result of a request issued with
/// [`ServiceEndpoint::call_async`].
///
/// Dropping a handle without waiting is fine: the entry expires at its
/// deadline and the kind becomes available again.
pub struct ResponseHandle {
    request_id: String,
    deadline: Instant,
    slot: Arc<ResultSlot>,
    core: Arc<EndpointCore>,
}

impl fmt::Debug for ResponseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseHandle")
            .field("kind", &self.core.kind)
            .field("request_id", &self.request_id)
            .field("resolved", &self.slot.peek().is_some())
            .finish()
    }
}

impl ResponseHandle {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// The result if it has arrived, without blocking.
    pub fn try_result(&self) -> Option<CallResult> {
        self.slot.peek()
    }

    /// Block until the response arrives or the request's deadline passes.
    pub fn wait(&self) -> CallResult {
        self.wait_until(self.deadline)
    }

    /// Block for at most `timeout`, and never past the request's deadline.
    /// On expiry the request is withdrawn just as if its deadline had passed.
    pub fn wait_timeout(&self, timeout: Duration) -> CallResult {
        self.wait_until(deadline_after(Instant::now(), timeout).min(self.deadline))
    }

    fn wait_until(&self, until: Instant) -> CallResult {
        if let Some(result) = self.slot.wait_until(until) {
            return result;
        }
        let withdrawn = self.core.pending.lock().remove(&self.request_id);
        match withdrawn {
            Some(entry) => {
                let err = self.core.timeout_error(&self.request_id);
                entry
                    .slot
                    .resolve(Err(err.clone()), Some(&self.core.counters.timed_out));
                debug!(kind = %self.core.kind, request_id = %self.request_id, "request timed out");
                self.slot.peek().unwrap_or(Err(err))
            }
            // Someone else removed the entry and is about to resolve it.
            None => self.slot.wait(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ServiceEndpoint
// ────────────────────────────────────────────────────────────────────────────

/// Request/response engine for one request kind.
pub struct ServiceEndpoint<Req> {
    core: Arc<EndpointCore>,
    requests: OutChannel<Req>,
    responses: InChannel<ServiceResponse>,
    ids: CorrelationIds,
    default_timeout: Mutex<Duration>,
}

impl<Req> fmt::Debug for ServiceEndpoint<Req> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceEndpoint")
            .field("kind", &self.core.kind)
            .field("pending", &self.core.pending.lock().len())
            .finish()
    }
}

impl<Req: Serialize> ServiceEndpoint<Req> {
    /// Set up the request publisher and start the response subscriber.
    pub fn new(
        ctx: &TransportContext,
        kind: impl Into<String>,
        request_topic: &str,
        response_topic: &str,
    ) -> Result<Self, LinkError> {
        Self::with_ids(ctx, kind, request_topic, response_topic, CorrelationIds::new())
    }

    pub fn with_ids(
        ctx: &TransportContext,
        kind: impl Into<String>,
        request_topic: &str,
        response_topic: &str,
        ids: CorrelationIds,
    ) -> Result<Self, LinkError> {
        let core = Arc::new(EndpointCore {
            kind: kind.into(),
            pending: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        });

        let requests = OutChannel::new(ctx, request_topic);
        requests.init()?;

        let responses = InChannel::new(ctx, response_topic);
        let sink = Arc::clone(&core);
        responses.start(move |response: ServiceResponse| sink.complete(response))?;

        debug!(kind = %core.kind, request_topic, response_topic, "service endpoint ready");
        Ok(Self {
            core,
            requests,
            responses,
            ids,
            default_timeout: Mutex::new(DEFAULT_SERVICE_TIMEOUT),
        })
    }

    pub fn kind(&self) -> &str {
        &self.core.kind
    }

    pub fn set_default_timeout(&self, timeout: Duration) {
        *self.default_timeout.lock() = timeout;
    }

    pub fn default_timeout(&self) -> Duration {
        *self.default_timeout.lock()
    }

    /// Issue a request due within the default timeout.
    ///
    /// `build` receives the correlation id and returns the request carrying
    /// it.
    pub fn call_async(&self, build: impl FnOnce(String) -> Req) -> Result<ResponseHandle, LinkError> {
        self.call_async_within(self.default_timeout(), build)
    }

    /// Issue a request due within `timeout`.
    ///
    /// Fails only with [`LinkError::Busy`]; a send failure is reported
    /// through the returned handle.
    pub fn call_async_within(
        &self,
        timeout: Duration,
        build: impl FnOnce(String) -> Req,
    ) -> Result<ResponseHandle, LinkError> {
        let now = Instant::now();
        let deadline = deadline_after(now, timeout);
        let slot = Arc::new(ResultSlot::default());

        let (admitted, expired) = {
            let mut table = self.core.pending.lock();
            let expired = EndpointCore::drain_expired(&mut table, now);
            let admitted = match table.keys().next() {
                Some(outstanding) => Err(outstanding.clone()),
                None => {
                    let id = self.ids.next_id();
                    table.insert(
                        id.clone(),
                        PendingRequest {
                            deadline,
                            slot: Arc::clone(&slot),
                        },
                    );
                    Ok(id)
                }
            };
            (admitted, expired)
        };
        self.core.resolve_expired(expired);

        let request_id = match admitted {
            Ok(id) => id,
            Err(outstanding) => {
                self.core.counters.rejected_busy.fetch_add(1, Ordering::Relaxed);
                debug!(kind = %self.core.kind, %outstanding, "request rejected, kind busy");
                return Err(LinkError::Busy(self.core.kind.clone()));
            }
        };
        self.core.counters.issued.fetch_add(1, Ordering::Relaxed);

        let request = build(request_id.clone());
        if let Err(e) = self.requests.try_send(&request) {
            self.core.counters.send_failures.fetch_add(1, Ordering::Relaxed);
            let err = match e {
                LinkError::TransportWrite { .. } => e,
                other => LinkError::TransportWrite {
                    topic: self.requests.topic().to_string(),
                    details: other.to_string(),
                },
            };
            warn!(kind = %self.core.kind, %request_id, error = %err, "request send failed");
            let removed = self.core.pending.lock().remove(&request_id);
            if let Some(entry) = removed {
                entry.slot.resolve(Err(err), None);
            }
        } else {
            debug!(kind = %self.core.kind, %request_id, ?timeout, "request sent");
        }

        Ok(ResponseHandle {
            request_id,
            deadline,
            slot,
            core: Arc::clone(&self.core),
        })
    }

    /// Issue a request and block for at most `timeout`.
    pub fn call(&self, timeout: Duration, build: impl FnOnce(String) -> Req) -> CallResult {
        self.call_async_within(timeout, build)?.wait()
    }

    /// Withdraw every entry past its deadline. Returns how many expired.
    pub fn expire_overdue(&self) -> usize {
        let expired = EndpointCore::drain_expired(&mut self.core.pending.lock(), Instant::now());
        self.core.resolve_expired(expired)
    }
}

impl<Req> ServiceEndpoint<Req> {
    pub fn stats(&self) -> EndpointStats {
        let c = &self.core.counters;
        EndpointStats {
            issued: c.issued.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            rejected_busy: c.rejected_busy.load(Ordering::Relaxed),
            send_failures: c.send_failures.load(Ordering::Relaxed),
            late_responses: c.late_responses.load(Ordering::Relaxed),
            pending: self.core.pending.lock().len(),
        }
    }

    /// Stop the response subscriber. Idempotent.
    pub fn shutdown(&self) {
        self.responses.stop();
    }
}

// ────────────────────────────────────────────────────────────────────────────
// RobotClient
// ────────────────────────────────────────────────────────────────────────────

/// Request and response topics of the three robot services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceTopics {
    pub bms_init_request: String,
    pub bms_init_response: String,
    pub torque_request: String,
    pub torque_response: String,
    pub control_mode_request: String,
    pub control_mode_response: String,
}

impl Default for ServiceTopics {
    fn default() -> Self {
        Self {
            bms_init_request: topics::BMS_INIT_REQUEST.to_string(),
            bms_init_response: topics::BMS_INIT_RESPONSE.to_string(),
            torque_request: topics::TORQUE_REQUEST.to_string(),
            torque_response: topics::TORQUE_RESPONSE.to_string(),
            control_mode_request: topics::CONTROL_MODE_REQUEST.to_string(),
            control_mode_response: topics::CONTROL_MODE_RESPONSE.to_string(),
        }
    }
}

/// Blocking and deferred access to the robot's BMS-init, torque and
/// control-mode services.
#[derive(Debug)]
pub struct RobotClient {
    bms_init: ServiceEndpoint<BmsInitCmd>,
    torque: ServiceEndpoint<TorqueCmd>,
    control_mode: ServiceEndpoint<ControlModeCmd>,
}

impl RobotClient {
    pub fn new(ctx: &TransportContext, topics: &ServiceTopics) -> Result<Self, LinkError> {
        let client = Self {
            bms_init: ServiceEndpoint::new(
                ctx,
                "bms_init",
                &topics.bms_init_request,
                &topics.bms_init_response,
            )?,
            torque: ServiceEndpoint::new(ctx, "torque", &topics.torque_request, &topics.torque_response)?,
            control_mode: ServiceEndpoint::new(
                ctx,
                "control_mode",
                &topics.control_mode_request,
                &topics.control_mode_response,
            )?,
        };
        info!("robot client ready");
        Ok(client)
    }

    /// Default deadline for the `_async` calls.
    pub fn set_timeout(&self, timeout: Duration) {
        self.bms_init.set_default_timeout(timeout);
        self.torque.set_default_timeout(timeout);
        self.control_mode.set_default_timeout(timeout);
    }

    pub fn timeout(&self) -> Duration {
        self.bms_init.default_timeout()
    }

    pub fn init_bms(&self, init: BmsInitType, timeout: Duration) -> CallResult {
        self.bms_init
            .call(timeout, |request_id| BmsInitCmd { request_id, init })
    }

    pub fn init_bms_async(&self, init: BmsInitType) -> Result<ResponseHandle, LinkError> {
        self.bms_init
            .call_async(|request_id| BmsInitCmd { request_id, init })
    }

    pub fn set_torque(&self, torque: TorqueType, timeout: Duration) -> CallResult {
        self.torque
            .call(timeout, |request_id| TorqueCmd { request_id, torque })
    }

    pub fn set_torque_async(&self, torque: TorqueType) -> Result<ResponseHandle, LinkError> {
        self.torque
            .call_async(|request_id| TorqueCmd { request_id, torque })
    }

    pub fn set_control_mode(&self, mode: ControlMode, timeout: Duration) -> CallResult {
        self.control_mode
            .call(timeout, |request_id| ControlModeCmd { request_id, mode })
    }

    pub fn set_control_mode_async(&self, mode: ControlMode) -> Result<ResponseHandle, LinkError> {
        self.control_mode
            .call_async(|request_id| ControlModeCmd { request_id, mode })
    }

    /// Per-kind counters, in a fixed order.
    pub fn stats(&self) -> [(&str, EndpointStats); 3] {
        [
            (self.bms_init.kind(), self.bms_init.stats()),
            (self.torque.kind(), self.torque.stats()),
            (self.control_mode.kind(), self.control_mode.stats()),
        ]
    }

    pub fn expire_overdue(&self) -> usize {
        self.bms_init.expire_overdue() + self.torque.expire_overdue() + self.control_mode.expire_overdue()
    }

    /// Stop every response subscriber. Idempotent.
    pub fn shutdown(&self) {
        self.bms_init.shutdown();
        self.torque.shutdown();
        self.control_mode.shutdown();
    }
}

impl Drop for RobotClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use servolink_middleware::TransportConfig;
    use std::thread;

    const REQ: &str = "test/torque/request";
    const RESP: &str = "test/torque/response";

    fn context() -> TransportContext {
        let ctx = TransportContext::new();
        ctx.init(&TransportConfig::default()).unwrap();
        ctx
    }

    fn endpoint(ctx: &TransportContext) -> ServiceEndpoint<TorqueCmd> {
        ServiceEndpoint::new(ctx, "torque", REQ, RESP).unwrap()
    }

    /// Answers every torque request after `latency`.
    fn responder(ctx: &TransportContext, latency: Duration) -> InChannel<TorqueCmd> {
        let replies: OutChannel<ServiceResponse> = OutChannel::new(ctx, RESP);
        replies.init().unwrap();
        let requests = InChannel::new(ctx, REQ);
        requests
            .start(move |cmd: TorqueCmd| {
                thread::sleep(latency);
                replies.send(&ServiceResponse::ok(cmd.request_id));
            })
            .unwrap();
        requests
    }

    fn inject(ctx: &TransportContext, response: ServiceResponse) {
        let replies: OutChannel<ServiceResponse> = OutChannel::new(ctx, RESP);
        replies.init().unwrap();
        assert!(replies.send(&response));
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn torque_on(request_id: String) -> TorqueCmd {
        TorqueCmd {
            request_id,
            torque: TorqueType::On,
        }
    }

    #[test]
    fn correlation_ids_are_salted_and_monotonic() {
        let ids = CorrelationIds::new();
        let a = ids.next_id();
        let b = ids.next_id();
        assert_ne!(a, b);
        let (salt, n) = a.rsplit_once('-').unwrap();
        assert_eq!(salt.len(), 8);
        assert!(salt.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(n, "1");
        assert_eq!(CorrelationIds::starting_at("req", 42).next_id(), "req-42");
    }

    #[test]
    fn response_after_50ms_resolves_well_before_timeout() -> Result<(), LinkError> {
        let ctx = context();
        let _peer = responder(&ctx, Duration::from_millis(50));
        let client = ServiceEndpoint::with_ids(
            &ctx,
            "torque",
            REQ,
            RESP,
            CorrelationIds::starting_at("req", 42),
        )?;

        let start = Instant::now();
        let response = client.call(Duration::from_millis(5000), torque_on)?;
        let elapsed = start.elapsed();

        assert_eq!(response.request_id, "req-42");
        assert!(response.success);
        assert!(elapsed >= Duration::from_millis(45), "too fast: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(1500), "too slow: {elapsed:?}");
        assert_eq!(client.stats().pending, 0);
        assert_eq!(client.stats().completed, 1);
        Ok(())
    }

    #[test]
    fn silent_peer_times_out_and_empties_table() {
        let ctx = context();
        let client = endpoint(&ctx);

        let start = Instant::now();
        let err = client.call(Duration::from_millis(200), torque_on).unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, LinkError::Timeout { ref kind, .. } if kind == "torque"));
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(1200), "too slow: {elapsed:?}");
        let stats = client.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.timed_out, 1);
    }

    #[test]
    fn second_request_while_pending_is_busy() {
        let ctx = context();
        let client = endpoint(&ctx);
        let first = client
            .call_async_within(Duration::from_secs(5), torque_on)
            .unwrap();

        let start = Instant::now();
        let err = client.call(Duration::from_secs(5), torque_on).unwrap_err();
        assert_eq!(err, LinkError::Busy("torque".to_string()));
        assert!(start.elapsed() < Duration::from_millis(100));

        let stats = client.stats();
        assert_eq!(stats.rejected_busy, 1);
        assert_eq!(stats.issued, 1);
        assert!(first.try_result().is_none());
    }

    #[test]
    fn foreign_id_never_resolves_pending_request() {
        let ctx = context();
        let client = endpoint(&ctx);
        let handle = client
            .call_async_within(Duration::from_secs(5), torque_on)
            .unwrap();

        inject(&ctx, ServiceResponse::ok("someone-else-1"));
        assert!(wait_for(|| client.stats().late_responses == 1));
        assert!(handle.try_result().is_none());
        assert_eq!(client.stats().pending, 1);

        inject(&ctx, ServiceResponse::failed(handle.request_id(), "motor fault"));
        let response = handle.wait().unwrap();
        assert_eq!(response.request_id, handle.request_id());
        assert!(!response.success);
        assert_eq!(response.message, "motor fault");
    }

    #[test]
    fn late_response_after_timeout_is_dropped() {
        let ctx = context();
        let client = endpoint(&ctx);
        let handle = client
            .call_async_within(Duration::from_millis(50), torque_on)
            .unwrap();
        assert!(matches!(handle.wait(), Err(LinkError::Timeout { .. })));

        inject(&ctx, ServiceResponse::ok(handle.request_id()));
        assert!(wait_for(|| client.stats().late_responses == 1));
        assert!(matches!(handle.try_result(), Some(Err(LinkError::Timeout { .. }))));
        assert_eq!(client.stats().pending, 0);
        assert_eq!(client.stats().completed, 0);
    }

    #[test]
    fn response_past_deadline_resolves_as_timeout() {
        let ctx = context();
        let client = endpoint(&ctx);
        let handle = client
            .call_async_within(Duration::from_millis(50), torque_on)
            .unwrap();
        thread::sleep(Duration::from_millis(150));
        assert!(handle.try_result().is_none());

        inject(&ctx, ServiceResponse::ok(handle.request_id()));
        assert!(wait_for(|| handle.try_result().is_some()));
        assert!(matches!(handle.try_result(), Some(Err(LinkError::Timeout { .. }))));
        assert!(wait_for(|| client.stats().late_responses == 1));
        let stats = client.stats();
        assert_eq!(stats.completed, 0);
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn counters_are_current_when_call_returns() -> Result<(), LinkError> {
        let ctx = context();
        let client = endpoint(&ctx);
        let _peer = responder(&ctx, Duration::ZERO);
        for n in 1..=20 {
            client.call(Duration::from_secs(2), torque_on)?;
            assert_eq!(client.stats().completed, n);
        }
        Ok(())
    }

    #[test]
    fn ids_of_one_kind_never_resolve_another() -> Result<(), LinkError> {
        let ctx = context();
        let torque = endpoint(&ctx);
        let mode: ServiceEndpoint<ControlModeCmd> = ServiceEndpoint::new(
            &ctx,
            "control_mode",
            "test/mode/request",
            "test/mode/response",
        )?;

        let a = torque.call_async_within(Duration::from_secs(5), torque_on)?;
        let b = mode.call_async_within(Duration::from_secs(5), |request_id| ControlModeCmd {
            request_id,
            mode: ControlMode::LowLevel,
        })?;

        // A's id on B's response topic, and an unknown id on A's.
        let mode_replies: OutChannel<ServiceResponse> = OutChannel::new(&ctx, "test/mode/response");
        mode_replies.init()?;
        assert!(mode_replies.send(&ServiceResponse::ok(a.request_id())));
        inject(&ctx, ServiceResponse::ok("stranger-7"));

        assert!(wait_for(|| mode.stats().late_responses == 1));
        assert!(wait_for(|| torque.stats().late_responses == 1));
        assert!(a.try_result().is_none());
        assert!(b.try_result().is_none());
        assert_eq!(torque.stats().pending, 1);
        assert_eq!(mode.stats().pending, 1);

        assert!(mode_replies.send(&ServiceResponse::ok(b.request_id())));
        assert_eq!(b.wait()?.request_id, b.request_id());
        assert!(a.try_result().is_none());
        Ok(())
    }

    #[test]
    fn wait_timeout_stops_at_request_deadline() -> Result<(), LinkError> {
        let ctx = context();
        let client = endpoint(&ctx);
        let handle = client.call_async_within(Duration::from_millis(50), torque_on)?;

        let start = Instant::now();
        let err = handle.wait_timeout(Duration::from_secs(10)).unwrap_err();
        assert!(matches!(err, LinkError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(1), "waited {:?}", start.elapsed());
        assert_eq!(client.stats().pending, 0);
        Ok(())
    }

    #[test]
    fn unbounded_timeout_does_not_overflow() -> Result<(), LinkError> {
        let ctx = context();
        let client = endpoint(&ctx);
        let handle = client.call_async_within(Duration::MAX, torque_on)?;
        assert!(handle.deadline() > Instant::now() + Duration::from_secs(3600));
        assert!(matches!(
            handle.wait_timeout(Duration::from_millis(20)),
            Err(LinkError::Timeout { .. })
        ));
        assert_eq!(client.stats().pending, 0);
        Ok(())
    }

    #[test]
    fn send_failure_resolves_with_transport_error() {
        let ctx = context();
        let client = endpoint(&ctx);
        ctx.release();

        let start = Instant::now();
        let err = client.call(Duration::from_secs(5), torque_on).unwrap_err();
        assert!(matches!(err, LinkError::TransportWrite { .. }));
        assert!(start.elapsed() < Duration::from_millis(500));
        let stats = client.stats();
        assert_eq!(stats.send_failures, 1);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn dropped_handle_does_not_wedge_the_kind() -> Result<(), LinkError> {
        let ctx = context();
        let client = endpoint(&ctx);
        drop(client.call_async_within(Duration::from_millis(30), torque_on)?);
        assert!(matches!(
            client.call_async_within(Duration::from_secs(1), torque_on),
            Err(LinkError::Busy(_))
        ));

        thread::sleep(Duration::from_millis(60));
        let handle = client.call_async_within(Duration::from_millis(100), torque_on)?;
        assert_eq!(client.stats().timed_out, 1);
        drop(handle);

        thread::sleep(Duration::from_millis(150));
        assert_eq!(client.expire_overdue(), 1);
        assert_eq!(client.stats().pending, 0);
        Ok(())
    }

    #[test]
    fn wait_timeout_withdraws_the_request() -> Result<(), LinkError> {
        let ctx = context();
        let client = endpoint(&ctx);
        let handle = client.call_async_within(Duration::from_secs(10), torque_on)?;
        let err = handle.wait_timeout(Duration::from_millis(40)).unwrap_err();
        assert!(matches!(err, LinkError::Timeout { .. }));
        assert_eq!(client.stats().pending, 0);
        // The kind is free again.
        client.call_async_within(Duration::from_secs(1), torque_on)?;
        Ok(())
    }

    #[test]
    fn table_is_empty_after_mixed_outcomes() -> Result<(), LinkError> {
        let ctx = context();
        let client = endpoint(&ctx);
        let peer = responder(&ctx, Duration::from_millis(5));
        for _ in 0..5 {
            client.call(Duration::from_secs(2), torque_on)?;
        }
        peer.stop();
        for _ in 0..3 {
            assert!(client.call(Duration::from_millis(30), torque_on).is_err());
        }
        let stats = client.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.completed, 5);
        assert_eq!(stats.timed_out, 3);
        Ok(())
    }

    #[test]
    fn concurrent_callers_get_exactly_one_outcome_each() {
        let ctx = context();
        let client = Arc::new(endpoint(&ctx));
        let _peer = responder(&ctx, Duration::from_millis(20));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = Arc::clone(&client);
                thread::spawn(move || c.call(Duration::from_secs(2), torque_on))
            })
            .collect();
        let results: Vec<CallResult> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let ok = results.iter().filter(|r| r.is_ok()).count();
        let busy = results
            .iter()
            .filter(|r| matches!(r, Err(LinkError::Busy(_))))
            .count();
        assert_eq!(ok + busy, 8);
        assert!(ok >= 1);
        assert_eq!(client.stats().pending, 0);
    }
}
