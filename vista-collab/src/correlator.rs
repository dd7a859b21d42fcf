//! Nonce-correlated request/response over a one-way event channel.
//!
//! A respondable request is sent with a fresh nonce and parked in the
//! pending table. Exactly one of two callbacks eventually fires for it:
//!
//! ```text
//!   send ──► pending[nonce] ──┬── response(nonce) + guard ok ──► on_response(R)
//!                             └── offline / never sent ────────► on_offline()
//! ```
//!
//! The boolean returned by whichever callback ran resolves the
//! [`ResponseFuture`] handed back to the caller.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

use crate::protocol::{Envelope, Nonce, ProtocolError};

type Check<R> = Box<dyn Fn(&Value) -> Option<R> + Send>;

/// `on_response` bound to a payload that passed the guard.
type Deferred = Box<dyn FnOnce() -> bool>;

/// Validates and decodes a response payload before `on_response` sees it.
pub struct ResponseGuard<R> {
    check: Check<R>,
}

impl<R: DeserializeOwned + 'static> ResponseGuard<R> {
    /// Accept any payload that deserializes as `R`.
    pub fn shape() -> Self {
        Self::custom(|payload| serde_json::from_value(payload.clone()).ok())
    }

    /// Accept payloads that deserialize as `R` and satisfy `predicate`.
    pub fn shape_where<F>(predicate: F) -> Self
    where
        F: Fn(&R) -> bool + Send + 'static,
    {
        Self::custom(move |payload| {
            serde_json::from_value(payload.clone())
                .ok()
                .filter(|r| predicate(r))
        })
    }
}

impl<R> ResponseGuard<R> {
    pub fn custom<F>(check: F) -> Self
    where
        F: Fn(&Value) -> Option<R> + Send + 'static,
    {
        Self {
            check: Box::new(check),
        }
    }

    pub fn check(&self, payload: &Value) -> Option<R> {
        (self.check)(payload)
    }
}

impl ResponseGuard<Value> {
    /// Accept every payload unchanged.
    pub fn any() -> Self {
        Self::custom(|payload| Some(payload.clone()))
    }
}

/// The two mutually exclusive completions of a respondable request.
pub struct RespondableHandlers<R> {
    on_response: Box<dyn FnOnce(R) -> bool + Send>,
    on_offline: Box<dyn FnOnce() -> bool + Send>,
}

impl<R> RespondableHandlers<R> {
    pub fn new<F, G>(on_response: F, on_offline: G) -> Self
    where
        F: FnOnce(R) -> bool + Send + 'static,
        G: FnOnce() -> bool + Send + 'static,
    {
        Self {
            on_response: Box::new(on_response),
            on_offline: Box::new(on_offline),
        }
    }
}

/// Type-erased callbacks of one request.
///
/// Dropping hooks that have not completed fires `on_offline`, so a request
/// lost anywhere between the caller and the channel still completes once.
struct ResponseHooks {
    respond: Box<dyn FnMut(&Value) -> Option<Deferred> + Send>,
    on_offline: Option<Box<dyn FnOnce() -> bool + Send>>,
    resolver: Option<oneshot::Sender<bool>>,
}

impl ResponseHooks {
    fn new<R: 'static>(guard: ResponseGuard<R>, handlers: RespondableHandlers<R>) -> Self {
        let mut on_response = Some(handlers.on_response);
        let respond = move |payload: &Value| -> Option<Deferred> {
            let decoded = guard.check(payload)?;
            let callback = on_response.take()?;
            let deferred: Deferred = Box::new(move || callback(decoded));
            Some(deferred)
        };
        Self {
            respond: Box::new(respond),
            on_offline: Some(handlers.on_offline),
            resolver: None,
        }
    }

    fn respond(&mut self, payload: &Value) -> Option<bool> {
        if self.on_offline.is_none() {
            return None;
        }
        let invoke = (self.respond)(payload)?;
        // Disarmed before running, so a panicking `on_response` never leads
        // to `on_offline` as well.
        self.on_offline = None;
        let outcome = invoke();
        self.settle(outcome);
        Some(outcome)
    }

    fn resolve_offline(&mut self) -> bool {
        match self.on_offline.take() {
            Some(callback) => {
                let outcome = callback();
                self.settle(outcome);
                outcome
            }
            None => false,
        }
    }

    fn settle(&mut self, outcome: bool) {
        if let Some(tx) = self.resolver.take() {
            // The caller may have dropped its future; the callbacks already ran.
            let _ = tx.send(outcome);
        }
    }
}

impl Drop for ResponseHooks {
    fn drop(&mut self) {
        if self.on_offline.is_some() {
            self.resolve_offline();
        }
    }
}

/// A request waiting to be sent.
pub struct RespondableRequest {
    event: String,
    payload: Value,
    hooks: ResponseHooks,
}

impl RespondableRequest {
    pub fn new<Req, R>(
        event: impl Into<String>,
        request: &Req,
        guard: ResponseGuard<R>,
        handlers: RespondableHandlers<R>,
    ) -> Result<Self, ProtocolError>
    where
        Req: Serialize + ?Sized,
        R: 'static,
    {
        let payload = serde_json::to_value(request)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            event: event.into(),
            payload,
            hooks: ResponseHooks::new(guard, handlers),
        })
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Future resolving with the outcome of whichever callback fires.
    ///
    /// Only the most recent subscription is resolved.
    pub fn subscribe(&mut self) -> ResponseFuture {
        let (tx, rx) = oneshot::channel();
        self.hooks.resolver = Some(tx);
        ResponseFuture::waiting(rx)
    }

    /// Complete without sending.
    pub fn resolve_offline(mut self) -> bool {
        self.hooks.resolve_offline()
    }
}

impl std::fmt::Debug for RespondableRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RespondableRequest")
            .field("event", &self.event)
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

struct PendingRequest {
    event: String,
    hooks: ResponseHooks,
}

/// Result of routing one response to the pending table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The guard passed and `on_response` returned this value.
    Resolved(bool),
    /// The guard rejected the payload; the request is still pending.
    Rejected,
    /// No pending request carries this nonce.
    Unknown,
}

/// Pending-request table.
pub struct Correlator {
    next_nonce: Nonce,
    pending: HashMap<Nonce, PendingRequest>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            next_nonce: 1,
            pending: HashMap::new(),
        }
    }

    /// Park `request` under a fresh nonce and build the envelope to send.
    pub fn register(&mut self, request: RespondableRequest) -> (Nonce, Envelope<Value>) {
        let nonce = self.allocate_nonce();
        let RespondableRequest {
            event,
            payload,
            hooks,
        } = request;
        let envelope = Envelope::new(event.clone(), payload).with_nonce(nonce);
        self.pending.insert(nonce, PendingRequest { event, hooks });
        (nonce, envelope)
    }

    /// Route a response payload to the request waiting on `nonce`.
    pub fn resolve(&mut self, nonce: Nonce, payload: &Value) -> Resolution {
        // Taken out of the table first so an unwinding callback cannot leave
        // it behind for `go_offline`.
        let Some(mut entry) = self.pending.remove(&nonce) else {
            log::debug!("Dropping response for unknown nonce {nonce}");
            return Resolution::Unknown;
        };
        match entry.hooks.respond(payload) {
            Some(outcome) => Resolution::Resolved(outcome),
            None => {
                log::warn!(
                    "Response for '{}' (nonce {nonce}) rejected by guard: {payload}",
                    entry.event
                );
                self.pending.insert(nonce, entry);
                Resolution::Rejected
            }
        }
    }

    /// Remove one request and complete it through `on_offline`.
    pub fn abandon(&mut self, nonce: Nonce) -> Option<bool> {
        let mut entry = self.pending.remove(&nonce)?;
        Some(entry.hooks.resolve_offline())
    }

    /// Complete every pending request through `on_offline`, in nonce order.
    pub fn go_offline(&mut self) -> usize {
        let mut nonces: Vec<Nonce> = self.pending.keys().copied().collect();
        nonces.sort_unstable();
        for nonce in &nonces {
            if let Some(mut entry) = self.pending.remove(nonce) {
                log::debug!("Resolving '{}' (nonce {nonce}) offline", entry.event);
                entry.hooks.resolve_offline();
            }
        }
        nonces.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, nonce: Nonce) -> bool {
        self.pending.contains_key(&nonce)
    }

    pub fn pending_nonces(&self) -> Vec<Nonce> {
        let mut nonces: Vec<Nonce> = self.pending.keys().copied().collect();
        nonces.sort_unstable();
        nonces
    }

    fn allocate_nonce(&mut self) -> Nonce {
        loop {
            let candidate = self.next_nonce;
            self.next_nonce = self.next_nonce.wrapping_add(1).max(1);
            if !self.pending.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        self.go_offline();
    }
}

enum FutureState {
    Ready(bool),
    Waiting(oneshot::Receiver<bool>),
}

/// Resolves to the boolean returned by the request's completing callback.
///
/// Resolves to `false` if the request is dropped without any callback
/// reporting a value.
pub struct ResponseFuture {
    state: FutureState,
}

impl ResponseFuture {
    pub fn ready(outcome: bool) -> Self {
        Self {
            state: FutureState::Ready(outcome),
        }
    }

    fn waiting(rx: oneshot::Receiver<bool>) -> Self {
        Self {
            state: FutureState::Waiting(rx),
        }
    }

    /// Outcome if already available, without waiting.
    pub fn try_resolved(&mut self) -> Option<bool> {
        let outcome = match &mut self.state {
            FutureState::Ready(outcome) => return Some(*outcome),
            FutureState::Waiting(rx) => match rx.try_recv() {
                Ok(outcome) => outcome,
                Err(oneshot::error::TryRecvError::Closed) => false,
                Err(oneshot::error::TryRecvError::Empty) => return None,
            },
        };
        self.state = FutureState::Ready(outcome);
        Some(outcome)
    }
}

impl Future for ResponseFuture {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        let outcome = match &mut self.state {
            FutureState::Ready(outcome) => return Poll::Ready(*outcome),
            FutureState::Waiting(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(result) => result.unwrap_or(false),
                Poll::Pending => return Poll::Pending,
            },
        };
        self.state = FutureState::Ready(outcome);
        Poll::Ready(outcome)
    }
}

impl std::fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.state {
            FutureState::Ready(outcome) => write!(f, "ResponseFuture::Ready({outcome})"),
            FutureState::Waiting(_) => f.write_str("ResponseFuture::Waiting"),
        }
    }
}
