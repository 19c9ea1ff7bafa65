//! Engine-facing interfaces.
//!
//! Everything the core needs from a native completion engine goes through the
//! types in this module: the event queue engines post completions to, the raw
//! batch representation, output slots the engine fills in place, and the
//! call/channel/server handle traits.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::buffer::ByteBuffer;
use crate::deadline::Deadline;
use crate::metadata::MetadataMap;
use crate::status::StatusCode;
use crate::tag::Tag;

// -- Events ------------------------------------------------------------------

/// Completion of one submitted batch (or of a server-level request).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub tag: Tag,
    /// Whether every operation of the batch succeeded.
    pub success: bool,
}

/// Result of waiting on the native event queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEvent {
    Complete(Completion),
    /// The deadline passed with no event.
    Timeout,
    /// The queue was shut down and fully drained.
    Shutdown,
}

#[derive(Default)]
struct EventQueueState {
    events: VecDeque<Completion>,
    shutdown: bool,
}

/// The native event queue: engines post completions, one consumer drains them.
///
/// After [`shutdown`](Self::shutdown), events already queued are still
/// delivered, then every `next` returns [`RawEvent::Shutdown`]. Completions
/// posted after shutdown are dropped.
#[derive(Default)]
pub struct EventQueue {
    state: Mutex<EventQueueState>,
    ready: Condvar,
}

impl EventQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Post a completion. Returns `false` if the queue is shut down and the
    /// completion was dropped.
    pub fn post(&self, tag: Tag, success: bool) -> bool {
        let mut state = self.state.lock();
        if state.shutdown {
            tracing::debug!(%tag, "completion posted after queue shutdown dropped");
            return false;
        }
        state.events.push_back(Completion { tag, success });
        drop(state);
        self.ready.notify_one();
        true
    }

    /// Wait for the next event until `deadline` (`None` waits forever).
    pub fn next(&self, deadline: Option<Instant>) -> RawEvent {
        let mut state = self.state.lock();
        loop {
            if let Some(c) = state.events.pop_front() {
                return RawEvent::Complete(c);
            }
            if state.shutdown {
                return RawEvent::Shutdown;
            }
            match deadline {
                Some(at) => {
                    let timed_out = self.ready.wait_until(&mut state, at).timed_out();
                    if timed_out && state.events.is_empty() && !state.shutdown {
                        return RawEvent::Timeout;
                    }
                }
                None => self.ready.wait(&mut state),
            }
        }
    }

    /// Begin shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.ready.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }
}

// -- Raw batch representation --------------------------------------------------

/// Shared cell the engine fills while a batch is outstanding.
///
/// The batch's [`OpContext`](crate::OpContext) and the engine each hold a
/// handle; the value itself is moved out exactly once by whoever calls
/// [`take`](Self::take) first.
pub struct OutputSlot<T> {
    cell: Arc<Mutex<Option<T>>>,
}

impl<T> OutputSlot<T> {
    pub fn new() -> Self {
        Self {
            cell: Arc::new(Mutex::new(None)),
        }
    }

    /// Store a value, replacing anything not yet taken.
    pub fn fill(&self, value: T) {
        *self.cell.lock() = Some(value);
    }

    pub fn take(&self) -> Option<T> {
        self.cell.lock().take()
    }

    pub fn is_filled(&self) -> bool {
        self.cell.lock().is_some()
    }
}

impl<T> Default for OutputSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for OutputSlot<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T> std::fmt::Debug for OutputSlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSlot")
            .field("filled", &self.is_filled())
            .finish()
    }
}

/// Status delivered to the client side of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStatus {
    pub trailing_metadata: MetadataMap,
    pub status: StatusCode,
    pub details: String,
}

/// Connectivity of a client channel to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    /// Not connected and not trying to.
    Idle,
    Connecting,
    Ready,
    /// The last attempt failed; the channel retries when asked to connect.
    TransientFailure,
    /// The engine is gone. Terminal.
    Shutdown,
}

impl std::fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectivityState::Idle => "IDLE",
            ConnectivityState::Connecting => "CONNECTING",
            ConnectivityState::Ready => "READY",
            ConnectivityState::TransientFailure => "TRANSIENT_FAILURE",
            ConnectivityState::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

/// Kind of a batch operation, without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    SendInitialMetadata,
    SendMessage,
    SendCloseFromClient,
    SendStatusFromServer,
    RecvInitialMetadata,
    RecvMessage,
    RecvStatusOnClient,
    RecvCloseOnServer,
}

impl OpKind {
    pub fn is_send(self) -> bool {
        matches!(
            self,
            OpKind::SendInitialMetadata
                | OpKind::SendMessage
                | OpKind::SendCloseFromClient
                | OpKind::SendStatusFromServer
        )
    }

    /// Whether a client-side call may carry this op.
    pub fn valid_on_client(self) -> bool {
        !matches!(self, OpKind::SendStatusFromServer | OpKind::RecvCloseOnServer)
    }

    /// Whether a server-side call may carry this op.
    pub fn valid_on_server(self) -> bool {
        !matches!(
            self,
            OpKind::SendCloseFromClient | OpKind::RecvInitialMetadata | OpKind::RecvStatusOnClient
        )
    }
}

/// One entry of the native batch array.
#[derive(Debug, Clone)]
pub enum RawOp {
    SendInitialMetadata(MetadataMap),
    SendMessage(ByteBuffer),
    SendCloseFromClient,
    SendStatusFromServer {
        trailing_metadata: MetadataMap,
        status: StatusCode,
        details: String,
    },
    RecvInitialMetadata(OutputSlot<MetadataMap>),
    RecvMessage(OutputSlot<ByteBuffer>),
    RecvStatusOnClient(OutputSlot<ClientStatus>),
    /// Filled with `true` when the call was cancelled.
    RecvCloseOnServer(OutputSlot<bool>),
}

impl RawOp {
    pub fn kind(&self) -> OpKind {
        match self {
            RawOp::SendInitialMetadata(_) => OpKind::SendInitialMetadata,
            RawOp::SendMessage(_) => OpKind::SendMessage,
            RawOp::SendCloseFromClient => OpKind::SendCloseFromClient,
            RawOp::SendStatusFromServer { .. } => OpKind::SendStatusFromServer,
            RawOp::RecvInitialMetadata(_) => OpKind::RecvInitialMetadata,
            RawOp::RecvMessage(_) => OpKind::RecvMessage,
            RawOp::RecvStatusOnClient(_) => OpKind::RecvStatusOnClient,
            RawOp::RecvCloseOnServer(_) => OpKind::RecvCloseOnServer,
        }
    }
}

// -- Errors ------------------------------------------------------------------

/// Rejections returned by the engine when a batch or request is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CallError {
    /// Operation is only valid on a client call.
    #[error("operation not valid on a server call")]
    NotOnServer,
    /// Operation is only valid on a server call.
    #[error("operation not valid on a client call")]
    NotOnClient,
    /// A once-per-call operation was already submitted in an earlier batch.
    #[error("operation already invoked on this call")]
    AlreadyInvoked,
    /// The call has already delivered its final status.
    #[error("call already finished")]
    AlreadyFinished,
    /// The same operation appears twice in one batch.
    #[error("too many operations of one kind in a batch")]
    TooManyOperations,
    /// Metadata contains an invalid key.
    #[error("invalid metadata")]
    InvalidMetadata,
    /// The completion queue bound to the call is shut down.
    #[error("completion queue shut down")]
    CompletionQueueShutdown,
    /// The server is shutting down and accepts no new requests.
    #[error("server shut down")]
    ServerShutdown,
    /// The registration handle is unknown to the server or channel.
    #[error("unknown method registration")]
    UnknownMethod,
}

/// Failures creating channels or servers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("address already in use: {0}")]
    AddressInUse(String),
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    #[error("engine shut down")]
    Shutdown,
}

// -- Handles -----------------------------------------------------------------

/// Opaque registration handle for a method, valid for the channel or server
/// that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodHandle(u64);

impl MethodHandle {
    pub fn from_raw(raw: u64) -> Self {
        MethodHandle(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// A native call handle (client or server side).
pub trait NativeCall: Send + Sync {
    /// Submit a batch; completion is posted to the call's queue under `tag`.
    /// Must not block.
    fn start_batch(&self, ops: &[RawOp], tag: Tag) -> Result<(), CallError>;

    /// Cancel the call. A no-op once the call has finished.
    fn cancel(&self) -> Result<(), CallError>;

    /// Cancel the call delivering `status` and `details` to the peer.
    /// A no-op once the call has finished.
    fn cancel_with_status(&self, status: StatusCode, details: &str) -> Result<(), CallError>;
}

/// A server-side call handed over by the engine, with its request details.
pub struct IncomingCall {
    pub call: Box<dyn NativeCall>,
    pub method: String,
    pub host: String,
    pub deadline: Deadline,
    /// The client's initial metadata.
    pub metadata: MetadataMap,
}

impl std::fmt::Debug for IncomingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingCall")
            .field("method", &self.method)
            .field("host", &self.host)
            .field("deadline", &self.deadline)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// A client channel to one target.
pub trait NativeChannel: Send + Sync {
    fn create_call(
        &self,
        queue: &Arc<EventQueue>,
        method: &str,
        host: Option<&str>,
        deadline: Deadline,
    ) -> Result<Box<dyn NativeCall>, CallError>;

    /// Register `method` once for repeated use with
    /// [`create_registered_call`](Self::create_registered_call).
    fn register_method(&self, method: &str, host: Option<&str>) -> MethodHandle;

    fn create_registered_call(
        &self,
        queue: &Arc<EventQueue>,
        method: MethodHandle,
        deadline: Deadline,
    ) -> Result<Box<dyn NativeCall>, CallError>;

    /// Current connectivity. `try_to_connect` starts a connection attempt on
    /// an idle channel.
    fn check_connectivity_state(&self, try_to_connect: bool) -> ConnectivityState;

    /// Post `tag` to `queue` once the state differs from `last`: with
    /// `success = true` on a change, `false` if `deadline` passes first.
    fn watch_connectivity_state(
        &self,
        last: ConnectivityState,
        deadline: Deadline,
        queue: &Arc<EventQueue>,
        tag: Tag,
    ) -> Result<(), CallError>;
}

/// A bound server.
pub trait NativeServer: Send + Sync {
    /// Register `method`; `None` if it is already registered.
    fn register_method(&self, method: &str, host: Option<&str>) -> Option<MethodHandle>;

    /// Make `queue` eligible for request notifications.
    fn register_queue(&self, queue: &Arc<EventQueue>);

    fn start(&self);

    /// Ask for the next call to an unregistered method. `slot` is filled and
    /// `tag` posted to `queue` when one arrives.
    fn request_call(
        &self,
        queue: &Arc<EventQueue>,
        slot: OutputSlot<IncomingCall>,
        tag: Tag,
    ) -> Result<(), CallError>;

    /// Ask for the next call to a registered method.
    fn request_registered_call(
        &self,
        method: MethodHandle,
        queue: &Arc<EventQueue>,
        slot: OutputSlot<IncomingCall>,
        tag: Tag,
    ) -> Result<(), CallError>;

    /// Withdraw a pending request so no call is handed to it.
    ///
    /// Returns `false` if the request is no longer pending: it was already
    /// matched to a call (its slot is filled and `tag` posted) or failed.
    fn cancel_request(&self, tag: Tag) -> bool;

    /// Stop accepting calls; post `tag` to `queue` once shut down. Pending
    /// requests complete unsuccessfully.
    fn shutdown_and_notify(&self, queue: &Arc<EventQueue>, tag: Tag);

    fn cancel_all_calls(&self);
}

/// A process-wide engine instance. Construction is engine init; all channels
/// and servers must be released before [`shutdown`](Self::shutdown).
pub trait Engine: Send + Sync {
    fn connect(&self, host: &str, port: u16) -> Result<Arc<dyn NativeChannel>, EngineError>;

    fn bind(&self, host: &str, port: u16) -> Result<Arc<dyn NativeServer>, EngineError>;

    fn shutdown(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn events_are_fifo() {
        let q = EventQueue::new();
        let a = Tag::encode(1, 1);
        let b = Tag::encode(1, 2);
        assert!(q.post(a, true));
        assert!(q.post(b, false));
        assert_eq!(q.next(None), RawEvent::Complete(Completion { tag: a, success: true }));
        assert_eq!(q.next(None), RawEvent::Complete(Completion { tag: b, success: false }));
    }

    #[test]
    fn next_times_out() {
        let q = EventQueue::new();
        let at = Instant::now() + Duration::from_millis(20);
        assert_eq!(q.next(Some(at)), RawEvent::Timeout);
        assert!(Instant::now() >= at);
    }

    #[test]
    fn shutdown_drains_then_reports() {
        let q = EventQueue::new();
        let a = Tag::encode(1, 1);
        q.post(a, true);
        q.shutdown();
        assert!(!q.post(Tag::encode(1, 2), true));
        assert_eq!(q.next(None), RawEvent::Complete(Completion { tag: a, success: true }));
        assert_eq!(q.next(None), RawEvent::Shutdown);
        assert_eq!(q.next(None), RawEvent::Shutdown);
    }

    #[test]
    fn shutdown_wakes_blocked_consumer() {
        let q = EventQueue::new();
        let q2 = q.clone();
        let h = std::thread::spawn(move || q2.next(None));
        std::thread::sleep(Duration::from_millis(20));
        q.shutdown();
        assert_eq!(h.join().unwrap(), RawEvent::Shutdown);
    }

    #[test]
    fn output_slot_takes_once() {
        let slot = OutputSlot::new();
        let engine_side = slot.clone();
        engine_side.fill(42u32);
        assert!(slot.is_filled());
        assert_eq!(slot.take(), Some(42));
        assert_eq!(slot.take(), None);
        assert!(!engine_side.is_filled());
    }

    #[test]
    fn op_side_rules() {
        assert!(OpKind::SendCloseFromClient.valid_on_client());
        assert!(!OpKind::SendCloseFromClient.valid_on_server());
        assert!(OpKind::RecvCloseOnServer.valid_on_server());
        assert!(!OpKind::RecvCloseOnServer.valid_on_client());
        assert!(OpKind::RecvMessage.valid_on_client() && OpKind::RecvMessage.valid_on_server());
        assert!(OpKind::SendStatusFromServer.is_send());
        assert!(!OpKind::RecvStatusOnClient.is_send());
    }
}
