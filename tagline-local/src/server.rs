use std::collections::{HashMap, VecDeque};
use std::mem;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tagline::StatusCode;
use tagline::Tag;
use tagline::native::{CallError, EventQueue, IncomingCall, MethodHandle, NativeServer, OutputSlot};

use crate::EngineInner;
use crate::call::LocalCall;
use crate::rpc::Rpc;

/// An outstanding `request_call` or `request_registered_call`.
struct PendingRequest {
    queue: Arc<EventQueue>,
    slot: OutputSlot<IncomingCall>,
    tag: Tag,
}

impl PendingRequest {
    /// Hand `rpc` to the requester. `false` if its queue is already shut down.
    fn fulfill(self, rpc: &Arc<Rpc>) -> bool {
        if self.queue.is_shutdown() {
            return false;
        }
        self.slot.fill(IncomingCall {
            call: Box::new(LocalCall::server(rpc.clone(), self.queue.clone())),
            method: rpc.method().to_string(),
            host: rpc.host().to_string(),
            deadline: rpc.deadline(),
            metadata: rpc.client_metadata(),
        });
        // A shutdown racing the post leaves the call in the slot; releasing
        // the slot cancels it.
        self.queue.post(self.tag, true);
        true
    }
}

#[derive(Default)]
struct ServerState {
    started: bool,
    shutdown: bool,
    methods: HashMap<String, MethodHandle>,
    queues: Vec<Arc<EventQueue>>,
    /// Keyed by registration; `None` for unregistered methods.
    requests: HashMap<Option<MethodHandle>, VecDeque<PendingRequest>>,
    /// Calls that arrived with no matching request.
    backlog: HashMap<Option<MethodHandle>, VecDeque<Arc<Rpc>>>,
    calls: Vec<Weak<Rpc>>,
}

/// In-process server bound to one address.
pub(crate) struct LocalServer {
    address: String,
    engine: Weak<EngineInner>,
    state: Mutex<ServerState>,
}

impl LocalServer {
    pub(crate) fn new(address: String, engine: Weak<EngineInner>) -> Self {
        Self {
            address,
            engine,
            state: Mutex::new(ServerState::default()),
        }
    }

    /// Started and not shut down.
    pub(crate) fn is_accepting(&self) -> bool {
        let state = self.state.lock();
        state.started && !state.shutdown
    }

    /// Tell channel watchers on this address to look again.
    fn notify_watchers(&self) {
        if let Some(engine) = self.engine.upgrade() {
            engine.state_changed(&self.address);
        }
    }

    /// Route an invoked client call. `false` if the server is not accepting.
    pub(crate) fn deliver(&self, rpc: &Arc<Rpc>) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.started || state.shutdown {
            return false;
        }
        let key = state.methods.get(rpc.method()).copied();
        state.calls.retain(|c| c.strong_count() > 0);
        state.calls.push(Arc::downgrade(rpc));

        if let Some(requests) = state.requests.get_mut(&key) {
            while let Some(request) = requests.pop_front() {
                if request.fulfill(rpc) {
                    return true;
                }
            }
        }
        tracing::trace!(addr = %self.address, method = rpc.method(), "call queued for a request");
        state.backlog.entry(key).or_default().push_back(rpc.clone());
        true
    }

    fn request(
        &self,
        key: Option<MethodHandle>,
        queue: &Arc<EventQueue>,
        slot: OutputSlot<IncomingCall>,
        tag: Tag,
    ) -> Result<(), CallError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.shutdown {
            return Err(CallError::ServerShutdown);
        }
        if queue.is_shutdown() {
            return Err(CallError::CompletionQueueShutdown);
        }
        if let Some(handle) = key {
            if !state.methods.values().any(|h| *h == handle) {
                return Err(CallError::UnknownMethod);
            }
        }
        if !state.queues.iter().any(|q| Arc::ptr_eq(q, queue)) {
            tracing::warn!(addr = %self.address, "call requested on an unregistered queue");
        }

        let request = PendingRequest {
            queue: queue.clone(),
            slot,
            tag,
        };
        if let Some(backlog) = state.backlog.get_mut(&key) {
            while let Some(rpc) = backlog.pop_front() {
                if !rpc.is_finished() {
                    request.fulfill(&rpc);
                    return Ok(());
                }
            }
        }
        state.requests.entry(key).or_default().push_back(request);
        Ok(())
    }
}

impl NativeServer for LocalServer {
    fn register_method(&self, method: &str, _host: Option<&str>) -> Option<MethodHandle> {
        let mut state = self.state.lock();
        if state.methods.contains_key(method) {
            return None;
        }
        let handle = MethodHandle::from_raw(state.methods.len() as u64 + 1);
        state.methods.insert(method.to_string(), handle);
        Some(handle)
    }

    fn register_queue(&self, queue: &Arc<EventQueue>) {
        self.state.lock().queues.push(queue.clone());
    }

    fn start(&self) {
        self.state.lock().started = true;
        tracing::debug!(addr = %self.address, "local server started");
        self.notify_watchers();
    }

    fn request_call(
        &self,
        queue: &Arc<EventQueue>,
        slot: OutputSlot<IncomingCall>,
        tag: Tag,
    ) -> Result<(), CallError> {
        self.request(None, queue, slot, tag)
    }

    fn request_registered_call(
        &self,
        method: MethodHandle,
        queue: &Arc<EventQueue>,
        slot: OutputSlot<IncomingCall>,
        tag: Tag,
    ) -> Result<(), CallError> {
        self.request(Some(method), queue, slot, tag)
    }

    fn cancel_request(&self, tag: Tag) -> bool {
        let mut state = self.state.lock();
        for requests in state.requests.values_mut() {
            if let Some(pos) = requests.iter().position(|r| r.tag == tag) {
                requests.remove(pos);
                tracing::trace!(addr = %self.address, %tag, "call request withdrawn");
                return true;
            }
        }
        false
    }

    fn shutdown_and_notify(&self, queue: &Arc<EventQueue>, tag: Tag) {
        let (requests, backlog) = {
            let mut state = self.state.lock();
            state.shutdown = true;
            (mem::take(&mut state.requests), mem::take(&mut state.backlog))
        };
        for request in requests.into_values().flatten() {
            request.queue.post(request.tag, false);
        }
        for rpc in backlog.into_values().flatten() {
            rpc.finish(StatusCode::Unavailable, "server shutting down", false);
        }
        tracing::debug!(addr = %self.address, "local server shut down");
        self.notify_watchers();
        queue.post(tag, true);
    }

    fn cancel_all_calls(&self) {
        let calls: Vec<Arc<Rpc>> = self
            .state
            .lock()
            .calls
            .drain(..)
            .filter_map(|c| c.upgrade())
            .collect();
        for rpc in calls {
            rpc.finish(StatusCode::Unavailable, "Cancelled all calls", true);
        }
    }
}

impl Drop for LocalServer {
    fn drop(&mut self) {
        self.notify_watchers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn withdrawn_request_is_not_matched() {
        let server = LocalServer::new("localhost:1".into(), Weak::new());
        server.start();
        let queue = EventQueue::new();
        let tag = Tag::encode(1, 1);
        let slot = OutputSlot::new();
        server.request_call(&queue, slot.clone(), tag).unwrap();

        assert!(server.cancel_request(tag));
        assert!(!server.cancel_request(tag));

        let rpc = Rpc::new("/svc/m", "localhost:1", tagline::Deadline::infinite());
        assert!(server.deliver(&rpc));
        assert!(!slot.is_filled());
    }

    #[test]
    fn matched_request_cannot_be_withdrawn() {
        let server = LocalServer::new("localhost:1".into(), Weak::new());
        server.start();
        let queue = EventQueue::new();
        let tag = Tag::encode(1, 1);
        let slot = OutputSlot::new();
        server.request_call(&queue, slot.clone(), tag).unwrap();

        let rpc = Rpc::new("/svc/m", "localhost:1", tagline::Deadline::infinite());
        assert!(server.deliver(&rpc));
        assert!(slot.is_filled());
        assert!(!server.cancel_request(tag));
    }
}
