use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tagline::native::{
    CallError, ConnectivityState, EventQueue, MethodHandle, NativeCall, NativeChannel,
};
use tagline::{Deadline, Tag};

use crate::EngineInner;
use crate::call::{LocalCall, Route};
use crate::rpc::Rpc;
use crate::watch::Watch;

struct Registered {
    method: String,
    host: Option<String>,
}

/// Client channel to one `host:port` target.
///
/// The target is resolved when each call is invoked, so a channel can be
/// created before its server is bound. The channel stays idle until it is
/// asked to connect or creates its first call.
pub(crate) struct LocalChannel {
    engine: Arc<EngineInner>,
    target: String,
    methods: Mutex<HashMap<MethodHandle, Registered>>,
    attempted: Arc<AtomicBool>,
}

impl LocalChannel {
    pub(crate) fn new(engine: Arc<EngineInner>, target: String) -> Self {
        Self {
            engine,
            target,
            methods: Mutex::new(HashMap::new()),
            attempted: Arc::new(AtomicBool::new(false)),
        }
    }

    fn try_to_connect(&self) {
        if !self.attempted.swap(true, Ordering::AcqRel) {
            self.engine.state_changed(&self.target);
        }
    }
}

impl NativeChannel for LocalChannel {
    fn create_call(
        &self,
        queue: &Arc<EventQueue>,
        method: &str,
        host: Option<&str>,
        deadline: Deadline,
    ) -> Result<Box<dyn NativeCall>, CallError> {
        if queue.is_shutdown() {
            return Err(CallError::CompletionQueueShutdown);
        }
        self.try_to_connect();
        let rpc = Rpc::new(method, host.unwrap_or(&self.target), deadline);
        let route = Route {
            engine: self.engine.clone(),
            target: self.target.clone(),
        };
        Ok(Box::new(LocalCall::client(rpc, queue.clone(), route)))
    }

    fn register_method(&self, method: &str, host: Option<&str>) -> MethodHandle {
        let mut methods = self.methods.lock();
        let handle = MethodHandle::from_raw(methods.len() as u64 + 1);
        methods.insert(
            handle,
            Registered {
                method: method.to_string(),
                host: host.map(str::to_string),
            },
        );
        handle
    }

    fn create_registered_call(
        &self,
        queue: &Arc<EventQueue>,
        method: MethodHandle,
        deadline: Deadline,
    ) -> Result<Box<dyn NativeCall>, CallError> {
        let (name, host) = match self.methods.lock().get(&method) {
            Some(r) => (r.method.clone(), r.host.clone()),
            None => return Err(CallError::UnknownMethod),
        };
        self.create_call(queue, &name, host.as_deref(), deadline)
    }

    fn check_connectivity_state(&self, try_to_connect: bool) -> ConnectivityState {
        if try_to_connect {
            self.try_to_connect();
        }
        self.engine
            .connectivity(&self.target, self.attempted.load(Ordering::Acquire))
    }

    fn watch_connectivity_state(
        &self,
        last: ConnectivityState,
        deadline: Deadline,
        queue: &Arc<EventQueue>,
        tag: Tag,
    ) -> Result<(), CallError> {
        if queue.is_shutdown() {
            return Err(CallError::CompletionQueueShutdown);
        }
        let watch = Watch::new(
            self.target.clone(),
            last,
            self.attempted.clone(),
            queue.clone(),
            tag,
        );
        self.engine.watch(Arc::new(watch), deadline);
        Ok(())
    }
}
