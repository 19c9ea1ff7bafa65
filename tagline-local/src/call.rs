use std::sync::{Arc, Weak};

use tagline::native::{CallError, EventQueue, NativeCall, RawOp};
use tagline::{StatusCode, Tag};

use crate::EngineInner;
use crate::alarm::Expire;
use crate::rpc::{Rpc, Side};

/// Where a client call is routed when it is invoked.
pub(crate) struct Route {
    pub(crate) engine: Arc<EngineInner>,
    pub(crate) target: String,
}

/// One end of an in-process call.
///
/// Releasing a handle before the call has a status cancels the call.
pub(crate) struct LocalCall {
    rpc: Arc<Rpc>,
    side: Side,
    queue: Arc<EventQueue>,
    /// Set on client calls only.
    route: Option<Route>,
}

impl LocalCall {
    pub(crate) fn client(rpc: Arc<Rpc>, queue: Arc<EventQueue>, route: Route) -> Self {
        if let Some(at) = rpc.deadline().instant() {
            let expiry: Weak<dyn Expire> = Arc::downgrade(&rpc) as Weak<Rpc>;
            route.engine.alarm.schedule(at, expiry);
        }
        Self {
            rpc,
            side: Side::Client,
            queue,
            route: Some(route),
        }
    }

    pub(crate) fn server(rpc: Arc<Rpc>, queue: Arc<EventQueue>) -> Self {
        Self {
            rpc,
            side: Side::Server,
            queue,
            route: None,
        }
    }

    /// Hand the call to the server listening on the route's target.
    fn invoke(&self) {
        let Some(route) = &self.route else {
            return;
        };
        let delivered = route
            .engine
            .server(&route.target)
            .is_some_and(|server| server.deliver(&self.rpc));
        if !delivered {
            tracing::debug!(target_addr = %route.target, method = self.rpc.method(), "no server");
            let details = format!("failed to connect to {}", route.target);
            self.rpc.finish(StatusCode::Unavailable, &details, false);
        }
    }
}

impl NativeCall for LocalCall {
    fn start_batch(&self, ops: &[RawOp], tag: Tag) -> Result<(), CallError> {
        if self.rpc.start_batch(self.side, ops, tag, &self.queue)? {
            self.invoke();
        }
        Ok(())
    }

    fn cancel(&self) -> Result<(), CallError> {
        self.rpc.finish(StatusCode::Cancelled, "Cancelled", true);
        Ok(())
    }

    fn cancel_with_status(&self, status: StatusCode, details: &str) -> Result<(), CallError> {
        self.rpc.finish(status, details, true);
        Ok(())
    }
}

impl Drop for LocalCall {
    fn drop(&mut self) {
        if self.rpc.finish(StatusCode::Cancelled, "call released", true) {
            tracing::debug!(
                side = ?self.side,
                method = self.rpc.method(),
                "unfinished call released"
            );
        }
    }
}
