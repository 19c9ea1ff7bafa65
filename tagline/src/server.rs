//! Unary server: accept calls, receive requests, send responses.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::buffer::ByteBuffer;
use crate::call::Call;
use crate::config::ServerConfig;
use crate::deadline::Deadline;
use crate::error::Error;
use crate::metadata::MetadataMap;
use crate::method::RegisteredMethod;
use crate::native::{CallError, Engine, IncomingCall, NativeServer, OutputSlot};
use crate::op::{Op, OpResult};
use crate::queue::CompletionQueue;
use crate::status::StatusCode;
use crate::tag::Tag;

/// What the server received on a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRequest {
    /// Request payload; `None` when the client sent no message.
    pub body: Option<ByteBuffer>,
    /// The client cancelled or the deadline passed before the request was
    /// fully received.
    pub cancelled: bool,
}

/// What the server sends back to finish a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerResponse {
    pub body: Option<ByteBuffer>,
    pub trailing_metadata: MetadataMap,
    pub status: StatusCode,
    pub details: String,
}

impl ServerResponse {
    /// `OK` with `body`.
    pub fn ok(body: ByteBuffer) -> Self {
        Self {
            body: Some(body),
            trailing_metadata: MetadataMap::new(),
            status: StatusCode::Ok,
            details: String::new(),
        }
    }

    /// No message, just `status` and `details`.
    pub fn status(status: StatusCode, details: impl Into<String>) -> Self {
        Self {
            body: None,
            trailing_metadata: MetadataMap::new(),
            status,
            details: details.into(),
        }
    }

    pub fn with_trailing_metadata(mut self, metadata: MetadataMap) -> Self {
        self.trailing_metadata = metadata;
        self
    }
}

/// A server bound to one address with one completion queue.
///
/// Accepting and serving calls is driven by the caller's threads; the server
/// owns no worker threads of its own.
pub struct Server {
    queue: CompletionQueue,
    native: Arc<dyn NativeServer>,
    methods: HashMap<String, RegisteredMethod>,
    config: ServerConfig,
    shut_down: AtomicBool,
}

impl Server {
    /// Bind `config.host:config.port`, register the configured methods and the
    /// completion queue, and start serving.
    pub fn new(engine: &dyn Engine, config: ServerConfig) -> Result<Self, Error> {
        config.validate()?;
        let native = engine.bind(&config.host, config.port)?;
        let queue = CompletionQueue::new()?;

        let mut methods = HashMap::with_capacity(config.registered_methods.len());
        for (name, call_type) in &config.registered_methods {
            let handle = native
                .register_method(name, None)
                .ok_or_else(|| Error::Config(format!("method {name} already registered")))?;
            methods.insert(name.clone(), RegisteredMethod::new(name.as_str(), *call_type, handle)?);
        }

        native.register_queue(queue.native());
        native.start();
        tracing::info!(addr = %config.address(), methods = methods.len(), "server started");

        Ok(Self {
            queue,
            native,
            methods,
            config,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn queue(&self) -> &CompletionQueue {
        &self.queue
    }

    pub fn registered_method(&self, name: &str) -> Option<&RegisteredMethod> {
        self.methods.get(name)
    }

    pub fn registered_methods(&self) -> impl Iterator<Item = &RegisteredMethod> {
        self.methods.values()
    }

    /// Wait for the next call to an unregistered method.
    pub fn accept(&self, timeout: Option<Duration>) -> Result<ServerCall<'_>, Error> {
        self.accept_with(timeout, |slot, tag| {
            self.native.request_call(self.queue.native(), slot, tag)
        })
    }

    /// Wait for the next call to `method`.
    pub fn accept_registered(
        &self,
        method: &RegisteredMethod,
        timeout: Option<Duration>,
    ) -> Result<ServerCall<'_>, Error> {
        self.accept_with(timeout, |slot, tag| {
            self.native
                .request_registered_call(method.handle(), self.queue.native(), slot, tag)
        })
    }

    fn accept_with<F>(&self, timeout: Option<Duration>, request: F) -> Result<ServerCall<'_>, Error>
    where
        F: FnOnce(OutputSlot<IncomingCall>, Tag) -> Result<(), CallError>,
    {
        let slot = OutputSlot::new();
        let tag = self.queue.new_tag()?;
        if let Err(e) = request(slot.clone(), tag) {
            self.queue.release_tag(tag);
            return Err(e.into());
        }

        let completion = match self.queue.pluck(tag, timeout) {
            Ok(completion) => completion,
            Err(e) => return self.abandon_request(slot, tag, e),
        };
        if !completion.success {
            tracing::debug!(%tag, "call request completed unsuccessfully");
            return Err(Error::BatchFailed);
        }
        let incoming = slot
            .take()
            .ok_or_else(|| Error::Unknown("request completed without a call".into()))?;
        Ok(self.server_call(incoming))
    }

    /// Give up on a request whose pluck failed with `err`.
    ///
    /// The request is withdrawn from the engine so a later call is not handed
    /// to a slot nobody reads. If the engine matched a call before the
    /// withdrawal, that call is still accepted after a timeout.
    fn abandon_request(
        &self,
        slot: OutputSlot<IncomingCall>,
        tag: Tag,
        err: Error,
    ) -> Result<ServerCall<'_>, Error> {
        if self.native.cancel_request(tag) {
            self.queue.withdraw_tag(tag);
            return Err(err);
        }
        match (err, slot.take()) {
            (Error::TimedOut, Some(incoming)) => {
                tracing::debug!(%tag, "call matched as the accept timed out");
                Ok(self.server_call(incoming))
            }
            (err, _) => Err(err),
        }
    }

    fn server_call(&self, incoming: IncomingCall) -> ServerCall<'_> {
        tracing::debug!(method = %incoming.method, host = %incoming.host, "call accepted");
        ServerCall {
            call: Call::from_incoming(&self.queue, incoming.call),
            method: incoming.method,
            host: incoming.host,
            deadline: incoming.deadline,
            metadata: incoming.metadata,
            pluck_grace: self.config.pluck_grace,
        }
    }

    /// Accept one call to `method`, receive its request, run `handler` and send
    /// its response.
    pub fn handle_registered<F>(
        &self,
        method: &RegisteredMethod,
        timeout: Option<Duration>,
        handler: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(&ServerCall<'_>, ServerRequest) -> ServerResponse,
    {
        let call = self.accept_registered(method, timeout)?;
        serve(&call, handler)
    }

    /// Accept one call to an unregistered method and serve it like
    /// [`handle_registered`](Self::handle_registered). Calls to names not in
    /// `unregistered_methods` are finished with `UNIMPLEMENTED`.
    pub fn handle<F>(&self, timeout: Option<Duration>, handler: F) -> Result<(), Error>
    where
        F: FnOnce(&ServerCall<'_>, ServerRequest) -> ServerResponse,
    {
        let call = self.accept(timeout)?;
        if !self.config.unregistered_methods.iter().any(|m| *m == call.method) {
            tracing::debug!(method = %call.method, "unimplemented method");
            let details = format!("method {} not implemented", call.method);
            return call.respond(ServerResponse::status(StatusCode::Unimplemented, details));
        }
        serve(&call, handler)
    }

    /// Stop accepting calls, cancel the ones in flight, and shut the queue
    /// down. Only the first call does anything.
    pub fn shutdown(&self) -> Result<(), Error> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let tag = self.queue.new_tag()?;
        self.native.shutdown_and_notify(self.queue.native(), tag);
        match self.queue.pluck(tag, Some(self.config.shutdown_timeout)) {
            Ok(_) => {}
            Err(Error::TimedOut) => {
                tracing::warn!(
                    timeout = ?self.config.shutdown_timeout,
                    "server shutdown not confirmed in time"
                );
            }
            Err(e) => return Err(e),
        }
        self.native.cancel_all_calls();
        self.queue.shutdown()?;
        tracing::info!(addr = %self.config.address(), "server shut down");
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "server shutdown failed");
        }
    }
}

fn serve<F>(call: &ServerCall<'_>, handler: F) -> Result<(), Error>
where
    F: FnOnce(&ServerCall<'_>, ServerRequest) -> ServerResponse,
{
    let request = call.receive(MetadataMap::new())?;
    if request.cancelled {
        tracing::debug!(method = %call.method, "call cancelled before handling");
        return Ok(());
    }
    let response = handler(call, request);
    call.respond(response)
}

/// A server-side call with the details of its request.
pub struct ServerCall<'q> {
    call: Call<'q>,
    method: String,
    host: String,
    deadline: Deadline,
    metadata: MetadataMap,
    pluck_grace: Duration,
}

impl<'q> ServerCall<'q> {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// The client's initial metadata.
    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    pub fn call(&self) -> &Call<'q> {
        &self.call
    }

    fn pluck_timeout(&self) -> Option<Duration> {
        self.deadline
            .remaining()
            .map(|r| r.saturating_add(self.pluck_grace))
    }

    /// Send `initial_metadata` and receive the request message and the
    /// client's half-close.
    pub fn receive(&self, initial_metadata: MetadataMap) -> Result<ServerRequest, Error> {
        let ops = vec![
            Op::SendInitialMetadata(initial_metadata),
            Op::RecvMessage,
            Op::RecvCloseOnServer,
        ];
        match <[OpResult; 2]>::try_from(self.call.run_ops(ops, self.pluck_timeout())?) {
            Ok([OpResult::Message(body), OpResult::CloseOnServer { cancelled }]) => {
                Ok(ServerRequest { body, cancelled })
            }
            Ok(other) => Err(Error::Unknown(format!("unexpected receive results {other:?}"))),
            Err(other) => Err(Error::Unknown(format!("{} receive results", other.len()))),
        }
    }

    /// Send the response message (if any) and final status.
    pub fn respond(&self, response: ServerResponse) -> Result<(), Error> {
        let mut ops = Vec::with_capacity(2);
        if let Some(body) = response.body {
            ops.push(Op::SendMessage(body));
        }
        ops.push(Op::SendStatusFromServer {
            trailing_metadata: response.trailing_metadata,
            status: response.status,
            details: response.details,
        });
        self.call.run_ops(ops, self.pluck_timeout())?;
        Ok(())
    }

    /// Finish the call with `status` without a response.
    pub fn cancel_with_status(&self, status: StatusCode, details: &str) -> Result<(), Error> {
        self.call.cancel_with_status(status, details)
    }
}

impl std::fmt::Debug for ServerCall<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerCall")
            .field("method", &self.method)
            .field("host", &self.host)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}
