//! Unary client.

use std::sync::Arc;
use std::time::Duration;

use crate::buffer::ByteBuffer;
use crate::call::Call;
use crate::config::ClientConfig;
use crate::deadline::Deadline;
use crate::error::Error;
use crate::metadata::MetadataMap;
use crate::method::{CallType, RegisteredMethod};
use crate::native::{ConnectivityState, Engine, NativeChannel};
use crate::queue::CompletionQueue;
use crate::request::{NormalRequestResult, ResponseShape, send_ops};

/// A channel to one target plus the completion queue its calls report to.
///
/// Every request runs on the calling thread: it submits its batches and plucks
/// their completions itself, so any number of threads can share one client.
pub struct Client {
    queue: CompletionQueue,
    channel: Arc<dyn NativeChannel>,
    config: ClientConfig,
}

impl Client {
    /// Connect to `config.host:config.port` through `engine`.
    pub fn new(engine: &dyn Engine, config: ClientConfig) -> Result<Self, Error> {
        config.validate()?;
        let channel = engine.connect(&config.host, config.port)?;
        let queue = CompletionQueue::new()?;
        tracing::debug!(addr = %config.target(), queue = queue.id(), "client created");
        Ok(Self { queue, channel, config })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn queue(&self) -> &CompletionQueue {
        &self.queue
    }

    /// Register `name` once so later calls skip per-call method resolution.
    pub fn register_method(
        &self,
        name: &str,
        call_type: CallType,
    ) -> Result<RegisteredMethod, Error> {
        if call_type != CallType::Normal {
            return Err(Error::UnsupportedCallType(call_type));
        }
        let handle = self.channel.register_method(name, None);
        RegisteredMethod::new(name, call_type, handle)
    }

    /// Create a call to `method` bounded by `deadline`.
    pub fn create_call(&self, method: &str, deadline: Deadline) -> Result<Call<'_>, Error> {
        Call::create(self.channel.as_ref(), &self.queue, method, None, deadline)
    }

    pub fn create_registered_call(
        &self,
        method: &RegisteredMethod,
        deadline: Deadline,
    ) -> Result<Call<'_>, Error> {
        Call::create_registered(self.channel.as_ref(), &self.queue, method, deadline)
    }

    /// Current connectivity of the channel. `try_to_connect` wakes an idle
    /// channel.
    pub fn connectivity_state(&self, try_to_connect: bool) -> ConnectivityState {
        self.channel.check_connectivity_state(try_to_connect)
    }

    /// Block until the channel's state differs from `last`.
    ///
    /// Returns `Ok(false)` if `timeout` passes with the state unchanged.
    pub fn wait_for_state_change(
        &self,
        last: ConnectivityState,
        timeout: Duration,
    ) -> Result<bool, Error> {
        let deadline = Deadline::after(timeout);
        let tag = self.queue.new_tag()?;
        let watched = self
            .channel
            .watch_connectivity_state(last, deadline, self.queue.native(), tag);
        if let Err(e) = watched {
            self.queue.release_tag(tag);
            return Err(e.into());
        }
        let completion = self.queue.pluck(tag, self.pluck_timeout(deadline))?;
        tracing::debug!(%last, changed = completion.success, "connectivity watch finished");
        Ok(completion.success)
    }

    /// Unary request to `method`, receiving the server's initial metadata.
    ///
    /// `timeout` becomes the call deadline. A non-OK status is returned as
    /// [`Error::BadStatusCode`].
    pub fn request(
        &self,
        method: &str,
        timeout: Duration,
        body: ByteBuffer,
        metadata: MetadataMap,
    ) -> Result<NormalRequestResult, Error> {
        let deadline = Deadline::after(timeout);
        let call = self.create_call(method, deadline)?;
        self.unary(&call, deadline, ResponseShape::WithInitialMetadata, body, metadata)
    }

    /// Unary request through a registered method. Initial metadata is not
    /// received on this path.
    pub fn registered_request(
        &self,
        method: &RegisteredMethod,
        timeout: Duration,
        body: ByteBuffer,
        metadata: MetadataMap,
    ) -> Result<NormalRequestResult, Error> {
        let deadline = Deadline::after(timeout);
        let call = self.create_registered_call(method, deadline)?;
        self.unary(&call, deadline, ResponseShape::WithoutInitialMetadata, body, metadata)
    }

    fn unary(
        &self,
        call: &Call<'_>,
        deadline: Deadline,
        shape: ResponseShape,
        body: ByteBuffer,
        metadata: MetadataMap,
    ) -> Result<NormalRequestResult, Error> {
        call.run_ops(send_ops(body, metadata), self.pluck_timeout(deadline))?;
        let results = call.run_ops(shape.receive_ops(), self.pluck_timeout(deadline))?;
        shape.compile(results)
    }

    fn pluck_timeout(&self, deadline: Deadline) -> Option<Duration> {
        deadline
            .remaining()
            .map(|r| r.saturating_add(self.config.pluck_grace))
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Err(e) = self.queue.shutdown() {
            tracing::debug!(error = %e, "client queue already shut down");
        }
        tracing::debug!(addr = %self.config.target(), "client released");
    }
}
