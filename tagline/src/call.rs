//! Call handles and batch execution.

use std::time::Duration;

use parking_lot::Mutex;

use crate::deadline::Deadline;
use crate::error::Error;
use crate::method::RegisteredMethod;
use crate::metrics;
use crate::native::{NativeCall, NativeChannel};
use crate::op::{Op, OpContext, OpResult};
use crate::queue::{CompletionQueue, QueueState};
use crate::status::StatusCode;
use crate::tag::Tag;

/// Where a call is in its batch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// No batch submitted yet.
    Created,
    /// A batch is with the engine under this tag.
    BatchOutstanding(Tag),
    /// The last batch has been plucked.
    Idle,
}

struct CallInner {
    state: CallState,
    /// Context of the outstanding batch. The engine may write its slots until
    /// the batch's completion is plucked.
    context: Option<OpContext>,
}

/// One RPC: a native call handle bound to the completion queue it reports to.
///
/// Batches on a call are strictly sequential. The call borrows its queue, so it
/// cannot outlive it.
pub struct Call<'q> {
    native: Box<dyn NativeCall>,
    queue: &'q CompletionQueue,
    inner: Mutex<CallInner>,
}

impl<'q> Call<'q> {
    /// Create a client call to `method`.
    pub fn create(
        channel: &dyn NativeChannel,
        queue: &'q CompletionQueue,
        method: &str,
        host: Option<&str>,
        deadline: Deadline,
    ) -> Result<Self, Error> {
        Self::ensure_active(queue)?;
        let native = channel.create_call(queue.native(), method, host, deadline)?;
        tracing::debug!(method, queue = queue.id(), "call created");
        Ok(Self::from_incoming(queue, native))
    }

    /// Create a client call through a pre-registered method handle.
    pub fn create_registered(
        channel: &dyn NativeChannel,
        queue: &'q CompletionQueue,
        method: &RegisteredMethod,
        deadline: Deadline,
    ) -> Result<Self, Error> {
        Self::ensure_active(queue)?;
        let native = channel.create_registered_call(queue.native(), method.handle(), deadline)?;
        tracing::debug!(method = method.name(), queue = queue.id(), "registered call created");
        Ok(Self::from_incoming(queue, native))
    }

    /// Wrap a native call the engine already created, such as an accepted
    /// server-side call.
    pub fn from_incoming(queue: &'q CompletionQueue, native: Box<dyn NativeCall>) -> Self {
        metrics::CALLS_ACTIVE.increment();
        Self {
            native,
            queue,
            inner: Mutex::new(CallInner {
                state: CallState::Created,
                context: None,
            }),
        }
    }

    fn ensure_active(queue: &CompletionQueue) -> Result<(), Error> {
        match queue.state() {
            QueueState::Active => Ok(()),
            QueueState::ShuttingDown => Err(Error::QueueShuttingDown),
            QueueState::Shutdown => Err(Error::QueueShutdown),
        }
    }

    pub fn state(&self) -> CallState {
        self.inner.lock().state
    }

    pub fn queue(&self) -> &'q CompletionQueue {
        self.queue
    }

    /// Submit `context` under `tag`. Never blocks.
    ///
    /// On rejection the context is dropped, releasing its slots, and the call
    /// stays in its previous state. The tag is left to the caller.
    pub fn start_batch(&self, context: OpContext, tag: Tag) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if let CallState::BatchOutstanding(outstanding) = inner.state {
            metrics::BATCHES_REJECTED.increment();
            tracing::warn!(%tag, %outstanding, "batch submitted while another is outstanding");
            return Err(Error::BatchOutstanding);
        }
        if let Err(e) = self.native.start_batch(context.raw_ops(), tag) {
            metrics::BATCHES_REJECTED.increment();
            tracing::debug!(%tag, error = %e, "batch rejected");
            return Err(e.into());
        }
        metrics::BATCHES_STARTED.increment();
        inner.state = CallState::BatchOutstanding(tag);
        inner.context = Some(context);
        Ok(())
    }

    /// Take back the context of the batch submitted under `tag` once its
    /// completion has been plucked.
    pub fn finish_batch(&self, tag: Tag) -> Option<OpContext> {
        let mut inner = self.inner.lock();
        if inner.state != CallState::BatchOutstanding(tag) {
            return None;
        }
        inner.state = CallState::Idle;
        inner.context.take()
    }

    /// Run one batch to completion: encode, submit, pluck, decode.
    ///
    /// If the pluck fails the batch stays outstanding and the call accepts no
    /// further batches; dropping it cancels the native call.
    pub fn run_ops(&self, ops: Vec<Op>, timeout: Option<Duration>) -> Result<Vec<OpResult>, Error> {
        let context = OpContext::encode(ops);
        let tag = self.queue.new_tag()?;
        if let Err(e) = self.start_batch(context, tag) {
            self.queue.release_tag(tag);
            return Err(e);
        }

        let completion = self.queue.pluck(tag, timeout)?;
        let mut context = self.finish_batch(tag).ok_or(Error::UnknownTag(tag))?;
        if !completion.success {
            metrics::BATCHES_FAILED.increment();
            return Err(Error::BatchFailed);
        }
        Ok(context.decode())
    }

    /// Cancel the call. Harmless once it has finished.
    pub fn cancel(&self) -> Result<(), Error> {
        self.native.cancel()?;
        Ok(())
    }

    /// Cancel the call, delivering `status` and `details` to the peer.
    pub fn cancel_with_status(&self, status: StatusCode, details: &str) -> Result<(), Error> {
        self.native.cancel_with_status(status, details)?;
        Ok(())
    }
}

impl std::fmt::Debug for Call<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("queue", &self.queue.id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for Call<'_> {
    fn drop(&mut self) {
        metrics::CALLS_ACTIVE.decrement();
        if let CallState::BatchOutstanding(tag) = self.inner.get_mut().state {
            tracing::warn!(%tag, "call dropped with a batch outstanding, cancelling");
            if let Err(e) = self.native.cancel() {
                tracing::debug!(error = %e, "cancel on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ByteBuffer;
    use crate::native::{CallError, EventQueue, RawOp};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted engine call: fills every receive slot and completes at once.
    struct ScriptedCall {
        queue: Arc<EventQueue>,
        /// Post completions at all.
        complete: bool,
        success: bool,
        reject: Option<CallError>,
        cancels: Arc<AtomicUsize>,
    }

    impl ScriptedCall {
        fn new(queue: &CompletionQueue) -> Self {
            Self {
                queue: queue.native().clone(),
                complete: true,
                success: true,
                reject: None,
                cancels: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl NativeCall for ScriptedCall {
        fn start_batch(&self, ops: &[RawOp], tag: Tag) -> Result<(), CallError> {
            if let Some(e) = self.reject {
                return Err(e);
            }
            for op in ops {
                if let RawOp::RecvMessage(slot) = op {
                    slot.fill(ByteBuffer::copy_in(b"hello you"));
                }
            }
            if self.complete {
                self.queue.post(tag, self.success);
            }
            Ok(())
        }

        fn cancel(&self) -> Result<(), CallError> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn cancel_with_status(&self, _status: StatusCode, _details: &str) -> Result<(), CallError> {
            self.cancel()
        }
    }

    #[test]
    fn run_ops_decodes_results() {
        let cq = CompletionQueue::new().unwrap();
        let call = Call::from_incoming(&cq, Box::new(ScriptedCall::new(&cq)));
        assert_eq!(call.state(), CallState::Created);

        let results = call
            .run_ops(
                vec![Op::SendMessage(ByteBuffer::copy_in(b"hello world")), Op::RecvMessage],
                Some(Duration::from_secs(5)),
            )
            .unwrap();
        assert_eq!(results, [OpResult::Message(Some(ByteBuffer::copy_in(b"hello you")))]);
        assert_eq!(call.state(), CallState::Idle);
        assert_eq!(cq.outstanding_tags(), 0);
    }

    #[test]
    fn unsuccessful_completion_is_batch_failed() {
        let cq = CompletionQueue::new().unwrap();
        let mut native = ScriptedCall::new(&cq);
        native.success = false;
        let call = Call::from_incoming(&cq, Box::new(native));
        let err = call.run_ops(vec![Op::RecvMessage], None).unwrap_err();
        assert!(matches!(err, Error::BatchFailed));
        assert_eq!(call.state(), CallState::Idle);
    }

    #[test]
    fn rejection_releases_tag() {
        let cq = CompletionQueue::new().unwrap();
        let mut native = ScriptedCall::new(&cq);
        native.reject = Some(CallError::TooManyOperations);
        let call = Call::from_incoming(&cq, Box::new(native));
        let err = call.run_ops(vec![Op::RecvMessage, Op::RecvMessage], None).unwrap_err();
        assert!(matches!(err, Error::BatchSubmissionFailed(CallError::TooManyOperations)));
        assert_eq!(call.state(), CallState::Created);
        assert_eq!(cq.outstanding_tags(), 0);
    }

    #[test]
    fn second_batch_while_outstanding_rejected() {
        let cq = CompletionQueue::new().unwrap();
        let mut native = ScriptedCall::new(&cq);
        native.complete = false;
        let cancels = native.cancels.clone();
        let call = Call::from_incoming(&cq, Box::new(native));

        let first = cq.new_tag().unwrap();
        call.start_batch(OpContext::encode(vec![Op::RecvMessage]), first).unwrap();
        assert_eq!(call.state(), CallState::BatchOutstanding(first));

        let second = cq.new_tag().unwrap();
        let err = call
            .start_batch(OpContext::encode(vec![Op::RecvMessage]), second)
            .unwrap_err();
        assert!(matches!(err, Error::BatchOutstanding));
        cq.release_tag(second);

        // Dropping with the batch outstanding cancels instead of freeing.
        drop(call);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn finish_batch_requires_matching_tag() {
        let cq = CompletionQueue::new().unwrap();
        let call = Call::from_incoming(&cq, Box::new(ScriptedCall::new(&cq)));
        let tag = cq.new_tag().unwrap();
        call.start_batch(OpContext::encode(vec![Op::RecvMessage]), tag).unwrap();
        cq.pluck(tag, None).unwrap();

        assert!(call.finish_batch(Tag::encode(cq.id(), 12345)).is_none());
        let mut context = call.finish_batch(tag).unwrap();
        assert_eq!(context.decode().len(), 1);
        assert!(call.finish_batch(tag).is_none());
    }

    #[test]
    fn pluck_timeout_leaves_batch_outstanding() {
        let cq = CompletionQueue::new().unwrap();
        let mut native = ScriptedCall::new(&cq);
        native.complete = false;
        let cancels = native.cancels.clone();
        let call = Call::from_incoming(&cq, Box::new(native));

        let err = call
            .run_ops(vec![Op::RecvMessage], Some(Duration::from_millis(10)))
            .unwrap_err();
        assert!(matches!(err, Error::TimedOut));
        assert!(matches!(call.state(), CallState::BatchOutstanding(_)));
        drop(call);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn run_ops_after_queue_shutdown() {
        let cq = CompletionQueue::new().unwrap();
        let call = Call::from_incoming(&cq, Box::new(ScriptedCall::new(&cq)));
        cq.shutdown().unwrap();
        let err = call.run_ops(vec![Op::RecvMessage], None).unwrap_err();
        assert!(matches!(err, Error::QueueShuttingDown));
    }
}
