//! Completion queue: pluck/next over one native event queue.
//!
//! A poller thread drains the native queue and routes each completion to the
//! one-shot slot registered for its tag. Completions nobody registered for are
//! buffered FIFO for [`CompletionQueue::next`]. Shutdown is observed through
//! the reserved sequence-0 tag, which the poller completes once the native
//! queue reports it has drained.

use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, select};
use parking_lot::Mutex;

use crate::error::Error;
use crate::metrics;
use crate::native::{Completion, EventQueue, RawEvent};
use crate::tag::{Tag, TagRegistry};

/// Lifecycle of a [`CompletionQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Active,
    ShuttingDown,
    Shutdown,
}

static NEXT_QUEUE_ID: AtomicU16 = AtomicU16::new(1);

fn next_queue_id() -> u16 {
    loop {
        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            return id;
        }
    }
}

struct Shared {
    id: u16,
    native: Arc<EventQueue>,
    tags: TagRegistry,
    state: Mutex<QueueState>,
}

/// Owner of one native event queue.
///
/// Any number of threads may pluck concurrently, each for its own tag.
pub struct CompletionQueue {
    shared: Arc<Shared>,
    poller: Mutex<Option<JoinHandle<()>>>,
    /// Dropped on shutdown; disconnection wakes every blocked waiter.
    closed_tx: Mutex<Option<Sender<()>>>,
    closed_rx: Receiver<()>,
    unclaimed_rx: Receiver<Completion>,
}

impl CompletionQueue {
    /// Create the native queue and start its poller thread.
    pub fn new() -> Result<Self, Error> {
        let id = next_queue_id();
        let shared = Arc::new(Shared {
            id,
            native: EventQueue::new(),
            tags: TagRegistry::new(id),
            state: Mutex::new(QueueState::Active),
        });
        shared.tags.register(Tag::shutdown(id));

        let (unclaimed_tx, unclaimed_rx) = crossbeam_channel::unbounded();
        let (closed_tx, closed_rx) = crossbeam_channel::bounded(0);

        let poller_shared = shared.clone();
        let poller = thread::Builder::new()
            .name(format!("tagline-cq-{id}"))
            .spawn(move || poll(poller_shared, unclaimed_tx))
            .map_err(Error::Io)?;

        metrics::QUEUES_ACTIVE.increment();
        tracing::debug!(queue = id, "completion queue created");

        Ok(Self {
            shared,
            poller: Mutex::new(Some(poller)),
            closed_tx: Mutex::new(Some(closed_tx)),
            closed_rx,
            unclaimed_rx,
        })
    }

    pub fn id(&self) -> u16 {
        self.shared.id
    }

    pub fn state(&self) -> QueueState {
        *self.shared.state.lock()
    }

    /// The native queue engines post this queue's completions to.
    pub fn native(&self) -> &Arc<EventQueue> {
        &self.shared.native
    }

    /// Allocate a tag and open its waiter slot.
    pub fn new_tag(&self) -> Result<Tag, Error> {
        let state = self.shared.state.lock();
        if *state != QueueState::Active {
            return Err(Error::QueueShuttingDown);
        }
        let tag = self.shared.tags.next_tag();
        self.shared.tags.register(tag);
        drop(state);
        tracing::trace!(%tag, "tag allocated");
        Ok(tag)
    }

    /// Release a tag that was never handed to the engine.
    pub fn release_tag(&self, tag: Tag) {
        self.shared.tags.retire(tag);
    }

    /// Forget a tag whose operation the engine withdrew after it was
    /// submitted. Nothing will be posted for it again.
    pub fn withdraw_tag(&self, tag: Tag) {
        self.shared.tags.withdraw(tag);
    }

    /// Tags with an open waiter slot, excluding the reserved shutdown tag.
    pub fn outstanding_tags(&self) -> usize {
        let reserved = usize::from(self.state() != QueueState::Shutdown);
        self.shared.tags.outstanding().saturating_sub(reserved)
    }

    /// Block until `tag` completes.
    ///
    /// Events for other tags are never consumed. On timeout the tag is
    /// abandoned, so a pluck is terminal for its batch either way. If the queue
    /// starts shutting down first, the pluck fails with
    /// [`Error::QueueShuttingDown`] unless the completion had already landed.
    pub fn pluck(&self, tag: Tag, timeout: Option<Duration>) -> Result<Completion, Error> {
        let rx = self.shared.tags.receiver(tag).ok_or(Error::UnknownTag(tag))?;
        if let Ok(completion) = rx.try_recv() {
            return Ok(self.plucked(completion));
        }

        let timer = timer(timeout);
        select! {
            recv(rx) -> completion => match completion {
                Ok(completion) => Ok(self.plucked(completion)),
                Err(_) => Err(Error::UnknownTag(tag)),
            },
            recv(self.closed_rx) -> _ => match self.shared.tags.abandon(tag) {
                Some(completion) => Ok(self.plucked(completion)),
                None => {
                    tracing::debug!(%tag, "pluck interrupted by queue shutdown");
                    Err(Error::QueueShuttingDown)
                }
            },
            recv(timer) -> _ => match self.shared.tags.abandon(tag) {
                Some(completion) => Ok(self.plucked(completion)),
                None => {
                    metrics::PLUCK_TIMEOUTS.increment();
                    tracing::debug!(%tag, ?timeout, "pluck timed out");
                    Err(Error::TimedOut)
                }
            },
        }
    }

    fn plucked(&self, completion: Completion) -> Completion {
        self.shared.tags.retire(completion.tag);
        metrics::PLUCKS_COMPLETED.increment();
        tracing::trace!(tag = %completion.tag, success = completion.success, "plucked");
        completion
    }

    /// Wait for the next completion no pluck is waiting for.
    ///
    /// Buffered completions are still returned after shutdown begins; once the
    /// queue is drained this fails with [`Error::QueueShutdown`].
    pub fn next(&self, timeout: Option<Duration>) -> Result<Completion, Error> {
        let timer = timer(timeout);
        if self.state() == QueueState::Active {
            select! {
                recv(self.unclaimed_rx) -> completion => {
                    return completion.map_err(|_| Error::QueueShutdown);
                }
                recv(self.closed_rx) -> _ => {}
                recv(timer) -> _ => return Err(Error::TimedOut),
            }
        }
        select! {
            recv(self.unclaimed_rx) -> completion => completion.map_err(|_| Error::QueueShutdown),
            recv(timer) -> _ => Err(Error::TimedOut),
        }
    }

    /// Shut the queue down and wait until the native queue has drained.
    ///
    /// Pending plucks are woken. Only the first call proceeds; later ones fail
    /// with [`Error::AlreadyShuttingDown`].
    pub fn shutdown(&self) -> Result<(), Error> {
        {
            let mut state = self.shared.state.lock();
            if *state != QueueState::Active {
                return Err(Error::AlreadyShuttingDown);
            }
            *state = QueueState::ShuttingDown;
        }
        let id = self.shared.id;
        tracing::debug!(queue = id, "completion queue shutting down");

        drop(self.closed_tx.lock().take());
        self.shared.native.shutdown();

        let shutdown_tag = Tag::shutdown(id);
        let observed = match self.shared.tags.receiver(shutdown_tag) {
            Some(rx) => rx.recv().is_ok(),
            None => false,
        };
        self.shared.tags.retire(shutdown_tag);
        if !observed {
            tracing::warn!(queue = id, "shutdown completion never observed");
        }

        if let Some(poller) = self.poller.lock().take() {
            if poller.join().is_err() {
                tracing::warn!(queue = id, "completion queue poller panicked");
            }
        }

        let stale = self.shared.tags.clear_abandoned();
        if stale > 0 {
            tracing::debug!(queue = id, stale, "dropped abandoned tags at shutdown");
        }

        *self.shared.state.lock() = QueueState::Shutdown;
        metrics::QUEUES_ACTIVE.decrement();
        tracing::debug!(queue = id, "completion queue shut down");
        Ok(())
    }
}

impl std::fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        if self.state() == QueueState::Active {
            let _ = self.shutdown();
        }
    }
}

/// Timer channel for `timeout`; never fires when unbounded or when the
/// timeout is past what `Instant` can represent.
fn timer(timeout: Option<Duration>) -> Receiver<Instant> {
    match timeout.and_then(|t| Instant::now().checked_add(t)) {
        Some(at) => crossbeam_channel::at(at),
        None => crossbeam_channel::never(),
    }
}

/// Poller loop: route native events until the queue reports shutdown.
fn poll(shared: Arc<Shared>, unclaimed: Sender<Completion>) {
    loop {
        match shared.native.next(None) {
            RawEvent::Complete(completion) => {
                metrics::QUEUE_EVENTS.increment();
                tracing::trace!(tag = %completion.tag, success = completion.success, "event");
                if let Some(completion) = shared.tags.complete(completion) {
                    metrics::QUEUE_UNCLAIMED.increment();
                    let _ = unclaimed.send(completion);
                }
            }
            RawEvent::Timeout => {}
            RawEvent::Shutdown => {
                shared.tags.complete(Completion {
                    tag: Tag::shutdown(shared.id),
                    success: true,
                });
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pluck_is_selective() {
        let cq = CompletionQueue::new().unwrap();
        let a = cq.new_tag().unwrap();
        let b = cq.new_tag().unwrap();

        cq.native().post(b, true);
        cq.native().post(a, false);

        assert_eq!(cq.pluck(a, None).unwrap(), Completion { tag: a, success: false });
        assert_eq!(cq.pluck(b, None).unwrap(), Completion { tag: b, success: true });
        assert_eq!(cq.outstanding_tags(), 0);
    }

    #[test]
    fn concurrent_plucks_each_get_their_own() {
        let cq = CompletionQueue::new().unwrap();
        let tags: Vec<Tag> = (0..16).map(|_| cq.new_tag().unwrap()).collect();

        thread::scope(|s| {
            let handles: Vec<_> = tags
                .iter()
                .map(|&tag| {
                    let cq = &cq;
                    s.spawn(move || cq.pluck(tag, Some(Duration::from_secs(5))).unwrap())
                })
                .collect();
            for &tag in tags.iter().rev() {
                cq.native().post(tag, true);
            }
            for (handle, &tag) in handles.into_iter().zip(&tags) {
                assert_eq!(handle.join().unwrap().tag, tag);
            }
        });
    }

    #[test]
    fn pluck_timeout_abandons_tag() {
        let cq = CompletionQueue::new().unwrap();
        let tag = cq.new_tag().unwrap();

        let start = Instant::now();
        let err = cq.pluck(tag, Some(Duration::from_millis(20))).unwrap_err();
        assert!(matches!(err, Error::TimedOut));
        assert!(start.elapsed() >= Duration::from_millis(20));

        // The late completion is discarded, not surfaced through next().
        cq.native().post(tag, true);
        let err = cq.next(Some(Duration::from_millis(50))).unwrap_err();
        assert!(matches!(err, Error::TimedOut));
        assert!(matches!(cq.pluck(tag, None), Err(Error::UnknownTag(t)) if t == tag));
    }

    #[test]
    fn oversized_timeout_waits_unbounded() {
        let cq = CompletionQueue::new().unwrap();
        let tag = cq.new_tag().unwrap();
        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(20));
                cq.native().post(tag, true);
            });
            assert!(cq.pluck(tag, Some(Duration::MAX)).unwrap().success);
        });
    }

    #[test]
    fn unclaimed_events_go_to_next() {
        let cq = CompletionQueue::new().unwrap();
        let foreign = Tag::encode(cq.id(), 999);
        cq.native().post(foreign, true);
        assert_eq!(
            cq.next(Some(Duration::from_secs(5))).unwrap(),
            Completion {
                tag: foreign,
                success: true
            }
        );
    }

    #[test]
    fn shutdown_wakes_pluckers() {
        let cq = CompletionQueue::new().unwrap();
        let tag = cq.new_tag().unwrap();

        thread::scope(|s| {
            let plucker = s.spawn(|| cq.pluck(tag, None));
            thread::sleep(Duration::from_millis(20));
            cq.shutdown().unwrap();
            assert!(matches!(plucker.join().unwrap(), Err(Error::QueueShuttingDown)));
        });
        assert_eq!(cq.state(), QueueState::Shutdown);
        assert!(matches!(cq.new_tag(), Err(Error::QueueShuttingDown)));
    }

    #[test]
    fn event_before_shutdown_is_returned() {
        let cq = CompletionQueue::new().unwrap();
        let tag = cq.new_tag().unwrap();
        cq.native().post(tag, true);
        cq.shutdown().unwrap();
        assert_eq!(cq.pluck(tag, None).unwrap(), Completion { tag, success: true });
    }

    #[test]
    fn next_drains_then_reports_shutdown() {
        let cq = CompletionQueue::new().unwrap();
        let foreign = Tag::encode(cq.id(), 77);
        cq.native().post(foreign, true);
        cq.shutdown().unwrap();
        assert_eq!(cq.next(None).unwrap().tag, foreign);
        assert!(matches!(cq.next(None), Err(Error::QueueShutdown)));
    }

    #[test]
    fn withdrawn_tag_is_forgotten() {
        let cq = CompletionQueue::new().unwrap();
        let tag = cq.new_tag().unwrap();
        assert!(matches!(cq.pluck(tag, Some(Duration::from_millis(10))), Err(Error::TimedOut)));
        assert_eq!(cq.shared.tags.abandoned(), 1);

        cq.withdraw_tag(tag);
        assert_eq!(cq.shared.tags.abandoned(), 0);
        assert_eq!(cq.outstanding_tags(), 0);
    }

    #[test]
    fn shutdown_clears_abandoned_tags() {
        let cq = CompletionQueue::new().unwrap();
        for _ in 0..4 {
            let tag = cq.new_tag().unwrap();
            let _ = cq.pluck(tag, Some(Duration::from_millis(1)));
        }
        assert_eq!(cq.shared.tags.abandoned(), 4);

        cq.shutdown().unwrap();
        assert_eq!(cq.shared.tags.abandoned(), 0);
    }

    #[test]
    fn shutdown_is_guarded() {
        let cq = CompletionQueue::new().unwrap();
        cq.shutdown().unwrap();
        assert!(matches!(cq.shutdown(), Err(Error::AlreadyShuttingDown)));
    }

    #[test]
    fn queue_ids_are_distinct() {
        let a = CompletionQueue::new().unwrap();
        let b = CompletionQueue::new().unwrap();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.id(), 0);
    }
}
