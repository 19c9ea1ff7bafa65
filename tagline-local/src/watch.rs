//! Connectivity watches.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tagline::native::{ConnectivityState, EventQueue};
use tagline::Tag;

use crate::alarm::Expire;

/// Resolve a channel's state from what the engine knows about its target.
pub(crate) fn resolve(shut_down: bool, ready: bool, attempted: bool) -> ConnectivityState {
    if shut_down {
        ConnectivityState::Shutdown
    } else if ready {
        ConnectivityState::Ready
    } else if attempted {
        ConnectivityState::TransientFailure
    } else {
        ConnectivityState::Idle
    }
}

/// An outstanding `watch_connectivity_state`. Posts its tag exactly once.
pub(crate) struct Watch {
    pub(crate) target: String,
    pub(crate) last: ConnectivityState,
    /// Shared with the channel that created the watch.
    pub(crate) attempted: Arc<AtomicBool>,
    queue: Arc<EventQueue>,
    tag: Tag,
    fired: AtomicBool,
}

impl Watch {
    pub(crate) fn new(
        target: String,
        last: ConnectivityState,
        attempted: Arc<AtomicBool>,
        queue: Arc<EventQueue>,
        tag: Tag,
    ) -> Self {
        Self {
            target,
            last,
            attempted,
            queue,
            tag,
            fired: AtomicBool::new(false),
        }
    }

    /// Post the tag unless already posted. Returns whether this call posted it.
    pub(crate) fn fire(&self, changed: bool) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        tracing::trace!(tag = %self.tag, target_addr = %self.target, changed, "watch fired");
        self.queue.post(self.tag, changed);
        true
    }

    pub(crate) fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Fire if `current` differs from the state the watcher last saw.
    pub(crate) fn observe(&self, current: ConnectivityState) -> bool {
        current != self.last && self.fire(true)
    }
}

impl Expire for Watch {
    fn expire(&self) {
        self.fire(false);
    }
}
