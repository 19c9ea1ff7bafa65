//! Correlation tags and the per-queue waiter table.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use crate::native::Completion;

/// Opaque correlation token linking a submitted batch to its completion.
///
/// Layout (64-bit):
/// ```text
/// Bits 63..48: queue id (16 bits)
/// Bits 47..0:  sequence (48 bits, 0 reserved for queue shutdown)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(u64);

impl Tag {
    const QUEUE_SHIFT: u64 = 48;
    const SEQ_MASK: u64 = (1 << Self::QUEUE_SHIFT) - 1;

    /// Encode a queue id and sequence number.
    #[inline]
    pub const fn encode(queue_id: u16, seq: u64) -> Self {
        Tag(((queue_id as u64) << Self::QUEUE_SHIFT) | (seq & Self::SEQ_MASK))
    }

    /// The reserved tag carrying a queue's own shutdown completion.
    #[inline]
    pub const fn shutdown(queue_id: u16) -> Self {
        Self::encode(queue_id, 0)
    }

    #[inline]
    pub fn queue_id(self) -> u16 {
        (self.0 >> Self::QUEUE_SHIFT) as u16
    }

    #[inline]
    pub fn seq(self) -> u64 {
        self.0 & Self::SEQ_MASK
    }

    #[inline]
    pub fn is_shutdown(self) -> bool {
        self.seq() == 0
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Tag(raw)
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.queue_id(), self.seq())
    }
}

struct Waiter {
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
}

#[derive(Default)]
struct Waiters {
    slots: HashMap<Tag, Waiter>,
    /// Tags whose pluck gave up; their late completion is discarded.
    abandoned: HashSet<Tag>,
}

/// Tag allocator plus the table of one-shot waiter slots for one queue.
///
/// Allocation is a single atomic increment and never touches the table lock,
/// so any number of threads can mint tags while others are routing events.
pub(crate) struct TagRegistry {
    queue_id: u16,
    next: AtomicU64,
    waiters: Mutex<Waiters>,
}

impl TagRegistry {
    pub(crate) fn new(queue_id: u16) -> Self {
        Self {
            queue_id,
            next: AtomicU64::new(1),
            waiters: Mutex::new(Waiters::default()),
        }
    }

    /// Mint a fresh tag. Never returns the reserved shutdown tag.
    pub(crate) fn next_tag(&self) -> Tag {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        debug_assert!(seq <= Tag::SEQ_MASK, "tag sequence exhausted");
        Tag::encode(self.queue_id, seq)
    }

    /// Open a one-shot waiter slot for `tag`.
    pub(crate) fn register(&self, tag: Tag) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let prev = self.waiters.lock().slots.insert(tag, Waiter { tx, rx });
        debug_assert!(prev.is_none(), "tag {tag} registered twice");
    }

    /// Receiving end of the slot for `tag`, if it is registered.
    pub(crate) fn receiver(&self, tag: Tag) -> Option<Receiver<Completion>> {
        self.waiters.lock().slots.get(&tag).map(|w| w.rx.clone())
    }

    /// Route a completion to its waiter.
    ///
    /// Returns the completion back when no waiter owns the tag so the caller
    /// can buffer it. Completions for abandoned tags are swallowed.
    pub(crate) fn complete(&self, completion: Completion) -> Option<Completion> {
        let mut waiters = self.waiters.lock();
        if waiters.abandoned.remove(&completion.tag) {
            tracing::debug!(tag = %completion.tag, "discarding completion for abandoned tag");
            return None;
        }
        match waiters.slots.get(&completion.tag) {
            Some(waiter) => {
                match waiter.tx.try_send(completion) {
                    Ok(()) => {}
                    Err(TrySendError::Full(c)) => {
                        tracing::warn!(tag = %c.tag, "duplicate completion for tag dropped");
                    }
                    Err(TrySendError::Disconnected(_)) => unreachable!("registry holds both ends"),
                }
                None
            }
            None => Some(completion),
        }
    }

    /// Retire a tag after its completion has been consumed, or when it was
    /// never submitted to the engine.
    pub(crate) fn retire(&self, tag: Tag) {
        self.waiters.lock().slots.remove(&tag);
    }

    /// Give up on `tag`. If its completion already landed it is handed back,
    /// otherwise the tag is remembered so the late completion is discarded.
    pub(crate) fn abandon(&self, tag: Tag) -> Option<Completion> {
        let mut waiters = self.waiters.lock();
        let waiter = waiters.slots.remove(&tag)?;
        match waiter.rx.try_recv() {
            Ok(c) => Some(c),
            Err(_) => {
                waiters.abandoned.insert(tag);
                None
            }
        }
    }

    /// Forget `tag` entirely. Only for operations the engine withdrew, so no
    /// completion will ever arrive for it.
    pub(crate) fn withdraw(&self, tag: Tag) {
        let mut waiters = self.waiters.lock();
        waiters.slots.remove(&tag);
        waiters.abandoned.remove(&tag);
    }

    /// Drop every abandoned-tag record. Called once nothing can post to the
    /// queue anymore. Returns how many were dropped.
    pub(crate) fn clear_abandoned(&self) -> usize {
        let mut waiters = self.waiters.lock();
        let n = waiters.abandoned.len();
        waiters.abandoned.clear();
        n
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.waiters.lock().slots.len()
    }

    #[cfg(test)]
    pub(crate) fn abandoned(&self) -> usize {
        self.waiters.lock().abandoned.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn encode_round_trip() {
        let tag = Tag::encode(0xBEEF, 0x0000_1234_5678_9ABC);
        assert_eq!(tag.queue_id(), 0xBEEF);
        assert_eq!(tag.seq(), 0x0000_1234_5678_9ABC);
        assert!(!tag.is_shutdown());
        assert_eq!(Tag::from_raw(tag.raw()), tag);
    }

    #[test]
    fn sequence_is_masked() {
        let tag = Tag::encode(1, u64::MAX);
        assert_eq!(tag.queue_id(), 1);
        assert_eq!(tag.seq(), (1 << 48) - 1);
    }

    #[test]
    fn shutdown_tag_is_reserved() {
        let registry = TagRegistry::new(3);
        let shutdown = Tag::shutdown(3);
        assert!(shutdown.is_shutdown());
        for _ in 0..1000 {
            assert_ne!(registry.next_tag(), shutdown);
        }
    }

    #[test]
    fn concurrent_tags_are_unique() {
        let registry = Arc::new(TagRegistry::new(7));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    (0..1000).map(|_| registry.next_tag()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for tag in h.join().unwrap() {
                assert_eq!(tag.queue_id(), 7);
                assert!(seen.insert(tag), "duplicate tag {tag}");
            }
        }
        assert_eq!(seen.len(), 8000);
    }

    #[test]
    fn routes_to_registered_waiter() {
        let registry = TagRegistry::new(1);
        let tag = registry.next_tag();
        registry.register(tag);
        let rx = registry.receiver(tag).unwrap();

        assert!(registry.complete(Completion { tag, success: true }).is_none());
        assert_eq!(rx.try_recv().unwrap(), Completion { tag, success: true });

        registry.retire(tag);
        assert!(registry.receiver(tag).is_none());
        assert_eq!(registry.outstanding(), 0);
    }

    #[test]
    fn unregistered_completion_is_returned() {
        let registry = TagRegistry::new(1);
        let tag = registry.next_tag();
        let c = Completion { tag, success: false };
        assert_eq!(registry.complete(c), Some(c));
    }

    #[test]
    fn abandoned_tag_swallows_late_completion() {
        let registry = TagRegistry::new(1);
        let tag = registry.next_tag();
        registry.register(tag);

        assert!(registry.abandon(tag).is_none());
        assert!(registry.complete(Completion { tag, success: true }).is_none());
        // Only swallowed once.
        assert!(registry.complete(Completion { tag, success: true }).is_some());
    }

    #[test]
    fn abandon_after_arrival_hands_back_completion() {
        let registry = TagRegistry::new(1);
        let tag = registry.next_tag();
        registry.register(tag);
        registry.complete(Completion { tag, success: true });
        assert_eq!(registry.abandon(tag), Some(Completion { tag, success: true }));
        assert_eq!(registry.outstanding(), 0);
    }

    #[test]
    fn withdrawn_tag_leaves_no_record() {
        let registry = TagRegistry::new(1);
        let tag = registry.next_tag();
        registry.register(tag);
        assert!(registry.abandon(tag).is_none());
        assert_eq!(registry.abandoned(), 1);

        registry.withdraw(tag);
        assert_eq!(registry.abandoned(), 0);
        assert_eq!(registry.outstanding(), 0);
    }

    #[test]
    fn clear_abandoned_drops_stale_records() {
        let registry = TagRegistry::new(1);
        for _ in 0..3 {
            let tag = registry.next_tag();
            registry.register(tag);
            registry.abandon(tag);
        }
        assert_eq!(registry.clear_abandoned(), 3);
        assert_eq!(registry.abandoned(), 0);
    }
}
