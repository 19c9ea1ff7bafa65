//! Deadline alarm thread.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

/// Something the alarm can time out.
pub(crate) trait Expire: Send + Sync {
    fn expire(&self);
}

struct Entry {
    at: Instant,
    seq: u64,
    target: Weak<dyn Expire>,
}

// Min-heap on (at, seq).
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.at, other.seq).cmp(&(self.at, self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Entry {}

/// One thread that expires calls and connectivity watches at their deadline.
///
/// Targets are held weakly; one released before its deadline is skipped.
/// The thread exits when the alarm is shut down.
pub(crate) struct Alarm {
    tx: Mutex<Option<Sender<(Instant, Weak<dyn Expire>)>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Alarm {
    pub(crate) fn start() -> std::io::Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = thread::Builder::new()
            .name("tagline-alarm".to_string())
            .spawn(move || run(rx))?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Expire `target` at `at`. Ignored after shutdown.
    pub(crate) fn schedule(&self, at: Instant, target: Weak<dyn Expire>) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send((at, target));
        }
    }

    pub(crate) fn shutdown(&self) {
        drop(self.tx.lock().take());
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                tracing::warn!("alarm thread panicked");
            }
        }
    }
}

fn run(rx: Receiver<(Instant, Weak<dyn Expire>)>) {
    let mut heap: BinaryHeap<Entry> = BinaryHeap::new();
    let mut seq = 0u64;
    loop {
        let now = Instant::now();
        while heap.peek().is_some_and(|e| e.at <= now) {
            if let Some(target) = heap.pop().and_then(|e| e.target.upgrade()) {
                target.expire();
            }
        }
        let received = match heap.peek() {
            Some(next) => rx.recv_deadline(next.at),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok((at, target)) => {
                seq += 1;
                heap.push(Entry { at, seq, target });
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tagline::Deadline;

    use crate::rpc::Rpc;

    #[test]
    fn expires_in_deadline_order() {
        let alarm = Alarm::start().unwrap();
        let late = Rpc::new("/svc/late", "localhost", Deadline::infinite());
        let early = Rpc::new("/svc/early", "localhost", Deadline::infinite());
        let late_target: Weak<dyn Expire> = Arc::downgrade(&late) as Weak<Rpc>;
        let early_target: Weak<dyn Expire> = Arc::downgrade(&early) as Weak<Rpc>;
        let now = Instant::now();
        alarm.schedule(now + Duration::from_millis(300), late_target);
        alarm.schedule(now + Duration::from_millis(20), early_target);

        thread::sleep(Duration::from_millis(150));
        assert!(early.is_finished());
        assert!(!late.is_finished());
        alarm.shutdown();
    }

    #[test]
    fn released_calls_are_skipped() {
        let alarm = Alarm::start().unwrap();
        let rpc = Rpc::new("/svc/gone", "localhost", Deadline::infinite());
        let target: Weak<dyn Expire> = Arc::downgrade(&rpc) as Weak<Rpc>;
        alarm.schedule(Instant::now(), target);
        drop(rpc);
        thread::sleep(Duration::from_millis(20));
        alarm.shutdown();
    }
}
