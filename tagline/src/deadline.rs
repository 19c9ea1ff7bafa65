use std::time::{Duration, Instant};

/// Absolute point in time bounding a call, or no bound at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Deadline {
    At(Instant),
    Infinite,
}

impl Deadline {
    /// Deadline `d` from now.
    pub fn after(d: Duration) -> Self {
        match Instant::now().checked_add(d) {
            Some(at) => Deadline::At(at),
            None => Deadline::Infinite,
        }
    }

    pub fn from_seconds(secs: u64) -> Self {
        Self::after(Duration::from_secs(secs))
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::after(Duration::from_millis(millis))
    }

    pub fn infinite() -> Self {
        Deadline::Infinite
    }

    pub fn instant(self) -> Option<Instant> {
        match self {
            Deadline::At(at) => Some(at),
            Deadline::Infinite => None,
        }
    }

    /// Time left before the deadline; `None` when unbounded. Saturates at zero.
    pub fn remaining(self) -> Option<Duration> {
        self.instant()
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(self) -> bool {
        matches!(self, Deadline::At(at) if at <= Instant::now())
    }
}

impl From<Duration> for Deadline {
    fn from(d: Duration) -> Self {
        Self::after(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infinite_never_expires() {
        let d = Deadline::infinite();
        assert!(!d.is_expired());
        assert_eq!(d.remaining(), None);
        assert_eq!(d.instant(), None);
    }

    #[test]
    fn elapsed_deadline() {
        let d = Deadline::At(Instant::now() - Duration::from_millis(5));
        assert!(d.is_expired());
        assert_eq!(d.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn ordering_puts_infinite_last() {
        let soon = Deadline::from_millis(10);
        let later = Deadline::from_seconds(10);
        assert!(soon < later);
        assert!(later < Deadline::Infinite);
    }
}
