//! Single-fire latch for the stop-and-flush sequence at exit.

use std::sync::atomic::{AtomicBool, Ordering};

/// Natural exit, explicit exit, SIGINT and SIGTERM all race for this; only
/// the first caller of [`ExitGuard::try_fire`] runs the flush.
#[derive(Debug, Default)]
pub struct ExitGuard {
    fired: AtomicBool,
}

impl ExitGuard {
    #[must_use]
    pub const fn new() -> Self {
        Self { fired: AtomicBool::new(false) }
    }

    /// Returns `true` exactly once over the guard's lifetime.
    pub fn try_fire(&self) -> bool {
        self.fired.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    #[must_use]
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_fires_once() {
        let guard = ExitGuard::new();
        assert!(!guard.has_fired());
        assert!(guard.try_fire());
        assert!(!guard.try_fire());
        assert!(guard.has_fired());
    }

    #[test]
    fn test_fires_once_across_threads() {
        let guard = Arc::new(ExitGuard::new());
        let winners = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..16)
            .map(|_| {
                let guard = Arc::clone(&guard);
                let winners = Arc::clone(&winners);
                std::thread::spawn(move || {
                    if guard.try_fire() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }
}
