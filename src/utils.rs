use crate::{
    config::BackoffConfig,
    sync::{hint, thread},
};
use std::num::NonZeroUsize;

/// Worker count used when none is configured: one thread per hardware
/// thread, minus the one driving the graph.
pub(crate) fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map_or(1, NonZeroUsize::get)
        .saturating_sub(1)
}

/// Escalating idle backoff: exponential spinning, then yielding, then short
/// bounded sleeps.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    step: u32,
    config: BackoffConfig,
}

impl Backoff {
    pub(crate) const fn new(config: BackoffConfig) -> Self {
        Self { step: 0, config }
    }

    /// Waits a little before the caller polls again. Each call without an
    /// intervening [`Backoff::reset`] waits at least as long as the last.
    pub(crate) fn snooze(&mut self) {
        let BackoffConfig {
            spin_limit,
            yield_limit,
            sleep,
        } = self.config;
        if self.step <= spin_limit {
            for _ in 0..1_u32 << self.step.min(31) {
                hint::spin_loop();
            }
        } else if self.step <= yield_limit {
            thread::yield_now();
        } else {
            thread::sleep(sleep);
        }
        if self.step <= yield_limit {
            self.step += 1;
        }
    }

    /// True once the backoff has escalated to sleeping.
    pub(crate) fn is_sleeping(&self) -> bool {
        self.step > self.config.yield_limit
    }

    pub(crate) fn reset(&mut self) {
        self.step = 0;
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn escalates_to_sleep_and_resets() {
        let mut backoff = Backoff::new(BackoffConfig {
            spin_limit: 2,
            yield_limit: 4,
            sleep: Duration::from_micros(1),
        });
        for _ in 0..5 {
            assert!(!backoff.is_sleeping());
            backoff.snooze();
        }
        assert!(backoff.is_sleeping());
        backoff.snooze();
        assert!(backoff.is_sleeping());
        backoff.reset();
        assert!(!backoff.is_sleeping());
    }
}
