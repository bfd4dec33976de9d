use std::time::Duration;

/// Default prefix for worker thread names.
pub const DEFAULT_THREAD_NAME: &str = "tgs-worker";

/// Largest accepted [`BackoffConfig::spin_limit`]: the last spinning step
/// busy-waits `2^16` iterations.
pub const MAX_SPIN_LIMIT: u32 = 16;

/// Construction-time settings of a [`Scheduler`](crate::scheduler::Scheduler).
///
/// ```
/// use tgs::config::Config;
///
/// let config = Config::new(1024).worker_threads(3).thread_name("render");
/// assert_eq!(config.capacity, 1024);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Config {
    /// Number of task slots, which bounds the number of concurrently live
    /// tasks. Must be a power of two and at least 2.
    pub capacity: usize,
    /// Number of pool threads. `None` means hardware parallelism minus one.
    /// Zero is allowed: `wait` then executes every task itself.
    pub worker_threads: Option<usize>,
    /// Worker threads are named `"{thread_name}-{n}"`.
    pub thread_name: String,
    /// Idle behaviour of workers and of waiting threads.
    pub backoff: BackoffConfig,
}

impl Config {
    /// Settings with the given capacity and defaults for everything else.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            worker_threads: None,
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
            backoff: BackoffConfig::default(),
        }
    }

    /// Sets the number of pool threads.
    #[must_use]
    pub fn worker_threads(mut self, val: usize) -> Self {
        self.worker_threads = Some(val);
        self
    }

    /// Sets the worker thread name prefix.
    #[must_use]
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        self.thread_name = val.into();
        self
    }

    /// Replaces the idle backoff settings.
    #[must_use]
    pub fn backoff(mut self, val: BackoffConfig) -> Self {
        self.backoff = val;
        self
    }
}

/// How an idle thread escalates while it finds nothing to run.
///
/// Step `n` (counting from zero) spins `2^n` times while `n <= spin_limit`,
/// yields the processor while `n <= yield_limit`, and sleeps for `sleep`
/// afterwards. Any successful dequeue resets the ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Last step that busy-spins. At most [`MAX_SPIN_LIMIT`].
    pub spin_limit: u32,
    /// Last step that yields; must not be lower than `spin_limit`.
    pub yield_limit: u32,
    /// Sleep duration once spinning and yielding are exhausted.
    pub sleep: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            spin_limit: 6,
            yield_limit: 10,
            sleep: Duration::from_micros(100),
        }
    }
}
