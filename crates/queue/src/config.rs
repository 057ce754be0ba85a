use std::time::Duration;

/// Retry and worker settings for a [`crate::WorkQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Used in logs and as the `queue` metrics label.
    pub name: String,
    /// Total callback attempts per failure streak before the item is dropped.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub workers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "status".to_string(),
            max_attempts: 5,
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1000),
            workers: 1,
        }
    }
}

impl QueueConfig {
    pub fn named(name: impl Into<String>) -> Self { Self { name: name.into(), ..Self::default() } }

    /// Defaults overridden by `KSTATUS_QUEUE_*` environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        let max_attempts = std::env::var("KSTATUS_QUEUE_MAX_ATTEMPTS").ok().and_then(|s| s.parse().ok()).unwrap_or(d.max_attempts);
        let backoff_base = std::env::var("KSTATUS_QUEUE_BACKOFF_BASE_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(d.backoff_base);
        let backoff_max = std::env::var("KSTATUS_QUEUE_BACKOFF_MAX_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(d.backoff_max);
        let workers = std::env::var("KSTATUS_QUEUE_WORKERS").ok().and_then(|s| s.parse().ok()).unwrap_or(d.workers);
        Self { name: d.name, max_attempts, backoff_base, backoff_max, workers }
    }

    pub fn with_max_attempts(mut self, n: u32) -> Self { self.max_attempts = n; self }
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self { self.backoff_base = base; self.backoff_max = max; self }
    pub fn with_workers(mut self, n: usize) -> Self { self.workers = n; self }

    /// Delay before retrying after the `failures`-th consecutive failure (1-based).
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.backoff_base.saturating_mul(1u32 << exp).min(self.backoff_max)
    }
}
