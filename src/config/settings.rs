use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;

/// Timing and paging knobs of the sync engine and the filesystem adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// How long the kernel may cache attributes and lookups
    time_to_live: Duration,
    /// Longest wait between two polls of the change feed
    poll_interval: Duration,
    /// Granularity at which an idle engine checks for shutdown
    idle_step: Duration,
    /// Entries per listing request, remote and local
    page_size: u32,
    /// Attempts for a remote call failing with a transient error
    retry_attempts: u32,
    /// Delay before the first retry, doubled for every further one
    retry_base_delay: Duration,
    /// Gitignore-style file with remote paths to skip
    ignore_file: Option<PathBuf>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            time_to_live: Duration::from_secs(2),
            poll_interval: Duration::from_secs(60),
            idle_step: Duration::from_secs(1),
            page_size: 100,
            retry_attempts: 4,
            retry_base_delay: Duration::from_millis(500),
            ignore_file: None,
        }
    }
}

impl SyncSettings {
    pub fn new(time_to_live: Duration, poll_interval: Duration) -> Self {
        Self {
            time_to_live,
            poll_interval,
            ..Self::default()
        }
    }
    pub fn with_idle_step(mut self, idle_step: Duration) -> Self {
        self.idle_step = idle_step;
        self
    }
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }
    pub fn with_retry(mut self, attempts: u32, base_delay: Duration) -> Self {
        self.retry_attempts = attempts.max(1);
        self.retry_base_delay = base_delay;
        self
    }
    pub fn with_ignore_file(mut self, ignore_file: Option<PathBuf>) -> Self {
        self.ignore_file = ignore_file;
        self
    }
}

// region getters
impl SyncSettings {
    pub fn time_to_live(&self) -> Duration {
        self.time_to_live
    }
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
    pub fn idle_step(&self) -> Duration {
        self.idle_step.min(self.poll_interval).max(Duration::from_millis(1))
    }
    pub fn page_size(&self) -> u32 {
        self.page_size
    }
    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts
    }
    pub fn retry_base_delay(&self) -> Duration {
        self.retry_base_delay
    }
    pub fn ignore_file(&self) -> Option<&PathBuf> {
        self.ignore_file.as_ref()
    }
}
// endregion

impl Display for SyncSettings {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SyncSettings {{ ttl: {}s, poll: {}s, page_size: {}, retries: {} }}",
            self.time_to_live.as_secs(),
            self.poll_interval.as_secs(),
            self.page_size,
            self.retry_attempts
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_step_never_exceeds_the_poll_interval() {
        let settings = SyncSettings::new(Duration::from_secs(1), Duration::from_millis(300))
            .with_idle_step(Duration::from_secs(5));
        assert_eq!(Duration::from_millis(300), settings.idle_step());
        let settings = SyncSettings::default().with_idle_step(Duration::ZERO);
        assert_eq!(Duration::from_millis(1), settings.idle_step());
    }
}
