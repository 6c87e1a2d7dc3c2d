//! Configuration for the sync client.

use mdir_core::JournalConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Default age after which an unanswered command may be re-issued.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

/// Default upper bound on how long the writer idles between passes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Identifier of the folder at the top of every tree.
pub const DEFAULT_ROOT_DIR_ID: &str = "root";

/// Configuration for a sync client.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Local mirror root.
    pub root: PathBuf,
    /// User the client acts for.
    pub user: String,
    /// Durable identifier of the top folder.
    pub root_dir_id: String,
    /// Age after which an unanswered command times out.
    pub command_timeout: Duration,
    /// Fallback interval between writer passes.
    pub poll_interval: Duration,
    /// Reconnection policy.
    pub retry: RetryConfig,
    /// Journal options for mirrored folders.
    pub journal: JournalConfig,
}

impl SyncConfig {
    /// Creates a configuration for `user` mirroring into `root`.
    pub fn new(root: impl Into<PathBuf>, user: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            user: user.into(),
            root_dir_id: DEFAULT_ROOT_DIR_ID.to_string(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            retry: RetryConfig::default(),
            journal: JournalConfig::default(),
        }
    }

    /// Sets the top folder identifier.
    #[must_use]
    pub fn with_root_dir_id(mut self, dir_id: impl Into<String>) -> Self {
        self.root_dir_id = dir_id.into();
        self
    }

    /// Sets the command timeout.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Sets the writer poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the reconnection policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the journal options.
    #[must_use]
    pub fn with_journal(mut self, journal: JournalConfig) -> Self {
        self.journal = journal;
        self
    }
}

/// How the client backs off between failed connection attempts.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Consecutive failed connection attempts before giving up (0 = never).
    pub max_attempts: u32,
    /// Wait after the first failure.
    pub initial_delay: Duration,
    /// Upper bound on any single wait.
    pub max_delay: Duration,
    /// Growth factor applied per further failure.
    pub backoff_multiplier: f64,
    /// Stretch each wait by up to a quarter so clients do not reconnect in lockstep.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a configuration giving up after `max_attempts` failures.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Retries forever.
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Sets the wait after the first failure.
    #[must_use]
    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    /// Caps a single wait.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Sets the growth factor.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, factor: f64) -> Self {
        self.backoff_multiplier = factor;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Returns true if another attempt is allowed after `failures` failures.
    pub fn should_retry(&self, failures: u32) -> bool {
        self.max_attempts == 0 || failures < self.max_attempts
    }

    /// Wait before reconnecting after `failures` consecutive failures.
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        let Some(steps) = failures.checked_sub(1) else {
            return Duration::ZERO;
        };
        let cap = self.max_delay.as_secs_f64();
        let grown = self.initial_delay.as_secs_f64()
            * self
                .backoff_multiplier
                .powi(i32::try_from(steps).unwrap_or(i32::MAX));
        let wait = grown.min(cap);
        let stretch = if self.add_jitter {
            1.0 + 0.25 * clock_fraction()
        } else {
            1.0
        };
        Duration::from_secs_f64(wait * stretch)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// A fraction in `[0, 1)` read off the clock's sub-second nanos.
fn clock_fraction() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.subsec_nanos())
        .unwrap_or(0);
    f64::from(nanos % 1024) / 1024.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new("/tmp/mirror", "alice")
            .with_root_dir_id("top")
            .with_command_timeout(Duration::from_secs(5))
            .with_poll_interval(Duration::from_millis(50));

        assert_eq!(config.user, "alice");
        assert_eq!(config.root_dir_id, "top");
        assert_eq!(config.command_timeout, Duration::from_secs(5));
        assert_eq!(config.poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn defaults() {
        let config = SyncConfig::new("/tmp/mirror", "alice");
        assert_eq!(config.root_dir_id, "root");
        assert_eq!(config.command_timeout, Duration::from_secs(15));
        assert!(config.retry.should_retry(1_000));
    }

    #[test]
    fn bounded_retries() {
        let config = RetryConfig::new(3);
        assert!(config.should_retry(2));
        assert!(!config.should_retry(3));
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let retry = RetryConfig::unlimited()
            .with_initial_delay(Duration::from_millis(125))
            .with_max_delay(Duration::from_millis(750))
            .with_jitter(false);

        let waits: Vec<_> = (0..6).map(|n| retry.delay_for_attempt(n)).collect();
        assert_eq!(
            waits,
            [0, 125, 250, 500, 750, 750].map(Duration::from_millis).to_vec()
        );
    }

    #[test]
    fn jitter_only_lengthens() {
        let retry = RetryConfig::unlimited().with_initial_delay(Duration::from_millis(400));
        for _ in 0..20 {
            let wait = retry.delay_for_attempt(1);
            assert!(wait >= Duration::from_millis(400));
            assert!(wait <= Duration::from_millis(500));
        }
    }
}
