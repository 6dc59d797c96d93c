//! Configuration Module - Runtime Tuning Parameters
//!
//! Manages the parameters of the reference counting runtime: which
//! accounting mode is active, how the thread registry is sharded, and when
//! counters are promoted to immortal.

use std::str::FromStr;

/// Largest accepted promotion threshold (half the local counter range)
pub const MAX_PROMOTION_THRESHOLD: u32 = u32::MAX / 2;

/// Default promotion threshold
pub const DEFAULT_PROMOTION_THRESHOLD: u32 = 1 << 30;

/// Default number of thread buckets
pub const DEFAULT_BUCKET_COUNT: usize = 257;

/// Reference accounting mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefcountMode {
    /// Owner thread counts locally, other threads go through the shared field
    Biased,
    /// One plain count per object, every operation takes the runtime lock
    SingleThreaded,
}

impl FromStr for RefcountMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "biased" | "brc" => Ok(RefcountMode::Biased),
            "single" | "single-threaded" | "gil" => Ok(RefcountMode::SingleThreaded),
            other => Err(ConfigError::InvalidMode(other.to_string())),
        }
    }
}

/// Main configuration for the reference counting runtime
///
/// # Examples
///
/// ```rust
/// use brc::{RefcountMode, RuntimeConfig};
///
/// // Use default configuration
/// let config = RuntimeConfig::default();
///
/// // Promote early, useful when exercising overflow paths
/// let config = RuntimeConfig {
///     promotion_threshold: 1_000,
///     mode: RefcountMode::Biased,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Accounting mode
    ///
    /// Default: Biased
    pub mode: RefcountMode,

    /// Number of thread buckets in the registry
    ///
    /// Threads hash into buckets by identity. Must be prime so that
    /// sequential identities spread evenly.
    ///
    /// Default: 257
    pub bucket_count: usize,

    /// Count at which an object is promoted to immortal
    ///
    /// A retain that would push the local count (or the shared count) past
    /// this value promotes the object instead.
    ///
    /// Default: 2^30
    pub promotion_threshold: u32,

    /// Collect per-thread counters
    ///
    /// Default: true
    pub stats_enabled: bool,

    /// Record lifecycle events in the runtime's event logger
    ///
    /// Default: false
    pub verbose: bool,

    /// Number of lifecycle events the logger keeps in memory
    ///
    /// Default: 1024
    pub event_history: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            // Accounting
            mode: RefcountMode::Biased,
            promotion_threshold: DEFAULT_PROMOTION_THRESHOLD,

            // Registry
            bucket_count: DEFAULT_BUCKET_COUNT,

            // Debug
            stats_enabled: true,
            verbose: false,
            event_history: 1024,
        }
    }
}

impl RuntimeConfig {
    /// Validate configuration
    ///
    /// # Examples
    ///
    /// ```rust
    /// use brc::RuntimeConfig;
    ///
    /// let config = RuntimeConfig {
    ///     bucket_count: 256,  // Not prime
    ///     ..Default::default()
    /// };
    ///
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_prime(self.bucket_count) {
            return Err(ConfigError::InvalidBucketCount(format!(
                "bucket_count must be prime, got {}",
                self.bucket_count
            )));
        }

        if self.promotion_threshold == 0 || self.promotion_threshold > MAX_PROMOTION_THRESHOLD {
            return Err(ConfigError::InvalidThreshold(format!(
                "promotion_threshold must be in 1..={}, got {}",
                MAX_PROMOTION_THRESHOLD, self.promotion_threshold
            )));
        }

        if self.verbose && self.event_history == 0 {
            return Err(ConfigError::InvalidEventHistory(
                "event_history must be > 0 when verbose is enabled".to_string(),
            ));
        }

        Ok(())
    }

    /// Build configuration from environment variables
    ///
    /// Overrides defaults with environment variables:
    /// - BRC_MODE (`biased` or `single`)
    /// - BRC_BUCKETS
    /// - BRC_PROMOTION_THRESHOLD
    /// - BRC_STATS
    /// - BRC_VERBOSE
    /// - BRC_EVENT_HISTORY
    ///
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("BRC_MODE") {
            if let Ok(mode) = val.parse::<RefcountMode>() {
                config.mode = mode;
            }
        }

        if let Ok(val) = std::env::var("BRC_BUCKETS") {
            if let Ok(count) = val.parse::<usize>() {
                config.bucket_count = count;
            }
        }

        if let Ok(val) = std::env::var("BRC_PROMOTION_THRESHOLD") {
            if let Ok(threshold) = val.parse::<u32>() {
                config.promotion_threshold = threshold;
            }
        }

        if let Ok(val) = std::env::var("BRC_STATS") {
            config.stats_enabled = parse_flag(&val);
        }

        if let Ok(val) = std::env::var("BRC_VERBOSE") {
            config.verbose = parse_flag(&val);
        }

        if let Ok(val) = std::env::var("BRC_EVENT_HISTORY") {
            if let Ok(history) = val.parse::<usize>() {
                config.event_history = history;
            }
        }

        config
    }
}

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid mode: {0}")]
    InvalidMode(String),

    #[error("Invalid bucket count: {0}")]
    InvalidBucketCount(String),

    #[error("Invalid threshold: {0}")]
    InvalidThreshold(String),

    #[error("Invalid event history: {0}")]
    InvalidEventHistory(String),
}

// ============================================================================
// HELPERS
// ============================================================================

fn parse_flag(val: &str) -> bool {
    val == "1" || val.eq_ignore_ascii_case("true")
}

fn is_prime(n: usize) -> bool {
    if n < 2 {
        return false;
    }
    let mut d = 2;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 1;
    }
    true
}
