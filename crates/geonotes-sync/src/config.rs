//! Sync configuration
//!
//! Loaded from an optional TOML file overlaid with `GEONOTES_<SECTION>__<KEY>`
//! environment variables (after `.env` is read), e.g.
//! `GEONOTES_SYNC__DIRECT_APPLY_THRESHOLD=5000`. Every field has a default, so
//! an empty environment yields a runnable local configuration.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Defaults
// ============================================================================

/// Config file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "geonotes.toml";

pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/geonotes";
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 1;
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

pub const DEFAULT_FEED_URL: &str = "http://localhost:8080/api/notes";
/// Upper bound on notes requested per feed fetch.
pub const DEFAULT_FETCH_LIMIT: usize = 50_000;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

pub const DEFAULT_DUMP_URL: &str = "http://localhost:8080/dumps/notes-latest.csv.gz";
pub const DEFAULT_WORK_DIR: &str = "./work";
pub const DEFAULT_PARTITIONS: usize = 8;
pub const DEFAULT_BULK_PARALLELISM: usize = 4;
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 3_600;
/// Bulk runs of one batch before it is abandoned
pub const DEFAULT_MAX_BATCH_ATTEMPTS: u32 = 3;

pub const DEFAULT_INSTANCE_NAME: &str = "default";
/// Batches larger than this go through the bulk path.
pub const DEFAULT_DIRECT_APPLY_THRESHOLD: usize = 10_000;
pub const DEFAULT_MIN_SLEEP_SECS: u64 = 30;
pub const DEFAULT_MAX_SLEEP_SECS: u64 = 900;
/// Records applied in one cycle for it to count as substantial work.
pub const DEFAULT_SUBSTANTIAL_WORK: usize = 100;
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;
pub const DEFAULT_LOCK_TTL_SECS: u64 = 1_800;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_TICKET_LEASE_SECS: u64 = 600;
pub const DEFAULT_TURN_TIMEOUT_SECS: u64 = 1_800;

pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 60_000;

pub const DEFAULT_BOUNDARIES_URL: &str = "http://localhost:8080/api/boundaries";
pub const DEFAULT_CHUNK_SIZE: i64 = 1_000;
pub const DEFAULT_VERIFY_PARALLELISM: usize = 4;
pub const DEFAULT_GRID_CELL_DEGREES: f64 = 1.0;

/// Full sync configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub database: DatabaseConfig,
    pub feed: FeedConfig,
    pub bulk: BulkConfig,
    pub sync: ControllerConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub verify: VerifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
}

/// Near-real-time notes feed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub url: String,
    pub fetch_limit: usize,
    pub request_timeout_secs: u64,
}

/// Bulk dump source and partition pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkConfig {
    pub dump_url: String,
    /// Optional URL of a file holding the dump's SHA-256
    pub checksum_url: Option<String>,
    pub work_dir: PathBuf,
    pub partitions: usize,
    pub parallelism: usize,
    pub failure_mode: FailureMode,
    /// Whole-download timeout for the dump
    pub download_timeout_secs: u64,
    /// Runs of one batch (first run plus resumes) before it is abandoned
    pub max_batch_attempts: u32,
}

/// What a worker failure does to the rest of the batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Any failed partition fails the batch
    #[default]
    FailFast,
    /// Failed partitions are recorded and the rest keep going
    BestEffort,
}

/// Controller and daemon loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub instance_name: String,
    pub direct_apply_threshold: usize,
    pub min_sleep_secs: u64,
    pub max_sleep_secs: u64,
    pub substantial_work: usize,
    pub max_consecutive_failures: u32,
    pub lock_ttl_secs: u64,
}

/// Ticket queue polling and leases
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_ms: u64,
    pub ticket_lease_secs: u64,
    pub turn_timeout_secs: u64,
    /// Status page reporting "N slots available now"; unset means unlimited
    pub capacity_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

/// Region verification and assignment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    pub boundaries_url: String,
    pub chunk_size: i64,
    pub parallelism: usize,
    pub grid_cell_degrees: f64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
            connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_FEED_URL.to_string(),
            fetch_limit: DEFAULT_FETCH_LIMIT,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            dump_url: DEFAULT_DUMP_URL.to_string(),
            checksum_url: None,
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            partitions: DEFAULT_PARTITIONS,
            parallelism: DEFAULT_BULK_PARALLELISM,
            failure_mode: FailureMode::FailFast,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            max_batch_attempts: DEFAULT_MAX_BATCH_ATTEMPTS,
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            instance_name: DEFAULT_INSTANCE_NAME.to_string(),
            direct_apply_threshold: DEFAULT_DIRECT_APPLY_THRESHOLD,
            min_sleep_secs: DEFAULT_MIN_SLEEP_SECS,
            max_sleep_secs: DEFAULT_MAX_SLEEP_SECS,
            substantial_work: DEFAULT_SUBSTANTIAL_WORK,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            ticket_lease_secs: DEFAULT_TICKET_LEASE_SECS,
            turn_timeout_secs: DEFAULT_TURN_TIMEOUT_SECS,
            capacity_url: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
        }
    }
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            boundaries_url: DEFAULT_BOUNDARIES_URL.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            parallelism: DEFAULT_VERIFY_PARALLELISM,
            grid_cell_degrees: DEFAULT_GRID_CELL_DEGREES,
        }
    }
}

impl SyncConfig {
    /// Load from `path` (or `geonotes.toml` if present) plus environment
    ///
    /// An explicitly given file must exist; the default one is optional.
    /// `DATABASE_URL` is honoured as a fallback for `database.url`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Ok(url) = std::env::var("DATABASE_URL") {
            builder = builder.set_default("database.url", url).map_err(config_error)?;
        }

        builder = match path {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name(DEFAULT_CONFIG_FILE).required(false)),
        };

        let config: SyncConfig = builder
            .add_source(
                config::Environment::with_prefix("GEONOTES")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(config_error)?
            .try_deserialize()
            .map_err(config_error)?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work together
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(SyncError::Config("database.url cannot be empty".into()));
        }
        if self.database.max_connections == 0 {
            return Err(SyncError::Config("database.max_connections must be greater than 0".into()));
        }
        if self.feed.fetch_limit <= self.sync.direct_apply_threshold {
            return Err(SyncError::Config(format!(
                "feed.fetch_limit ({}) must exceed sync.direct_apply_threshold ({})",
                self.feed.fetch_limit, self.sync.direct_apply_threshold
            )));
        }
        if self.sync.min_sleep_secs == 0 || self.sync.min_sleep_secs > self.sync.max_sleep_secs {
            return Err(SyncError::Config(format!(
                "sync.min_sleep_secs ({}) must be in 1..=max_sleep_secs ({})",
                self.sync.min_sleep_secs, self.sync.max_sleep_secs
            )));
        }
        if self.sync.max_consecutive_failures == 0 {
            return Err(SyncError::Config("sync.max_consecutive_failures must be at least 1".into()));
        }
        if self.bulk.partitions == 0 || self.bulk.parallelism == 0 {
            return Err(SyncError::Config("bulk.partitions and bulk.parallelism must be greater than 0".into()));
        }
        if self.verify.chunk_size <= 0 || self.verify.parallelism == 0 {
            return Err(SyncError::Config("verify.chunk_size and verify.parallelism must be greater than 0".into()));
        }
        if self.verify.grid_cell_degrees.is_nan() || self.verify.grid_cell_degrees <= 0.0 {
            return Err(SyncError::Config("verify.grid_cell_degrees must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(SyncError::Config("retry.base_delay_ms cannot exceed retry.max_delay_ms".into()));
        }
        if self.scheduler.poll_interval_ms == 0 || self.scheduler.ticket_lease_secs == 0 {
            return Err(SyncError::Config(
                "scheduler.poll_interval_ms and scheduler.ticket_lease_secs must be greater than 0".into(),
            ));
        }
        // Leases are renewed every third of their length
        let lease_ms = self.scheduler.ticket_lease_secs.saturating_mul(1_000);
        if lease_ms < self.scheduler.poll_interval_ms.saturating_mul(3) {
            return Err(SyncError::Config(format!(
                "scheduler.ticket_lease_secs ({}) must cover at least three poll intervals ({} ms)",
                self.scheduler.ticket_lease_secs, self.scheduler.poll_interval_ms
            )));
        }
        if self.sync.lock_ttl_secs < 3 {
            return Err(SyncError::Config(format!(
                "sync.lock_ttl_secs ({}) must be at least 3",
                self.sync.lock_ttl_secs
            )));
        }
        if self.bulk.max_batch_attempts == 0 {
            return Err(SyncError::Config("bulk.max_batch_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

fn config_error(err: config::ConfigError) -> SyncError {
    SyncError::Config(err.to_string())
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl FeedConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl BulkConfig {
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

impl ControllerConfig {
    /// Lease lock guarding a single running instance
    pub fn instance_lock(&self) -> String {
        format!("instance:{}", self.instance_name)
    }

    pub fn min_sleep(&self) -> Duration {
        Duration::from_secs(self.min_sleep_secs)
    }

    pub fn max_sleep(&self) -> Duration {
        Duration::from_secs(self.max_sleep_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn ticket_lease(&self) -> Duration {
        Duration::from_secs(self.ticket_lease_secs)
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs)
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = SyncConfig::default();
        config.validate().unwrap();
        assert_eq!(config.sync.direct_apply_threshold, 10_000);
        assert_eq!(config.retry.base_delay(), Duration::from_secs(1));
        assert_eq!(config.bulk.failure_mode, FailureMode::FailFast);
    }

    #[test]
    fn test_rejects_inverted_sleep_bounds() {
        let mut config = SyncConfig::default();
        config.sync.min_sleep_secs = 600;
        config.sync.max_sleep_secs = 60;
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_rejects_threshold_above_fetch_limit() {
        let mut config = SyncConfig::default();
        config.feed.fetch_limit = 5_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_leases_too_short_to_renew() {
        let mut config = SyncConfig::default();
        config.scheduler.ticket_lease_secs = 1;
        config.scheduler.poll_interval_ms = 500;
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));

        let mut config = SyncConfig::default();
        config.sync.lock_ttl_secs = 2;
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));

        let mut config = SyncConfig::default();
        config.bulk.max_batch_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_load_file_with_env_override() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[sync]\ndirect_apply_threshold = 2000\ninstance_name = \"eu\"\n\n[bulk]\nfailure_mode = \"best_effort\"\n"
        )
        .unwrap();

        std::env::set_var("GEONOTES_SYNC__MIN_SLEEP_SECS", "5");
        let config = SyncConfig::load(Some(file.path()));
        std::env::remove_var("GEONOTES_SYNC__MIN_SLEEP_SECS");
        let config = config.unwrap();

        assert_eq!(config.sync.direct_apply_threshold, 2000);
        assert_eq!(config.sync.instance_name, "eu");
        assert_eq!(config.sync.min_sleep_secs, 5);
        assert_eq!(config.bulk.failure_mode, FailureMode::BestEffort);
        assert_eq!(config.verify.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    #[serial]
    fn test_load_invalid_override_is_config_error() {
        std::env::set_var("GEONOTES_BULK__PARALLELISM", "0");
        let result = SyncConfig::load(Some(Path::new("/nonexistent/geonotes.toml")));
        std::env::remove_var("GEONOTES_BULK__PARALLELISM");

        assert!(matches!(result, Err(SyncError::Config(_))));
    }
}
