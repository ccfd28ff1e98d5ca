//! Coordinator configuration.
//!
//! All knobs are explicit with conservative defaults. Environment
//! overrides use strict validation: a present-but-malformed value is a
//! startup error, never a silent fallback.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::state::{RetryBackoff, RetryPolicy};
use crate::wal::SyncPolicy;

const ENV_LEASE_DURATION_SECS: &str = "TETHER_LEASE_DURATION_SECS";
const ENV_HEARTBEAT_INTERVAL_SECS: &str = "TETHER_HEARTBEAT_INTERVAL_SECS";
const ENV_MAX_RETRIES: &str = "TETHER_MAX_RETRIES";
const ENV_RETRY_BACKOFF_MS: &str = "TETHER_RETRY_BACKOFF_MS";
const ENV_SYNC_BATCH_SIZE: &str = "TETHER_SYNC_BATCH_SIZE";
const ENV_SYNC_BATCH_INTERVAL_MS: &str = "TETHER_SYNC_BATCH_INTERVAL_MS";
const ENV_EXPIRY_SCAN_INTERVAL_MS: &str = "TETHER_EXPIRY_SCAN_INTERVAL_MS";

const DEFAULT_LEASE_DURATION_SECS: u64 = 30;
const DEFAULT_MAX_RETRIES: u32 = 0;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 1_000;
const DEFAULT_SYNC_BATCH_SIZE: u32 = 1;
const DEFAULT_SYNC_BATCH_INTERVAL_MS: u64 = 0;
const DEFAULT_EXPIRY_SCAN_INTERVAL_MS: u64 = 1_000;

/// Upper bound on the lease duration; keeps expiries far from the
/// encodable timestamp horizon.
const MAX_LEASE_DURATION_SECS: u64 = 86_400;

/// Coordinator configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Path of the WAL file; one per coordinator instance.
    pub wal_path: PathBuf,
    /// Cap on each renewable lease span.
    pub lease_duration: Duration,
    /// Expected worker heartbeat cadence; staleness triggers at three
    /// missed intervals.
    pub heartbeat_interval: Duration,
    /// Default `max_attempts` for submissions without a retry policy.
    pub max_retries: u32,
    /// Fixed backoff between a failed attempt and the next grant.
    pub retry_backoff: Duration,
    /// Sync after this many unacknowledged records.
    pub sync_batch_size: u32,
    /// Sync after this much time with unacknowledged records pending.
    pub sync_batch_interval: Duration,
    /// Cadence of the lease-expiry scan.
    pub expiry_scan_interval: Duration,
}

impl CoordinatorConfig {
    /// Creates a configuration with conservative defaults.
    #[must_use]
    pub fn new(wal_path: impl Into<PathBuf>) -> Self {
        let lease_duration = Duration::from_secs(DEFAULT_LEASE_DURATION_SECS);
        Self {
            wal_path: wal_path.into(),
            lease_duration,
            heartbeat_interval: lease_duration / 3,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            sync_batch_size: DEFAULT_SYNC_BATCH_SIZE,
            sync_batch_interval: Duration::from_millis(DEFAULT_SYNC_BATCH_INTERVAL_MS),
            expiry_scan_interval: Duration::from_millis(DEFAULT_EXPIRY_SCAN_INTERVAL_MS),
        }
    }

    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a present value is malformed
    /// or the combination fails validation.
    pub fn from_env(wal_path: impl Into<PathBuf>) -> Result<Self> {
        Self::from_env_with(wal_path, |key| std::env::var(key).ok())
    }

    /// Loads configuration with a custom environment source.
    ///
    /// This entry point is test-friendly and accepts a key lookup
    /// function.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a present value is malformed
    /// or the combination fails validation.
    pub fn from_env_with<F>(wal_path: impl Into<PathBuf>, get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lease_duration_secs = parse_u64_env(
            &get_env,
            ENV_LEASE_DURATION_SECS,
            DEFAULT_LEASE_DURATION_SECS,
            1,
        )?;
        let lease_duration = Duration::from_secs(lease_duration_secs);

        let heartbeat_interval = match get_env(ENV_HEARTBEAT_INTERVAL_SECS) {
            Some(_) => Duration::from_secs(parse_u64_env(
                &get_env,
                ENV_HEARTBEAT_INTERVAL_SECS,
                0,
                1,
            )?),
            None => lease_duration / 3,
        };

        let max_retries = parse_u32_env(&get_env, ENV_MAX_RETRIES, DEFAULT_MAX_RETRIES, 0)?;
        let retry_backoff = Duration::from_millis(parse_u64_env(
            &get_env,
            ENV_RETRY_BACKOFF_MS,
            DEFAULT_RETRY_BACKOFF_MS,
            0,
        )?);
        let sync_batch_size =
            parse_u32_env(&get_env, ENV_SYNC_BATCH_SIZE, DEFAULT_SYNC_BATCH_SIZE, 1)?;
        let sync_batch_interval = Duration::from_millis(parse_u64_env(
            &get_env,
            ENV_SYNC_BATCH_INTERVAL_MS,
            DEFAULT_SYNC_BATCH_INTERVAL_MS,
            0,
        )?);
        let expiry_scan_interval = Duration::from_millis(parse_u64_env(
            &get_env,
            ENV_EXPIRY_SCAN_INTERVAL_MS,
            DEFAULT_EXPIRY_SCAN_INTERVAL_MS,
            1,
        )?);

        let config = Self {
            wal_path: wal_path.into(),
            lease_duration,
            heartbeat_interval,
            max_retries,
            retry_backoff,
            sync_batch_size,
            sync_batch_interval,
            expiry_scan_interval,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration as a whole.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the failed constraint.
    pub fn validate(&self) -> Result<()> {
        if self.lease_duration.is_zero() {
            return Err(Error::configuration("lease_duration must be positive"));
        }
        if self.lease_duration > Duration::from_secs(MAX_LEASE_DURATION_SECS) {
            return Err(Error::configuration(format!(
                "lease_duration exceeds {MAX_LEASE_DURATION_SECS}s"
            )));
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.lease_duration {
            return Err(Error::configuration(
                "heartbeat_interval must be positive and below lease_duration",
            ));
        }
        if self.sync_batch_size == 0 {
            return Err(Error::configuration("sync_batch_size must be at least 1"));
        }
        if self.expiry_scan_interval.is_zero() {
            return Err(Error::configuration(
                "expiry_scan_interval must be positive",
            ));
        }
        Ok(())
    }

    /// The retry policy applied to submissions that omit one.
    #[must_use]
    pub fn default_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries,
            backoff: RetryBackoff::Fixed(self.retry_backoff),
        }
    }

    /// The WAL sync policy for unacknowledged records.
    #[must_use]
    pub const fn sync_policy(&self) -> SyncPolicy {
        SyncPolicy {
            batch_size: self.sync_batch_size,
            batch_interval: self.sync_batch_interval,
        }
    }
}

fn parse_u64_env<F>(get_env: &F, key: &str, default: u64, min: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default);
    };
    let parsed = raw.parse::<u64>().map_err(|_| {
        Error::configuration(format!("{key} must be a non-negative integer, got '{raw}'"))
    })?;
    if parsed < min {
        return Err(Error::configuration(format!(
            "{key} must be at least {min}"
        )));
    }
    Ok(parsed)
}

fn parse_u32_env<F>(get_env: &F, key: &str, default: u32, min: u32) -> Result<u32>
where
    F: Fn(&str) -> Option<String>,
{
    let value = parse_u64_env(get_env, key, u64::from(default), u64::from(min))?;
    u32::try_from(value)
        .map_err(|_| Error::configuration(format!("{key} value {value} exceeds supported range")))
}
