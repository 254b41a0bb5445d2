//! Client configuration.
//!
//! Every tuning constant of the sync runtime is a default here rather than a
//! hard-coded value, and every setter validates its input.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{invalid_argument, FirestoreResult};
use crate::local::persistence::DEFAULT_COMPACTION_THRESHOLD;
use crate::model::DatabaseId;
use crate::remote::DEFAULT_MAX_PENDING_WRITES;
use crate::util::backoff::{BackoffConfig, DEFAULT_BACKOFF_FACTOR, DEFAULT_INITIAL_DELAY_MILLIS, DEFAULT_MAX_DELAY_MILLIS};
use crate::util::RetryPolicy;

/// Limbo documents resolved at the same time; the rest wait in FIFO order.
pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;
/// Grace period before repeated watch failures report the client offline.
pub const DEFAULT_ONLINE_STATE_TIMEOUT_MILLIS: u64 = 10_000;
pub const DEFAULT_STREAM_INITIAL_BACKOFF_MILLIS: u64 = DEFAULT_INITIAL_DELAY_MILLIS;
pub const DEFAULT_STREAM_MAX_BACKOFF_MILLIS: u64 = DEFAULT_MAX_DELAY_MILLIS;
pub const DEFAULT_STREAM_BACKOFF_FACTOR: f64 = DEFAULT_BACKOFF_FACTOR;

/// Where the local caches live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PersistenceSettings {
    Memory,
    /// A directory holding the snapshot and commit log.
    Durable {
        directory: PathBuf,
        compaction_threshold: usize,
    },
}

impl PersistenceSettings {
    pub fn durable(directory: impl Into<PathBuf>) -> Self {
        PersistenceSettings::Durable {
            directory: directory.into(),
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
        }
    }
}

/// Settings for a [`FirestoreClient`](crate::core::FirestoreClient).
#[derive(Clone, Debug, PartialEq)]
pub struct FirestoreSettings {
    database_id: DatabaseId,
    persistence: PersistenceSettings,
    max_concurrent_limbo_resolutions: usize,
    max_pending_writes: usize,
    online_state_timeout: Duration,
    stream_backoff: BackoffConfig,
    persistence_retry: RetryPolicy,
}

impl FirestoreSettings {
    /// Settings with every default for the given database.
    pub fn new(database_id: DatabaseId) -> Self {
        Self {
            database_id,
            persistence: PersistenceSettings::Memory,
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            max_pending_writes: DEFAULT_MAX_PENDING_WRITES,
            online_state_timeout: Duration::from_millis(DEFAULT_ONLINE_STATE_TIMEOUT_MILLIS),
            stream_backoff: BackoffConfig {
                initial_delay: Duration::from_millis(DEFAULT_STREAM_INITIAL_BACKOFF_MILLIS),
                backoff_factor: DEFAULT_STREAM_BACKOFF_FACTOR,
                max_delay: Duration::from_millis(DEFAULT_STREAM_MAX_BACKOFF_MILLIS),
            },
            persistence_retry: RetryPolicy::default(),
        }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn persistence(&self) -> &PersistenceSettings {
        &self.persistence
    }

    pub fn max_concurrent_limbo_resolutions(&self) -> usize {
        self.max_concurrent_limbo_resolutions
    }

    pub fn max_pending_writes(&self) -> usize {
        self.max_pending_writes
    }

    pub fn online_state_timeout(&self) -> Duration {
        self.online_state_timeout
    }

    pub fn stream_backoff(&self) -> BackoffConfig {
        self.stream_backoff
    }

    pub fn persistence_retry(&self) -> RetryPolicy {
        self.persistence_retry
    }

    pub fn with_persistence(mut self, persistence: PersistenceSettings) -> FirestoreResult<Self> {
        if let PersistenceSettings::Durable {
            directory,
            compaction_threshold,
        } = &persistence
        {
            if directory.as_os_str().is_empty() {
                return Err(invalid_argument("Durable persistence requires a directory"));
            }
            if *compaction_threshold == 0 {
                return Err(invalid_argument("compaction_threshold must be greater than zero"));
            }
        }
        self.persistence = persistence;
        Ok(self)
    }

    pub fn with_max_concurrent_limbo_resolutions(mut self, value: usize) -> FirestoreResult<Self> {
        if value == 0 {
            return Err(invalid_argument("max_concurrent_limbo_resolutions must be greater than zero"));
        }
        self.max_concurrent_limbo_resolutions = value;
        Ok(self)
    }

    pub fn with_max_pending_writes(mut self, value: usize) -> FirestoreResult<Self> {
        if value == 0 {
            return Err(invalid_argument("max_pending_writes must be greater than zero"));
        }
        self.max_pending_writes = value;
        Ok(self)
    }

    pub fn with_online_state_timeout(mut self, value: Duration) -> FirestoreResult<Self> {
        if value.is_zero() {
            return Err(invalid_argument("online_state_timeout must be greater than zero"));
        }
        self.online_state_timeout = value;
        Ok(self)
    }

    /// Backoff between reconnect attempts of the watch and write streams.
    pub fn with_stream_backoff(mut self, backoff: BackoffConfig) -> FirestoreResult<Self> {
        validate_backoff(&backoff)?;
        self.stream_backoff = backoff;
        Ok(self)
    }

    /// How often a persistence operation is retried before it fails.
    pub fn with_persistence_retry(mut self, retry: RetryPolicy) -> FirestoreResult<Self> {
        if retry.max_attempts == 0 {
            return Err(invalid_argument("max_attempts must be greater than zero"));
        }
        validate_backoff(&retry.backoff)?;
        self.persistence_retry = retry;
        Ok(self)
    }
}

fn validate_backoff(backoff: &BackoffConfig) -> FirestoreResult<()> {
    if backoff.backoff_factor < 1.0 || !backoff.backoff_factor.is_finite() {
        return Err(invalid_argument("backoff_factor must be a finite value of at least 1"));
    }
    if backoff.max_delay < backoff.initial_delay {
        return Err(invalid_argument("max_delay must not be shorter than initial_delay"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::DEFAULT_MAX_RETRY_ATTEMPTS;

    fn settings() -> FirestoreSettings {
        FirestoreSettings::new(DatabaseId::default("project"))
    }

    #[test]
    fn defaults_match_named_constants() {
        let settings = settings();
        assert_eq!(settings.persistence(), &PersistenceSettings::Memory);
        assert_eq!(settings.max_concurrent_limbo_resolutions(), 100);
        assert_eq!(settings.max_pending_writes(), 10);
        assert_eq!(settings.online_state_timeout(), Duration::from_secs(10));
        assert_eq!(settings.stream_backoff(), BackoffConfig::default());
        assert_eq!(settings.persistence_retry().max_attempts, DEFAULT_MAX_RETRY_ATTEMPTS);
    }

    #[test]
    fn setters_reject_invalid_values() {
        assert!(settings().with_max_concurrent_limbo_resolutions(0).is_err());
        assert!(settings().with_max_pending_writes(0).is_err());
        assert!(settings().with_online_state_timeout(Duration::ZERO).is_err());
        assert!(settings()
            .with_persistence(PersistenceSettings::Durable {
                directory: PathBuf::from("/tmp/db"),
                compaction_threshold: 0,
            })
            .is_err());
        assert!(settings()
            .with_stream_backoff(BackoffConfig {
                initial_delay: Duration::from_secs(2),
                backoff_factor: 1.5,
                max_delay: Duration::from_secs(1),
            })
            .is_err());

        let tuned = settings()
            .with_max_pending_writes(3)
            .unwrap()
            .with_persistence(PersistenceSettings::durable("/tmp/db"))
            .unwrap();
        assert_eq!(tuned.max_pending_writes(), 3);
        assert!(matches!(tuned.persistence(), PersistenceSettings::Durable { compaction_threshold, .. } if *compaction_threshold == DEFAULT_COMPACTION_THRESHOLD));
    }
}
