//! Client configuration.

use std::time::Duration;

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::DatabaseId;
use crate::util::BackoffSettings;

/// Default number of limbo documents resolved at the same time.
pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;
/// Default number of batches in flight on the write stream.
pub const DEFAULT_MAX_PENDING_WRITES: usize = 10;
/// Streams close after this long without activity.
pub const DEFAULT_STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_STORAGE_PROBE_INTERVAL: Duration = Duration::from_secs(5);
/// How long the watch stream may take to connect before the client reports
/// itself offline.
pub const DEFAULT_ONLINE_STATE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_TRANSACTION_ATTEMPTS: u32 = 5;

#[derive(Clone, Debug, PartialEq)]
pub struct FirestoreSettings {
    pub database_id: DatabaseId,
    pub max_concurrent_limbo_resolutions: usize,
    pub max_pending_writes: usize,
    pub stream_idle_timeout: Duration,
    pub backoff: BackoffSettings,
    pub storage_retry_backoff: BackoffSettings,
    pub storage_probe_interval: Duration,
    pub online_state_timeout: Duration,
    pub max_transaction_attempts: u32,
}

impl FirestoreSettings {
    pub fn new(database_id: DatabaseId) -> Self {
        Self {
            database_id,
            ..Self::default()
        }
    }

    pub fn with_max_concurrent_limbo_resolutions(mut self, value: usize) -> Self {
        self.max_concurrent_limbo_resolutions = value;
        self
    }

    pub fn with_max_pending_writes(mut self, value: usize) -> Self {
        self.max_pending_writes = value;
        self
    }

    pub fn with_stream_idle_timeout(mut self, value: Duration) -> Self {
        self.stream_idle_timeout = value;
        self
    }

    pub fn with_backoff(mut self, value: BackoffSettings) -> Self {
        self.backoff = value;
        self
    }

    pub fn with_storage_retry_backoff(mut self, value: BackoffSettings) -> Self {
        self.storage_retry_backoff = value;
        self
    }

    pub fn with_storage_probe_interval(mut self, value: Duration) -> Self {
        self.storage_probe_interval = value;
        self
    }

    pub fn with_online_state_timeout(mut self, value: Duration) -> Self {
        self.online_state_timeout = value;
        self
    }

    pub fn with_max_transaction_attempts(mut self, value: u32) -> Self {
        self.max_transaction_attempts = value;
        self
    }

    pub fn validate(&self) -> FirestoreResult<()> {
        if self.max_concurrent_limbo_resolutions == 0 {
            return Err(invalid_argument(
                "max_concurrent_limbo_resolutions must be greater than zero",
            ));
        }
        if self.max_pending_writes == 0 {
            return Err(invalid_argument("max_pending_writes must be greater than zero"));
        }
        if self.max_transaction_attempts == 0 {
            return Err(invalid_argument(
                "max_transaction_attempts must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Default for FirestoreSettings {
    fn default() -> Self {
        Self {
            database_id: DatabaseId::default("default-project"),
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            max_pending_writes: DEFAULT_MAX_PENDING_WRITES,
            stream_idle_timeout: DEFAULT_STREAM_IDLE_TIMEOUT,
            backoff: BackoffSettings::default(),
            storage_retry_backoff: BackoffSettings::default(),
            storage_probe_interval: DEFAULT_STORAGE_PROBE_INTERVAL,
            online_state_timeout: DEFAULT_ONLINE_STATE_TIMEOUT,
            max_transaction_attempts: DEFAULT_MAX_TRANSACTION_ATTEMPTS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = FirestoreSettings::default();
        assert_eq!(settings.max_pending_writes, 10);
        assert_eq!(settings.stream_idle_timeout, Duration::from_secs(60));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn zero_limits_are_rejected() {
        let err = FirestoreSettings::default()
            .with_max_pending_writes(0)
            .validate()
            .unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
        assert!(FirestoreSettings::default()
            .with_max_concurrent_limbo_resolutions(0)
            .validate()
            .is_err());
    }
}
