//! Error types and retry pacing for the EtcdCluster controller.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("kubernetes api: {0}")]
    Kube(#[from] kube::Error),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("apply cluster resources: {0}")]
    Resources(#[from] crate::resources::Error),

    #[error("etcd: {0}")]
    Etcd(#[from] crate::etcd::Error),

    #[error("backup store: {0}")]
    Backup(#[from] crate::backup::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Fast retries for the first attempts, then a slower steady pace.
///
/// Per-identity attempt counts reset on the next successful reconcile.
pub struct RetryTracker {
    fast: Duration,
    slow: Duration,
    fast_attempts: u32,
    attempts: Mutex<HashMap<String, u32>>,
}

impl Default for RetryTracker {
    fn default() -> Self {
        Self {
            fast: Duration::from_secs(1),
            slow: Duration::from_secs(5),
            fast_attempts: 10,
            attempts: Mutex::new(HashMap::new()),
        }
    }
}

impl RetryTracker {
    /// Record a failure and return the delay before the next attempt
    pub fn failure(&self, key: &str) -> Duration {
        let mut attempts = self.attempts.lock().expect("retry tracker lock");
        let count = attempts.entry(key.to_string()).or_insert(0);
        *count += 1;

        if *count <= self.fast_attempts {
            self.fast
        } else {
            self.slow
        }
    }

    /// Reset pacing after a successful reconcile
    pub fn success(&self, key: &str) {
        self.attempts.lock().expect("retry tracker lock").remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_then_slow() {
        let tracker = RetryTracker::default();

        for _ in 0..10 {
            assert_eq!(tracker.failure("ns/name"), Duration::from_secs(1));
        }
        assert_eq!(tracker.failure("ns/name"), Duration::from_secs(5));
        assert_eq!(tracker.failure("ns/name"), Duration::from_secs(5));
    }

    #[test]
    fn success_resets_pacing() {
        let tracker = RetryTracker::default();
        for _ in 0..12 {
            tracker.failure("ns/name");
        }

        tracker.success("ns/name");
        assert_eq!(tracker.failure("ns/name"), Duration::from_secs(1));
    }

    #[test]
    fn identities_are_independent() {
        let tracker = RetryTracker::default();
        for _ in 0..12 {
            tracker.failure("ns/a");
        }

        assert_eq!(tracker.failure("ns/b"), Duration::from_secs(1));
    }
}
