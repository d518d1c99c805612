use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::probe::connection::DEFAULT_PROBE_TIMEOUT;

/// What to do with a probe that failed to dial or decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Cache the failure for the rest of the run, exactly like a success.
    #[default]
    CacheFailures,
    /// Hand the failure back but let the next caller probe again.
    RetryOnFailure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Dial deadline, also passed to the decoder as its handshake timeout.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    pub failure_policy: FailurePolicy,
    /// Username sent in the `Cookie: mstshash=` routing token.
    pub mstshash_user: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PROBE_TIMEOUT,
            failure_policy: FailurePolicy::default(),
            mstshash_user: "rdpscope".to_string(),
        }
    }
}

impl ProbeConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_preserve_five_second_timeout() {
        let config = ProbeConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.failure_policy, FailurePolicy::CacheFailures);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: ProbeConfig =
            serde_json::from_str(r#"{"timeout": 1500, "failure_policy": "retry_on_failure"}"#)
                .unwrap();
        assert_eq!(config.timeout, Duration::from_millis(1500));
        assert_eq!(config.failure_policy, FailurePolicy::RetryOnFailure);
        assert_eq!(config.mstshash_user, "rdpscope");
    }
}
