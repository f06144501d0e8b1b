//! Wait budgets for node, load balancer, and governance polling.

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Default budget for fetching node and service certificates (300s).
///
/// Nodes can take minutes to start serving TLS after provisioning.
const fn default_certificate() -> Duration {
    Duration::from_secs(300)
}

/// Default budget for node state and membership appearance checks (60s).
const fn default_node_state() -> Duration {
    Duration::from_secs(60)
}

/// Default budget for a recovered node to reach its target state (120s).
const fn default_recovery_readiness() -> Duration {
    Duration::from_secs(120)
}

/// Default budget for the load balancer to proxy the cluster (300s).
const fn default_load_balancer() -> Duration {
    Duration::from_secs(300)
}

/// Default budget for a proposal transaction to commit (60s).
const fn default_proposal_commit() -> Duration {
    Duration::from_secs(60)
}

/// Default budget for the trust transition of a joining node to commit (180s).
///
/// Node-to-node channel establishment can take over a minute.
const fn default_trust_commit() -> Duration {
    Duration::from_secs(180)
}

/// Default per-request timeout for certificate and readiness probes (30s).
const fn default_request() -> Duration {
    Duration::from_secs(30)
}

/// Default interval between poll attempts (1s).
const fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

/// Wait budgets used by every poll in the orchestrator.
///
/// Timeouts are per wait, never global. Each wait fails with a timeout
/// error carrying the last state it observed.
///
/// # Example
///
/// ```no_run
/// # use std::time::Duration;
/// # use consortium_types::config::TimeoutConfig;
/// let config = TimeoutConfig::builder()
///     .node_state(Duration::from_secs(90))
///     .trust_commit(Duration::from_secs(240))
///     .build()
///     .expect("valid timeout config");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TimeoutConfig {
    /// Budget for fetching node and service certificates.
    #[serde(default = "default_certificate", with = "super::humantime_serde")]
    #[schemars(with = "String")]
    pub certificate: Duration,
    /// Budget for node state and membership appearance checks.
    #[serde(default = "default_node_state", with = "super::humantime_serde")]
    #[schemars(with = "String")]
    pub node_state: Duration,
    /// Budget for a recovered node to reach its target state.
    #[serde(default = "default_recovery_readiness", with = "super::humantime_serde")]
    #[schemars(with = "String")]
    pub recovery_readiness: Duration,
    /// Budget for the load balancer to proxy the cluster.
    #[serde(default = "default_load_balancer", with = "super::humantime_serde")]
    #[schemars(with = "String")]
    pub load_balancer: Duration,
    /// Budget for a proposal transaction to commit.
    #[serde(default = "default_proposal_commit", with = "super::humantime_serde")]
    #[schemars(with = "String")]
    pub proposal_commit: Duration,
    /// Budget for the trust transition of a joining node to commit.
    #[serde(default = "default_trust_commit", with = "super::humantime_serde")]
    #[schemars(with = "String")]
    pub trust_commit: Duration,
    /// Per-request timeout for certificate and readiness probes.
    #[serde(default = "default_request", with = "super::humantime_serde")]
    #[schemars(with = "String")]
    pub request: Duration,
    /// Sleep between poll attempts.
    #[serde(default = "default_poll_interval", with = "super::humantime_serde")]
    #[schemars(with = "String")]
    pub poll_interval: Duration,
}

#[bon::bon]
impl TimeoutConfig {
    /// Creates a new timeout configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if a budget is zero or not larger
    /// than the poll interval.
    #[builder]
    pub fn new(
        #[builder(default = default_certificate())] certificate: Duration,
        #[builder(default = default_node_state())] node_state: Duration,
        #[builder(default = default_recovery_readiness())] recovery_readiness: Duration,
        #[builder(default = default_load_balancer())] load_balancer: Duration,
        #[builder(default = default_proposal_commit())] proposal_commit: Duration,
        #[builder(default = default_trust_commit())] trust_commit: Duration,
        #[builder(default = default_request())] request: Duration,
        #[builder(default = default_poll_interval())] poll_interval: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            certificate,
            node_state,
            recovery_readiness,
            load_balancer,
            proposal_commit,
            trust_commit,
            request,
            poll_interval,
        };
        config.validate()?;
        Ok(config)
    }
}

impl TimeoutConfig {
    /// Validates the configuration values.
    ///
    /// Call after deserialization to ensure values are within valid ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Validation {
                message: "poll_interval must be > 0".to_string(),
            });
        }
        if self.request.is_zero() {
            return Err(ConfigError::Validation { message: "request must be > 0".to_string() });
        }
        let budgets = [
            ("certificate", self.certificate),
            ("node_state", self.node_state),
            ("recovery_readiness", self.recovery_readiness),
            ("load_balancer", self.load_balancer),
            ("proposal_commit", self.proposal_commit),
            ("trust_commit", self.trust_commit),
        ];
        for (name, budget) in budgets {
            if budget <= self.poll_interval {
                return Err(ConfigError::Validation {
                    message: format!(
                        "{name} ({}) must be greater than poll_interval ({})",
                        humantime::format_duration(budget),
                        humantime::format_duration(self.poll_interval)
                    ),
                });
            }
        }
        Ok(())
    }

    /// Budgets scaled down for tests against in-memory fakes.
    pub fn fast() -> Self {
        Self {
            certificate: Duration::from_secs(2),
            node_state: Duration::from_secs(2),
            recovery_readiness: Duration::from_secs(2),
            load_balancer: Duration::from_secs(2),
            proposal_commit: Duration::from_secs(2),
            trust_commit: Duration::from_secs(2),
            request: Duration::from_millis(500),
            poll_interval: Duration::from_millis(10),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            certificate: default_certificate(),
            node_state: default_node_state(),
            recovery_readiness: default_recovery_readiness(),
            load_balancer: default_load_balancer(),
            proposal_commit: default_proposal_commit(),
            trust_commit: default_trust_commit(),
            request: default_request(),
            poll_interval: default_poll_interval(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_defaults() {
        let config = TimeoutConfig::default();
        assert_eq!(config.certificate, Duration::from_secs(300));
        assert_eq!(config.node_state, Duration::from_secs(60));
        assert_eq!(config.recovery_readiness, Duration::from_secs(120));
        assert_eq!(config.load_balancer, Duration::from_secs(300));
        assert_eq!(config.proposal_commit, Duration::from_secs(60));
        assert_eq!(config.trust_commit, Duration::from_secs(180));
        assert_eq!(config.request, Duration::from_secs(30));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        config.validate().unwrap();
    }

    #[test]
    fn test_fast_profile_is_valid() {
        TimeoutConfig::fast().validate().unwrap();
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let result = TimeoutConfig::builder().poll_interval(Duration::ZERO).build();
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn test_budget_not_exceeding_interval_rejected() {
        let err = TimeoutConfig::builder()
            .poll_interval(Duration::from_secs(5))
            .node_state(Duration::from_secs(5))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("node_state"), "unexpected message: {err}");
    }

    #[test]
    fn test_humantime_round_trip() {
        let config = TimeoutConfig::builder().trust_commit(Duration::from_secs(150)).build().unwrap();
        let json = serde_json::to_value(config).unwrap();
        assert_eq!(json["trust_commit"], "2m 30s");
        let decoded: TimeoutConfig = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, config);
    }
}
