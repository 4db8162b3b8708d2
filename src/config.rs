//! # Agent configuration.
//!
//! [`AgentConfig`] collects every recognized option: broker endpoint,
//! instance pool sizing, consumer delivery policy, metrics address, pod
//! identity, and the shutdown grace period.
//!
//! Plain structs with `Default` impls; all of them deserialize from JSON
//! so the binary can read a config file. Duration fields are integer
//! milliseconds on the wire.
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use funcvisor::AgentConfig;
//!
//! let mut cfg = AgentConfig::default();
//! cfg.instances.max = 2;
//! cfg.instances.lifetime = Duration::from_secs(300);
//! cfg.pod_name = "agent-demo".into();
//!
//! assert!(cfg.validate().is_ok());
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;

/// Full agent configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub broker: BrokerConfig,
    pub instances: InstancesConfig,
    pub consumer: ConsumerSettings,
    pub metrics: MetricsConfig,
    /// Identity used in durable consumer names. Defaults to
    /// `agent-<hostname>`.
    pub pod_name: String,
    /// Maximum time to wait for consumers and instances during graceful
    /// shutdown.
    #[serde(with = "crate::domain::duration_ms")]
    pub grace: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            instances: InstancesConfig::default(),
            consumer: ConsumerSettings::default(),
            metrics: MetricsConfig::default(),
            pod_name: default_pod_name(),
            grace: Duration::from_secs(10),
        }
    }
}

impl AgentConfig {
    /// Rejects configurations the runtime cannot operate with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.broker.url.trim().is_empty() {
            return Err(Error::invalid_argument("broker.url is required"));
        }
        if self.instances.max == 0 {
            return Err(Error::invalid_argument("instances.max must be at least 1"));
        }
        if self.consumer.max_deliver == 0 {
            return Err(Error::invalid_argument(
                "consumer.max_deliver must be at least 1",
            ));
        }
        if self.pod_name.trim().is_empty() {
            return Err(Error::invalid_argument("pod_name must not be empty"));
        }
        Ok(())
    }
}

/// Broker endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Required. The embedded broker ignores the host part; an external
    /// broker implementation of the same trait connects to it.
    pub url: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "memory://local".into(),
        }
    }
}

/// Instance pool sizing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InstancesConfig {
    /// Global cap on live instances.
    pub max: usize,
    /// Wall-clock age at which an instance expires.
    #[serde(with = "crate::domain::duration_ms")]
    pub lifetime: Duration,
    /// Initialization delay paid once per instance.
    #[serde(with = "crate::domain::duration_ms")]
    pub cold_start: Duration,
}

impl Default for InstancesConfig {
    fn default() -> Self {
        Self {
            max: 4,
            lifetime: Duration::from_secs(300),
            cold_start: Duration::from_millis(100),
        }
    }
}

/// Delivery policy for the agent's durable consumers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    /// Concurrent in-flight ceiling per function.
    pub max_ack_pending: usize,
    /// Redelivery timeout; also the upper bound on one execution.
    #[serde(with = "crate::domain::duration_ms")]
    pub ack_wait: Duration,
    /// Attempts before a message is dead-lettered.
    pub max_deliver: u64,
    /// Ordered per-attempt redelivery delays.
    #[serde(with = "duration_ms_list")]
    pub backoff: Vec<Duration>,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            max_ack_pending: 32,
            ack_wait: Duration::from_secs(30),
            max_deliver: 5,
            backoff: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(5),
            ],
        }
    }
}

/// Metrics scrape endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Host:port the read-only HTTP endpoint binds to.
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:9090".into(),
        }
    }
}

fn default_pod_name() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".into());
    format!("agent-{host}")
}

/// Serde helper: `Vec<Duration>` as integer milliseconds.
mod duration_ms_list {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(list: &[Duration], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let ms: Vec<u64> = list.iter().map(|d| d.as_millis() as u64).collect();
        ms.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = Vec::<u64>::deserialize(deserializer)?;
        Ok(ms.into_iter().map(Duration::from_millis).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        AgentConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_instances() {
        let mut cfg = AgentConfig::default();
        cfg.instances.max = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_empty_broker_url() {
        let mut cfg = AgentConfig::default();
        cfg.broker.url = "  ".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn deserializes_partial_file() {
        let cfg: AgentConfig = serde_json::from_str(
            r#"{
                "instances": { "max": 2, "lifetime": 60000 },
                "consumer": { "max_deliver": 3, "backoff": [100, 200] },
                "pod_name": "agent-test"
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.instances.max, 2);
        assert_eq!(cfg.instances.lifetime, Duration::from_secs(60));
        // Unset fields keep their defaults.
        assert_eq!(cfg.instances.cold_start, Duration::from_millis(100));
        assert_eq!(cfg.consumer.max_deliver, 3);
        assert_eq!(
            cfg.consumer.backoff,
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
        assert_eq!(cfg.pod_name, "agent-test");
    }
}
