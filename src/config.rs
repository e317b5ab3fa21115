//! Node configuration

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::datatype::Identity;
use crate::error::{DiameterError, DiameterResult};
use crate::{DIAMETER_PORT, DIAMETER_TLS_PORT};

/// Duration fields are written in milliseconds
mod duration_ms {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Watchdog policy for one peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Interval between watchdog probes on an idle connection
    #[serde(with = "duration_ms", default = "default_watchdog_interval")]
    pub interval: Duration,
    /// Consecutive unanswered probes at which the connection is torn down
    #[serde(default = "default_max_missed")]
    pub max_missed: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_watchdog_interval(),
            max_missed: default_max_missed(),
        }
    }
}

/// Local Diameter node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub origin_host: Identity,
    pub origin_realm: Identity,
    #[serde(default)]
    pub host_ip_addresses: Vec<IpAddr>,
    #[serde(default)]
    pub vendor_id: u32,
    /// Vendor ids advertised as Supported-Vendor-Id
    #[serde(default)]
    pub supported_vendor_ids: Vec<u32>,
    #[serde(default = "default_product_name")]
    pub product_name: String,
    #[serde(default)]
    pub firmware_revision: Option<u32>,
    #[serde(default)]
    pub origin_state_id: Option<u32>,
    /// Applications advertised in the capabilities exchange
    #[serde(default)]
    pub auth_application_ids: Vec<u32>,
    #[serde(default)]
    pub acct_application_ids: Vec<u32>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_tls_port")]
    pub tls_port: u16,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    /// How long one outstanding request may stay unanswered
    #[serde(with = "duration_ms", default = "default_request_timeout")]
    pub request_timeout: Duration,
    /// How long one CER may stay unanswered before it is retransmitted
    #[serde(with = "duration_ms", default = "default_request_timeout")]
    pub handshake_timeout: Duration,
    /// Retransmissions attempted before the handshake is abandoned
    #[serde(default = "default_max_retransmits")]
    pub max_retransmits: u32,
}

fn default_true() -> bool {
    true
}

fn default_watchdog_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_max_missed() -> u32 {
    3
}

fn default_product_name() -> String {
    "diameter-stack".to_string()
}

fn default_port() -> u16 {
    DIAMETER_PORT
}

fn default_tls_port() -> u16 {
    DIAMETER_TLS_PORT
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_retransmits() -> u32 {
    3
}

impl NodeConfig {
    /// A minimal configuration carrying the two required identities
    pub fn new(origin_host: impl Into<Identity>, origin_realm: impl Into<Identity>) -> Self {
        Self {
            origin_host: origin_host.into(),
            origin_realm: origin_realm.into(),
            host_ip_addresses: Vec::new(),
            vendor_id: 0,
            supported_vendor_ids: Vec::new(),
            product_name: default_product_name(),
            firmware_revision: None,
            origin_state_id: None,
            auth_application_ids: Vec::new(),
            acct_application_ids: Vec::new(),
            port: default_port(),
            tls_port: default_tls_port(),
            watchdog: WatchdogConfig::default(),
            request_timeout: default_request_timeout(),
            handshake_timeout: default_request_timeout(),
            max_retransmits: default_max_retransmits(),
        }
    }

    /// Parse a YAML configuration document
    pub fn from_yaml(src: &str) -> DiameterResult<Self> {
        let config: Self = serde_yaml::from_str(src)
            .map_err(|e| DiameterError::Config(format!("YAML parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the fields that cannot be defaulted
    pub fn validate(&self) -> DiameterResult<()> {
        if self.origin_host.is_empty() {
            return Err(DiameterError::Config("origin_host is required".to_string()));
        }
        if self.origin_realm.is_empty() {
            return Err(DiameterError::Config(
                "origin_realm is required".to_string(),
            ));
        }
        if self.auth_application_ids.is_empty() && self.acct_application_ids.is_empty() {
            return Err(DiameterError::Config(
                "at least one application must be advertised".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::new("mme.example.org", "example.org");
        assert_eq!(config.port, DIAMETER_PORT);
        assert_eq!(config.tls_port, DIAMETER_TLS_PORT);
        assert!(config.watchdog.enabled);
        assert_eq!(config.watchdog.interval, Duration::from_secs(30));
        assert_eq!(config.watchdog.max_missed, 3);
        assert_eq!(config.max_retransmits, 3);
    }

    #[test]
    fn test_from_yaml() {
        let config = NodeConfig::from_yaml(
            r#"
origin_host: "mme.epc.example.org"
origin_realm: "epc.example.org"
host_ip_addresses: ["10.0.0.1"]
auth_application_ids: [16777251]
watchdog:
  interval: 50
  max_missed: 3
"#,
        )
        .unwrap();
        assert_eq!(config.origin_host.as_str(), "mme.epc.example.org");
        assert_eq!(config.watchdog.interval, Duration::from_millis(50));
        assert_eq!(config.auth_application_ids, vec![16_777_251]);
        assert_eq!(config.product_name, "diameter-stack");
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        assert!(NodeConfig::from_yaml("origin_realm: \"example.org\"").is_err());
        // No advertised application
        let config = NodeConfig::new("mme.example.org", "example.org");
        assert!(config.validate().is_err());
    }
}
