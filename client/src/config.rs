//! Client configuration

use anyhow::{Context, Result};
use lockwire_protocol::{WireFormat, MAX_FRAME_LEN};
use lockwire_transport::TransportConfig;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default lockdown daemon port
pub const LOCKDOWN_PORT: u16 = 62078;

/// Probe run configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    /// Device to probe
    pub device: DeviceConfig,

    /// Lockdown session configuration
    #[serde(default)]
    pub lockdown: LockdownConfig,

    /// Domain/key/service catalogs
    #[serde(default)]
    pub catalog: CatalogConfig,
}

impl ProbeConfig {
    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: ProbeConfig = toml::from_str(content)?;
        config.lockdown.validate()?;
        Ok(config)
    }
}

/// Device address and credentials
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Device IP address
    pub address: IpAddr,

    /// Lockdown port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path to the pairing record property list
    pub pairing_record: PathBuf,
}

fn default_port() -> u16 {
    LOCKDOWN_PORT
}

/// Lockdown session configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LockdownConfig {
    /// Client label sent with every request
    #[serde(default = "default_label")]
    pub label: String,

    /// TCP connect timeout (milliseconds)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Read/write timeout (milliseconds). Unsupported requests may be
    /// ignored by the device rather than answered.
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,

    /// Largest accepted frame body
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,

    /// Outgoing payload encoding
    #[serde(default)]
    pub wire_format: WireFormat,

    /// Send QueryType before StartSession
    #[serde(default = "default_true")]
    pub query_type: bool,

    /// StartService errors meaning "not present on this OS version"
    #[serde(default = "default_unavailable_service_errors")]
    pub unavailable_service_errors: Vec<String>,
}

fn default_label() -> String {
    "lockwire".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_io_timeout_ms() -> u64 {
    12_000
}

fn default_max_frame_len() -> usize {
    MAX_FRAME_LEN
}

fn default_true() -> bool {
    true
}

fn default_unavailable_service_errors() -> Vec<String> {
    vec!["InvalidService".to_string()]
}

impl Default for LockdownConfig {
    fn default() -> Self {
        Self {
            label: default_label(),
            connect_timeout_ms: default_connect_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
            max_frame_len: default_max_frame_len(),
            wire_format: WireFormat::default(),
            query_type: default_true(),
            unavailable_service_errors: default_unavailable_service_errors(),
        }
    }
}

impl LockdownConfig {
    /// Reject settings the socket layer cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_ms == 0 {
            anyhow::bail!("lockdown.connect_timeout_ms must be greater than zero");
        }
        if self.io_timeout_ms == 0 {
            anyhow::bail!("lockdown.io_timeout_ms must be greater than zero");
        }
        Ok(())
    }

    /// Socket settings for lockdown and service connections
    pub fn transport(&self) -> TransportConfig {
        let io_timeout = Some(Duration::from_millis(self.io_timeout_ms));
        TransportConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            read_timeout: io_timeout,
            write_timeout: io_timeout,
            max_frame_len: self.max_frame_len,
            format: self.wire_format,
        }
    }

    /// Whether a StartService error means the service simply does not exist
    pub fn is_unavailable_error(&self, error: &str) -> bool {
        self.unavailable_service_errors.iter().any(|e| e == error)
    }
}

/// Caller-supplied catalogs driving a probe run
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogConfig {
    /// Values to query, in order
    #[serde(default)]
    pub values: Vec<ValueProbe>,

    /// Candidate service names
    #[serde(default)]
    pub services: Vec<String>,

    /// Open a connection to every started service
    #[serde(default)]
    pub connect_services: bool,
}

/// One GetValue probe: domain and key are both optional
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ValueProbe {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl ValueProbe {
    pub fn key(domain: Option<&str>, key: &str) -> Self {
        Self {
            domain: domain.map(str::to_string),
            key: Some(key.to_string()),
        }
    }

    pub fn domain(domain: &str) -> Self {
        Self {
            domain: Some(domain.to_string()),
            key: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_lockdown_config() {
        let config = LockdownConfig::default();
        assert_eq!(config.label, "lockwire");
        assert_eq!(config.io_timeout_ms, 12_000);
        assert_eq!(config.max_frame_len, MAX_FRAME_LEN);
        assert_eq!(config.wire_format, WireFormat::Binary);
        assert!(config.query_type);
        assert!(config.is_unavailable_error("InvalidService"));
        assert!(!config.is_unavailable_error("ServiceProhibited"));
    }

    #[test]
    fn test_transport_settings() {
        let config = LockdownConfig {
            io_timeout_ms: 250,
            ..LockdownConfig::default()
        };
        let transport = config.transport();

        assert_eq!(transport.read_timeout, Some(Duration::from_millis(250)));
        assert_eq!(transport.write_timeout, Some(Duration::from_millis(250)));
        assert_eq!(transport.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_parse_probe_config() {
        let config = ProbeConfig::from_toml(
            r#"
[device]
address = "192.168.1.20"
pairing_record = "/var/lib/lockwire/device.plist"

[lockdown]
label = "probe"
wire_format = "xml"
unavailable_service_errors = ["InvalidService", "ServiceProhibited"]

[catalog]
services = ["com.apple.mobile.diagnostics_relay", "com.apple.mobile.notification_proxy"]
connect_services = true

[[catalog.values]]
key = "ProductVersion"

[[catalog.values]]
domain = "com.apple.disk_usage"
"#,
        )
        .unwrap();

        assert_eq!(config.device.port, LOCKDOWN_PORT);
        assert_eq!(config.lockdown.label, "probe");
        assert_eq!(config.lockdown.wire_format, WireFormat::Xml);
        assert_eq!(config.lockdown.io_timeout_ms, 12_000);
        assert!(config.lockdown.is_unavailable_error("ServiceProhibited"));
        assert_eq!(config.catalog.services.len(), 2);
        assert!(config.catalog.connect_services);
        assert_eq!(
            config.catalog.values,
            vec![
                ValueProbe::key(None, "ProductVersion"),
                ValueProbe::domain("com.apple.disk_usage"),
            ]
        );
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let device = "[device]\naddress = \"10.0.0.5\"\npairing_record = \"p.plist\"\n";

        let err = ProbeConfig::from_toml(&format!("{device}[lockdown]\nio_timeout_ms = 0\n"))
            .unwrap_err();
        assert!(err.to_string().contains("io_timeout_ms must be greater than zero"));

        let err = ProbeConfig::from_toml(&format!("{device}[lockdown]\nconnect_timeout_ms = 0\n"))
            .unwrap_err();
        assert!(err.to_string().contains("connect_timeout_ms must be greater than zero"));

        assert!(ProbeConfig::from_toml(&format!("{device}[lockdown]\nio_timeout_ms = 1\n")).is_ok());
    }

    #[test]
    fn test_missing_device_section() {
        assert!(ProbeConfig::from_toml("[lockdown]\nlabel = \"x\"\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lockwire.toml");
        std::fs::write(
            &path,
            "[device]\naddress = \"10.0.0.5\"\nport = 1234\npairing_record = \"p.plist\"\n",
        )
        .unwrap();

        let config = ProbeConfig::load(&path).unwrap();
        assert_eq!(config.device.port, 1234);
        assert!(config.catalog.values.is_empty());
    }
}
