//! Server configuration

use crate::coap_types::ContentFormat;
use crate::error::{Lwm2mError, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Registration url prefixes owned by the server itself
const RESERVED_URL_PREFIXES: [&str; 2] = ["/rd", "/bs"];

/// IP family used for outgoing requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpProtocol {
    #[default]
    Udp4,
    Udp6,
}

impl IpProtocol {
    /// Loopback address of the local CoAP proxy
    pub fn proxy_host(self) -> IpAddr {
        match self {
            Self::Udp4 => IpAddr::V4(Ipv4Addr::LOCALHOST),
            Self::Udp6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
        }
    }

    /// Wildcard address for binding client sockets
    pub fn unspecified(self) -> IpAddr {
        match self {
            Self::Udp4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Self::Udp6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    /// `coap://` uri of a device, bracketing the host for IPv6
    pub fn device_uri(self, address: IpAddr, port: u16) -> String {
        match self {
            Self::Udp4 => format!("coap://{}:{}", address, port),
            Self::Udp6 => format!("coap://[{}]:{}", address, port),
        }
    }
}

/// Device type matched against the registration url
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceType {
    pub name: String,
    pub url: String,
}

/// Where bootstrap scripts are read from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeviceSettingConfig {
    /// One `<root_path>/<endpoint>.setting` file per device
    File {
        #[serde(default = "default_setting_root")]
        root_path: PathBuf,
    },
    /// `bootstraps(name, setting)` table in a SQLite database
    Sqlite { path: PathBuf },
}

impl Default for DeviceSettingConfig {
    fn default() -> Self {
        Self::File {
            root_path: default_setting_root(),
        }
    }
}

/// LWM2M server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Local CoAP port, also the port of the local proxy (default: 5683)
    #[serde(default = "default_port")]
    pub port: u16,

    /// IP family for proxy addressing and client sockets
    #[serde(default)]
    pub ip_protocol: IpProtocol,

    /// Content format of write, execute and bootstrap-write payloads
    #[serde(default)]
    pub write_format: ContentFormat,

    /// Prefix of the registration Location-Path
    #[serde(default)]
    pub base_root: Option<String>,

    /// Type assigned to devices registering under `/rd`
    #[serde(default)]
    pub default_type: Option<String>,

    /// Device types registered under their own url
    #[serde(default)]
    pub types: Vec<DeviceType>,

    /// Time after registration beyond which Q-binding devices get queued requests
    #[serde(default = "default_queue_delay_threshold")]
    pub queue_delay_threshold_ms: u64,

    /// How long to wait for a device reply
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Period of the registry expiry scan
    #[serde(default = "default_lifetime_check_interval")]
    pub lifetime_check_interval_secs: u64,

    #[serde(default)]
    pub device_setting: DeviceSettingConfig,

    /// Filter directive for the demo's log subscriber
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_port() -> u16 {
    5683
}

fn default_queue_delay_threshold() -> u64 {
    1000
}

fn default_request_timeout() -> u64 {
    30
}

fn default_lifetime_check_interval() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_setting_root() -> PathBuf {
    PathBuf::from("/tmp")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            ip_protocol: IpProtocol::default(),
            write_format: ContentFormat::default(),
            base_root: None,
            default_type: None,
            types: Vec::new(),
            queue_delay_threshold_ms: default_queue_delay_threshold(),
            request_timeout_secs: default_request_timeout(),
            lifetime_check_interval_secs: default_lifetime_check_interval(),
            device_setting: DeviceSettingConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// Load and validate configuration from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject type urls that collide with the registration or bootstrap routes,
    /// and zero timer periods
    pub fn validate(&self) -> Result<()> {
        if self.lifetime_check_interval_secs == 0 {
            return Err(Lwm2mError::InvalidConfig(
                "lifetime_check_interval_secs must be at least 1".into(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(Lwm2mError::InvalidConfig(
                "request_timeout_secs must be at least 1".into(),
            ));
        }
        for device_type in &self.types {
            if RESERVED_URL_PREFIXES
                .iter()
                .any(|prefix| device_type.url.starts_with(prefix))
            {
                return Err(Lwm2mError::IllegalTypeUrl(device_type.url.clone()));
            }
        }
        Ok(())
    }

    pub fn queue_delay_threshold(&self) -> Duration {
        Duration::from_millis(self.queue_delay_threshold_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn lifetime_check_interval(&self) -> Duration {
        Duration::from_secs(self.lifetime_check_interval_secs)
    }

    /// Location-Path of a registered device: `<baseRoot>/rd/<id>`
    pub fn registration_location(&self, device_id: u64) -> String {
        let base = self.base_root.as_deref().unwrap_or("").trim_end_matches('/');
        format!("{}/rd/{}", base, device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config: ServerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.port, 5683);
        assert_eq!(config.ip_protocol, IpProtocol::Udp4);
        assert_eq!(config.write_format, ContentFormat::Text);
        assert_eq!(config.queue_delay_threshold(), Duration::from_millis(1000));
        assert_eq!(config.device_setting, DeviceSettingConfig::default());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "port": 5690,
                "ip_protocol": "udp6",
                "write_format": "tlv",
                "base_root": "/lwm2m",
                "types": [{{"name": "sensor", "url": "/sensors"}}],
                "device_setting": {{"type": "sqlite", "path": "/var/lib/bs.db"}}
            }}"#
        )
        .unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.port, 5690);
        assert_eq!(config.write_format, ContentFormat::Tlv);
        assert_eq!(config.registration_location(4), "/lwm2m/rd/4");
        assert_eq!(
            config.device_setting,
            DeviceSettingConfig::Sqlite {
                path: PathBuf::from("/var/lib/bs.db")
            }
        );
    }

    #[test]
    fn test_reserved_type_urls_rejected() {
        for url in ["/rd/sensors", "/bs"] {
            let config = ServerConfig {
                types: vec![DeviceType {
                    name: "bad".into(),
                    url: url.into(),
                }],
                ..ServerConfig::default()
            };
            assert!(matches!(
                config.validate(),
                Err(Lwm2mError::IllegalTypeUrl(u)) if u == url
            ));
        }
    }

    #[test]
    fn test_zero_timer_periods_rejected() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"lifetime_check_interval_secs": 0}"#).unwrap();
        assert!(matches!(
            config.validate(),
            Err(Lwm2mError::InvalidConfig(msg)) if msg.contains("lifetime_check_interval_secs")
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"request_timeout_secs": 0}}"#).unwrap();
        assert!(matches!(
            ServerConfig::from_file(file.path()),
            Err(Lwm2mError::InvalidConfig(_))
        ));

        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_proxy_uri_forms() {
        let v6: IpAddr = "fe80::1".parse().unwrap();
        assert_eq!(
            IpProtocol::Udp6.device_uri(v6, 5683),
            "coap://[fe80::1]:5683"
        );
        assert_eq!(
            IpProtocol::Udp4.device_uri("10.0.0.2".parse().unwrap(), 56830),
            "coap://10.0.0.2:56830"
        );
        assert_eq!(
            IpProtocol::Udp6.proxy_host(),
            IpAddr::V6(Ipv6Addr::LOCALHOST)
        );
    }
}
