use crate::error::{SdkError, SdkResult};
use serde::{Deserialize, Serialize};

/// Authentication mode of a device identity.
///
/// The wire numbering matters: device-secret auth is `-1` in request
/// bodies and header strings, the dynamic modes are `0` and `1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMode {
    DeviceSecret,
    DynamicPreRegistered,
    DynamicNoPreRegistered,
}

impl AuthMode {
    pub fn wire_value(&self) -> i32 {
        match self {
            AuthMode::DeviceSecret => -1,
            AuthMode::DynamicPreRegistered => 0,
            AuthMode::DynamicNoPreRegistered => 1,
        }
    }
}

impl std::fmt::Display for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.wire_value())
    }
}

/// Immutable device identity, fixed after context init.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub instance_id: String,
    pub product_key: String,
    pub product_secret: Option<String>,
    pub device_name: String,
    pub device_secret: Option<String>,
    pub auth_mode: AuthMode,
}

impl DeviceIdentity {
    /// Check that the secrets required by `auth_mode` are present.
    ///
    /// Device-secret mode needs the device secret up front; both dynamic
    /// modes need the product secret so registration can run.
    pub fn verify_secrets(&self) -> SdkResult<()> {
        match self.auth_mode {
            AuthMode::DeviceSecret => {
                if self.device_secret.as_deref().unwrap_or("").is_empty() {
                    return Err(SdkError::Configuration(
                        "device_secret required for device-secret auth".to_string(),
                    ));
                }
            }
            AuthMode::DynamicPreRegistered | AuthMode::DynamicNoPreRegistered => {
                if self.product_secret.as_deref().unwrap_or("").is_empty() {
                    return Err(SdkError::Configuration(
                        "product_secret required for dynamic auth".to_string(),
                    ));
                }
            }
        }
        if self.product_key.is_empty() || self.device_name.is_empty() {
            return Err(SdkError::Configuration(
                "product_key and device_name must be non-empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Secret used to sign MQTT passwords and gateway requests.
    pub fn device_secret(&self) -> Option<&str> {
        self.device_secret.as_deref().filter(|s| !s.is_empty())
    }
}

/// Platform endpoints a context talks to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSet {
    pub http_host: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub enable_tls: bool,
    /// Optional PEM trust anchor used for both transports.
    pub ca_pem: Option<String>,
}

impl EndpointSet {
    pub fn verify(&self, need_http: bool, need_mqtt: bool) -> SdkResult<()> {
        if need_http && self.http_host.is_empty() {
            return Err(SdkError::Configuration("http_host must be non-empty".to_string()));
        }
        if need_mqtt && self.mqtt_host.is_empty() {
            return Err(SdkError::Configuration("mqtt_host must be non-empty".to_string()));
        }
        Ok(())
    }
}

/// MQTT session tuning knobs.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub keepalive_interval_s: u16,
    pub ping_interval_s: u16,
    pub auto_reconnect: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_s: 60,
            ping_interval_s: 60,
            auto_reconnect: true,
        }
    }
}

/// OTA orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OtaConfig {
    /// Directory downloaded packages are written to.
    pub download_dir: std::path::PathBuf,
    /// Directory the persisted job/task blobs live in.
    pub state_dir: std::path::PathBuf,
}

/// Log uploader configuration.
#[derive(Debug, Clone)]
pub struct LogUploadConfig {
    /// Flush when the pending list grows past this many lines.
    pub flush_line_count: usize,
    /// Flush at least this often.
    pub flush_interval_s: u64,
    /// Upload gate, can be flipped remotely via the config topic.
    pub upload_switch: bool,
    pub lowest_level: LogLevel,
    /// Directory `iot_<timestamp>.log` files are named under.
    pub log_dir: Option<std::path::PathBuf>,
}

impl Default for LogUploadConfig {
    fn default() -> Self {
        Self {
            flush_line_count: 30,
            flush_interval_s: 5,
            upload_switch: false,
            lowest_level: LogLevel::Debug,
            log_dir: None,
        }
    }
}

/// Realtime WebSocket session configuration.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Request path on the gateway, including the query string.
    pub path: String,
    pub send_ping: bool,
    pub ping_interval_s: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            path: "/v1/realtime?model=AG-voice-chat-agent".to_string(),
            send_ping: true,
            ping_interval_s: 110,
        }
    }
}

/// Severity of an uploaded log line. Ordered worst-first so the numeric
/// value can gate uploads (`Fatal` < `Debug`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Fatal,
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Fatal => "FATAL",
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }

    pub fn parse(s: &str) -> Option<LogLevel> {
        match s.to_ascii_uppercase().as_str() {
            "FATAL" => Some(LogLevel::Fatal),
            "ERROR" => Some(LogLevel::Error),
            "WARN" | "WARNING" => Some(LogLevel::Warn),
            "INFO" => Some(LogLevel::Info),
            "DEBUG" => Some(LogLevel::Debug),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Origin of an uploaded log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogKind {
    Sdk,
    Device,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogKind::Sdk => "sdk",
            LogKind::Device => "device",
        }
    }
}

/// Current milliseconds since the Unix epoch.
pub fn unix_timestamp_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}
