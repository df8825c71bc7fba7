use thiserror::Error;

/// Top-level error type that encompasses all subsystem failures
#[derive(Debug, Error)]
pub enum SdkError {
    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] MqttError),

    #[error("Thing-model error: {0}")]
    ThingModel(#[from] TmError),

    #[error("OTA error: {0}")]
    Ota(#[from] OtaError),

    #[error("Realtime error: {0}")]
    Realtime(#[from] RealtimeError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not initialised: {0}")]
    NotInitialised(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Authentication and registration errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Missing secret for auth mode: {0}")]
    MissingSecret(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server rejected registration: code {code}, {message}")]
    Server { code: i64, message: String },

    #[error("Decrypt error: {0}")]
    Decrypt(String),
}

/// HTTP engine errors
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Connect timeout")]
    ConnectTimeout,

    #[error("Read timeout")]
    ReadTimeout,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("HTTP status {0}: {1}")]
    Status(u16, String),

    #[error("Response body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Download size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Download signature mismatch: expected {expected}, got {actual}")]
    SignatureMismatch { expected: String, actual: String },

    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// MQTT session errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Publish queue full")]
    QueueFull,

    #[error("Topic validation error: {0}")]
    TopicValidation(String),

    #[error("MQTT protocol error: {0}")]
    Protocol(String),

    #[error("Session closed")]
    Closed,
}

/// Thing-model codec errors
#[derive(Debug, Error)]
pub enum TmError {
    #[error("Message parsing error: {0}")]
    Parse(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] MqttError),
}

/// OTA orchestration errors
#[derive(Debug, Error)]
pub enum OtaError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown module: {0}")]
    UnknownModule(String),

    #[error("URL decrypt error: {0}")]
    Decrypt(String),

    #[error("Downloaded size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Downloaded file signature mismatch: expected {expected}, got {actual}")]
    SignatureMismatch { expected: String, actual: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] MqttError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OtaError {
    /// Numeric code reported in `result_code` of progress payloads.
    pub fn result_code(&self) -> i32 {
        match self {
            OtaError::InvalidArgument(_) => 100,
            OtaError::UnknownModule(_) => 101,
            OtaError::Decrypt(_) => 102,
            OtaError::SizeMismatch { .. } => 103,
            OtaError::SignatureMismatch { .. } => 104,
            OtaError::Persistence(_) => 105,
            OtaError::InstallFailed(_) => 106,
            OtaError::Http(_) => 107,
            OtaError::Mqtt(_) => 108,
            OtaError::Io(_) => 109,
        }
    }
}

/// Realtime WebSocket session errors
#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Event parsing error: {0}")]
    Parse(String),

    #[error("Session closed")]
    Closed,
}

/// Result type alias for SDK-level operations
pub type SdkResult<T> = Result<T, SdkError>;

/// Result type alias for auth operations
pub type AuthResult<T> = Result<T, AuthError>;

/// Result type alias for HTTP operations
pub type HttpResult<T> = Result<T, HttpError>;

/// Result type alias for MQTT operations
pub type MqttResult<T> = Result<T, MqttError>;

/// Result type alias for thing-model operations
pub type TmResult<T> = Result<T, TmError>;

/// Result type alias for OTA operations
pub type OtaResult<T> = Result<T, OtaError>;

/// Result type alias for realtime operations
pub type RealtimeResult<T> = Result<T, RealtimeError>;
