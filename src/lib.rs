pub mod chat;
pub mod context;
pub mod crypto;
pub mod error;
pub mod gateway;
pub mod http_client;
pub mod kv;
pub mod log_report;
pub mod logging;
pub mod mqtt_session;
pub mod ota;
pub mod realtime;
pub mod registrar;
pub mod signer;
pub mod sse;
pub mod thing_model;
pub mod topic;
pub mod types;

pub use chat::{ChatClient, ChatMessage, ChatRequest, ChatResponse, ChatTool};
pub use context::{DeviceContext, SdkConfig};
pub use error::*;
pub use gateway::GatewayConfig;
pub use http_client::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
pub use log_report::LogReporter;
pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use mqtt_session::{
    IotChannel, MessageHandler, MockIotChannel, MqttHandle, MqttSession, Qos, SessionState,
};
pub use ota::{OtaJobInfo, OtaManager, UpgradeDeviceStatus};
pub use realtime::{RealtimeCallbacks, RealtimeSession, SessionParams, TranslationSessionParams};
pub use sse::{SseFrame, SseParser};
pub use thing_model::{
    EventPost, PropertyPost, ShadowPost, ThingModel, TmEvent, TmMessage, SDK_VERSION,
};
pub use types::*;
