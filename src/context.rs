use crate::chat::ChatClient;
use crate::error::{SdkError, SdkResult};
use crate::gateway::{self, GatewayConfig};
use crate::http_client::HttpClient;
use crate::log_report::LogReporter;
use crate::logging::{self, LoggingConfig};
use crate::mqtt_session::{IotChannel, MqttHandle, MqttSession, SessionState};
use crate::ota::OtaManager;
use crate::realtime::RealtimeSession;
use crate::registrar;
use crate::thing_model::ThingModel;
use crate::types::{
    DeviceIdentity, EndpointSet, LogUploadConfig, MqttConfig, OtaConfig, RealtimeConfig,
};
use std::sync::Arc;
use tracing::info;

/// Everything a device process hands the SDK at startup.
#[derive(Debug, Clone)]
pub struct SdkConfig {
    pub identity: DeviceIdentity,
    pub endpoints: EndpointSet,
    /// MQTT session; `None` for AI-only deployments.
    pub mqtt: Option<MqttConfig>,
    /// OTA orchestration (requires MQTT).
    pub ota: Option<OtaConfig>,
    /// Log upload (requires MQTT).
    pub log_upload: Option<LogUploadConfig>,
    /// Chat and realtime access through the AI gateway.
    pub enable_ai: bool,
    pub realtime: RealtimeConfig,
    /// Internal diagnostics; `None` leaves the subscriber untouched.
    pub logging: Option<LoggingConfig>,
}

impl SdkConfig {
    pub fn new(identity: DeviceIdentity, endpoints: EndpointSet) -> Self {
        Self {
            identity,
            endpoints,
            mqtt: None,
            ota: None,
            log_upload: None,
            enable_ai: false,
            realtime: RealtimeConfig::default(),
            logging: None,
        }
    }
}

/// Top-level context: wires the subsystems together and orders their
/// lifecycle. Owns every component it constructs.
pub struct DeviceContext {
    identity: Arc<DeviceIdentity>,
    endpoints: EndpointSet,
    http: HttpClient,
    gateway: Option<GatewayConfig>,
    realtime_config: RealtimeConfig,
    mqtt: Option<MqttSession>,
    chat: Option<ChatClient>,
    thing_model: Option<ThingModel>,
    ota: Option<OtaManager>,
    log_reporter: Option<LogReporter>,
}

impl DeviceContext {
    /// Initialise the context: validate the identity, run dynamic
    /// registration when the device secret is missing, fetch the
    /// gateway config when AI features are on, then construct the
    /// configured components (MQTT consumers included).
    pub async fn init(config: SdkConfig) -> SdkResult<Self> {
        if let Some(logging_config) = &config.logging {
            logging::init_logging(logging_config);
        }
        config.identity.verify_secrets()?;
        let needs_http = config.enable_ai || config.identity.device_secret().is_none();
        config.endpoints.verify(needs_http, config.mqtt.is_some())?;

        let http = HttpClient::new();
        let mut identity = config.identity;
        if identity.device_secret().is_none() {
            let secret = registrar::dynamic_register(&http, &config.endpoints, &identity).await?;
            identity.device_secret = Some(secret);
        }
        let identity = Arc::new(identity);

        let gateway = if config.enable_ai {
            Some(gateway::fetch_gateway_config(&http, &config.endpoints, &identity).await?)
        } else {
            None
        };
        let chat = gateway
            .as_ref()
            .map(|gw| ChatClient::new(&gw.url, &gw.api_key, Arc::clone(&identity)));

        let mut context = Self {
            identity: Arc::clone(&identity),
            endpoints: config.endpoints,
            http,
            gateway,
            realtime_config: config.realtime,
            mqtt: None,
            chat,
            thing_model: None,
            ota: None,
            log_reporter: None,
        };

        if let Some(mqtt_config) = config.mqtt {
            let session = MqttSession::new(
                Arc::clone(&identity),
                context.endpoints.clone(),
                mqtt_config,
            );
            let handle: Arc<dyn IotChannel> = Arc::new(session.handle());
            context.mqtt = Some(session);

            context.thing_model = Some(ThingModel::attach(
                Arc::clone(&handle),
                &identity.product_key,
                &identity.device_name,
            )?);
            if let Some(ota_config) = &config.ota {
                context.ota = Some(OtaManager::attach(
                    Arc::clone(&handle),
                    &identity,
                    ota_config,
                    context.endpoints.ca_pem.clone(),
                )?);
            }
            if let Some(log_config) = &config.log_upload {
                context.log_reporter = Some(LogReporter::attach(
                    Arc::clone(&handle),
                    &identity.product_key,
                    &identity.device_name,
                    log_config,
                )?);
            }
        }

        info!(device = %identity.device_name, "device context initialised");
        Ok(context)
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    pub fn gateway_config(&self) -> Option<&GatewayConfig> {
        self.gateway.as_ref()
    }

    /// Chat client; present when AI features were enabled at init.
    pub fn chat(&self) -> Option<&ChatClient> {
        self.chat.as_ref()
    }

    pub fn thing_model(&self) -> Option<&ThingModel> {
        self.thing_model.as_ref()
    }

    pub fn ota(&self) -> Option<&OtaManager> {
        self.ota.as_ref()
    }

    pub fn log_reporter(&self) -> Option<&LogReporter> {
        self.log_reporter.as_ref()
    }

    /// Clone-able handle onto the MQTT session's queues.
    pub fn mqtt_handle(&self) -> Option<MqttHandle> {
        self.mqtt.as_ref().map(MqttSession::handle)
    }

    pub fn mqtt_state(&self) -> SessionState {
        self.mqtt
            .as_ref()
            .map(MqttSession::state)
            .unwrap_or(SessionState::Idle)
    }

    /// Open the MQTT connection. The session becomes usable once the
    /// event loop (driven via [`DeviceContext::run_mqtt_event_loop`])
    /// observes CONNACK.
    pub fn connect(&mut self) -> SdkResult<()> {
        let session = self
            .mqtt
            .as_mut()
            .ok_or_else(|| SdkError::NotInitialised("mqtt not configured".to_string()))?;
        session.connect()?;
        Ok(())
    }

    /// One iteration of the MQTT event loop; also ticks the log
    /// reporter's flush deadline.
    pub async fn run_mqtt_event_loop(&mut self, timeout_ms: u64) -> SdkResult<()> {
        let session = self
            .mqtt
            .as_mut()
            .ok_or_else(|| SdkError::NotInitialised("mqtt not configured".to_string()))?;
        session.run_event_loop(timeout_ms).await?;
        if let Some(reporter) = &self.log_reporter {
            reporter.tick();
        }
        Ok(())
    }

    /// Open a realtime session against the configured gateway.
    pub async fn connect_realtime(&self) -> SdkResult<RealtimeSession> {
        let gateway = self
            .gateway
            .as_ref()
            .ok_or_else(|| SdkError::NotInitialised("AI gateway not configured".to_string()))?;
        let session =
            RealtimeSession::connect(&gateway.ws_host(), &self.realtime_config, &self.identity)
                .await?;
        Ok(session)
    }

    /// Tear the context down: pending MQTT work is dropped.
    pub async fn shutdown(&mut self) {
        if let Some(reporter) = &self.log_reporter {
            reporter.flush();
        }
        if let Some(session) = self.mqtt.as_mut() {
            session.close().await;
        }
        info!("device context shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AuthMode;

    fn config() -> SdkConfig {
        SdkConfig::new(
            DeviceIdentity {
                instance_id: "inst".to_string(),
                product_key: "pk".to_string(),
                product_secret: None,
                device_name: "dn".to_string(),
                device_secret: Some("0123456789abcdef".to_string()),
                auth_mode: AuthMode::DeviceSecret,
            },
            EndpointSet {
                http_host: "iot.example.com".to_string(),
                mqtt_host: "mqtt.example.com".to_string(),
                mqtt_port: 1883,
                enable_tls: false,
                ca_pem: None,
            },
        )
    }

    #[tokio::test]
    async fn test_init_without_transports() {
        let context = DeviceContext::init(config()).await.unwrap();
        assert!(context.chat().is_none());
        assert!(context.thing_model().is_none());
        assert!(context.mqtt_handle().is_none());
        assert_eq!(context.mqtt_state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_init_wires_mqtt_consumers() {
        let mut cfg = config();
        cfg.mqtt = Some(MqttConfig::default());
        let dir = tempfile::tempdir().unwrap();
        cfg.ota = Some(OtaConfig {
            download_dir: dir.path().join("dl"),
            state_dir: dir.path().join("state"),
        });
        cfg.log_upload = Some(LogUploadConfig::default());

        let context = DeviceContext::init(cfg).await.unwrap();
        assert!(context.thing_model().is_some());
        assert!(context.ota().is_some());
        assert!(context.log_reporter().is_some());
        assert!(context.mqtt_handle().is_some());
    }

    #[tokio::test]
    async fn test_init_rejects_identity_without_secrets() {
        let mut cfg = config();
        cfg.identity.device_secret = None;
        // Device-secret mode with no secret fails before any network IO.
        assert!(DeviceContext::init(cfg).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_requires_mqtt_config() {
        let mut context = DeviceContext::init(config()).await.unwrap();
        assert!(matches!(
            context.connect(),
            Err(SdkError::NotInitialised(_))
        ));
    }
}
