use crate::error::{MqttError, MqttResult};
use crate::signer::{self, SignedRequestParams};
use crate::topic::topic_matches;
use crate::types::{AuthMode, DeviceIdentity, EndpointSet, MqttConfig};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, SubscribeFilter,
    TlsConfiguration, Transport,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Maximum topics batched into one SUBSCRIBE packet.
const MAX_SUBSCRIBE_BATCH: usize = 7;
/// Bound on the deferred publish queue.
const MAX_PENDING_PUBLISHES: usize = 10;

/// Callback invoked for inbound messages; topic and payload are borrowed
/// for the duration of the call only.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// QoS levels the platform supports. QoS 2 is excluded by contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
}

impl From<Qos> for rumqttc::QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => rumqttc::QoS::AtMostOnce,
            Qos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// Publish/subscribe seam between the session and its consumers
/// (thing model, OTA, log upload). Mirrors the session handle; a mock
/// implementation backs the tests.
pub trait IotChannel: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8], qos: Qos) -> MqttResult<()>;
    fn subscribe(&self, topic: &str, qos: Qos, handler: MessageHandler) -> MqttResult<()>;
    fn state(&self) -> SessionState;
}

#[derive(Clone)]
struct Subscription {
    topic: String,
    qos: Qos,
    handler: MessageHandler,
}

#[derive(Clone)]
struct PendingPublish {
    topic: String,
    payload: Vec<u8>,
    qos: Qos,
}

/// Deferred-work state of one session: pending and active subscriptions,
/// the pending publish queue, and the two in-flight gates. Pure queue
/// logic, driven by the event loop and unit-tested standalone.
#[derive(Default)]
struct SessionQueues {
    pending_subscriptions: VecDeque<Subscription>,
    inflight_subscribe: Vec<Subscription>,
    active_subscriptions: Vec<Subscription>,
    pending_publishes: VecDeque<PendingPublish>,
    inflight_publish: Option<PendingPublish>,
    awaiting_suback: bool,
    awaiting_puback: bool,
}

impl SessionQueues {
    fn new() -> Self {
        Self::default()
    }

    /// Record a subscription request. A topic already known (active,
    /// in flight or pending) is accepted as a no-op, so a topic can
    /// never be active and pending at the same time.
    fn enqueue_subscription(&mut self, sub: Subscription) {
        let known = self
            .active_subscriptions
            .iter()
            .chain(self.inflight_subscribe.iter())
            .chain(self.pending_subscriptions.iter())
            .any(|s| s.topic == sub.topic);
        if known {
            debug!(topic = %sub.topic, "already subscribed, skipping");
            return;
        }
        self.pending_subscriptions.push_back(sub);
    }

    fn enqueue_publish(&mut self, publish: PendingPublish) -> MqttResult<()> {
        if self.pending_publishes.len() >= MAX_PENDING_PUBLISHES {
            return Err(MqttError::QueueFull);
        }
        self.pending_publishes.push_back(publish);
        Ok(())
    }

    /// Take the next SUBSCRIBE batch (≤ 7 topics) unless one is already
    /// in flight.
    fn next_subscribe_batch(&mut self) -> Option<Vec<(String, Qos)>> {
        if self.awaiting_suback || self.pending_subscriptions.is_empty() {
            return None;
        }
        let count = self.pending_subscriptions.len().min(MAX_SUBSCRIBE_BATCH);
        let mut filters = Vec::with_capacity(count);
        for _ in 0..count {
            let sub = self.pending_subscriptions.pop_front().unwrap();
            filters.push((sub.topic.clone(), sub.qos));
            self.inflight_subscribe.push(sub);
        }
        self.awaiting_suback = true;
        Some(filters)
    }

    /// SUBACK arrived: move the acknowledged batch into the active set,
    /// skipping topics already present.
    fn complete_suback(&mut self) {
        for sub in self.inflight_subscribe.drain(..) {
            if self.active_subscriptions.iter().any(|s| s.topic == sub.topic) {
                debug!(topic = %sub.topic, "duplicate SUBACK topic, keeping existing handler");
                continue;
            }
            self.active_subscriptions.push(sub);
        }
        self.awaiting_suback = false;
    }

    /// Publishes to send on this writable pass: leading QoS0 entries
    /// flush freely; the first QoS1 entry is sent alone and gates the
    /// queue until its PUBACK.
    fn next_publishes(&mut self) -> Vec<PendingPublish> {
        let mut out = Vec::new();
        if self.awaiting_puback {
            return out;
        }
        while let Some(front) = self.pending_publishes.front() {
            match front.qos {
                Qos::AtMostOnce => out.push(self.pending_publishes.pop_front().unwrap()),
                Qos::AtLeastOnce => {
                    let publish = self.pending_publishes.pop_front().unwrap();
                    self.inflight_publish = Some(publish.clone());
                    self.awaiting_puback = true;
                    out.push(publish);
                    break;
                }
            }
        }
        out
    }

    fn complete_puback(&mut self) {
        self.inflight_publish = None;
        self.awaiting_puback = false;
    }

    /// Connection lost: everything previously active or in flight is
    /// re-queued, in original subscribe order, with handlers intact.
    fn on_disconnect(&mut self) {
        let mut requeued: VecDeque<Subscription> = self
            .active_subscriptions
            .drain(..)
            .chain(self.inflight_subscribe.drain(..))
            .collect();
        requeued.append(&mut self.pending_subscriptions);
        self.pending_subscriptions = requeued;
        self.awaiting_suback = false;

        if let Some(publish) = self.inflight_publish.take() {
            self.pending_publishes.push_front(publish);
        }
        self.awaiting_puback = false;
    }

    fn has_work(&self) -> bool {
        (!self.awaiting_suback && !self.pending_subscriptions.is_empty())
            || (!self.awaiting_puback && !self.pending_publishes.is_empty())
    }

    /// First active subscription matching the incoming topic.
    fn find_handler(&self, topic: &str) -> Option<MessageHandler> {
        self.active_subscriptions
            .iter()
            .find(|s| topic_matches(&s.topic, topic))
            .map(|s| Arc::clone(&s.handler))
    }

    fn clear(&mut self) {
        *self = SessionQueues::default();
    }
}

/// Clone-able session handle that consumers publish and subscribe
/// through. All work is deferred onto the session's queues and flushed
/// by the event loop.
#[derive(Clone)]
pub struct MqttHandle {
    queues: Arc<Mutex<SessionQueues>>,
    state: Arc<Mutex<SessionState>>,
}

impl IotChannel for MqttHandle {
    fn publish(&self, topic: &str, payload: &[u8], qos: Qos) -> MqttResult<()> {
        if topic.is_empty() {
            return Err(MqttError::TopicValidation("topic cannot be empty".to_string()));
        }
        if *self.state.lock().unwrap() == SessionState::Closed {
            return Err(MqttError::Closed);
        }
        self.queues.lock().unwrap().enqueue_publish(PendingPublish {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
        })
    }

    fn subscribe(&self, topic: &str, qos: Qos, handler: MessageHandler) -> MqttResult<()> {
        if topic.is_empty() {
            return Err(MqttError::TopicValidation("topic cannot be empty".to_string()));
        }
        if *self.state.lock().unwrap() == SessionState::Closed {
            return Err(MqttError::Closed);
        }
        self.queues.lock().unwrap().enqueue_subscription(Subscription {
            topic: topic.to_string(),
            qos,
            handler,
        });
        Ok(())
    }

    fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }
}

/// MQTT session engine: owns the rumqttc client and event loop, applies
/// the deferred queues under the platform's flow-control rules, and
/// dispatches inbound messages to per-topic handlers.
///
/// The caller drives it by calling [`MqttSession::run_event_loop`] in a
/// loop, typically from a dedicated task.
pub struct MqttSession {
    identity: Arc<DeviceIdentity>,
    endpoints: EndpointSet,
    config: MqttConfig,
    queues: Arc<Mutex<SessionQueues>>,
    state: Arc<Mutex<SessionState>>,
    client: Option<AsyncClient>,
    event_loop: Option<EventLoop>,
}

impl MqttSession {
    pub fn new(identity: Arc<DeviceIdentity>, endpoints: EndpointSet, config: MqttConfig) -> Self {
        Self {
            identity,
            endpoints,
            config,
            queues: Arc::new(Mutex::new(SessionQueues::new())),
            state: Arc::new(Mutex::new(SessionState::Idle)),
            client: None,
            event_loop: None,
        }
    }

    /// Handle for consumers; valid for the session's lifetime.
    pub fn handle(&self) -> MqttHandle {
        MqttHandle {
            queues: Arc::clone(&self.queues),
            state: Arc::clone(&self.state),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    /// Session username: `<product_key>|<device_name>`.
    fn username(identity: &DeviceIdentity) -> String {
        format!("{}|{}", identity.product_key, identity.device_name)
    }

    /// Session password:
    /// `<auth_type>|<random>|<timestamp>|<signature>`, signed with the
    /// device secret. The password field only admits the dynamic auth
    /// types, so device-secret identities sign as pre-registered.
    fn password(identity: &DeviceIdentity) -> MqttResult<String> {
        let secret = identity
            .device_secret()
            .ok_or_else(|| MqttError::Configuration("device_secret missing".to_string()))?;
        let auth_mode = match identity.auth_mode {
            AuthMode::DeviceSecret => AuthMode::DynamicPreRegistered,
            other => other,
        };
        let params = SignedRequestParams::generate();
        let signature = signer::sign_as(identity, auth_mode, &params, secret);
        Ok(format!(
            "{}|{}|{}|{}",
            auth_mode.wire_value(),
            params.random_num,
            params.timestamp_ms,
            signature
        ))
    }

    fn mqtt_options(&self) -> MqttResult<MqttOptions> {
        self.endpoints
            .verify(false, true)
            .map_err(|e| MqttError::Configuration(e.to_string()))?;
        let username = Self::username(&self.identity);
        let password = Self::password(&self.identity)?;
        let port = if self.endpoints.mqtt_port != 0 {
            self.endpoints.mqtt_port
        } else if self.endpoints.enable_tls {
            8883
        } else {
            1883
        };

        let mut options = MqttOptions::new(username.clone(), &self.endpoints.mqtt_host, port);
        options.set_credentials(username, password);
        // rumqttc emits PINGREQ on the keep-alive cadence, so the ping
        // interval folds into it when tighter.
        let keepalive = self
            .config
            .keepalive_interval_s
            .min(self.config.ping_interval_s)
            .max(5);
        options.set_keep_alive(Duration::from_secs(u64::from(keepalive)));
        options.set_clean_session(true);

        if self.endpoints.enable_tls {
            options.set_transport(Transport::Tls(self.tls_config()?));
        }
        Ok(options)
    }

    fn tls_config(&self) -> MqttResult<TlsConfiguration> {
        let mut root_cert_store = rustls::RootCertStore::empty();
        if let Some(ca_pem) = &self.endpoints.ca_pem {
            let certs = rustls_pemfile::certs(&mut ca_pem.as_bytes())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| MqttError::Configuration(format!("bad CA PEM: {e}")))?;
            for cert in certs {
                root_cert_store
                    .add(cert)
                    .map_err(|e| MqttError::Configuration(format!("bad CA cert: {e}")))?;
            }
        } else {
            root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
        let client_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();
        Ok(TlsConfiguration::Rustls(Arc::new(client_config)))
    }

    /// Open the connection. The session reaches `Connected` once the
    /// event loop observes CONNACK.
    pub fn connect(&mut self) -> MqttResult<()> {
        let options = self.mqtt_options()?;
        info!(host = %self.endpoints.mqtt_host, "connecting MQTT session");
        let (client, event_loop) = AsyncClient::new(options, 10);
        self.client = Some(client);
        self.event_loop = Some(event_loop);
        *self.state.lock().unwrap() = SessionState::Connecting;
        Ok(())
    }

    /// Close the session and drop all deferred work.
    pub async fn close(&mut self) {
        if let Some(client) = &self.client {
            let _ = client.disconnect().await;
        }
        self.client = None;
        self.event_loop = None;
        self.queues.lock().unwrap().clear();
        *self.state.lock().unwrap() = SessionState::Closed;
    }

    /// Run one event-loop iteration: flush deferred work permitted by
    /// the flow-control gates, then wait up to `timeout_ms` for the next
    /// network event and process it.
    pub async fn run_event_loop(&mut self, timeout_ms: u64) -> MqttResult<()> {
        if self.event_loop.is_none() {
            return Err(MqttError::NotConnected);
        }
        if self.state() == SessionState::Connected {
            self.flush().await?;
        }

        let event_loop = self.event_loop.as_mut().unwrap();
        let polled = tokio::time::timeout(Duration::from_millis(timeout_ms), event_loop.poll()).await;
        match polled {
            Err(_) => Ok(()), // idle tick
            Ok(Ok(event)) => self.handle_event(event).await,
            Ok(Err(e)) => self.handle_transport_error(e).await,
        }
    }

    async fn handle_event(&mut self, event: Event) -> MqttResult<()> {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code == ConnectReturnCode::Success {
                    info!("MQTT session established");
                    *self.state.lock().unwrap() = SessionState::Connected;
                    self.flush().await?;
                } else {
                    warn!(code = ?ack.code, "broker refused connection");
                    *self.state.lock().unwrap() = SessionState::Reconnecting;
                }
            }
            Event::Incoming(Packet::SubAck(_)) => {
                self.queues.lock().unwrap().complete_suback();
                self.flush().await?;
            }
            Event::Incoming(Packet::PubAck(_)) => {
                self.queues.lock().unwrap().complete_puback();
                self.flush().await?;
            }
            Event::Incoming(Packet::Publish(publish)) => {
                let handler = self.queues.lock().unwrap().find_handler(&publish.topic);
                match handler {
                    Some(handler) => handler(&publish.topic, &publish.payload),
                    None => debug!(topic = %publish.topic, "no subscription matches inbound message"),
                }
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("broker closed the session");
                self.on_connection_lost();
            }
            _ => {}
        }
        Ok(())
    }

    async fn handle_transport_error(&mut self, e: rumqttc::ConnectionError) -> MqttResult<()> {
        error!("MQTT transport error: {e}");
        self.on_connection_lost();
        if !self.config.auto_reconnect {
            self.client = None;
            self.event_loop = None;
            *self.state.lock().unwrap() = SessionState::Closed;
            return Err(MqttError::Connection(e.to_string()));
        }
        // rumqttc reconnects on the next poll; pace the retry.
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(())
    }

    fn on_connection_lost(&mut self) {
        *self.state.lock().unwrap() = SessionState::Reconnecting;
        self.queues.lock().unwrap().on_disconnect();
    }

    /// Flush deferred work under the flow-control gates: at most one
    /// in-flight SUBSCRIBE batch; publishes wait for SUBACK, then QoS0
    /// flush freely and QoS1 is strictly serialised.
    async fn flush(&mut self) -> MqttResult<()> {
        let Some(client) = self.client.clone() else {
            return Err(MqttError::NotConnected);
        };

        let batch = self.queues.lock().unwrap().next_subscribe_batch();
        if let Some(filters) = batch {
            debug!(count = filters.len(), "sending SUBSCRIBE batch");
            let filters: Vec<SubscribeFilter> = filters
                .into_iter()
                .map(|(topic, qos)| SubscribeFilter::new(topic, qos.into()))
                .collect();
            client
                .subscribe_many(filters)
                .await
                .map_err(|e| MqttError::Protocol(format!("subscribe failed: {e}")))?;
            return Ok(());
        }
        if self.queues.lock().unwrap().awaiting_suback {
            return Ok(());
        }

        let publishes = self.queues.lock().unwrap().next_publishes();
        for publish in publishes {
            debug!(topic = %publish.topic, bytes = publish.payload.len(), "publishing");
            client
                .publish(&publish.topic, publish.qos.into(), false, publish.payload)
                .await
                .map_err(|e| MqttError::Protocol(format!("publish failed: {e}")))?;
        }
        Ok(())
    }
}

/// In-memory channel that records published messages and dispatches
/// injected inbound messages, for tests of channel consumers.
#[derive(Default)]
pub struct MockIotChannel {
    published: Mutex<Vec<(String, Vec<u8>, Qos)>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl MockIotChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(t, p, _)| (t.clone(), p.clone()))
            .collect()
    }

    pub fn clear_published(&self) {
        self.published.lock().unwrap().clear();
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.topic.clone())
            .collect()
    }

    /// Deliver an inbound message to the first matching subscription,
    /// the way the session dispatches.
    pub fn inject(&self, topic: &str, payload: &[u8]) -> bool {
        let handler = self
            .subscriptions
            .lock()
            .unwrap()
            .iter()
            .find(|s| topic_matches(&s.topic, topic))
            .map(|s| Arc::clone(&s.handler));
        match handler {
            Some(handler) => {
                handler(topic, payload);
                true
            }
            None => false,
        }
    }
}

impl IotChannel for MockIotChannel {
    fn publish(&self, topic: &str, payload: &[u8], qos: Qos) -> MqttResult<()> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_vec(), qos));
        Ok(())
    }

    fn subscribe(&self, topic: &str, qos: Qos, handler: MessageHandler) -> MqttResult<()> {
        self.subscriptions.lock().unwrap().push(Subscription {
            topic: topic.to_string(),
            qos,
            handler,
        });
        Ok(())
    }

    fn state(&self) -> SessionState {
        SessionState::Connected
    }
}
