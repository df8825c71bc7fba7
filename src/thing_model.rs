use crate::error::{TmError, TmResult};
use crate::mqtt_session::{IotChannel, MessageHandler, Qos};
use crate::topic::{segment, TopicSpace};
use crate::types::unix_timestamp_ms;
use rand::Rng;
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Unique per-message identifier: `<u32 random><u64 ms-since-epoch>`.
pub fn message_id() -> String {
    format!("{}{}", rand::rng().random::<u32>(), unix_timestamp_ms())
}

/// Wrap `params` in the platform envelope `{id, version, params}`.
pub fn envelope(id: &str, params: Value) -> Value {
    json!({
        "id": id,
        "version": SDK_VERSION,
        "params": params,
    })
}

/// Property report under construction. Every value carries its sample
/// time per the platform schema.
#[derive(Debug, Clone)]
pub struct PropertyPost {
    pub id: String,
    params: Map<String, Value>,
}

impl Default for PropertyPost {
    fn default() -> Self {
        Self::new()
    }
}

impl PropertyPost {
    pub fn new() -> Self {
        Self::with_id(message_id())
    }

    pub fn with_id(id: String) -> Self {
        Self {
            id,
            params: Map::new(),
        }
    }

    pub fn add_num(&mut self, key: &str, value: f64) -> &mut Self {
        self.add_value(key, json!(value))
    }

    pub fn add_string(&mut self, key: &str, value: &str) -> &mut Self {
        self.add_value(key, json!(value))
    }

    pub fn add_value(&mut self, key: &str, value: Value) -> &mut Self {
        self.params.insert(
            key.to_string(),
            json!({ "value": value, "time": unix_timestamp_ms() }),
        );
        self
    }

    fn payload(&self) -> Value {
        envelope(&self.id, Value::Object(self.params.clone()))
    }
}

/// Event report: `{ID, Version, Params: {Time, Value}}`.
#[derive(Debug, Clone)]
pub struct EventPost {
    pub module: String,
    pub identifier: String,
    pub id: String,
    pub value: Value,
}

impl EventPost {
    pub fn new(module: &str, identifier: &str, value: Value) -> Self {
        Self {
            module: module.to_string(),
            identifier: identifier.to_string(),
            id: message_id(),
            value,
        }
    }

    fn payload(&self) -> Value {
        json!({
            "ID": self.id,
            "Version": SDK_VERSION,
            "Params": {
                "Time": unix_timestamp_ms(),
                "Value": self.value,
            },
        })
    }
}

/// Shadow report: the reported keys ride inside
/// `params: {version: <ms>, report: {...}}`.
#[derive(Debug, Clone)]
pub struct ShadowPost {
    pub id: String,
    report: Map<String, Value>,
}

impl Default for ShadowPost {
    fn default() -> Self {
        Self::new()
    }
}

impl ShadowPost {
    pub fn new() -> Self {
        Self {
            id: message_id(),
            report: Map::new(),
        }
    }

    pub fn add(&mut self, key: &str, value: Value) -> &mut Self {
        self.report.insert(key.to_string(), value);
        self
    }

    fn payload(&self) -> Value {
        envelope(
            &self.id,
            json!({
                "version": unix_timestamp_ms(),
                "report": Value::Object(self.report.clone()),
            }),
        )
    }
}

/// Outbound thing-model messages.
#[derive(Debug, Clone)]
pub enum TmMessage {
    PropertyPost(PropertyPost),
    PropertySetReply { msg_id: String, code: i32 },
    EventPost(EventPost),
    ServiceCallReply {
        module: String,
        identifier: String,
        topic_uuid: String,
        msg_id: String,
        code: i32,
        data: Value,
    },
    CustomTopicPost { suffix: String, payload_json: String },
    ShadowPost(ShadowPost),
    ShadowGet,
    ShadowClear,
    DeviceDelayReply { uuid: String },
    WebshellReply { uid: String },
    WebshellPong { uid: String, status: String },
}

impl TmMessage {
    fn topic(&self, topics: &TopicSpace) -> String {
        match self {
            TmMessage::PropertyPost(_) => topics.property_post(),
            TmMessage::PropertySetReply { .. } => topics.property_set_reply(),
            TmMessage::EventPost(event) => topics.event_post(&event.module, &event.identifier),
            TmMessage::ServiceCallReply {
                module,
                identifier,
                topic_uuid,
                ..
            } => topics.service_call_reply(module, identifier, topic_uuid),
            TmMessage::CustomTopicPost { suffix, .. } => topics.custom(suffix),
            TmMessage::ShadowPost(_) => topics.shadow_post(),
            TmMessage::ShadowGet => topics.shadow_get(),
            TmMessage::ShadowClear => topics.shadow_clear(),
            TmMessage::DeviceDelayReply { uuid } => topics.device_delay_reply(uuid),
            TmMessage::WebshellReply { uid } => topics.webshell_command_reply(uid),
            TmMessage::WebshellPong { uid, .. } => topics.webshell_pong(uid),
        }
    }

    fn payload(&self) -> String {
        match self {
            TmMessage::PropertyPost(post) => post.payload().to_string(),
            TmMessage::PropertySetReply { msg_id, code } => {
                json!({ "id": msg_id, "code": code }).to_string()
            }
            TmMessage::EventPost(event) => event.payload().to_string(),
            TmMessage::ServiceCallReply {
                msg_id, code, data, ..
            } => json!({
                "id": msg_id,
                "version": SDK_VERSION,
                "code": code,
                "data": data,
            })
            .to_string(),
            TmMessage::CustomTopicPost { payload_json, .. } => payload_json.clone(),
            TmMessage::ShadowPost(post) => post.payload().to_string(),
            TmMessage::ShadowGet | TmMessage::ShadowClear => {
                envelope(&message_id(), json!({})).to_string()
            }
            TmMessage::DeviceDelayReply { .. } => envelope(&message_id(), json!({})).to_string(),
            TmMessage::WebshellReply { .. } => "{}".to_string(),
            TmMessage::WebshellPong { status, .. } => status.clone(),
        }
    }
}

/// Inbound thing-model events delivered to the user handler. Parameter
/// objects are re-serialised JSON text, owned by the event.
#[derive(Debug, Clone)]
pub enum TmEvent {
    PropertySet { msg_id: String, params: String },
    PropertyPostReply { msg_id: String, code: i32 },
    EventPostReply {
        module: String,
        identifier: String,
        msg_id: String,
        code: i32,
    },
    ServiceCall {
        module: String,
        identifier: String,
        topic_uuid: String,
        msg_id: String,
        params: String,
    },
    ShadowGetReply {
        msg_id: String,
        version: i64,
        desired: String,
    },
    ShadowSet { msg_id: String, desired: String },
    CustomTopic { suffix: String, payload: String },
    DeviceDelay { uuid: String, payload: String },
    WebshellCommand { uid: String, command: String },
}

pub type TmEventHandler = Arc<dyn Fn(TmEvent) + Send + Sync>;

struct TmInner {
    channel: Arc<dyn IotChannel>,
    topics: TopicSpace,
    handler: Mutex<Option<TmEventHandler>>,
}

impl TmInner {
    fn deliver(&self, event: TmEvent) {
        if let Some(handler) = self.handler.lock().unwrap().as_ref() {
            handler(event);
        }
    }

    fn reply(&self, msg: TmMessage) {
        let topic = msg.topic(&self.topics);
        let payload = msg.payload();
        if let Err(e) = self
            .channel
            .publish(&topic, payload.as_bytes(), Qos::AtLeastOnce)
        {
            warn!(%topic, "auto-reply publish failed: {e}");
        }
    }
}

/// Thing-model codec: renders outbound messages onto their topics and
/// parses, dispatches and auto-acknowledges inbound ones.
pub struct ThingModel {
    inner: Arc<TmInner>,
}

impl ThingModel {
    /// Wire the codec onto a channel. Subscribes every platform-defined
    /// inbound topic; the exact propertySet filter is registered before
    /// the service wildcard so dispatch-by-first-match works.
    pub fn attach(
        channel: Arc<dyn IotChannel>,
        product_key: &str,
        device_name: &str,
    ) -> TmResult<Self> {
        let inner = Arc::new(TmInner {
            channel: Arc::clone(&channel),
            topics: TopicSpace::new(product_key, device_name),
            handler: Mutex::new(None),
        });
        let model = Self { inner };
        let topics = model.inner.topics.clone();

        model.sub(&topics.property_set(), handle_property_set)?;
        model.sub(&topics.property_post_reply(), handle_property_post_reply)?;
        model.sub(&topics.service_call_filter(), handle_service_call)?;
        model.sub(&topics.event_post_reply_filter(), handle_event_post_reply)?;
        model.sub(&topics.shadow_get_reply(), handle_shadow_get_reply)?;
        model.sub(&topics.shadow_set(), handle_shadow_set)?;
        model.sub(&topics.device_delay_filter(), handle_device_delay)?;
        model.sub(&topics.webshell_command_filter(), handle_webshell_command)?;
        Ok(model)
    }

    fn sub(&self, topic: &str, handler: fn(&TmInner, &str, &[u8])) -> TmResult<()> {
        let inner = Arc::clone(&self.inner);
        let callback: MessageHandler =
            Arc::new(move |topic: &str, payload: &[u8]| handler(&inner, topic, payload));
        self.inner
            .channel
            .subscribe(topic, Qos::AtLeastOnce, callback)?;
        Ok(())
    }

    pub fn set_event_handler(&self, handler: TmEventHandler) {
        *self.inner.handler.lock().unwrap() = Some(handler);
    }

    /// Publish an outbound thing-model message (QoS 1).
    pub fn send(&self, msg: &TmMessage) -> TmResult<()> {
        let topic = msg.topic(&self.inner.topics);
        let payload = msg.payload();
        debug!(%topic, "thing-model send");
        self.inner
            .channel
            .publish(&topic, payload.as_bytes(), Qos::AtLeastOnce)?;
        Ok(())
    }

    /// Subscribe a custom topic suffix; messages surface as
    /// [`TmEvent::CustomTopic`].
    pub fn subscribe_custom(&self, suffix: &str) -> TmResult<()> {
        let filter = self.inner.topics.custom(suffix);
        let suffix = suffix.to_string();
        let inner = Arc::clone(&self.inner);
        let callback: MessageHandler = Arc::new(move |_topic: &str, payload: &[u8]| {
            inner.deliver(TmEvent::CustomTopic {
                suffix: suffix.clone(),
                payload: String::from_utf8_lossy(payload).into_owned(),
            });
        });
        self.inner
            .channel
            .subscribe(&filter, Qos::AtLeastOnce, callback)?;
        Ok(())
    }
}

fn parse_json(payload: &[u8]) -> Option<Value> {
    match serde_json::from_slice(payload) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("unparseable thing-model payload: {e}");
            None
        }
    }
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn num_field(value: &Value, key: &str) -> i64 {
    value.get(key).and_then(Value::as_i64).unwrap_or_default()
}

fn raw_field(value: &Value, key: &str) -> String {
    value.get(key).map(Value::to_string).unwrap_or_default()
}

fn handle_property_set(inner: &TmInner, _topic: &str, payload: &[u8]) {
    let Some(value) = parse_json(payload) else { return };
    let msg_id = str_field(&value, "ID");
    let params = raw_field(&value, "Params");
    inner.deliver(TmEvent::PropertySet {
        msg_id: msg_id.clone(),
        params,
    });
    inner.reply(TmMessage::PropertySetReply { msg_id, code: 0 });
}

fn handle_property_post_reply(inner: &TmInner, _topic: &str, payload: &[u8]) {
    let Some(value) = parse_json(payload) else { return };
    inner.deliver(TmEvent::PropertyPostReply {
        msg_id: str_field(&value, "ID"),
        code: num_field(&value, "Code") as i32,
    });
}

fn handle_service_call(inner: &TmInner, topic: &str, payload: &[u8]) {
    let Some(value) = parse_json(payload) else { return };
    let module = segment(topic, 5).unwrap_or_default().to_string();
    let identifier = segment(topic, 6).unwrap_or_default().to_string();
    let topic_uuid = segment(topic, 7).unwrap_or_default().to_string();
    let msg_id = str_field(&value, "ID");
    inner.deliver(TmEvent::ServiceCall {
        module: module.clone(),
        identifier: identifier.clone(),
        topic_uuid: topic_uuid.clone(),
        msg_id: msg_id.clone(),
        params: raw_field(&value, "Params"),
    });
    inner.reply(TmMessage::ServiceCallReply {
        module,
        identifier,
        topic_uuid,
        msg_id,
        code: 0,
        data: json!({}),
    });
}

fn handle_event_post_reply(inner: &TmInner, topic: &str, payload: &[u8]) {
    let Some(value) = parse_json(payload) else { return };
    inner.deliver(TmEvent::EventPostReply {
        module: segment(topic, 5).unwrap_or_default().to_string(),
        identifier: segment(topic, 6).unwrap_or_default().to_string(),
        msg_id: str_field(&value, "ID"),
        code: num_field(&value, "Code") as i32,
    });
}

fn handle_shadow_get_reply(inner: &TmInner, _topic: &str, payload: &[u8]) {
    let Some(value) = parse_json(payload) else { return };
    let params = value.get("Data").or_else(|| value.get("Params"));
    let (version, desired) = match params {
        Some(params) => (num_field(params, "version"), raw_field(params, "desired")),
        None => (0, String::new()),
    };
    inner.deliver(TmEvent::ShadowGetReply {
        msg_id: str_field(&value, "ID"),
        version,
        desired,
    });
    // The platform expects the desired state cleared once fetched.
    inner.reply(TmMessage::ShadowClear);
}

fn handle_shadow_set(inner: &TmInner, _topic: &str, payload: &[u8]) {
    let Some(value) = parse_json(payload) else { return };
    let desired = value
        .get("Params")
        .map(Value::to_string)
        .unwrap_or_default();
    inner.deliver(TmEvent::ShadowSet {
        msg_id: str_field(&value, "ID"),
        desired,
    });
}

fn handle_device_delay(inner: &TmInner, topic: &str, payload: &[u8]) {
    let uuid = segment(topic, 4).unwrap_or_default().to_string();
    inner.deliver(TmEvent::DeviceDelay {
        uuid: uuid.clone(),
        payload: String::from_utf8_lossy(payload).into_owned(),
    });
    inner.reply(TmMessage::DeviceDelayReply { uuid });
}

fn handle_webshell_command(inner: &TmInner, topic: &str, payload: &[u8]) {
    let uid = segment(topic, 5).unwrap_or_default().to_string();
    inner.deliver(TmEvent::WebshellCommand {
        uid: uid.clone(),
        command: String::from_utf8_lossy(payload).into_owned(),
    });
    inner.reply(TmMessage::WebshellReply { uid: uid.clone() });
    // The payload leads with a type byte: '1' runs a command, '2' is a
    // liveness ping, '3' resizes the terminal. Pings get a pong.
    if payload.first() == Some(&b'2') {
        inner.reply(TmMessage::WebshellPong {
            uid,
            status: "2".to_string(),
        });
    }
}
