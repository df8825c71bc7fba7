use crate::crypto;
use crate::error::{RealtimeError, RealtimeResult};
use crate::signer::{self, SignedRequestParams};
use crate::types::{DeviceIdentity, RealtimeConfig};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Session parameters for `session.update`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<String>,
}

/// Session parameters for `translation_session.update`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TranslationSessionParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_language: Option<String>,
}

/// Client callbacks for inbound realtime events. Payloads are borrowed
/// for the duration of the call.
#[derive(Clone, Default)]
pub struct RealtimeCallbacks {
    pub on_audio: Option<Arc<dyn Fn(&[u8]) + Send + Sync>>,
    pub on_text: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub on_transcript_text: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub on_translation_text: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub on_response_done: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_error: Option<Arc<dyn Fn(&str, &str) + Send + Sync>>,
}

/// Reassembles complete JSON values from a stream of (possibly partial)
/// text frames.
#[derive(Default)]
struct JsonAssembler {
    buf: Vec<u8>,
}

impl JsonAssembler {
    fn push(&mut self, bytes: &[u8]) -> Vec<Value> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        loop {
            let mut iter = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
            match iter.next() {
                Some(Ok(value)) => {
                    let consumed = iter.byte_offset();
                    self.buf.drain(..consumed);
                    out.push(value);
                }
                Some(Err(e)) if e.is_eof() => break,
                Some(Err(e)) => {
                    warn!("dropping undecodable realtime buffer: {e}");
                    self.buf.clear();
                    break;
                }
                None => break,
            }
        }
        out
    }
}

/// Dispatch one parsed event to the client callbacks.
fn dispatch(callbacks: &RealtimeCallbacks, event: &Value) {
    let Some(kind) = event.get("type").and_then(Value::as_str) else {
        return;
    };
    match kind {
        "response.audio.delta" => {
            if let (Some(cb), Some(delta)) = (
                callbacks.on_audio.as_ref(),
                event.get("delta").and_then(Value::as_str),
            ) {
                match crypto::b64_decode(delta) {
                    Ok(audio) => cb(&audio),
                    Err(e) => warn!("undecodable audio delta: {e}"),
                }
            }
        }
        "response.audio_transcript.done" => {
            if let (Some(cb), Some(transcript)) = (
                callbacks.on_text.as_ref(),
                event.get("transcript").and_then(Value::as_str),
            ) {
                cb(transcript);
            }
        }
        "response.audio_transcript.delta" => {
            if let (Some(cb), Some(delta)) = (
                callbacks.on_transcript_text.as_ref(),
                event.get("delta").and_then(Value::as_str),
            ) {
                cb(delta);
            }
        }
        "response.audio_translation.delta" => {
            if let (Some(cb), Some(delta)) = (
                callbacks.on_translation_text.as_ref(),
                event.get("delta").and_then(Value::as_str),
            ) {
                cb(delta);
            }
        }
        "response.done" => {
            if let Some(cb) = callbacks.on_response_done.as_ref() {
                cb();
            }
        }
        "error" => {
            let code = event
                .pointer("/error/code")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let message = event
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or_default();
            // The socket stays up; recovery is the caller's decision.
            if let Some(cb) = callbacks.on_error.as_ref() {
                cb(code, message);
            }
        }
        other => debug!(kind = other, "unhandled realtime event"),
    }
}

/// Realtime bidirectional session over the AI gateway's WebSocket.
///
/// Outbound messages are queued and drained on the next
/// [`RealtimeSession::run_event_loop`] call; sends never block on
/// network I/O.
pub struct RealtimeSession {
    ws: Option<WsStream>,
    assembler: JsonAssembler,
    callbacks: RealtimeCallbacks,
    outbound: VecDeque<String>,
    send_ping: bool,
    ping_interval: Duration,
    last_ping: Instant,
}

impl RealtimeSession {
    /// Open the WebSocket with device-auth headers.
    /// `ws_host` is e.g. `wss://gateway.example.com`; the request path
    /// comes from `config.path`.
    pub async fn connect(
        ws_host: &str,
        config: &RealtimeConfig,
        identity: &DeviceIdentity,
    ) -> RealtimeResult<Self> {
        let secret = identity
            .device_secret()
            .ok_or_else(|| RealtimeError::Connection("device_secret missing".to_string()))?;
        let url = format!("{}{}", ws_host.trim_end_matches('/'), config.path);
        let mut request = url
            .clone()
            .into_client_request()
            .map_err(|e| RealtimeError::Connection(format!("bad gateway url: {e}")))?;

        let params = SignedRequestParams::generate();
        for (key, value) in signer::aigw_auth_headers(identity, &params, secret) {
            let value = value
                .parse()
                .map_err(|_| RealtimeError::Connection(format!("bad header value for {key}")))?;
            request.headers_mut().insert(key, value);
        }

        info!(%url, "connecting realtime session");
        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| RealtimeError::Connection(e.to_string()))?;
        Ok(Self {
            ws: Some(ws),
            assembler: JsonAssembler::default(),
            callbacks: RealtimeCallbacks::default(),
            outbound: VecDeque::new(),
            send_ping: config.send_ping,
            ping_interval: Duration::from_secs(config.ping_interval_s.max(1)),
            last_ping: Instant::now(),
        })
    }

    pub fn set_callbacks(&mut self, callbacks: RealtimeCallbacks) {
        self.callbacks = callbacks;
    }

    fn queue(&mut self, mut event: Value) -> RealtimeResult<()> {
        if self.ws.is_none() {
            return Err(RealtimeError::NotConnected);
        }
        event["event_id"] = json!(uuid::Uuid::new_v4().to_string());
        self.outbound.push_back(event.to_string());
        Ok(())
    }

    pub fn session_update(&mut self, session: &SessionParams) -> RealtimeResult<()> {
        self.queue(json!({ "type": "session.update", "session": session }))
    }

    pub fn translation_session_update(
        &mut self,
        session: &TranslationSessionParams,
    ) -> RealtimeResult<()> {
        self.queue(json!({ "type": "translation_session.update", "session": session }))
    }

    /// Append captured audio to the input buffer (base64 on the wire).
    pub fn input_audio_append(&mut self, audio: &[u8]) -> RealtimeResult<()> {
        self.queue(json!({
            "type": "input_audio_buffer.append",
            "audio": crypto::b64_encode(audio),
        }))
    }

    pub fn input_audio_commit(&mut self) -> RealtimeResult<()> {
        self.queue(json!({ "type": "input_audio_buffer.commit" }))
    }

    pub fn input_audio_done(&mut self) -> RealtimeResult<()> {
        self.queue(json!({ "type": "input_audio.done" }))
    }

    pub fn response_create(&mut self) -> RealtimeResult<()> {
        self.queue(json!({ "type": "response.create" }))
    }

    pub fn response_cancel(&mut self) -> RealtimeResult<()> {
        self.queue(json!({ "type": "response.cancel" }))
    }

    /// Send one audio chunk; with `commit` the input buffer is committed
    /// and a response requested.
    pub fn audio_send(&mut self, audio: &[u8], commit: bool) -> RealtimeResult<()> {
        self.input_audio_append(audio)?;
        if commit {
            self.input_audio_commit()?;
            self.response_create()?;
        }
        Ok(())
    }

    /// Translation variant: commit finishes with `input_audio.done`.
    pub fn translation_audio_send(&mut self, audio: &[u8], commit: bool) -> RealtimeResult<()> {
        self.input_audio_append(audio)?;
        if commit {
            self.input_audio_commit()?;
            self.input_audio_done()?;
        }
        Ok(())
    }

    /// Drain queued sends, keep the connection alive and wait up to
    /// `timeout_ms` for inbound frames, dispatching parsed events.
    pub async fn run_event_loop(&mut self, timeout_ms: u64) -> RealtimeResult<()> {
        let ws = self.ws.as_mut().ok_or(RealtimeError::NotConnected)?;

        while let Some(text) = self.outbound.pop_front() {
            ws.send(Message::Text(text))
                .await
                .map_err(|e| RealtimeError::Connection(e.to_string()))?;
        }

        if self.send_ping && self.last_ping.elapsed() >= self.ping_interval {
            ws.send(Message::Ping(Vec::new()))
                .await
                .map_err(|e| RealtimeError::Connection(e.to_string()))?;
            self.last_ping = Instant::now();
        }

        let frame = tokio::time::timeout(Duration::from_millis(timeout_ms), ws.next()).await;
        match frame {
            Err(_) => Ok(()), // idle tick
            Ok(None) => {
                self.ws = None;
                Err(RealtimeError::Closed)
            }
            Ok(Some(Err(e))) => {
                self.ws = None;
                Err(RealtimeError::Connection(e.to_string()))
            }
            Ok(Some(Ok(Message::Text(text)))) => {
                for event in self.assembler.push(text.as_bytes()) {
                    dispatch(&self.callbacks, &event);
                }
                Ok(())
            }
            Ok(Some(Ok(Message::Close(_)))) => {
                self.ws = None;
                Err(RealtimeError::Closed)
            }
            Ok(Some(Ok(_))) => Ok(()), // ping/pong/binary keep-alive traffic
        }
    }

    /// Close the socket; queued messages are dropped.
    pub async fn close(&mut self) {
        self.outbound.clear();
        if let Some(mut ws) = self.ws.take() {
            let _ = ws.close(None).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_json_assembler_handles_partial_frames() {
        let mut assembler = JsonAssembler::default();
        assert!(assembler.push(br#"{"type":"respo"#).is_empty());
        let events = assembler.push(br#"nse.done"}{"type":"x"}"#);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["type"], "response.done");
        assert_eq!(events[1]["type"], "x");
        assert!(assembler.buf.is_empty());
    }

    #[test]
    fn test_json_assembler_drops_garbage() {
        let mut assembler = JsonAssembler::default();
        assert!(assembler.push(b"!!!").is_empty());
        // Buffer was reset; later valid frames still parse.
        let events = assembler.push(br#"{"type":"response.done"}"#);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_audio_delta_dispatch_decodes_base64() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callbacks = RealtimeCallbacks {
            on_audio: Some(Arc::new(move |audio| {
                sink.lock().unwrap().extend_from_slice(audio);
            })),
            ..Default::default()
        };
        let event: Value =
            serde_json::from_str(r#"{"type":"response.audio.delta","event_id":"e1","delta":"QUJD"}"#)
                .unwrap();
        dispatch(&callbacks, &event);
        assert_eq!(&*seen.lock().unwrap(), b"ABC");
    }

    #[test]
    fn test_transcript_and_translation_dispatch() {
        let text = Arc::new(Mutex::new(String::new()));
        let transcript = Arc::new(Mutex::new(String::new()));
        let translation = Arc::new(Mutex::new(String::new()));
        let done = Arc::new(Mutex::new(false));

        let t1 = Arc::clone(&text);
        let t2 = Arc::clone(&transcript);
        let t3 = Arc::clone(&translation);
        let d = Arc::clone(&done);
        let callbacks = RealtimeCallbacks {
            on_text: Some(Arc::new(move |s| t1.lock().unwrap().push_str(s))),
            on_transcript_text: Some(Arc::new(move |s| t2.lock().unwrap().push_str(s))),
            on_translation_text: Some(Arc::new(move |s| t3.lock().unwrap().push_str(s))),
            on_response_done: Some(Arc::new(move || *d.lock().unwrap() = true)),
            ..Default::default()
        };

        for raw in [
            r#"{"type":"response.audio_transcript.delta","delta":"par"}"#,
            r#"{"type":"response.audio_transcript.delta","delta":"tial"}"#,
            r#"{"type":"response.audio_transcript.done","transcript":"full text"}"#,
            r#"{"type":"response.audio_translation.delta","delta":"uebersetzt"}"#,
            r#"{"type":"response.done"}"#,
        ] {
            dispatch(&callbacks, &serde_json::from_str(raw).unwrap());
        }

        assert_eq!(&*transcript.lock().unwrap(), "partial");
        assert_eq!(&*text.lock().unwrap(), "full text");
        assert_eq!(&*translation.lock().unwrap(), "uebersetzt");
        assert!(*done.lock().unwrap());
    }

    #[test]
    fn test_error_frame_dispatch() {
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let callbacks = RealtimeCallbacks {
            on_error: Some(Arc::new(move |code, message| {
                *sink.lock().unwrap() = Some((code.to_string(), message.to_string()));
            })),
            ..Default::default()
        };
        let event: Value = serde_json::from_str(
            r#"{"type":"error","error":{"code":"session_expired","message":"expired"}}"#,
        )
        .unwrap();
        dispatch(&callbacks, &event);
        let (code, message) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(code, "session_expired");
        assert_eq!(message, "expired");
    }

    #[test]
    fn test_unknown_event_ignored() {
        let callbacks = RealtimeCallbacks::default();
        let event: Value = serde_json::from_str(r#"{"type":"weird.new.event"}"#).unwrap();
        dispatch(&callbacks, &event);
    }

    #[test]
    fn test_outbound_event_shapes() {
        let mut session = RealtimeSession {
            ws: None,
            assembler: JsonAssembler::default(),
            callbacks: RealtimeCallbacks::default(),
            outbound: VecDeque::new(),
            send_ping: false,
            ping_interval: Duration::from_secs(110),
            last_ping: Instant::now(),
        };
        // Sends require a live socket.
        assert!(matches!(
            session.input_audio_commit(),
            Err(RealtimeError::NotConnected)
        ));
    }

    #[test]
    fn test_queued_event_json() {
        // Validate the wire shape of each outbound message kind.
        let audio = crypto::b64_encode(b"pcm");
        let cases = vec![
            (
                json!({"type": "input_audio_buffer.append", "audio": audio}),
                "input_audio_buffer.append",
            ),
            (json!({"type": "input_audio_buffer.commit"}), "input_audio_buffer.commit"),
            (json!({"type": "response.create"}), "response.create"),
            (json!({"type": "response.cancel"}), "response.cancel"),
            (json!({"type": "input_audio.done"}), "input_audio.done"),
        ];
        for (value, kind) in cases {
            assert_eq!(value["type"], kind);
        }
        let update = json!({"type": "session.update", "session": SessionParams {
            voice: Some("alloy".to_string()),
            ..Default::default()
        }});
        assert_eq!(update["session"]["voice"], "alloy");
        assert!(update["session"].get("instructions").is_none());
    }
}
