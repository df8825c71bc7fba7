use crate::error::{MqttResult, TmResult};
use crate::mqtt_session::{IotChannel, MessageHandler, Qos};
use crate::thing_model::{message_id, SDK_VERSION};
use crate::topic::TopicSpace;
use crate::types::{unix_timestamp_ms, LogKind, LogLevel, LogUploadConfig};
use serde_json::{json, Value};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One formatted log line pending upload.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub timestamp_ms: u64,
    pub level: LogLevel,
    pub kind: LogKind,
    pub tag: String,
    pub text: String,
}

struct LogGate {
    upload_switch: bool,
    lowest_level: LogLevel,
}

struct LogInner {
    channel: Arc<dyn IotChannel>,
    topics: TopicSpace,
    gate: Mutex<LogGate>,
    pending: Mutex<Vec<LogLine>>,
    last_flush: Mutex<Instant>,
    flush_line_count: usize,
    flush_interval: Duration,
    log_file: Option<Mutex<std::fs::File>>,
}

/// Buffered log uploader: lines accumulate in memory and drain onto the
/// batch-report topic when the count threshold or the flush deadline is
/// reached. The remote config topic flips the gate at runtime.
pub struct LogReporter {
    inner: Arc<LogInner>,
}

/// Log file name for a session started at `now`.
pub fn log_file_name(now: chrono::DateTime<chrono::Local>) -> String {
    format!("iot_{}.log", now.format("%Y-%m-%dT%H-%M-%S"))
}

impl LogReporter {
    pub fn attach(
        channel: Arc<dyn IotChannel>,
        product_key: &str,
        device_name: &str,
        config: &LogUploadConfig,
    ) -> TmResult<Self> {
        let log_file = match &config.log_dir {
            Some(dir) => Some(Mutex::new(open_log_file(dir)?)),
            None => None,
        };
        let inner = Arc::new(LogInner {
            channel: Arc::clone(&channel),
            topics: TopicSpace::new(product_key, device_name),
            gate: Mutex::new(LogGate {
                upload_switch: config.upload_switch,
                lowest_level: config.lowest_level,
            }),
            pending: Mutex::new(Vec::new()),
            last_flush: Mutex::new(Instant::now()),
            flush_line_count: config.flush_line_count,
            flush_interval: Duration::from_secs(config.flush_interval_s),
            log_file,
        });

        let config_inner = Arc::clone(&inner);
        let on_config: MessageHandler = Arc::new(move |_topic: &str, payload: &[u8]| {
            config_inner.on_remote_config(payload);
        });
        channel.subscribe(&inner.topics.log_batch_config(), Qos::AtLeastOnce, on_config)?;

        Ok(Self { inner })
    }

    /// Record one line: formats it, mirrors it to stdout (and the log
    /// file when configured), then buffers it for upload.
    pub fn log(&self, level: LogLevel, kind: LogKind, tag: &str, text: &str) {
        let timestamp_ms = unix_timestamp_ms();
        let formatted = format_line(level, kind, tag, text);
        println!("{formatted}");
        if let Some(file) = &self.inner.log_file {
            if let Err(e) = writeln!(file.lock().unwrap(), "{formatted}") {
                warn!("log file write failed: {e}");
            }
        }

        let should_flush = {
            let mut pending = self.inner.pending.lock().unwrap();
            pending.push(LogLine {
                timestamp_ms,
                level,
                kind,
                tag: tag.to_string(),
                text: text.to_string(),
            });
            pending.len() > self.inner.flush_line_count
        };
        if should_flush {
            self.flush();
        }
    }

    /// Deadline check, called from the owner's loop.
    pub fn tick(&self) {
        let due = self.inner.last_flush.lock().unwrap().elapsed() >= self.inner.flush_interval;
        if due {
            self.flush();
        }
    }

    /// Swap the pending list and upload the lines that pass the gate.
    pub fn flush(&self) {
        let lines = {
            let mut pending = self.inner.pending.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        *self.inner.last_flush.lock().unwrap() = Instant::now();
        if lines.is_empty() {
            return;
        }
        self.inner.upload(lines);
    }

    /// Local override of the upload gate.
    pub fn set_report_switch(&self, upload: bool, lowest_level: LogLevel) {
        let mut gate = self.inner.gate.lock().unwrap();
        gate.upload_switch = upload;
        gate.lowest_level = lowest_level;
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }
}

impl LogInner {
    fn upload(&self, lines: Vec<LogLine>) {
        let (upload_switch, lowest_level) = {
            let gate = self.gate.lock().unwrap();
            (gate.upload_switch, gate.lowest_level)
        };
        if !upload_switch {
            return;
        }
        let items: Vec<Value> = lines
            .iter()
            .filter(|line| line.level <= lowest_level)
            .map(|line| {
                json!({
                    "CreateTime": line.timestamp_ms,
                    "LogLevel": line.level.as_str(),
                    "Type": line.kind.as_str(),
                    "Content": format!("{} : {}", line.tag, line.text),
                })
            })
            .collect();
        if items.is_empty() {
            return;
        }

        let payload = json!({
            "id": message_id(),
            "version": SDK_VERSION,
            "data": items,
        })
        .to_string();
        if let Err(e) = self.publish(&payload) {
            warn!("log batch publish failed: {e}");
        }
    }

    fn publish(&self, payload: &str) -> MqttResult<()> {
        self.channel.publish(
            &self.topics.log_batch_report(),
            payload.as_bytes(),
            Qos::AtLeastOnce,
        )
    }

    /// `log/batch/config` carries `{data: {Switch, LowestLevel}}`.
    fn on_remote_config(&self, payload: &[u8]) {
        let Ok(value) = serde_json::from_slice::<Value>(payload) else {
            warn!("unparseable log config payload");
            return;
        };
        let Some(data) = value.get("data") else { return };
        let mut gate = self.gate.lock().unwrap();
        if let Some(switch) = data.get("Switch").and_then(Value::as_bool) {
            gate.upload_switch = switch;
        }
        if let Some(level) = data
            .get("LowestLevel")
            .and_then(Value::as_str)
            .and_then(LogLevel::parse)
        {
            gate.lowest_level = level;
        }
        debug!(
            switch = gate.upload_switch,
            level = %gate.lowest_level,
            "log upload gate updated remotely"
        );
    }
}

fn format_line(level: LogLevel, kind: LogKind, tag: &str, text: &str) -> String {
    let now = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f");
    format!("[{}] [{}] [{}] {} : {}", kind.as_str(), level.as_str(), now, tag, text)
}

fn open_log_file(dir: &PathBuf) -> TmResult<std::fs::File> {
    std::fs::create_dir_all(dir)
        .and_then(|_| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(log_file_name(chrono::Local::now())))
        })
        .map_err(|e| crate::error::TmError::InvalidArgument(format!("log dir unusable: {e}")))
}
