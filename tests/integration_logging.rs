use iot_device_sdk::{
    log_report::LogReporter, IotChannel, LogKind, LogLevel, LogUploadConfig, MockIotChannel,
};
use serde_json::Value;
use std::sync::Arc;

fn setup(config: LogUploadConfig) -> (Arc<MockIotChannel>, LogReporter) {
    let channel = Arc::new(MockIotChannel::new());
    let reporter =
        LogReporter::attach(channel.clone() as Arc<dyn IotChannel>, "p", "d", &config).unwrap();
    (channel, reporter)
}

#[test]
fn test_batch_upload_payload_shape() {
    let config = LogUploadConfig {
        upload_switch: true,
        flush_line_count: 1,
        ..LogUploadConfig::default()
    };
    let (channel, reporter) = setup(config);

    reporter.log(LogLevel::Warn, LogKind::Device, "sensor", "voltage sag");
    reporter.log(LogLevel::Info, LogKind::Sdk, "mqtt", "reconnected");

    let published = channel.published();
    assert!(!published.is_empty());
    assert_eq!(published[0].0, "sys/p/d/log/batch/report");

    let payload: Value = serde_json::from_slice(&published[0].1).unwrap();
    assert!(payload["id"].is_string());
    assert!(payload["version"].is_string());
    let items = payload["data"].as_array().unwrap();
    assert_eq!(items[0]["LogLevel"], "WARN");
    assert_eq!(items[0]["Type"], "device");
    assert!(items[0]["CreateTime"].is_u64());
    assert_eq!(items[0]["Content"], "sensor : voltage sag");
}

#[test]
fn test_remote_config_flips_gate_and_level() {
    let (channel, reporter) = setup(LogUploadConfig::default());

    // Upload starts disabled: nothing goes out.
    reporter.log(LogLevel::Error, LogKind::Device, "t", "before");
    reporter.flush();
    assert!(channel.published().is_empty());

    channel.inject(
        "sys/p/d/log/batch/config",
        br#"{"id":"c","version":"1.0","data":{"Switch":true,"LowestLevel":"warn"}}"#,
    );

    reporter.log(LogLevel::Info, LogKind::Device, "t", "filtered");
    reporter.log(LogLevel::Warn, LogKind::Device, "t", "uploaded");
    reporter.flush();

    let published = channel.published();
    assert_eq!(published.len(), 1);
    let payload: Value = serde_json::from_slice(&published[0].1).unwrap();
    let items = payload["data"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["Content"], "t : uploaded");
}

#[test]
fn test_empty_flush_publishes_nothing() {
    let config = LogUploadConfig {
        upload_switch: true,
        ..LogUploadConfig::default()
    };
    let (channel, reporter) = setup(config);
    reporter.flush();
    reporter.tick();
    assert!(channel.published().is_empty());
}
