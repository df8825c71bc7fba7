use crate::crypto;
use crate::types::{unix_timestamp_ms, AuthMode, DeviceIdentity};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

/// One-shot parameters consumed by a single signed request.
#[derive(Debug, Clone, Copy)]
pub struct SignedRequestParams {
    pub timestamp_ms: u64,
    pub random_num: u32,
}

static LAST_TIMESTAMP: AtomicU64 = AtomicU64::new(0);

impl SignedRequestParams {
    /// Produce a `(timestamp, random)` pair that is unique and strictly
    /// monotonic within the process.
    pub fn generate() -> Self {
        let now = unix_timestamp_ms();
        let timestamp_ms = LAST_TIMESTAMP
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .map(|last| now.max(last + 1))
            .unwrap_or(now);
        Self {
            timestamp_ms,
            random_num: rand::rng().random(),
        }
    }

    pub fn with(timestamp_ms: u64, random_num: u32) -> Self {
        Self {
            timestamp_ms,
            random_num,
        }
    }
}

/// Canonical string signed for device auth. Field order is fixed by the
/// server contract.
fn canonical_string(identity: &DeviceIdentity, auth_mode: AuthMode, params: &SignedRequestParams) -> String {
    format!(
        "auth_type={}&device_name={}&random_num={}&product_key={}&timestamp={}",
        auth_mode.wire_value(),
        identity.device_name,
        params.random_num,
        identity.product_key,
        params.timestamp_ms,
    )
}

/// HMAC-SHA256 signature over the canonical string, base64 with padding.
pub fn sign(identity: &DeviceIdentity, params: &SignedRequestParams, secret: &str) -> String {
    sign_as(identity, identity.auth_mode, params, secret)
}

/// Same as [`sign`] but with an explicit auth mode, for the MQTT
/// password path where device-secret identities sign as pre-registered.
pub fn sign_as(
    identity: &DeviceIdentity,
    auth_mode: AuthMode,
    params: &SignedRequestParams,
    secret: &str,
) -> String {
    let input = canonical_string(identity, auth_mode, params);
    crypto::b64_encode(&crypto::hmac_sha256(secret.as_bytes(), input.as_bytes()))
}

pub const HEADER_SIGNATURE: &str = "X-Signature";
pub const HEADER_AUTH_TYPE: &str = "X-Auth-Type";
pub const HEADER_DEVICE_NAME: &str = "X-Device-Name";
pub const HEADER_PRODUCT_KEY: &str = "X-Product-Key";
pub const HEADER_RANDOM_NUM: &str = "X-Random-Num";
pub const HEADER_TIMESTAMP: &str = "X-Timestamp";
pub const HEADER_HARDWARE_ID: &str = "X-Hardware-Id";

/// Device-auth headers sent on every AI-gateway request.
pub fn aigw_auth_headers(
    identity: &DeviceIdentity,
    params: &SignedRequestParams,
    device_secret: &str,
) -> Vec<(&'static str, String)> {
    let signature = sign(identity, params, device_secret);
    vec![
        (HEADER_SIGNATURE, signature),
        (HEADER_AUTH_TYPE, identity.auth_mode.wire_value().to_string()),
        (HEADER_DEVICE_NAME, identity.device_name.clone()),
        (HEADER_PRODUCT_KEY, identity.product_key.clone()),
        (HEADER_RANDOM_NUM, params.random_num.to_string()),
        (HEADER_TIMESTAMP, params.timestamp_ms.to_string()),
        (HEADER_HARDWARE_ID, hardware_id()),
    ]
}

static HARDWARE_ID: OnceLock<String> = OnceLock::new();

/// Best-effort stable hardware identifier: the MAC of the first
/// non-loopback interface, or a process-stable pseudorandom MAC with the
/// locally-administered bit set.
pub fn hardware_id() -> String {
    HARDWARE_ID
        .get_or_init(|| interface_mac().unwrap_or_else(random_local_mac))
        .clone()
}

fn interface_mac() -> Option<String> {
    let entries = std::fs::read_dir("/sys/class/net").ok()?;
    let mut names: Vec<_> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name != "lo")
        .collect();
    names.sort();
    for name in names {
        if let Ok(addr) = std::fs::read_to_string(format!("/sys/class/net/{name}/address")) {
            let addr = addr.trim().to_string();
            if !addr.is_empty() && addr != "00:00:00:00:00:00" {
                return Some(addr);
            }
        }
    }
    None
}

fn random_local_mac() -> String {
    let mut octets = [0u8; 6];
    rand::rng().fill(&mut octets[..]);
    octets[0] = (octets[0] | 0x02) & !0x01;
    octets
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}
