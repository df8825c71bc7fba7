use crate::crypto;
use crate::error::{AuthError, AuthResult};
use crate::http_client::{HttpClient, HttpRequest};
use crate::signer::{self, SignedRequestParams};
use crate::types::{DeviceIdentity, EndpointSet};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

const GET_LLM_CONFIG_PATH: &str = "/2021-12-14/GetLLMConfig";
const GET_LLM_CONFIG_QUERY: &str = "Action=GetLLMConfig&Version=2021-12-14";

/// AI-gateway endpoints and credentials bound to this device.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// HTTP endpoint of the gateway, e.g. `https://gw.example.com`.
    pub url: String,
    pub api_key: String,
    /// WebSocket host for realtime sessions; derived from `url` when
    /// the platform does not send one.
    #[serde(default)]
    pub ws_url: Option<String>,
}

impl GatewayConfig {
    /// WebSocket origin, e.g. `wss://gw.example.com`.
    pub fn ws_host(&self) -> String {
        if let Some(ws) = self.ws_url.as_deref().filter(|s| !s.is_empty()) {
            return ws.trim_end_matches('/').to_string();
        }
        let url = self.url.trim_end_matches('/');
        if let Some(rest) = url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            format!("wss://{url}")
        }
    }
}

/// Fetch the gateway config bound to this device from the IoT platform.
/// The request is signed with the device secret the same way as
/// registration; the response payload is AES-encoded under it.
pub async fn fetch_gateway_config(
    http: &HttpClient,
    endpoints: &EndpointSet,
    identity: &DeviceIdentity,
) -> AuthResult<GatewayConfig> {
    let secret = identity
        .device_secret()
        .ok_or_else(|| AuthError::MissingSecret("device_secret".to_string()))?;

    let params = SignedRequestParams::generate();
    let signature = signer::sign(identity, &params, secret);
    let body = json!({
        "InstanceID": identity.instance_id,
        "product_key": identity.product_key,
        "device_name": identity.device_name,
        "random_num": params.random_num,
        "timestamp": params.timestamp_ms,
        "auth_type": identity.auth_mode.wire_value(),
        "signature": signature,
    })
    .to_string();

    let host = if endpoints.http_host.starts_with("http") {
        endpoints.http_host.trim_end_matches('/').to_string()
    } else {
        format!("https://{}", endpoints.http_host.trim_end_matches('/'))
    };
    let url = format!("{host}{GET_LLM_CONFIG_PATH}?{GET_LLM_CONFIG_QUERY}");
    debug!(%url, "fetching gateway config");

    let mut req = HttpRequest::post(&url).json_body(&body);
    req.ca_pem = endpoints.ca_pem.clone();
    let response = http
        .send(&req)
        .await
        .map_err(|e| AuthError::Network(e.to_string()))?;
    if response.status != 200 {
        return Err(AuthError::Server {
            code: response.status as i64,
            message: response.body_string(),
        });
    }
    decode_gateway_response(&response.body_string(), secret)
}

/// Parse a GetLLMConfig response. The `Result` either carries an
/// encrypted `payload` (AES-CBC under the device secret) or the plain
/// config fields.
fn decode_gateway_response(body: &str, device_secret: &str) -> AuthResult<GatewayConfig> {
    let value: Value = serde_json::from_str(body).map_err(|e| AuthError::Server {
        code: -1,
        message: format!("unparseable gateway config response: {e}"),
    })?;
    let result = value.get("Result").ok_or_else(|| AuthError::Server {
        code: -1,
        message: "gateway config response carries no Result".to_string(),
    })?;

    let plain = match result.get("payload").and_then(Value::as_str) {
        Some(payload) => crypto::aes_decode_string(device_secret, payload, true)
            .map_err(|e| AuthError::Decrypt(e.to_string()))?,
        None => result.to_string(),
    };
    let config: GatewayConfig = serde_json::from_str(&plain).map_err(|e| AuthError::Server {
        code: -1,
        message: format!("unparseable gateway config payload: {e}"),
    })?;
    if config.url.is_empty() {
        return Err(AuthError::Server {
            code: -1,
            message: "gateway config without url".to_string(),
        });
    }
    Ok(config)
}
