use crate::crypto;
use crate::error::{AuthError, AuthResult};
use crate::http_client::{HttpClient, HttpRequest};
use crate::signer::{self, SignedRequestParams};
use crate::types::{DeviceIdentity, EndpointSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const DYNAMIC_REGISTER_PATH: &str = "/2021-12-14/DynamicRegister";
const DYNAMIC_REGISTER_QUERY: &str = "Action=DynamicRegister&Version=2021-12-14";

#[derive(Debug, Serialize)]
struct RegisterBody<'a> {
    #[serde(rename = "InstanceID")]
    instance_id: &'a str,
    product_key: &'a str,
    device_name: &'a str,
    random_num: u32,
    timestamp: u64,
    auth_type: i32,
    signature: String,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    #[serde(rename = "Result")]
    result: Option<RegisterResult>,
    #[serde(rename = "ResponseMetadata")]
    metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Deserialize)]
struct RegisterResult {
    #[serde(default)]
    len: i64,
    payload: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMetadata {
    #[serde(rename = "Error")]
    error: Option<MetadataError>,
}

#[derive(Debug, Deserialize)]
struct MetadataError {
    #[serde(rename = "CodeN", default)]
    code_n: i64,
    #[serde(rename = "Message")]
    message: Option<String>,
}

/// Obtain the device secret through dynamic registration.
///
/// A no-op when the identity already carries a secret. Otherwise posts a
/// signed registration request and decrypts the returned payload with
/// the product secret.
pub async fn dynamic_register(
    http: &HttpClient,
    endpoints: &EndpointSet,
    identity: &DeviceIdentity,
) -> AuthResult<String> {
    if let Some(secret) = identity.device_secret() {
        return Ok(secret.to_string());
    }
    let product_secret = identity
        .product_secret
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AuthError::MissingSecret("product_secret".to_string()))?;

    let params = SignedRequestParams::generate();
    let signature = signer::sign(identity, &params, product_secret);
    let body = RegisterBody {
        instance_id: &identity.instance_id,
        product_key: &identity.product_key,
        device_name: &identity.device_name,
        random_num: params.random_num,
        timestamp: params.timestamp_ms,
        auth_type: identity.auth_mode.wire_value(),
        signature,
    };
    let body_json =
        serde_json::to_string(&body).map_err(|e| AuthError::InvalidArgument(e.to_string()))?;

    let host = normalize_host(&endpoints.http_host);
    let url = format!("{host}{DYNAMIC_REGISTER_PATH}?{DYNAMIC_REGISTER_QUERY}");
    debug!(%url, "dynamic register request");

    let mut req = HttpRequest::post(&url).json_body(&body_json);
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
    let secret = decode_register_response(&response.body_string(), product_secret)?;
    info!(device_name = %identity.device_name, "dynamic registration succeeded");
    Ok(secret)
}

/// Parse a registration response body and decrypt the secret payload.
fn decode_register_response(body: &str, product_secret: &str) -> AuthResult<String> {
    let parsed: RegisterResponse = serde_json::from_str(body).map_err(|e| AuthError::Server {
        code: -1,
        message: format!("unparseable registration response: {e}"),
    })?;

    if let Some(error) = parsed.metadata.and_then(|m| m.error) {
        return Err(AuthError::Server {
            code: error.code_n,
            message: error.message.unwrap_or_default(),
        });
    }

    let result = parsed.result.ok_or_else(|| AuthError::Server {
        code: -1,
        message: "registration response carries no Result".to_string(),
    })?;
    let payload = result.payload.filter(|p| !p.is_empty() && result.len > 0);
    let payload = payload.ok_or_else(|| AuthError::Server {
        code: -1,
        message: "registration result carries no payload".to_string(),
    })?;

    // Result cipher: AES-CBC-128 under the product secret, IV = first 16
    // bytes of the same secret.
    crypto::aes_decode_string(product_secret, &payload, true)
        .map_err(|e| AuthError::Decrypt(e.to_string()))
}

fn normalize_host(host: &str) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        host.trim_end_matches('/').to_string()
    } else {
        format!("https://{}", host.trim_end_matches('/'))
    }
}
