//! HTTP plumbing shared by the node-backed adapters.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::RailError;

/// Wallet sockets are stored as bare `host:port`; TLS is the default. An
/// explicit scheme is honored so local development can point at plain HTTP.
pub(crate) fn base_url(socket: &str) -> String {
    let socket = socket.trim().trim_end_matches('/');
    if socket.starts_with("http://") || socket.starts_with("https://") {
        socket.to_string()
    } else {
        format!("https://{socket}")
    }
}

/// Build a client pinned to the wallet's stored certificate when one is
/// present (self-signed node certs), otherwise the platform trust roots.
pub(crate) fn pinned_client(cert_base64: Option<&str>) -> Result<reqwest::Client, RailError> {
    let Some(encoded) = cert_base64.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(reqwest::Client::new());
    };

    let der_or_pem = BASE64
        .decode(encoded)
        .map_err(|error| RailError::Misconfigured(format!("wallet cert is not base64: {error}")))?;
    let certificate = reqwest::Certificate::from_pem(&der_or_pem)
        .or_else(|_| reqwest::Certificate::from_der(&der_or_pem))
        .map_err(|error| {
            RailError::Misconfigured(format!("wallet cert is not PEM or DER: {error}"))
        })?;

    reqwest::Client::builder()
        .add_root_certificate(certificate)
        .build()
        .map_err(|error| RailError::Transport(error.to_string()))
}

/// Reduce a non-success backend response to a one-line detail. Both node
/// backends answer with JSON error envelopes, but their field names differ
/// and auth layers can answer with bare text.
pub(crate) fn response_detail(status: reqwest::StatusCode, body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        for key in ["message", "error"] {
            if let Some(text) = value.get(key).and_then(serde_json::Value::as_str) {
                if !text.trim().is_empty() {
                    return text.trim().to_string();
                }
            }
        }
    }
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        format!("backend returned status {status}")
    } else {
        format!("backend returned status {status}: {text}")
    }
}
