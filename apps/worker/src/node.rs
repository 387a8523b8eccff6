//! Client for the platform's own Lightning node.
//!
//! Everything goes over LND's REST proxy. Unary calls are plain JSON; the
//! streaming endpoints (payment dispatch, invoice and payment subscriptions)
//! answer with newline-delimited JSON where every message sits inside a
//! `{"result": ...}` envelope and errors arrive as `{"error": ...}` lines.
//! int64 fields cross the proxy as JSON strings.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE as BASE64_URL};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::config::Config;

#[derive(Debug, Error)]
pub enum NodeError {
    /// Could not reach the node at all.
    #[error("node unavailable: {0}")]
    Unavailable(String),
    /// The node answered with a non-success status.
    #[error("node api error ({status}): {message}")]
    Api { status: u16, message: String },
    /// The node answered with something we could not read.
    #[error("unreadable node response: {0}")]
    Parse(String),
    /// The payment was taken but failed before it left the node.
    #[error("payment failed: {0}")]
    PaymentFailed(String),
    #[error("node misconfigured: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone)]
pub struct DecodedPaymentRequest {
    /// Hex payment hash.
    pub payment_hash: String,
    pub num_msats: u64,
    pub expires_at: DateTime<Utc>,
    /// Hex hash of the LNURL-pay metadata, when the invoice commits to one.
    pub description_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentStatus {
    InFlight,
    Succeeded { fee_msats: u64 },
    Failed { reason: String },
}

/// One invoice event, from a lookup or the settle subscription.
#[derive(Debug, Clone)]
pub struct InvoiceUpdate {
    /// Hex payment hash.
    pub hash: String,
    pub settled: bool,
    pub canceled: bool,
    pub msats_received: u64,
    pub settle_index: u64,
    pub settled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct PaymentUpdate {
    /// Hex payment hash.
    pub hash: String,
    pub status: PaymentStatus,
}

pub type EventStream<T> = BoxStream<'static, Result<T, NodeError>>;

#[async_trait]
pub trait LightningNode: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn decode_payment_request(
        &self,
        bolt11: &str,
    ) -> Result<DecodedPaymentRequest, NodeError>;

    /// Hands the payment to the node and returns once it is accepted for
    /// routing. The terminal state is read back with `payment_status`.
    async fn send_payment(
        &self,
        bolt11: &str,
        max_fee_sats: u64,
        timeout_seconds: u64,
    ) -> Result<(), NodeError>;

    async fn payment_status(&self, hash: &str) -> Result<PaymentStatus, NodeError>;

    async fn lookup_invoice(&self, hash: &str) -> Result<InvoiceUpdate, NodeError>;

    /// Settle events, resuming after `settle_index`.
    async fn subscribe_invoices(
        &self,
        settle_index: u64,
    ) -> Result<EventStream<InvoiceUpdate>, NodeError>;

    /// Terminal updates for every in-flight outgoing payment.
    async fn subscribe_payments(&self) -> Result<EventStream<PaymentUpdate>, NodeError>;
}

/// Builds the node client from configuration. Missing or unusable settings
/// degrade to a stub that fails every call, so the worker still comes up and
/// keeps serving queue jobs that do not touch the node.
pub fn from_config(config: &Config) -> Arc<dyn LightningNode> {
    let Some(socket) = config.lnd_socket.as_deref() else {
        return unavailable("SATBANK_LND_SOCKET is not set");
    };
    let Some(macaroon) = config.lnd_macaroon.as_deref() else {
        return unavailable("SATBANK_LND_MACAROON is not set");
    };
    match LndRestNode::new(socket, config.lnd_cert.as_deref(), macaroon) {
        Ok(node) => Arc::new(node),
        Err(error) => unavailable(&error.to_string()),
    }
}

fn unavailable(reason: &str) -> Arc<dyn LightningNode> {
    tracing::warn!(reason, "lightning node unavailable; node-backed jobs will fail");
    Arc::new(UnavailableNode {
        backend: "lnd",
        reason: reason.to_string(),
    })
}

struct UnavailableNode {
    backend: &'static str,
    reason: String,
}

impl UnavailableNode {
    fn err(&self) -> NodeError {
        NodeError::Unavailable(format!("{}: {}", self.backend, self.reason))
    }
}

#[async_trait]
impl LightningNode for UnavailableNode {
    fn backend(&self) -> &'static str {
        self.backend
    }

    async fn decode_payment_request(
        &self,
        _bolt11: &str,
    ) -> Result<DecodedPaymentRequest, NodeError> {
        Err(self.err())
    }

    async fn send_payment(
        &self,
        _bolt11: &str,
        _max_fee_sats: u64,
        _timeout_seconds: u64,
    ) -> Result<(), NodeError> {
        Err(self.err())
    }

    async fn payment_status(&self, _hash: &str) -> Result<PaymentStatus, NodeError> {
        Err(self.err())
    }

    async fn lookup_invoice(&self, _hash: &str) -> Result<InvoiceUpdate, NodeError> {
        Err(self.err())
    }

    async fn subscribe_invoices(
        &self,
        _settle_index: u64,
    ) -> Result<EventStream<InvoiceUpdate>, NodeError> {
        Err(self.err())
    }

    async fn subscribe_payments(&self) -> Result<EventStream<PaymentUpdate>, NodeError> {
        Err(self.err())
    }
}

pub struct LndRestNode {
    base_url: String,
    macaroon_hex: String,
    client: reqwest::Client,
}

const MACAROON_HEADER: &str = "Grpc-Metadata-macaroon";

impl LndRestNode {
    pub fn new(socket: &str, cert: Option<&str>, macaroon: &str) -> Result<Self, NodeError> {
        let macaroon_bytes = BASE64.decode(macaroon.trim()).map_err(|error| {
            NodeError::InvalidConfig(format!("lnd macaroon is not base64: {error}"))
        })?;
        Ok(Self {
            base_url: base_url(socket),
            macaroon_hex: hex::encode(macaroon_bytes),
            client: pinned_client(cert)?,
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}{path}", self.base_url))
            .header(MACAROON_HEADER, &self.macaroon_hex)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{path}", self.base_url))
            .header(MACAROON_HEADER, &self.macaroon_hex)
    }
}

#[async_trait]
impl LightningNode for LndRestNode {
    fn backend(&self) -> &'static str {
        "lnd"
    }

    async fn decode_payment_request(
        &self,
        bolt11: &str,
    ) -> Result<DecodedPaymentRequest, NodeError> {
        let response = checked(self.get(&format!("/v1/payreq/{}", bolt11.trim()))).await?;
        let decoded: PayReqResponse = response
            .json()
            .await
            .map_err(|error| NodeError::Parse(error.to_string()))?;
        Ok(DecodedPaymentRequest {
            payment_hash: decoded.payment_hash,
            num_msats: decoded.num_msat,
            expires_at: timestamp_from_unix(decoded.timestamp.saturating_add(decoded.expiry)),
            description_hash: Some(decoded.description_hash)
                .filter(|hash| !hash.trim().is_empty()),
        })
    }

    async fn send_payment(
        &self,
        bolt11: &str,
        max_fee_sats: u64,
        timeout_seconds: u64,
    ) -> Result<(), NodeError> {
        let body = serde_json::json!({
            "payment_request": bolt11,
            "timeout_seconds": timeout_seconds,
            "fee_limit_sat": max_fee_sats.to_string(),
            "no_inflight_updates": false,
        });
        let response = checked(self.post("/v2/router/send").json(&body)).await?;
        // The first stream message is the in-flight ack, or the terminal
        // state when the payment dies before leaving the node. Dropping the
        // rest of the stream does not cancel the payment.
        let first = first_stream_message(response).await?;
        let payment: PaymentResponse = serde_json::from_value(first)
            .map_err(|error| NodeError::Parse(error.to_string()))?;
        if payment.status == "FAILED" {
            return Err(NodeError::PaymentFailed(failure_detail(
                &payment.failure_reason,
            )));
        }
        Ok(())
    }

    async fn payment_status(&self, hash: &str) -> Result<PaymentStatus, NodeError> {
        let path = format!(
            "/v2/router/track/{}?no_inflight_updates=false",
            hash_to_base64url(hash)?
        );
        let response = checked(self.get(&path)).await?;
        let first = first_stream_message(response).await?;
        let payment: PaymentResponse = serde_json::from_value(first)
            .map_err(|error| NodeError::Parse(error.to_string()))?;
        Ok(payment_status_from_wire(&payment))
    }

    async fn lookup_invoice(&self, hash: &str) -> Result<InvoiceUpdate, NodeError> {
        let response = checked(self.get(&format!("/v1/invoice/{}", hash.trim()))).await?;
        let invoice: InvoiceResponse = response
            .json()
            .await
            .map_err(|error| NodeError::Parse(error.to_string()))?;
        invoice_update_from_wire(invoice)
    }

    async fn subscribe_invoices(
        &self,
        settle_index: u64,
    ) -> Result<EventStream<InvoiceUpdate>, NodeError> {
        let response = checked(
            self.get(&format!("/v1/invoices/subscribe?settle_index={settle_index}")),
        )
        .await?;
        Ok(stream_results(response)
            .map(|message| {
                let invoice: InvoiceResponse = serde_json::from_value(message?)
                    .map_err(|error| NodeError::Parse(error.to_string()))?;
                invoice_update_from_wire(invoice)
            })
            .boxed())
    }

    async fn subscribe_payments(&self) -> Result<EventStream<PaymentUpdate>, NodeError> {
        let response =
            checked(self.get("/v2/router/trackpayments?no_inflight_updates=false")).await?;
        Ok(stream_results(response)
            .map(|message| {
                let payment: PaymentResponse = serde_json::from_value(message?)
                    .map_err(|error| NodeError::Parse(error.to_string()))?;
                Ok(PaymentUpdate {
                    hash: payment.payment_hash.clone(),
                    status: payment_status_from_wire(&payment),
                })
            })
            .boxed())
    }
}

// LND's REST gateway encodes int64 fields as JSON strings.
mod int64 {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Number(value) => Ok(value),
            Raw::Text(text) => {
                let text = text.trim();
                if text.is_empty() {
                    return Ok(0);
                }
                text.parse::<u64>().map_err(serde::de::Error::custom)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct PayReqResponse {
    #[serde(default)]
    payment_hash: String,
    #[serde(default, deserialize_with = "int64::deserialize")]
    num_msat: u64,
    #[serde(default, deserialize_with = "int64::deserialize")]
    timestamp: u64,
    #[serde(default, deserialize_with = "int64::deserialize")]
    expiry: u64,
    #[serde(default)]
    description_hash: String,
}

#[derive(Debug, Deserialize)]
struct PaymentResponse {
    #[serde(default)]
    payment_hash: String,
    #[serde(default)]
    status: String,
    #[serde(default, deserialize_with = "int64::deserialize")]
    fee_msat: u64,
    #[serde(default)]
    failure_reason: String,
}

#[derive(Debug, Deserialize)]
struct InvoiceResponse {
    /// Payment hash, base64 on the wire.
    #[serde(default)]
    r_hash: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    settled: bool,
    #[serde(default, deserialize_with = "int64::deserialize")]
    amt_paid_msat: u64,
    #[serde(default, deserialize_with = "int64::deserialize")]
    settle_index: u64,
    #[serde(default, deserialize_with = "int64::deserialize")]
    settle_date: u64,
}

fn payment_status_from_wire(payment: &PaymentResponse) -> PaymentStatus {
    match payment.status.as_str() {
        "SUCCEEDED" => PaymentStatus::Succeeded {
            fee_msats: payment.fee_msat,
        },
        "FAILED" => PaymentStatus::Failed {
            reason: failure_detail(&payment.failure_reason),
        },
        _ => PaymentStatus::InFlight,
    }
}

fn invoice_update_from_wire(invoice: InvoiceResponse) -> Result<InvoiceUpdate, NodeError> {
    let hash = base64_to_hex(&invoice.r_hash)?;
    Ok(InvoiceUpdate {
        hash,
        settled: invoice.settled || invoice.state == "SETTLED",
        canceled: invoice.state == "CANCELED",
        msats_received: invoice.amt_paid_msat,
        settle_index: invoice.settle_index,
        settled_at: (invoice.settle_date > 0).then(|| timestamp_from_unix(invoice.settle_date)),
    })
}

/// `FAILURE_REASON_NO_ROUTE` reads as `no route` in wallet logs.
fn failure_detail(reason: &str) -> String {
    let reason = reason.trim().trim_start_matches("FAILURE_REASON_");
    if reason.is_empty() || reason == "NONE" {
        return "payment failed".to_string();
    }
    reason.replace('_', " ").to_lowercase()
}

fn timestamp_from_unix(secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn base64_to_hex(encoded: &str) -> Result<String, NodeError> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|error| NodeError::Parse(format!("hash is not base64: {error}")))?;
    Ok(hex::encode(bytes))
}

/// Path parameters carrying hashes go over as URL-safe base64.
fn hash_to_base64url(hash: &str) -> Result<String, NodeError> {
    let bytes = hex::decode(hash.trim())
        .map_err(|error| NodeError::Parse(format!("hash is not hex: {error}")))?;
    Ok(BASE64_URL.encode(bytes))
}

fn base_url(socket: &str) -> String {
    let socket = socket.trim().trim_end_matches('/');
    if socket.starts_with("http://") || socket.starts_with("https://") {
        socket.to_string()
    } else {
        format!("https://{socket}")
    }
}

/// Client pinned to the node's certificate when one is configured
/// (self-signed node certs), otherwise the platform trust roots. No request
/// timeout is set; the subscription streams stay open indefinitely.
fn pinned_client(cert_base64: Option<&str>) -> Result<reqwest::Client, NodeError> {
    let Some(encoded) = cert_base64.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(reqwest::Client::new());
    };
    let der_or_pem = BASE64
        .decode(encoded)
        .map_err(|error| NodeError::InvalidConfig(format!("lnd cert is not base64: {error}")))?;
    let certificate = reqwest::Certificate::from_pem(&der_or_pem)
        .or_else(|_| reqwest::Certificate::from_der(&der_or_pem))
        .map_err(|error| {
            NodeError::InvalidConfig(format!("lnd cert is not PEM or DER: {error}"))
        })?;
    reqwest::Client::builder()
        .add_root_certificate(certificate)
        .build()
        .map_err(|error| NodeError::Unavailable(error.to_string()))
}

async fn checked(request: reqwest::RequestBuilder) -> Result<reqwest::Response, NodeError> {
    let response = request
        .send()
        .await
        .map_err(|error| NodeError::Unavailable(error.to_string()))?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.bytes().await.unwrap_or_default();
    Err(NodeError::Api {
        status: status.as_u16(),
        message: error_detail(status, &body),
    })
}

fn error_detail(status: reqwest::StatusCode, body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        for pointer in ["/message", "/error", "/error/message"] {
            if let Some(text) = value.pointer(pointer).and_then(Value::as_str) {
                if !text.trim().is_empty() {
                    return text.trim().to_string();
                }
            }
        }
    }
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        format!("lnd returned status {status}")
    } else {
        text.to_string()
    }
}

/// Unwraps one grpc-gateway stream envelope.
fn stream_envelope(message: Value) -> Result<Value, NodeError> {
    if let Some(error) = message.get("error") {
        let status = error
            .get("http_code")
            .and_then(Value::as_u64)
            .and_then(|code| u16::try_from(code).ok())
            .unwrap_or(500);
        let detail = error
            .get("message")
            .and_then(Value::as_str)
            .map(|text| text.trim().to_string())
            .unwrap_or_else(|| error.to_string());
        return Err(NodeError::Api {
            status,
            message: detail,
        });
    }
    match message.get("result") {
        Some(result) => Ok(result.clone()),
        None => Ok(message),
    }
}

fn stream_results(response: reqwest::Response) -> BoxStream<'static, Result<Value, NodeError>> {
    ndjson_values(response)
        .map(|message| message.and_then(stream_envelope))
        .boxed()
}

async fn first_stream_message(response: reqwest::Response) -> Result<Value, NodeError> {
    let mut messages = stream_results(response);
    match messages.next().await {
        Some(message) => message,
        None => Err(NodeError::Parse("empty stream response".to_string())),
    }
}

/// Splits a streaming response body into JSON values, one per line. A
/// transport or parse error ends the stream after it is yielded.
fn ndjson_values(response: reqwest::Response) -> BoxStream<'static, Result<Value, NodeError>> {
    let state = (response.bytes_stream().boxed(), Vec::<u8>::new(), false);
    futures::stream::unfold(state, |(mut chunks, mut buffer, done)| async move {
        if done {
            return None;
        }
        loop {
            if let Some(split) = buffer.iter().position(|byte| *byte == b'\n') {
                let line: Vec<u8> = buffer.drain(..=split).collect();
                match parse_line(&line[..line.len() - 1]) {
                    Some(Ok(value)) => return Some((Ok(value), (chunks, buffer, false))),
                    Some(Err(error)) => return Some((Err(error), (chunks, buffer, true))),
                    None => continue,
                }
            }
            match chunks.next().await {
                Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                Some(Err(error)) => {
                    return Some((
                        Err(NodeError::Unavailable(error.to_string())),
                        (chunks, buffer, true),
                    ));
                }
                None => {
                    let rest = std::mem::take(&mut buffer);
                    return parse_line(&rest).map(|result| (result, (chunks, buffer, true)));
                }
            }
        }
    })
    .boxed()
}

/// `None` for blank keep-alive lines.
fn parse_line(line: &[u8]) -> Option<Result<Value, NodeError>> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(serde_json::from_str(text).map_err(|error| NodeError::Parse(error.to_string())))
}
