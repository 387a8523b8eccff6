//! LND rail: create an invoice on the destination node over its REST
//! endpoint, then hand it to the withdrawal-execution path.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::client;
use crate::error::{RailError, required};
use crate::wallet::UserContext;
use crate::{OUTBOUND_INVOICE_EXPIRY_SECONDS, WithdrawalSink};

const INVOICE_DESCRIPTION: &str = "autowithdraw to LND from satbank";

// LND's REST gateway encodes int64 fields as JSON strings.
#[derive(Debug, Serialize)]
struct AddInvoiceRequest {
    value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    memo: Option<String>,
    expiry: String,
}

#[derive(Debug, Deserialize)]
struct AddInvoiceResponse {
    payment_request: String,
}

pub async fn attempt(
    socket: Option<&str>,
    cert: Option<&str>,
    macaroon: Option<&str>,
    amount_sats: u64,
    max_fee_sats: u64,
    user: &UserContext,
    sink: &dyn WithdrawalSink,
) -> Result<Uuid, RailError> {
    let socket = required(socket, "lnd wallet has no socket on record")?;
    let macaroon = required(macaroon, "lnd wallet has no macaroon on record")?;
    let macaroon_bytes = BASE64
        .decode(macaroon)
        .map_err(|error| RailError::Misconfigured(format!("lnd macaroon is not base64: {error}")))?;

    let http = client::pinned_client(cert)?;
    let request = AddInvoiceRequest {
        value: amount_sats.to_string(),
        memo: (!user.hide_invoice_desc).then(|| INVOICE_DESCRIPTION.to_string()),
        expiry: OUTBOUND_INVOICE_EXPIRY_SECONDS.to_string(),
    };

    let response = http
        .post(format!("{}/v1/invoices", client::base_url(socket)))
        .header("Grpc-Metadata-macaroon", hex::encode(macaroon_bytes))
        .json(&request)
        .send()
        .await
        .map_err(|error| RailError::Transport(error.to_string()))?;

    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|error| RailError::Transport(error.to_string()))?;
    if !status.is_success() {
        return Err(RailError::Rejected(client::response_detail(status, &body)));
    }

    let invoice = serde_json::from_slice::<AddInvoiceResponse>(&body)
        .map_err(|error| RailError::Transport(format!("unreadable invoice response: {error}")))?;

    sink.execute_withdrawal(invoice.payment_request.trim(), max_fee_sats, user)
        .await
}
