//! CLN rail: create an invoice through the destination node's REST plugin,
//! then hand it to the withdrawal-execution path.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::client;
use crate::error::{RailError, required};
use crate::wallet::UserContext;
use crate::{OUTBOUND_INVOICE_EXPIRY_SECONDS, WithdrawalSink};

const INVOICE_DESCRIPTION: &str = "autowithdraw to CLN from satbank";

// REST plugins up to CLN 23.08 insist on a nodeid header; any well-formed
// node id passes, newer releases ignore it.
const COMPAT_NODE_ID: &str = "03adfde04b4e6a4e1d1a7d96e4e17e5dbe1b64e36c81e85c7a7e8d5a30f2dbb655";

#[derive(Debug, Serialize)]
struct InvoiceRequest {
    // CLN amount strings carry their unit.
    amount_msat: String,
    label: String,
    description: String,
    expiry: u64,
}

#[derive(Debug, Deserialize)]
struct InvoiceResponse {
    bolt11: String,
}

pub async fn attempt(
    socket: Option<&str>,
    cert: Option<&str>,
    rune: Option<&str>,
    amount_sats: u64,
    max_fee_sats: u64,
    user: &UserContext,
    sink: &dyn WithdrawalSink,
) -> Result<Uuid, RailError> {
    let socket = required(socket, "cln wallet has no socket on record")?;
    let rune = required(rune, "cln wallet has no rune on record")?;

    let http = client::pinned_client(cert)?;
    let request = InvoiceRequest {
        amount_msat: format!("{amount_sats}sat"),
        // The backend requires request-scoped label uniqueness.
        label: format!("autowithdraw-{}", Uuid::new_v4()),
        description: if user.hide_invoice_desc {
            String::new()
        } else {
            INVOICE_DESCRIPTION.to_string()
        },
        expiry: OUTBOUND_INVOICE_EXPIRY_SECONDS,
    };

    let response = http
        .post(format!("{}/v1/invoice", client::base_url(socket)))
        .header("Rune", rune)
        .header("nodeid", COMPAT_NODE_ID)
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

    let invoice = serde_json::from_slice::<InvoiceResponse>(&body)
        .map_err(|error| RailError::Transport(format!("unreadable invoice response: {error}")))?;

    sink.execute_withdrawal(invoice.bolt11.trim(), max_fee_sats, user)
        .await
}
