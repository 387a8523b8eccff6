//! Withdrawal execution: the funded half of every rail attempt.
//!
//! The rails produce a bolt11 one way or another (destination node invoice,
//! LNURL-pay callback); this service validates it against the platform node,
//! escrows principal plus fee budget in one ledger transaction, dispatches
//! the payment and schedules the check job that settles it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rails::units::sats_to_msats;
use rails::wallet::UserContext;
use rails::{RailError, WithdrawalSink};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::jobs;
use crate::ledger::{LedgerError, LedgerStore, NewWithdrawal};
use crate::node::{LightningNode, NodeError};
use crate::queue::{Enqueue, JobQueue};

#[derive(Debug, Clone)]
pub struct PayoutSettings {
    pub payment_timeout_seconds: u64,
    /// Delay before the first settlement check of a dispatched payment.
    pub check_delay_seconds: u64,
    pub job_retry_limit: u32,
}

pub struct PayoutService {
    ledger: Arc<dyn LedgerStore>,
    node: Arc<dyn LightningNode>,
    queue: Arc<dyn JobQueue>,
    http: reqwest::Client,
    settings: PayoutSettings,
}

impl PayoutService {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        node: Arc<dyn LightningNode>,
        queue: Arc<dyn JobQueue>,
        settings: PayoutSettings,
    ) -> Self {
        Self {
            ledger,
            node,
            queue,
            http: reqwest::Client::new(),
            settings,
        }
    }

    async fn pay_invoice(
        &self,
        bolt11: &str,
        expected_msats: Option<u64>,
        expected_description_hash: Option<&str>,
        max_fee_sats: u64,
        user: &UserContext,
    ) -> Result<Uuid, RailError> {
        let decoded = self
            .node
            .decode_payment_request(bolt11)
            .await
            .map_err(node_rail_error)?;
        if decoded.num_msats == 0 {
            return Err(RailError::Rejected("invoice has no amount".to_string()));
        }
        if let Some(expected) = expected_msats {
            if decoded.num_msats != expected {
                return Err(RailError::Rejected(format!(
                    "invoice is for {} msats, expected {expected}",
                    decoded.num_msats
                )));
            }
        }
        if decoded.expires_at <= Utc::now() {
            return Err(RailError::Rejected("invoice is expired".to_string()));
        }
        if let Some(expected) = expected_description_hash {
            if decoded.description_hash.as_deref() != Some(expected) {
                return Err(RailError::Rejected(
                    "invoice does not commit to the lnurl-pay metadata".to_string(),
                ));
            }
        }

        let withdrawal = self
            .ledger
            .create_withdrawal(NewWithdrawal {
                user_id: user.user_id,
                hash: decoded.payment_hash.clone(),
                bolt11: bolt11.to_string(),
                msats_paying: decoded.num_msats,
                msats_fee_paying: sats_to_msats(max_fee_sats),
                auto_withdraw: true,
            })
            .await
            .map_err(ledger_rail_error)?;

        // Funds are escrowed from here on. A dispatch error does not fail the
        // withdrawal: the node may have taken the payment before the
        // transport gave out, so settlement is left to the check job either
        // way.
        if let Err(error) = self
            .node
            .send_payment(bolt11, max_fee_sats, self.settings.payment_timeout_seconds)
            .await
        {
            tracing::warn!(
                hash = %withdrawal.hash,
                reason = %error,
                "payment dispatch reported an error; the check job will settle it"
            );
        }
        self.schedule_check(&withdrawal.hash).await;
        Ok(withdrawal.id)
    }

    async fn schedule_check(&self, hash: &str) {
        let delay = i64::try_from(self.settings.check_delay_seconds).unwrap_or(0);
        let job = Enqueue {
            name: jobs::CHECK_WITHDRAWAL.to_string(),
            payload: serde_json::json!({ "hash": hash }),
            retry_limit: self.settings.job_retry_limit,
            retry_backoff: true,
            start_after: Utc::now() + Duration::seconds(delay),
        };
        if let Err(error) = self.queue.enqueue(job).await {
            tracing::warn!(
                hash,
                reason = %error,
                "could not schedule the withdrawal check; the recovery scan will pick it up"
            );
        }
    }

    async fn resolve_lightning_address(
        &self,
        address: &str,
        amount_msats: u64,
    ) -> Result<(String, String), RailError> {
        let (name, domain) = split_address(address)?;
        let params_url = format!("https://{domain}/.well-known/lnurlp/{name}");
        self.resolve_from(&params_url, address, amount_msats).await
    }

    async fn resolve_from(
        &self,
        params_url: &str,
        address: &str,
        amount_msats: u64,
    ) -> Result<(String, String), RailError> {
        let params = self.fetch_lnurl_json(params_url).await?;
        let params: LnurlPayParams = serde_json::from_value(params).map_err(|error| {
            RailError::Transport(format!("unreadable lnurl-pay parameters: {error}"))
        })?;
        if params.tag != "payRequest" {
            return Err(RailError::Rejected(format!(
                "{address} does not speak lnurl-pay"
            )));
        }
        if amount_msats < params.min_sendable || amount_msats > params.max_sendable {
            return Err(RailError::Rejected(format!(
                "{address} accepts between {} and {} msats",
                params.min_sendable, params.max_sendable
            )));
        }

        let separator = if params.callback.contains('?') { '&' } else { '?' };
        let callback_url = format!("{}{separator}amount={amount_msats}", params.callback);
        let invoice = self.fetch_lnurl_json(&callback_url).await?;
        let invoice: LnurlInvoice = serde_json::from_value(invoice).map_err(|error| {
            RailError::Transport(format!("unreadable lnurl-pay invoice: {error}"))
        })?;
        let bolt11 = invoice.pr.trim().to_string();
        if bolt11.is_empty() {
            return Err(RailError::Rejected(format!(
                "{address} returned no invoice"
            )));
        }
        // The service names the amount; hold it to that before the node ever
        // sees the invoice.
        if rails::bolt11::amount_msats(&bolt11) != Some(amount_msats) {
            return Err(RailError::Rejected(format!(
                "{address} returned an invoice for the wrong amount"
            )));
        }

        let metadata_hash = hex::encode(Sha256::digest(params.metadata.as_bytes()));
        Ok((bolt11, metadata_hash))
    }

    /// LNURL endpoints report failures as `{"status": "ERROR"}` bodies on a
    /// 200 as often as with a real status code.
    async fn fetch_lnurl_json(&self, url: &str) -> Result<Value, RailError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|error| RailError::Transport(error.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|error| RailError::Transport(error.to_string()))?;
        if !status.is_success() {
            return Err(RailError::Rejected(format!(
                "lnurl endpoint returned status {status}"
            )));
        }
        let value: Value = serde_json::from_slice(&body)
            .map_err(|error| RailError::Transport(format!("unreadable lnurl response: {error}")))?;
        if value.get("status").and_then(Value::as_str) == Some("ERROR") {
            let reason = value
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("lnurl endpoint reported an error");
            return Err(RailError::Rejected(reason.to_string()));
        }
        Ok(value)
    }
}

#[async_trait]
impl WithdrawalSink for PayoutService {
    async fn execute_withdrawal(
        &self,
        bolt11: &str,
        max_fee_sats: u64,
        user: &UserContext,
    ) -> Result<Uuid, RailError> {
        self.pay_invoice(bolt11, None, None, max_fee_sats, user).await
    }

    async fn send_to_external_address(
        &self,
        address: &str,
        amount_sats: u64,
        max_fee_sats: u64,
        user: &UserContext,
    ) -> Result<Uuid, RailError> {
        let amount_msats = sats_to_msats(amount_sats);
        let (bolt11, metadata_hash) = self
            .resolve_lightning_address(address, amount_msats)
            .await?;
        self.pay_invoice(
            &bolt11,
            Some(amount_msats),
            Some(&metadata_hash),
            max_fee_sats,
            user,
        )
        .await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LnurlPayParams {
    callback: String,
    min_sendable: u64,
    max_sendable: u64,
    metadata: String,
    #[serde(default)]
    tag: String,
}

#[derive(Debug, Deserialize)]
struct LnurlInvoice {
    #[serde(default)]
    pr: String,
}

fn split_address(address: &str) -> Result<(&str, &str), RailError> {
    let address = address.trim();
    let bad = || RailError::Misconfigured(format!("{address} is not a lightning address"));
    let (name, domain) = address.split_once('@').ok_or_else(bad)?;
    if name.is_empty() || domain.is_empty() || domain.contains('/') || domain.contains('@') {
        return Err(bad());
    }
    Ok((name, domain))
}

fn node_rail_error(error: NodeError) -> RailError {
    match error {
        NodeError::Unavailable(detail) | NodeError::Parse(detail) => {
            RailError::Transport(detail)
        }
        NodeError::Api { message, .. } => RailError::Rejected(message),
        NodeError::PaymentFailed(reason) => RailError::Rejected(reason),
        NodeError::InvalidConfig(detail) => RailError::Misconfigured(detail),
    }
}

fn ledger_rail_error(error: LedgerError) -> RailError {
    match error {
        LedgerError::InsufficientBalance => RailError::Rejected(
            "balance is too low to cover the withdrawal and its fee budget".to_string(),
        ),
        other => RailError::Transport(other.to_string()),
    }
}
