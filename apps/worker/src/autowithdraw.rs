//! The autowithdraw decision engine.
//!
//! Runs once per triggering event (deposit settle, schedule change) and
//! decides whether the user's balance above their threshold should leave
//! custody, then walks the attached wallets best-first until one accepts.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rails::units::{ceil_percent, format_sats, msats_to_sats, sats_to_msats};
use rails::wallet::{UserContext, Wallet};
use rails::PaymentRails;
use uuid::Uuid;

use crate::ledger::{LedgerStore, WalletLogEntry, WalletLogLevel};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutowithdrawOutcome {
    /// The user has not set both a threshold and a fee cap.
    Disabled,
    /// Balance has not cleared the threshold plus the hysteresis margin, or
    /// the amount left after the fee budget would be under a satoshi.
    BelowThreshold,
    /// An earlier attempt is still in flight or recently failed at this fee.
    Blocked,
    NoWallets,
    Withdrawn {
        withdrawal_id: Uuid,
        amount_sats: u64,
        max_fee_sats: u64,
    },
    /// Every attached wallet was tried and none accepted the withdrawal.
    Exhausted,
}

pub struct AutowithdrawEngine {
    ledger: Arc<dyn LedgerStore>,
    rails: Arc<dyn PaymentRails>,
}

impl AutowithdrawEngine {
    pub fn new(ledger: Arc<dyn LedgerStore>, rails: Arc<dyn PaymentRails>) -> Self {
        Self { ledger, rails }
    }

    pub async fn run(&self, user_id: Uuid) -> anyhow::Result<AutowithdrawOutcome> {
        let settings = self.ledger.autowithdraw_settings(user_id).await?;
        let (Some(threshold_sats), Some(max_fee_percent)) =
            (settings.threshold_sats, settings.max_fee_percent)
        else {
            return Ok(AutowithdrawOutcome::Disabled);
        };

        let threshold_msats = sats_to_msats(threshold_sats);
        if settings.msats < threshold_msats {
            return Ok(AutowithdrawOutcome::BelowThreshold);
        }
        let excess_msats = settings.msats - threshold_msats;
        // Hysteresis: a trickle of small deposits waits until the excess is
        // at least a tenth of the threshold.
        if excess_msats.saturating_mul(10) < threshold_msats {
            return Ok(AutowithdrawOutcome::BelowThreshold);
        }

        let excess_sats = msats_to_sats(excess_msats);
        let max_fee_sats = ceil_percent(excess_sats, max_fee_percent);
        let Some(amount_sats) = excess_sats.checked_sub(max_fee_sats).filter(|sats| *sats >= 1)
        else {
            return Ok(AutowithdrawOutcome::BelowThreshold);
        };

        let since = Utc::now() - Duration::hours(1);
        if self
            .ledger
            .has_blocking_autowithdraw(user_id, sats_to_msats(max_fee_sats), since)
            .await?
        {
            return Ok(AutowithdrawOutcome::Blocked);
        }

        let wallets = self.ledger.wallets_by_priority(user_id).await?;
        if wallets.is_empty() {
            return Ok(AutowithdrawOutcome::NoWallets);
        }

        let user = UserContext {
            user_id,
            hide_invoice_desc: settings.hide_invoice_desc,
        };
        for wallet in &wallets {
            match self
                .rails
                .attempt(wallet, amount_sats, max_fee_sats, &user)
                .await
            {
                Ok(withdrawal_id) => {
                    self.log_attempt(
                        user_id,
                        wallet,
                        WalletLogLevel::Success,
                        format!("autowithdrawal of {}", format_sats(amount_sats)),
                    )
                    .await;
                    tracing::info!(
                        %user_id,
                        wallet = %wallet.kind(),
                        amount_sats,
                        max_fee_sats,
                        "autowithdrawal dispatched"
                    );
                    return Ok(AutowithdrawOutcome::Withdrawn {
                        withdrawal_id,
                        amount_sats,
                        max_fee_sats,
                    });
                }
                Err(error) => {
                    self.log_attempt(
                        user_id,
                        wallet,
                        WalletLogLevel::Error,
                        format!("autowithdrawal failed: {}", error.detail()),
                    )
                    .await;
                    tracing::info!(
                        %user_id,
                        wallet = %wallet.kind(),
                        reason = %error,
                        "autowithdrawal attempt failed; falling back"
                    );
                }
            }
        }
        Ok(AutowithdrawOutcome::Exhausted)
    }

    /// Wallet log lines are user-visible history; losing one is not worth
    /// failing the withdrawal over.
    async fn log_attempt(
        &self,
        user_id: Uuid,
        wallet: &Wallet,
        level: WalletLogLevel,
        message: String,
    ) {
        let entry = WalletLogEntry {
            user_id,
            wallet_kind: wallet.kind(),
            level,
            message,
        };
        if let Err(error) = self.ledger.append_wallet_log(entry).await {
            tracing::warn!(%user_id, reason = %error, "could not record the wallet log line");
        }
    }
}
