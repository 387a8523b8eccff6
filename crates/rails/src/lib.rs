//! Outbound payment rails for satbank autowithdrawals.
//!
//! Each supported wallet backend gets one adapter implementing the common
//! attempt contract: construct the outbound payment request for a given
//! amount and fee budget, then submit it into the generic
//! withdrawal-execution path. Adapters normalize backend-native failures
//! into [`RailError`] so callers can log a uniform detail line.

#![forbid(unsafe_code)]

pub mod bolt11;
mod client;
pub mod cln;
pub mod error;
pub mod lnaddr;
pub mod lnd;
pub mod units;
pub mod wallet;

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

pub use error::RailError;
pub use wallet::{UserContext, Wallet, WalletCredentials, WalletKind};

/// Expiry on destination-node invoices. Bounds how long an outbound payment
/// attempt can stay in flight.
pub const OUTBOUND_INVOICE_EXPIRY_SECONDS: u64 = 360;

/// The generic withdrawal-execution path the adapters submit into.
///
/// The worker implements this over its ledger and platform node; adapter
/// tests script it.
#[async_trait]
pub trait WithdrawalSink: Send + Sync {
    /// Pay `bolt11` on the user's behalf, reserving `max_fee_sats`.
    async fn execute_withdrawal(
        &self,
        bolt11: &str,
        max_fee_sats: u64,
        user: &UserContext,
    ) -> Result<Uuid, RailError>;

    /// Resolve a lightning address and pay `amount_sats` to it.
    async fn send_to_external_address(
        &self,
        address: &str,
        amount_sats: u64,
        max_fee_sats: u64,
        user: &UserContext,
    ) -> Result<Uuid, RailError>;
}

/// Common attempt contract over the closed backend set.
#[async_trait]
pub trait PaymentRails: Send + Sync {
    async fn attempt(
        &self,
        wallet: &Wallet,
        amount_sats: u64,
        max_fee_sats: u64,
        user: &UserContext,
    ) -> Result<Uuid, RailError>;
}

/// Live dispatch: one adapter per wallet kind, all funneling into the same
/// execution sink.
pub struct BackendRails {
    sink: Arc<dyn WithdrawalSink>,
}

impl BackendRails {
    #[must_use]
    pub fn new(sink: Arc<dyn WithdrawalSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl PaymentRails for BackendRails {
    async fn attempt(
        &self,
        wallet: &Wallet,
        amount_sats: u64,
        max_fee_sats: u64,
        user: &UserContext,
    ) -> Result<Uuid, RailError> {
        match &wallet.credentials {
            WalletCredentials::Lnd {
                socket,
                cert,
                macaroon,
            } => {
                lnd::attempt(
                    socket.as_deref(),
                    cert.as_deref(),
                    macaroon.as_deref(),
                    amount_sats,
                    max_fee_sats,
                    user,
                    self.sink.as_ref(),
                )
                .await
            }
            WalletCredentials::Cln { socket, cert, rune } => {
                cln::attempt(
                    socket.as_deref(),
                    cert.as_deref(),
                    rune.as_deref(),
                    amount_sats,
                    max_fee_sats,
                    user,
                    self.sink.as_ref(),
                )
                .await
            }
            WalletCredentials::LightningAddress { address } => {
                lnaddr::attempt(
                    address.as_deref(),
                    amount_sats,
                    max_fee_sats,
                    user,
                    self.sink.as_ref(),
                )
                .await
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use uuid::Uuid;

    use crate::error::RailError;
    use crate::wallet::UserContext;
    use crate::WithdrawalSink;

    #[derive(Debug, Clone)]
    pub struct ExecutedInvoice {
        pub bolt11: String,
        pub max_fee_sats: u64,
    }

    #[derive(Debug, Clone)]
    pub struct SentToAddress {
        pub address: String,
        pub amount_sats: u64,
        pub max_fee_sats: u64,
    }

    /// Scripted execution path: records every submission, then succeeds with
    /// a fixed withdrawal id or fails with a fixed detail.
    pub struct RecordingSink {
        pub withdrawal_id: Uuid,
        fail_with: Option<String>,
        executed: Mutex<Vec<ExecutedInvoice>>,
        sent: Mutex<Vec<SentToAddress>>,
    }

    impl RecordingSink {
        pub fn succeeding() -> Self {
            Self {
                withdrawal_id: Uuid::new_v4(),
                fail_with: None,
                executed: Mutex::new(Vec::new()),
                sent: Mutex::new(Vec::new()),
            }
        }

        pub fn failing(detail: &str) -> Self {
            Self {
                withdrawal_id: Uuid::new_v4(),
                fail_with: Some(detail.to_string()),
                executed: Mutex::new(Vec::new()),
                sent: Mutex::new(Vec::new()),
            }
        }

        pub fn executed_invoices(&self) -> Vec<ExecutedInvoice> {
            self.executed.lock().map(|rows| rows.clone()).unwrap_or_default()
        }

        pub fn sent_to_addresses(&self) -> Vec<SentToAddress> {
            self.sent.lock().map(|rows| rows.clone()).unwrap_or_default()
        }

        fn outcome(&self) -> Result<Uuid, RailError> {
            match self.fail_with.as_ref() {
                Some(detail) => Err(RailError::Rejected(detail.clone())),
                None => Ok(self.withdrawal_id),
            }
        }
    }

    #[async_trait]
    impl WithdrawalSink for RecordingSink {
        async fn execute_withdrawal(
            &self,
            bolt11: &str,
            max_fee_sats: u64,
            _user: &UserContext,
        ) -> Result<Uuid, RailError> {
            if let Ok(mut executed) = self.executed.lock() {
                executed.push(ExecutedInvoice {
                    bolt11: bolt11.to_string(),
                    max_fee_sats,
                });
            }
            self.outcome()
        }

        async fn send_to_external_address(
            &self,
            address: &str,
            amount_sats: u64,
            max_fee_sats: u64,
            _user: &UserContext,
        ) -> Result<Uuid, RailError> {
            if let Ok(mut sent) = self.sent.lock() {
                sent.push(SentToAddress {
                    address: address.to_string(),
                    amount_sats,
                    max_fee_sats,
                });
            }
            self.outcome()
        }
    }
}
