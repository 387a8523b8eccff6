//! Balance and withdrawal bookkeeping.
//!
//! Every msat a user holds lives on `satbank.users.msats`. A withdrawal debits
//! principal plus the whole fee budget up front; settlement refunds whatever
//! part of the budget the route did not spend, and failure refunds everything.
//! That makes the three statuses on a withdrawal row a small state machine:
//! `NULL` (in flight, funds escrowed), `CONFIRMED`, `FAILED`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rails::wallet::{Wallet, WalletCredentials, WalletKind};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_postgres::Client;
use uuid::Uuid;

use crate::db::WorkerDb;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("not found")]
    NotFound,
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("database error: {0}")]
    Db(String),
}

/// What the autowithdraw engine needs to know about a user, in one read.
#[derive(Debug, Clone)]
pub struct AutowithdrawSettings {
    pub user_id: Uuid,
    pub msats: u64,
    /// `None` disables autowithdraw outright.
    pub threshold_sats: Option<u64>,
    /// `None` disables autowithdraw outright.
    pub max_fee_percent: Option<u32>,
    pub hide_invoice_desc: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithdrawalStatus {
    Confirmed,
    Failed,
}

impl WithdrawalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Confirmed => "CONFIRMED",
            Self::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewWithdrawal {
    pub user_id: Uuid,
    pub hash: String,
    pub bolt11: String,
    pub msats_paying: u64,
    pub msats_fee_paying: u64,
    pub auto_withdraw: bool,
}

#[derive(Debug, Clone)]
pub struct WithdrawalRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub hash: String,
    /// Nulled out by retention once the row is settled.
    pub bolt11: Option<String>,
    pub msats_paying: u64,
    pub msats_fee_paying: u64,
    pub msats_fee_paid: Option<u64>,
    /// `None` means the payment is still in flight.
    pub status: Option<WithdrawalStatus>,
    pub auto_withdraw: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct InvoiceRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub hash: String,
    pub bolt11: String,
    pub msats_requested: u64,
    pub msats_received: Option<u64>,
    pub expires_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    /// Node-side settle index, kept so subscriptions can resume after a crash.
    pub confirmed_index: Option<u64>,
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletLogLevel {
    Success,
    Error,
}

impl WalletLogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
        }
    }
}

/// One line of the user-visible wallet attempt history.
#[derive(Debug, Clone)]
pub struct WalletLogEntry {
    pub user_id: Uuid,
    pub wallet_kind: WalletKind,
    pub level: WalletLogLevel,
    pub message: String,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn autowithdraw_settings(
        &self,
        user_id: Uuid,
    ) -> Result<AutowithdrawSettings, LedgerError>;

    /// Wallets to try, best first. Ties on priority break toward the older row.
    async fn wallets_by_priority(&self, user_id: Uuid) -> Result<Vec<Wallet>, LedgerError>;

    /// Whether an earlier autowithdraw attempt should suppress a new one.
    ///
    /// An unsettled attempt always blocks. A settled-but-unconfirmed attempt
    /// blocks only while it is younger than `since` and its fee budget was at
    /// least `max_fee_msats`, so a retry may still go out with a raised fee.
    async fn has_blocking_autowithdraw(
        &self,
        user_id: Uuid,
        max_fee_msats: u64,
        since: DateTime<Utc>,
    ) -> Result<bool, LedgerError>;

    /// Debits principal plus fee budget and records the withdrawal, atomically.
    async fn create_withdrawal(&self, new: NewWithdrawal) -> Result<WithdrawalRow, LedgerError>;

    /// Latest withdrawal for a payment hash, if any.
    async fn withdrawal_by_hash(&self, hash: &str) -> Result<Option<WithdrawalRow>, LedgerError>;

    /// Marks the withdrawal confirmed and refunds the unspent fee budget.
    /// Settles at most once; a second call returns the already-settled row.
    async fn confirm_withdrawal(
        &self,
        hash: &str,
        msats_fee_paid: u64,
    ) -> Result<WithdrawalRow, LedgerError>;

    /// Marks the withdrawal failed and refunds principal plus fee budget.
    /// Settles at most once; a second call returns the already-settled row.
    async fn fail_withdrawal(&self, hash: &str) -> Result<WithdrawalRow, LedgerError>;

    /// Withdrawals still awaiting a terminal status, oldest first.
    async fn unsettled_withdrawals(&self) -> Result<Vec<WithdrawalRow>, LedgerError>;

    async fn invoice_by_hash(&self, hash: &str) -> Result<Option<InvoiceRow>, LedgerError>;

    /// Credits the user and stamps the settle index. Settles at most once.
    async fn settle_invoice(
        &self,
        hash: &str,
        msats_received: u64,
        confirmed_index: u64,
        confirmed_at: DateTime<Utc>,
    ) -> Result<InvoiceRow, LedgerError>;

    /// Marks an unpaid invoice cancelled. A settled or already-cancelled
    /// invoice is returned unchanged.
    async fn cancel_invoice(&self, hash: &str) -> Result<InvoiceRow, LedgerError>;

    /// Highest settle index recorded so far, 0 when none is.
    async fn max_confirmed_index(&self) -> Result<u64, LedgerError>;

    async fn append_wallet_log(&self, entry: WalletLogEntry) -> Result<(), LedgerError>;

    /// Nulls `bolt11` on settled withdrawals older than `cutoff`. Returns the
    /// number of rows touched.
    async fn drop_old_bolt11s(&self, cutoff: DateTime<Utc>) -> Result<u64, LedgerError>;
}

pub fn memory() -> Arc<dyn LedgerStore> {
    MemoryLedgerStore::shared()
}

pub fn postgres(db: &WorkerDb) -> Arc<dyn LedgerStore> {
    Arc::new(PostgresLedgerStore { client: db.client() })
}

#[derive(Debug, Clone)]
struct MemoryUser {
    msats: u64,
    threshold_sats: Option<u64>,
    max_fee_percent: Option<u32>,
    hide_invoice_desc: bool,
}

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, MemoryUser>,
    wallets: Vec<Wallet>,
    withdrawals: Vec<WithdrawalRow>,
    invoices: HashMap<String, InvoiceRow>,
    wallet_logs: Vec<WalletLogEntry>,
}

/// In-memory store for tests and for running without a database.
#[derive(Default)]
pub struct MemoryLedgerStore {
    inner: Mutex<Inner>,
}

impl MemoryLedgerStore {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn insert_user(
        &self,
        user_id: Uuid,
        msats: u64,
        threshold_sats: Option<u64>,
        max_fee_percent: Option<u32>,
    ) {
        let mut inner = self.inner.lock().await;
        inner.users.insert(
            user_id,
            MemoryUser {
                msats,
                threshold_sats,
                max_fee_percent,
                hide_invoice_desc: false,
            },
        );
    }

    pub async fn insert_wallet(
        &self,
        user_id: Uuid,
        priority: i32,
        credentials: WalletCredentials,
    ) -> Uuid {
        let mut inner = self.inner.lock().await;
        let id = Uuid::now_v7();
        inner.wallets.push(Wallet {
            id,
            user_id,
            priority,
            credentials,
            created_at: Utc::now(),
        });
        id
    }

    pub async fn insert_invoice(&self, invoice: InvoiceRow) {
        let mut inner = self.inner.lock().await;
        inner.invoices.insert(invoice.hash.clone(), invoice);
    }

    pub async fn seed_withdrawal(&self, row: WithdrawalRow) {
        let mut inner = self.inner.lock().await;
        inner.withdrawals.push(row);
    }

    pub async fn user_msats(&self, user_id: Uuid) -> Option<u64> {
        let inner = self.inner.lock().await;
        inner.users.get(&user_id).map(|user| user.msats)
    }

    pub async fn withdrawals(&self) -> Vec<WithdrawalRow> {
        let inner = self.inner.lock().await;
        inner.withdrawals.clone()
    }

    pub async fn wallet_logs(&self) -> Vec<WalletLogEntry> {
        let inner = self.inner.lock().await;
        inner.wallet_logs.clone()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn autowithdraw_settings(
        &self,
        user_id: Uuid,
    ) -> Result<AutowithdrawSettings, LedgerError> {
        let inner = self.inner.lock().await;
        let user = inner.users.get(&user_id).ok_or(LedgerError::NotFound)?;
        Ok(AutowithdrawSettings {
            user_id,
            msats: user.msats,
            threshold_sats: user.threshold_sats,
            max_fee_percent: user.max_fee_percent,
            hide_invoice_desc: user.hide_invoice_desc,
        })
    }

    async fn wallets_by_priority(&self, user_id: Uuid) -> Result<Vec<Wallet>, LedgerError> {
        let inner = self.inner.lock().await;
        let mut wallets: Vec<Wallet> = inner
            .wallets
            .iter()
            .filter(|wallet| wallet.user_id == user_id)
            .cloned()
            .collect();
        wallets.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(wallets)
    }

    async fn has_blocking_autowithdraw(
        &self,
        user_id: Uuid,
        max_fee_msats: u64,
        since: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let inner = self.inner.lock().await;
        Ok(inner.withdrawals.iter().any(|row| {
            row.user_id == user_id
                && row.auto_withdraw
                && (row.status.is_none()
                    || (row.status != Some(WithdrawalStatus::Confirmed)
                        && row.created_at > since
                        && row.msats_fee_paying >= max_fee_msats))
        }))
    }

    async fn create_withdrawal(&self, new: NewWithdrawal) -> Result<WithdrawalRow, LedgerError> {
        let mut inner = self.inner.lock().await;
        let total = new.msats_paying.saturating_add(new.msats_fee_paying);
        let user = inner
            .users
            .get_mut(&new.user_id)
            .ok_or(LedgerError::NotFound)?;
        if user.msats < total {
            return Err(LedgerError::InsufficientBalance);
        }
        user.msats -= total;
        let now = Utc::now();
        let row = WithdrawalRow {
            id: Uuid::now_v7(),
            user_id: new.user_id,
            hash: new.hash,
            bolt11: Some(new.bolt11),
            msats_paying: new.msats_paying,
            msats_fee_paying: new.msats_fee_paying,
            msats_fee_paid: None,
            status: None,
            auto_withdraw: new.auto_withdraw,
            created_at: now,
            updated_at: now,
        };
        inner.withdrawals.push(row.clone());
        Ok(row)
    }

    async fn withdrawal_by_hash(&self, hash: &str) -> Result<Option<WithdrawalRow>, LedgerError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .withdrawals
            .iter()
            .filter(|row| row.hash == hash)
            .max_by_key(|row| row.created_at)
            .cloned())
    }

    async fn confirm_withdrawal(
        &self,
        hash: &str,
        msats_fee_paid: u64,
    ) -> Result<WithdrawalRow, LedgerError> {
        let mut inner = self.inner.lock().await;
        let open = inner
            .withdrawals
            .iter()
            .position(|row| row.hash == hash && row.status.is_none());
        match open {
            Some(index) => {
                let (user_id, refund) = {
                    let row = &mut inner.withdrawals[index];
                    row.status = Some(WithdrawalStatus::Confirmed);
                    row.msats_fee_paid = Some(msats_fee_paid);
                    row.updated_at = Utc::now();
                    (row.user_id, row.msats_fee_paying.saturating_sub(msats_fee_paid))
                };
                if refund > 0 {
                    if let Some(user) = inner.users.get_mut(&user_id) {
                        user.msats = user.msats.saturating_add(refund);
                    }
                }
                Ok(inner.withdrawals[index].clone())
            }
            None => inner
                .withdrawals
                .iter()
                .find(|row| row.hash == hash)
                .cloned()
                .ok_or(LedgerError::NotFound),
        }
    }

    async fn fail_withdrawal(&self, hash: &str) -> Result<WithdrawalRow, LedgerError> {
        let mut inner = self.inner.lock().await;
        let open = inner
            .withdrawals
            .iter()
            .position(|row| row.hash == hash && row.status.is_none());
        match open {
            Some(index) => {
                let (user_id, refund) = {
                    let row = &mut inner.withdrawals[index];
                    row.status = Some(WithdrawalStatus::Failed);
                    row.updated_at = Utc::now();
                    (row.user_id, row.msats_paying.saturating_add(row.msats_fee_paying))
                };
                if let Some(user) = inner.users.get_mut(&user_id) {
                    user.msats = user.msats.saturating_add(refund);
                }
                Ok(inner.withdrawals[index].clone())
            }
            None => inner
                .withdrawals
                .iter()
                .find(|row| row.hash == hash)
                .cloned()
                .ok_or(LedgerError::NotFound),
        }
    }

    async fn unsettled_withdrawals(&self) -> Result<Vec<WithdrawalRow>, LedgerError> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<WithdrawalRow> = inner
            .withdrawals
            .iter()
            .filter(|row| row.status.is_none())
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.created_at);
        Ok(rows)
    }

    async fn invoice_by_hash(&self, hash: &str) -> Result<Option<InvoiceRow>, LedgerError> {
        let inner = self.inner.lock().await;
        Ok(inner.invoices.get(hash).cloned())
    }

    async fn settle_invoice(
        &self,
        hash: &str,
        msats_received: u64,
        confirmed_index: u64,
        confirmed_at: DateTime<Utc>,
    ) -> Result<InvoiceRow, LedgerError> {
        let mut inner = self.inner.lock().await;
        let invoice = inner.invoices.get(hash).ok_or(LedgerError::NotFound)?;
        if invoice.confirmed_at.is_some() || invoice.cancelled {
            return Ok(invoice.clone());
        }
        let user_id = invoice.user_id;
        if let Some(user) = inner.users.get_mut(&user_id) {
            user.msats = user.msats.saturating_add(msats_received);
        }
        let invoice = inner
            .invoices
            .get_mut(hash)
            .ok_or(LedgerError::NotFound)?;
        invoice.msats_received = Some(msats_received);
        invoice.confirmed_at = Some(confirmed_at);
        invoice.confirmed_index = Some(confirmed_index);
        Ok(invoice.clone())
    }

    async fn cancel_invoice(&self, hash: &str) -> Result<InvoiceRow, LedgerError> {
        let mut inner = self.inner.lock().await;
        let invoice = inner
            .invoices
            .get_mut(hash)
            .ok_or(LedgerError::NotFound)?;
        if invoice.confirmed_at.is_none() {
            invoice.cancelled = true;
        }
        Ok(invoice.clone())
    }

    async fn max_confirmed_index(&self) -> Result<u64, LedgerError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .invoices
            .values()
            .filter_map(|invoice| invoice.confirmed_index)
            .max()
            .unwrap_or(0))
    }

    async fn append_wallet_log(&self, entry: WalletLogEntry) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().await;
        inner.wallet_logs.push(entry);
        Ok(())
    }

    async fn drop_old_bolt11s(&self, cutoff: DateTime<Utc>) -> Result<u64, LedgerError> {
        let mut inner = self.inner.lock().await;
        let mut dropped = 0;
        for row in &mut inner.withdrawals {
            if row.status.is_some() && row.created_at < cutoff && row.bolt11.is_some() {
                row.bolt11 = None;
                dropped += 1;
            }
        }
        Ok(dropped)
    }
}

struct PostgresLedgerStore {
    client: Arc<Mutex<Client>>,
}

const WITHDRAWAL_COLUMNS: &str = "id, user_id, hash, bolt11, msats_paying, msats_fee_paying, \
     msats_fee_paid, status, auto_withdraw, created_at, updated_at";

const INVOICE_COLUMNS: &str = "id, user_id, hash, bolt11, msats_requested, msats_received, \
     expires_at, confirmed_at, confirmed_index, cancelled, created_at";

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn autowithdraw_settings(
        &self,
        user_id: Uuid,
    ) -> Result<AutowithdrawSettings, LedgerError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT msats, auto_withdraw_threshold_sats, auto_withdraw_max_fee_percent,
                       hide_invoice_desc
                FROM satbank.users
                WHERE id = $1
                "#,
                &[&user_id],
            )
            .await
            .map_err(|error| LedgerError::Db(error.to_string()))?
            .ok_or(LedgerError::NotFound)?;
        let threshold: Option<i64> = row.get(1);
        let percent: Option<i32> = row.get(2);
        Ok(AutowithdrawSettings {
            user_id,
            msats: u64_from_i64(row.get(0)),
            threshold_sats: threshold.map(u64_from_i64),
            max_fee_percent: percent.map(|value| u32::try_from(value).unwrap_or(0)),
            hide_invoice_desc: row.get(3),
        })
    }

    async fn wallets_by_priority(&self, user_id: Uuid) -> Result<Vec<Wallet>, LedgerError> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT id, user_id, priority, credentials, created_at
                FROM satbank.wallets
                WHERE user_id = $1
                ORDER BY priority DESC, created_at ASC
                "#,
                &[&user_id],
            )
            .await
            .map_err(|error| LedgerError::Db(error.to_string()))?;
        rows.iter().map(map_wallet_row).collect()
    }

    async fn has_blocking_autowithdraw(
        &self,
        user_id: Uuid,
        max_fee_msats: u64,
        since: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let client = self.client.lock().await;
        let row = client
            .query_one(
                r#"
                SELECT EXISTS (
                    SELECT 1
                    FROM satbank.withdrawals
                    WHERE user_id = $1
                      AND auto_withdraw
                      AND (status IS NULL
                           OR (status <> 'CONFIRMED'
                               AND created_at > $2
                               AND msats_fee_paying >= $3))
                )
                "#,
                &[
                    &user_id,
                    &since,
                    &i64::try_from(max_fee_msats).unwrap_or(i64::MAX),
                ],
            )
            .await
            .map_err(|error| LedgerError::Db(error.to_string()))?;
        Ok(row.get(0))
    }

    async fn create_withdrawal(&self, new: NewWithdrawal) -> Result<WithdrawalRow, LedgerError> {
        let total = new.msats_paying.saturating_add(new.msats_fee_paying);
        let mut client = self.client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| LedgerError::Db(error.to_string()))?;
        let debited = tx
            .query_opt(
                r#"
                UPDATE satbank.users
                SET msats = msats - $2
                WHERE id = $1 AND msats >= $2
                RETURNING id
                "#,
                &[&new.user_id, &i64::try_from(total).unwrap_or(i64::MAX)],
            )
            .await
            .map_err(|error| LedgerError::Db(error.to_string()))?;
        if debited.is_none() {
            return Err(LedgerError::InsufficientBalance);
        }
        let row = tx
            .query_one(
                &format!(
                    r#"
                    INSERT INTO satbank.withdrawals
                        (id, user_id, hash, bolt11, msats_paying, msats_fee_paying, auto_withdraw)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    RETURNING {WITHDRAWAL_COLUMNS}
                    "#
                ),
                &[
                    &Uuid::now_v7(),
                    &new.user_id,
                    &new.hash,
                    &new.bolt11,
                    &i64::try_from(new.msats_paying).unwrap_or(i64::MAX),
                    &i64::try_from(new.msats_fee_paying).unwrap_or(i64::MAX),
                    &new.auto_withdraw,
                ],
            )
            .await
            .map_err(|error| LedgerError::Db(error.to_string()))?;
        let row = map_withdrawal_row(&row)?;
        tx.commit()
            .await
            .map_err(|error| LedgerError::Db(error.to_string()))?;
        Ok(row)
    }

    async fn withdrawal_by_hash(&self, hash: &str) -> Result<Option<WithdrawalRow>, LedgerError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                &format!(
                    r#"
                    SELECT {WITHDRAWAL_COLUMNS}
                    FROM satbank.withdrawals
                    WHERE hash = $1
                    ORDER BY created_at DESC
                    LIMIT 1
                    "#
                ),
                &[&hash],
            )
            .await
            .map_err(|error| LedgerError::Db(error.to_string()))?;
        row.as_ref().map(map_withdrawal_row).transpose()
    }

    async fn confirm_withdrawal(
        &self,
        hash: &str,
        msats_fee_paid: u64,
    ) -> Result<WithdrawalRow, LedgerError> {
        let mut client = self.client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| LedgerError::Db(error.to_string()))?;
        let settled = tx
            .query_opt(
                &format!(
                    r#"
                    UPDATE satbank.withdrawals
                    SET status = 'CONFIRMED', msats_fee_paid = $2, updated_at = now()
                    WHERE hash = $1 AND status IS NULL
                    RETURNING {WITHDRAWAL_COLUMNS}
                    "#
                ),
                &[&hash, &i64::try_from(msats_fee_paid).unwrap_or(i64::MAX)],
            )
            .await
            .map_err(|error| LedgerError::Db(error.to_string()))?;
        let Some(settled) = settled else {
            drop(tx);
            let row = client
                .query_opt(
                    &format!(
                        r#"
                        SELECT {WITHDRAWAL_COLUMNS}
                        FROM satbank.withdrawals
                        WHERE hash = $1
                        ORDER BY created_at DESC
                        LIMIT 1
                        "#
                    ),
                    &[&hash],
                )
                .await
                .map_err(|error| LedgerError::Db(error.to_string()))?;
            return row
                .as_ref()
                .map(map_withdrawal_row)
                .transpose()?
                .ok_or(LedgerError::NotFound);
        };
        let row = map_withdrawal_row(&settled)?;
        let refund = row.msats_fee_paying.saturating_sub(msats_fee_paid);
        if refund > 0 {
            tx.execute(
                r#"UPDATE satbank.users SET msats = msats + $2 WHERE id = $1"#,
                &[&row.user_id, &i64::try_from(refund).unwrap_or(i64::MAX)],
            )
            .await
            .map_err(|error| LedgerError::Db(error.to_string()))?;
        }
        tx.commit()
            .await
            .map_err(|error| LedgerError::Db(error.to_string()))?;
        Ok(row)
    }

    async fn fail_withdrawal(&self, hash: &str) -> Result<WithdrawalRow, LedgerError> {
        let mut client = self.client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| LedgerError::Db(error.to_string()))?;
        let settled = tx
            .query_opt(
                &format!(
                    r#"
                    UPDATE satbank.withdrawals
                    SET status = 'FAILED', updated_at = now()
                    WHERE hash = $1 AND status IS NULL
                    RETURNING {WITHDRAWAL_COLUMNS}
                    "#
                ),
                &[&hash],
            )
            .await
            .map_err(|error| LedgerError::Db(error.to_string()))?;
        let Some(settled) = settled else {
            drop(tx);
            let row = client
                .query_opt(
                    &format!(
                        r#"
                        SELECT {WITHDRAWAL_COLUMNS}
                        FROM satbank.withdrawals
                        WHERE hash = $1
                        ORDER BY created_at DESC
                        LIMIT 1
                        "#
                    ),
                    &[&hash],
                )
                .await
                .map_err(|error| LedgerError::Db(error.to_string()))?;
            return row
                .as_ref()
                .map(map_withdrawal_row)
                .transpose()?
                .ok_or(LedgerError::NotFound);
        };
        let row = map_withdrawal_row(&settled)?;
        let refund = row.msats_paying.saturating_add(row.msats_fee_paying);
        tx.execute(
            r#"UPDATE satbank.users SET msats = msats + $2 WHERE id = $1"#,
            &[&row.user_id, &i64::try_from(refund).unwrap_or(i64::MAX)],
        )
        .await
        .map_err(|error| LedgerError::Db(error.to_string()))?;
        tx.commit()
            .await
            .map_err(|error| LedgerError::Db(error.to_string()))?;
        Ok(row)
    }

    async fn unsettled_withdrawals(&self) -> Result<Vec<WithdrawalRow>, LedgerError> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                &format!(
                    r#"
                    SELECT {WITHDRAWAL_COLUMNS}
                    FROM satbank.withdrawals
                    WHERE status IS NULL
                    ORDER BY created_at ASC
                    "#
                ),
                &[],
            )
            .await
            .map_err(|error| LedgerError::Db(error.to_string()))?;
        rows.iter().map(map_withdrawal_row).collect()
    }

    async fn invoice_by_hash(&self, hash: &str) -> Result<Option<InvoiceRow>, LedgerError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                &format!(
                    r#"
                    SELECT {INVOICE_COLUMNS}
                    FROM satbank.invoices
                    WHERE hash = $1
                    "#
                ),
                &[&hash],
            )
            .await
            .map_err(|error| LedgerError::Db(error.to_string()))?;
        row.as_ref().map(map_invoice_row).transpose()
    }

    async fn settle_invoice(
        &self,
        hash: &str,
        msats_received: u64,
        confirmed_index: u64,
        confirmed_at: DateTime<Utc>,
    ) -> Result<InvoiceRow, LedgerError> {
        let mut client = self.client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| LedgerError::Db(error.to_string()))?;
        let settled = tx
            .query_opt(
                &format!(
                    r#"
                    UPDATE satbank.invoices
                    SET msats_received = $2, confirmed_at = $3, confirmed_index = $4
                    WHERE hash = $1 AND confirmed_at IS NULL AND NOT cancelled
                    RETURNING {INVOICE_COLUMNS}
                    "#
                ),
                &[
                    &hash,
                    &i64::try_from(msats_received).unwrap_or(i64::MAX),
                    &confirmed_at,
                    &i64::try_from(confirmed_index).unwrap_or(i64::MAX),
                ],
            )
            .await
            .map_err(|error| LedgerError::Db(error.to_string()))?;
        let Some(settled) = settled else {
            drop(tx);
            let row = client
                .query_opt(
                    &format!(
                        r#"
                        SELECT {INVOICE_COLUMNS}
                        FROM satbank.invoices
                        WHERE hash = $1
                        "#
                    ),
                    &[&hash],
                )
                .await
                .map_err(|error| LedgerError::Db(error.to_string()))?;
            return row
                .as_ref()
                .map(map_invoice_row)
                .transpose()?
                .ok_or(LedgerError::NotFound);
        };
        let row = map_invoice_row(&settled)?;
        tx.execute(
            r#"UPDATE satbank.users SET msats = msats + $2 WHERE id = $1"#,
            &[
                &row.user_id,
                &i64::try_from(msats_received).unwrap_or(i64::MAX),
            ],
        )
        .await
        .map_err(|error| LedgerError::Db(error.to_string()))?;
        tx.commit()
            .await
            .map_err(|error| LedgerError::Db(error.to_string()))?;
        Ok(row)
    }

    async fn cancel_invoice(&self, hash: &str) -> Result<InvoiceRow, LedgerError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                &format!(
                    r#"
                    UPDATE satbank.invoices
                    SET cancelled = TRUE
                    WHERE hash = $1 AND confirmed_at IS NULL
                    RETURNING {INVOICE_COLUMNS}
                    "#
                ),
                &[&hash],
            )
            .await
            .map_err(|error| LedgerError::Db(error.to_string()))?;
        match row {
            Some(row) => map_invoice_row(&row),
            None => {
                let row = client
                    .query_opt(
                        &format!(
                            r#"
                            SELECT {INVOICE_COLUMNS}
                            FROM satbank.invoices
                            WHERE hash = $1
                            "#
                        ),
                        &[&hash],
                    )
                    .await
                    .map_err(|error| LedgerError::Db(error.to_string()))?;
                row.as_ref()
                    .map(map_invoice_row)
                    .transpose()?
                    .ok_or(LedgerError::NotFound)
            }
        }
    }

    async fn max_confirmed_index(&self) -> Result<u64, LedgerError> {
        let client = self.client.lock().await;
        let row = client
            .query_one(
                r#"SELECT COALESCE(MAX(confirmed_index), 0) FROM satbank.invoices"#,
                &[],
            )
            .await
            .map_err(|error| LedgerError::Db(error.to_string()))?;
        Ok(u64_from_i64(row.get(0)))
    }

    async fn append_wallet_log(&self, entry: WalletLogEntry) -> Result<(), LedgerError> {
        let client = self.client.lock().await;
        client
            .execute(
                r#"
                INSERT INTO satbank.wallet_logs (id, user_id, wallet_kind, level, message)
                VALUES ($1, $2, $3, $4, $5)
                "#,
                &[
                    &Uuid::now_v7(),
                    &entry.user_id,
                    &entry.wallet_kind.as_str(),
                    &entry.level.as_str(),
                    &entry.message,
                ],
            )
            .await
            .map_err(|error| LedgerError::Db(error.to_string()))?;
        Ok(())
    }

    async fn drop_old_bolt11s(&self, cutoff: DateTime<Utc>) -> Result<u64, LedgerError> {
        let client = self.client.lock().await;
        client
            .execute(
                r#"
                UPDATE satbank.withdrawals
                SET bolt11 = NULL
                WHERE created_at < $1 AND bolt11 IS NOT NULL AND status IS NOT NULL
                "#,
                &[&cutoff],
            )
            .await
            .map_err(|error| LedgerError::Db(error.to_string()))
    }
}

fn map_wallet_row(row: &tokio_postgres::Row) -> Result<Wallet, LedgerError> {
    let credentials: serde_json::Value = row.get(3);
    let credentials: WalletCredentials = serde_json::from_value(credentials)
        .map_err(|error| LedgerError::Db(format!("bad wallet credentials: {error}")))?;
    Ok(Wallet {
        id: row.get(0),
        user_id: row.get(1),
        priority: row.get(2),
        credentials,
        created_at: row.get(4),
    })
}

fn map_withdrawal_row(row: &tokio_postgres::Row) -> Result<WithdrawalRow, LedgerError> {
    let status: Option<String> = row.get(7);
    let status = match status.as_deref() {
        None => None,
        Some("CONFIRMED") => Some(WithdrawalStatus::Confirmed),
        Some("FAILED") => Some(WithdrawalStatus::Failed),
        Some(other) => {
            return Err(LedgerError::Db(format!("unknown withdrawal status: {other}")));
        }
    };
    let msats_fee_paid: Option<i64> = row.get(6);
    Ok(WithdrawalRow {
        id: row.get(0),
        user_id: row.get(1),
        hash: row.get(2),
        bolt11: row.get(3),
        msats_paying: u64_from_i64(row.get(4)),
        msats_fee_paying: u64_from_i64(row.get(5)),
        msats_fee_paid: msats_fee_paid.map(u64_from_i64),
        status,
        auto_withdraw: row.get(8),
        created_at: row.get(9),
        updated_at: row.get(10),
    })
}

fn map_invoice_row(row: &tokio_postgres::Row) -> Result<InvoiceRow, LedgerError> {
    let msats_received: Option<i64> = row.get(5);
    let confirmed_index: Option<i64> = row.get(8);
    Ok(InvoiceRow {
        id: row.get(0),
        user_id: row.get(1),
        hash: row.get(2),
        bolt11: row.get(3),
        msats_requested: u64_from_i64(row.get(4)),
        msats_received: msats_received.map(u64_from_i64),
        expires_at: row.get(6),
        confirmed_at: row.get(7),
        confirmed_index: confirmed_index.map(u64_from_i64),
        cancelled: row.get(9),
        created_at: row.get(10),
    })
}

fn u64_from_i64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
