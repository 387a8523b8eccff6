use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};

/// Idempotent schema for everything the worker touches. The broker table
/// (`satbank.job_queue`) lives here too so a fresh database only needs one
/// `--migrate` run.
const SCHEMA_SQL: &str = r#"
CREATE SCHEMA IF NOT EXISTS satbank;

CREATE TABLE IF NOT EXISTS satbank.users (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    msats BIGINT NOT NULL DEFAULT 0,
    auto_withdraw_threshold_sats BIGINT,
    auto_withdraw_max_fee_percent INTEGER,
    hide_invoice_desc BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS satbank.wallets (
    id UUID PRIMARY KEY,
    user_id UUID NOT NULL REFERENCES satbank.users (id),
    priority INTEGER NOT NULL DEFAULT 0,
    credentials JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS wallets_user_priority_idx
    ON satbank.wallets (user_id, priority DESC);

CREATE TABLE IF NOT EXISTS satbank.withdrawals (
    id UUID PRIMARY KEY,
    user_id UUID NOT NULL REFERENCES satbank.users (id),
    hash TEXT NOT NULL,
    bolt11 TEXT,
    msats_paying BIGINT NOT NULL,
    msats_fee_paying BIGINT NOT NULL,
    msats_fee_paid BIGINT,
    status TEXT,
    auto_withdraw BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS withdrawals_hash_idx ON satbank.withdrawals (hash);
CREATE INDEX IF NOT EXISTS withdrawals_user_created_idx
    ON satbank.withdrawals (user_id, created_at DESC);

CREATE TABLE IF NOT EXISTS satbank.invoices (
    id UUID PRIMARY KEY,
    user_id UUID NOT NULL REFERENCES satbank.users (id),
    hash TEXT NOT NULL UNIQUE,
    bolt11 TEXT NOT NULL,
    msats_requested BIGINT NOT NULL,
    msats_received BIGINT,
    expires_at TIMESTAMPTZ NOT NULL,
    confirmed_at TIMESTAMPTZ,
    confirmed_index BIGINT,
    cancelled BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS invoices_confirmed_index_idx
    ON satbank.invoices (confirmed_index DESC NULLS LAST);

CREATE TABLE IF NOT EXISTS satbank.wallet_logs (
    id UUID PRIMARY KEY,
    user_id UUID NOT NULL REFERENCES satbank.users (id),
    wallet_kind TEXT NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS wallet_logs_user_created_idx
    ON satbank.wallet_logs (user_id, created_at DESC);

CREATE TABLE IF NOT EXISTS satbank.job_queue (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL,
    payload JSONB NOT NULL DEFAULT '{}'::jsonb,
    state TEXT NOT NULL DEFAULT 'created',
    attempts INTEGER NOT NULL DEFAULT 0,
    retry_limit INTEGER NOT NULL DEFAULT 0,
    retry_backoff BOOLEAN NOT NULL DEFAULT FALSE,
    start_after TIMESTAMPTZ NOT NULL DEFAULT now(),
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    completed_at TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS job_queue_fetch_idx
    ON satbank.job_queue (name, start_after)
    WHERE state IN ('created', 'retry');
"#;

/// Shared postgres connection for the worker.
#[derive(Clone)]
pub struct WorkerDb {
    client: Arc<Mutex<Client>>,
}

impl WorkerDb {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let (client, connection) = tokio_postgres::connect(url, NoTls)
            .await
            .context("connect to postgres")?;
        tokio::spawn(async move {
            if let Err(error) = connection.await {
                tracing::error!(reason = %error, "worker postgres connection error");
            }
        });
        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        let client = self.client.lock().await;
        client
            .batch_execute(SCHEMA_SQL)
            .await
            .context("apply worker schema")?;
        Ok(())
    }

    pub fn client(&self) -> Arc<Mutex<Client>> {
        self.client.clone()
    }
}
