//! Queue worker for the satbank custodial ledger.
//!
//! One process owns everything that happens after money sits in a user's
//! balance: the autowithdraw engine, payment dispatch through the wallet
//! rails, settlement checks against the node, and the event subscriptions
//! that keep the ledger honest across restarts.

#![forbid(unsafe_code)]

pub mod autowithdraw;
pub mod config;
pub mod db;
pub mod jobs;
pub mod ledger;
pub mod node;
pub mod payout;
pub mod queue;
pub mod reconcile;
pub mod subscriptions;

#[cfg(test)]
pub(crate) mod testutil;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rails::{BackendRails, PaymentRails, WithdrawalSink};
use rand::Rng as _;
use tokio::sync::watch;

use crate::autowithdraw::AutowithdrawEngine;
use crate::config::Config;
use crate::db::WorkerDb;
use crate::jobs::JobContext;
use crate::ledger::LedgerStore;
use crate::node::LightningNode;
use crate::payout::{PayoutService, PayoutSettings};
use crate::queue::{Enqueue, JobQueue};

pub struct WorkerState {
    pub config: Config,
    pub ledger: Arc<dyn LedgerStore>,
    pub queue: Arc<dyn JobQueue>,
    pub node: Arc<dyn LightningNode>,
}

/// Wires stores and the node client from configuration. Without a database
/// URL the worker still runs, on stores that do not survive a restart.
pub async fn build_worker_state(config: Config) -> anyhow::Result<WorkerState> {
    let (ledger, queue) = match config.db_url.as_deref() {
        Some(url) => {
            let db = WorkerDb::connect(url).await?;
            (
                ledger::postgres(&db),
                queue::postgres(&db, config.job_retry_delay_seconds),
            )
        }
        None => {
            tracing::warn!("DB_URL is not set; state lives in memory and is lost on restart");
            (
                ledger::memory(),
                queue::memory(config.job_retry_delay_seconds),
            )
        }
    };
    let node = node::from_config(&config);
    Ok(WorkerState {
        config,
        ledger,
        queue,
        node,
    })
}

/// Runs the worker until `shutdown` flips to true.
pub async fn run(state: WorkerState, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let config = state.config.clone();
    let payout: Arc<dyn WithdrawalSink> = Arc::new(PayoutService::new(
        state.ledger.clone(),
        state.node.clone(),
        state.queue.clone(),
        PayoutSettings {
            payment_timeout_seconds: config.payment_timeout_seconds,
            check_delay_seconds: config.check_withdrawal_delay_seconds,
            job_retry_limit: config.job_retry_limit,
        },
    ));
    let rails: Arc<dyn PaymentRails> = Arc::new(BackendRails::new(payout));
    let engine = Arc::new(AutowithdrawEngine::new(state.ledger.clone(), rails));
    let ctx = JobContext {
        ledger: state.ledger.clone(),
        node: state.node.clone(),
        queue: state.queue.clone(),
        engine,
        bolt11_retention_days: config.bolt11_retention_days,
    };

    seed_recovery_jobs(&ctx, &config).await;

    let invoice_task = tokio::spawn(invoice_subscription_loop(
        ctx.clone(),
        config.clone(),
        shutdown.clone(),
    ));
    let payment_task = tokio::spawn(payment_subscription_loop(
        ctx.clone(),
        config.clone(),
        shutdown.clone(),
    ));

    jobs::run_pollers(
        ctx,
        config.job_concurrency,
        config.queue_poll_interval_ms,
        shutdown,
    )
    .await;

    let _ = invoice_task.await;
    let _ = payment_task.await;
    tracing::info!("worker stopped");
    Ok(())
}

/// Seeds one settlement check per unsettled withdrawal, so payments that
/// were in flight when the last process died still get resolved, plus one
/// retention run.
async fn seed_recovery_jobs(ctx: &JobContext, config: &Config) {
    match ctx.ledger.unsettled_withdrawals().await {
        Ok(rows) => {
            let count = rows.len();
            for row in rows {
                enqueue_at_boot(
                    ctx,
                    config,
                    jobs::CHECK_WITHDRAWAL,
                    serde_json::json!({ "hash": row.hash }),
                )
                .await;
            }
            if count > 0 {
                tracing::info!(count, "scheduled checks for unsettled withdrawals");
            }
        }
        Err(error) => {
            tracing::warn!(reason = %error, "could not scan for unsettled withdrawals");
        }
    }
    enqueue_at_boot(ctx, config, jobs::DROP_BOLT11S, serde_json::json!({})).await;
}

async fn enqueue_at_boot(ctx: &JobContext, config: &Config, name: &str, payload: serde_json::Value) {
    let job = Enqueue {
        name: name.to_string(),
        payload,
        retry_limit: config.job_retry_limit,
        retry_backoff: true,
        start_after: Utc::now(),
    };
    if let Err(error) = ctx.queue.enqueue(job).await {
        tracing::warn!(job = name, reason = %error, "could not enqueue a boot job");
    }
}

async fn invoice_subscription_loop(
    ctx: JobContext,
    config: Config,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut delay_ms = config.subscribe_retry_base_ms;
    loop {
        if *shutdown.borrow() {
            break;
        }
        let session = async {
            let resume_from = match ctx.ledger.max_confirmed_index().await {
                Ok(index) => index,
                Err(error) => return (false, format!("read settle index: {error}")),
            };
            match ctx.node.subscribe_invoices(resume_from).await {
                Ok(events) => {
                    tracing::info!(resume_from, "invoice subscription open");
                    let stopped = subscriptions::run_invoice_events(
                        events,
                        ctx.queue.clone(),
                        config.job_retry_limit,
                    )
                    .await;
                    (true, stopped.to_string())
                }
                Err(error) => (false, format!("open invoice subscription: {error}")),
            }
        };
        tokio::select! {
            _ = shutdown.changed() => break,
            (opened, reason) = session => {
                if opened {
                    delay_ms = config.subscribe_retry_base_ms;
                }
                tracing::warn!(reason = %reason, "invoice subscription lost; reconnecting");
            }
        }
        if !sleep_with_backoff(&mut delay_ms, &config, &mut shutdown).await {
            break;
        }
    }
    tracing::debug!("invoice subscription loop stopped");
}

async fn payment_subscription_loop(
    ctx: JobContext,
    config: Config,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut delay_ms = config.subscribe_retry_base_ms;
    loop {
        if *shutdown.borrow() {
            break;
        }
        let session = async {
            match ctx.node.subscribe_payments().await {
                Ok(events) => {
                    tracing::info!("payment subscription open");
                    let stopped = subscriptions::run_payment_events(
                        events,
                        ctx.queue.clone(),
                        config.job_retry_limit,
                    )
                    .await;
                    (true, stopped.to_string())
                }
                Err(error) => (false, format!("open payment subscription: {error}")),
            }
        };
        tokio::select! {
            _ = shutdown.changed() => break,
            (opened, reason) = session => {
                if opened {
                    delay_ms = config.subscribe_retry_base_ms;
                }
                tracing::warn!(reason = %reason, "payment subscription lost; reconnecting");
            }
        }
        if !sleep_with_backoff(&mut delay_ms, &config, &mut shutdown).await {
            break;
        }
    }
    tracing::debug!("payment subscription loop stopped");
}

/// Sleeps the current delay plus jitter, then doubles the delay up to the
/// configured cap. Returns false when shutdown fired during the sleep.
async fn sleep_with_backoff(
    delay_ms: &mut u64,
    config: &Config,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let jitter = rand::rng().random_range(0..=config.subscribe_retry_jitter_ms);
    let wait = Duration::from_millis(delay_ms.saturating_add(jitter));
    *delay_ms = delay_ms.saturating_mul(2).min(config.subscribe_retry_max_ms);
    tokio::select! {
        _ = shutdown.changed() => false,
        () = tokio::time::sleep(wait) => true,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use tokio::sync::watch;
    use uuid::Uuid;

    use crate::autowithdraw::AutowithdrawEngine;
    use crate::config::Config;
    use crate::jobs::{self, JobContext};
    use crate::ledger::{MemoryLedgerStore, WithdrawalRow, WithdrawalStatus};
    use crate::node::LightningNode as _;
    use crate::queue::MemoryJobQueue;
    use crate::testutil::{FakeNode, FakeRails};

    fn unsettled_row(hash: &str) -> WithdrawalRow {
        WithdrawalRow {
            id: Uuid::now_v7(),
            user_id: Uuid::now_v7(),
            hash: hash.to_string(),
            bolt11: Some("lnbc1recovered".to_string()),
            msats_paying: 10_000,
            msats_fee_paying: 1_000,
            msats_fee_paid: None,
            status: None,
            auto_withdraw: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn boot_seeds_checks_for_unsettled_withdrawals_and_retention() {
        let ledger = MemoryLedgerStore::shared();
        let queue = MemoryJobQueue::shared(30);
        let engine = Arc::new(AutowithdrawEngine::new(ledger.clone(), FakeRails::shared()));
        let ctx = JobContext {
            ledger: ledger.clone(),
            node: FakeNode::shared(),
            queue: queue.clone(),
            engine,
            bolt11_retention_days: 10,
        };
        let config = Config::from_lookup(|_| None).expect("default config");

        ledger.seed_withdrawal(unsettled_row("aa11")).await;
        ledger.seed_withdrawal(unsettled_row("bb22")).await;
        let mut settled = unsettled_row("cc33");
        settled.status = Some(WithdrawalStatus::Confirmed);
        ledger.seed_withdrawal(settled).await;

        super::seed_recovery_jobs(&ctx, &config).await;

        let seeded = queue.jobs().await;
        let checks: Vec<_> = seeded
            .iter()
            .filter(|job| job.name == jobs::CHECK_WITHDRAWAL)
            .collect();
        assert_eq!(checks.len(), 2);
        let hashes: Vec<_> = checks
            .iter()
            .map(|job| job.payload["hash"].as_str().unwrap_or_default())
            .collect();
        assert!(hashes.contains(&"aa11"));
        assert!(hashes.contains(&"bb22"));
        assert_eq!(
            seeded
                .iter()
                .filter(|job| job.name == jobs::DROP_BOLT11S)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn the_worker_comes_up_without_a_database_or_node_and_stops_cleanly() {
        let config = Config::from_lookup(|_| None).expect("default config");
        let state = super::build_worker_state(config).await.expect("state");
        assert_eq!(state.node.backend(), "lnd");

        let (stop, shutdown) = watch::channel(false);
        let worker = tokio::spawn(super::run(state, shutdown));
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.send(true).expect("signal shutdown");

        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .expect("worker stops in time")
            .expect("worker task joins")
            .expect("worker run");
    }
}
