//! Job names, dispatch, and the poller harness that drains the queue.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::autowithdraw::AutowithdrawEngine;
use crate::ledger::LedgerStore;
use crate::node::LightningNode;
use crate::queue::{Job, JobQueue};
use crate::reconcile;

pub const AUTOWITHDRAW: &str = "autowithdraw";
pub const CHECK_WITHDRAWAL: &str = "check_withdrawal";
pub const CHECK_INVOICE: &str = "check_invoice";
pub const DROP_BOLT11S: &str = "drop_bolt11s";

/// Every job this worker claims from the queue.
pub const ALL_JOBS: &[&str] = &[AUTOWITHDRAW, CHECK_WITHDRAWAL, CHECK_INVOICE, DROP_BOLT11S];

/// Everything a job run can touch.
#[derive(Clone)]
pub struct JobContext {
    pub ledger: Arc<dyn LedgerStore>,
    pub node: Arc<dyn LightningNode>,
    pub queue: Arc<dyn JobQueue>,
    pub engine: Arc<AutowithdrawEngine>,
    pub bolt11_retention_days: i64,
}

pub async fn dispatch(ctx: &JobContext, job: &Job) -> anyhow::Result<()> {
    match job.name.as_str() {
        AUTOWITHDRAW => {
            let user_id = payload_user_id(&job.payload)?;
            let outcome = ctx.engine.run(user_id).await?;
            tracing::debug!(%user_id, outcome = ?outcome, "autowithdraw ran");
            Ok(())
        }
        CHECK_WITHDRAWAL => reconcile::check_withdrawal(ctx, &payload_hash(&job.payload)?).await,
        CHECK_INVOICE => reconcile::check_invoice(ctx, &payload_hash(&job.payload)?).await,
        DROP_BOLT11S => reconcile::drop_bolt11s(ctx).await,
        other => anyhow::bail!("unknown job: {other}"),
    }
}

fn payload_hash(payload: &Value) -> anyhow::Result<String> {
    payload
        .get("hash")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("job payload is missing a hash"))
}

fn payload_user_id(payload: &Value) -> anyhow::Result<Uuid> {
    let raw = payload
        .get("user_id")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("job payload is missing a user id"))?;
    Ok(Uuid::parse_str(raw)?)
}

/// Runs `concurrency` pollers against the queue until `shutdown` flips.
pub async fn run_pollers(
    ctx: JobContext,
    concurrency: usize,
    poll_interval_ms: u64,
    shutdown: watch::Receiver<bool>,
) {
    let mut pollers = Vec::with_capacity(concurrency);
    for poller in 0..concurrency {
        let ctx = ctx.clone();
        let mut shutdown = shutdown.clone();
        pollers.push(tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                match ctx.queue.fetch(ALL_JOBS).await {
                    Ok(Some(job)) => run_job(&ctx, job).await,
                    Ok(None) => idle(&mut shutdown, poll_interval_ms).await,
                    Err(error) => {
                        tracing::warn!(poller, reason = %error, "job fetch failed");
                        idle(&mut shutdown, poll_interval_ms).await;
                    }
                }
            }
            tracing::debug!(poller, "job poller stopped");
        }));
    }
    for poller in pollers {
        let _ = poller.await;
    }
}

async fn run_job(ctx: &JobContext, job: Job) {
    let id = job.id;
    let name = job.name.clone();
    tracing::info!(job = %name, %id, "running job");
    match dispatch(ctx, &job).await {
        Ok(()) => {
            tracing::info!(job = %name, %id, "finished job");
            if let Err(error) = ctx.queue.complete(id).await {
                tracing::warn!(job = %name, %id, reason = %error, "could not mark the job completed");
            }
        }
        Err(error) => {
            tracing::warn!(job = %name, %id, reason = %error, "job failed");
            if let Err(error) = ctx.queue.fail(id).await {
                tracing::warn!(job = %name, %id, reason = %error, "could not hand the job back");
            }
        }
    }
}

async fn idle(shutdown: &mut watch::Receiver<bool>, poll_interval_ms: u64) {
    tokio::select! {
        _ = shutdown.changed() => {}
        () = tokio::time::sleep(Duration::from_millis(poll_interval_ms)) => {}
    }
}
