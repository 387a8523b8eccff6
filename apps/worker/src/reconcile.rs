//! Settlement checks: reconcile ledger rows against the node's view.
//!
//! These run as queue jobs, so a transient node error is just an `Err` back
//! to the poller and the queue's backoff does the waiting.

use anyhow::Context as _;
use chrono::{Duration, Utc};

use crate::jobs::JobContext;
use crate::node::{NodeError, PaymentStatus};

pub async fn check_withdrawal(ctx: &JobContext, hash: &str) -> anyhow::Result<()> {
    let Some(withdrawal) = ctx.ledger.withdrawal_by_hash(hash).await? else {
        tracing::warn!(hash, "check asked for a withdrawal that does not exist");
        return Ok(());
    };
    if withdrawal.status.is_some() {
        return Ok(());
    }
    match ctx.node.payment_status(hash).await {
        Ok(PaymentStatus::Succeeded { fee_msats }) => {
            ctx.ledger.confirm_withdrawal(hash, fee_msats).await?;
            tracing::info!(hash, fee_msats, "withdrawal confirmed");
            Ok(())
        }
        Ok(PaymentStatus::Failed { reason }) => {
            ctx.ledger.fail_withdrawal(hash).await?;
            tracing::info!(hash, reason = %reason, "withdrawal failed; funds returned");
            Ok(())
        }
        Ok(PaymentStatus::InFlight) => {
            anyhow::bail!("withdrawal {hash} is still in flight")
        }
        // The node never saw this payment, so nothing can settle later.
        Err(NodeError::Api { status: 404, .. }) => {
            ctx.ledger.fail_withdrawal(hash).await?;
            tracing::info!(hash, "withdrawal was never dispatched; funds returned");
            Ok(())
        }
        Err(error) => Err(error).context("track payment"),
    }
}

pub async fn check_invoice(ctx: &JobContext, hash: &str) -> anyhow::Result<()> {
    let Some(invoice) = ctx.ledger.invoice_by_hash(hash).await? else {
        tracing::warn!(hash, "check asked for an invoice that does not exist");
        return Ok(());
    };
    if invoice.confirmed_at.is_some() || invoice.cancelled {
        return Ok(());
    }
    let expired = invoice.expires_at <= Utc::now();
    match ctx.node.lookup_invoice(hash).await {
        Ok(update) if update.settled => {
            let confirmed_at = update.settled_at.unwrap_or_else(Utc::now);
            ctx.ledger
                .settle_invoice(hash, update.msats_received, update.settle_index, confirmed_at)
                .await?;
            tracing::info!(hash, msats = update.msats_received, "invoice settled");
            Ok(())
        }
        Ok(update) if update.canceled => {
            ctx.ledger.cancel_invoice(hash).await?;
            tracing::info!(hash, "invoice cancelled");
            Ok(())
        }
        Ok(_) if expired => {
            ctx.ledger.cancel_invoice(hash).await?;
            tracing::info!(hash, "invoice expired unpaid");
            Ok(())
        }
        Ok(_) => Ok(()),
        // Unknown to the node: once it can no longer be paid, close it out.
        Err(NodeError::Api { status: 404, .. }) if expired => {
            ctx.ledger.cancel_invoice(hash).await?;
            tracing::info!(hash, "invoice unknown to the node; cancelled after expiry");
            Ok(())
        }
        Err(error) => Err(error).context("lookup invoice"),
    }
}

pub async fn drop_bolt11s(ctx: &JobContext) -> anyhow::Result<()> {
    let cutoff = Utc::now() - Duration::days(ctx.bolt11_retention_days);
    let dropped = ctx.ledger.drop_old_bolt11s(cutoff).await?;
    if dropped > 0 {
        tracing::info!(dropped, "dropped bolt11s from settled withdrawals");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use crate::autowithdraw::AutowithdrawEngine;
    use crate::jobs::JobContext;
    use crate::ledger::{
        InvoiceRow, LedgerStore as _, MemoryLedgerStore, NewWithdrawal, WithdrawalStatus,
    };
    use crate::node::{InvoiceUpdate, PaymentStatus};
    use crate::queue::MemoryJobQueue;
    use crate::testutil::{FakeNode, FakeRails};

    struct Harness {
        ledger: Arc<MemoryLedgerStore>,
        node: Arc<FakeNode>,
        ctx: JobContext,
    }

    fn harness() -> Harness {
        let ledger = MemoryLedgerStore::shared();
        let node = FakeNode::shared();
        let queue = MemoryJobQueue::shared(30);
        let engine = Arc::new(AutowithdrawEngine::new(ledger.clone(), FakeRails::shared()));
        let ctx = JobContext {
            ledger: ledger.clone(),
            node: node.clone(),
            queue,
            engine,
            bolt11_retention_days: 10,
        };
        Harness { ledger, node, ctx }
    }

    async fn funded_withdrawal(h: &Harness) -> (Uuid, String) {
        let user_id = Uuid::now_v7();
        h.ledger.insert_user(user_id, 200_000, None, None).await;
        h.ledger
            .create_withdrawal(NewWithdrawal {
                user_id,
                hash: "aa11".to_string(),
                bolt11: "lnbc1checked".to_string(),
                msats_paying: 110_000,
                msats_fee_paying: 9_000,
                auto_withdraw: true,
            })
            .await
            .expect("create withdrawal");
        (user_id, "aa11".to_string())
    }

    #[tokio::test]
    async fn succeeded_payments_confirm_and_refund_the_unspent_fee() {
        let h = harness();
        let (user_id, hash) = funded_withdrawal(&h).await;
        h.node
            .script_status(&hash, PaymentStatus::Succeeded { fee_msats: 3_000 });

        super::check_withdrawal(&h.ctx, &hash).await.expect("check");

        let row = &h.ledger.withdrawals().await[0];
        assert_eq!(row.status, Some(WithdrawalStatus::Confirmed));
        assert_eq!(row.msats_fee_paid, Some(3_000));
        // 200_000 - 119_000 escrowed + 6_000 unspent fee budget back.
        assert_eq!(h.ledger.user_msats(user_id).await, Some(87_000));
    }

    #[tokio::test]
    async fn failed_payments_refund_principal_and_fee() {
        let h = harness();
        let (user_id, hash) = funded_withdrawal(&h).await;
        h.node.script_status(
            &hash,
            PaymentStatus::Failed {
                reason: "no route".to_string(),
            },
        );

        super::check_withdrawal(&h.ctx, &hash).await.expect("check");

        let row = &h.ledger.withdrawals().await[0];
        assert_eq!(row.status, Some(WithdrawalStatus::Failed));
        assert_eq!(h.ledger.user_msats(user_id).await, Some(200_000));
    }

    #[tokio::test]
    async fn inflight_payments_push_the_job_into_retry() {
        let h = harness();
        let (user_id, hash) = funded_withdrawal(&h).await;
        h.node.script_status(&hash, PaymentStatus::InFlight);

        let error = super::check_withdrawal(&h.ctx, &hash)
            .await
            .expect_err("in flight");
        assert!(error.to_string().contains("still in flight"));

        let row = &h.ledger.withdrawals().await[0];
        assert_eq!(row.status, None);
        assert_eq!(h.ledger.user_msats(user_id).await, Some(81_000));
    }

    #[tokio::test]
    async fn payments_the_node_never_saw_fail_safe() {
        let h = harness();
        let (user_id, hash) = funded_withdrawal(&h).await;
        // Nothing scripted: the node answers 404 for this hash.

        super::check_withdrawal(&h.ctx, &hash).await.expect("check");

        let row = &h.ledger.withdrawals().await[0];
        assert_eq!(row.status, Some(WithdrawalStatus::Failed));
        assert_eq!(h.ledger.user_msats(user_id).await, Some(200_000));
    }

    #[tokio::test]
    async fn settled_withdrawals_are_left_alone() {
        let h = harness();
        let (user_id, hash) = funded_withdrawal(&h).await;
        h.node
            .script_status(&hash, PaymentStatus::Succeeded { fee_msats: 9_000 });
        super::check_withdrawal(&h.ctx, &hash).await.expect("first check");
        let settled_balance = h.ledger.user_msats(user_id).await;

        // A replay must not touch the balance again.
        super::check_withdrawal(&h.ctx, &hash).await.expect("second check");
        assert_eq!(h.ledger.user_msats(user_id).await, settled_balance);
    }

    fn open_invoice(user_id: Uuid, hash: &str, expires_at: chrono::DateTime<Utc>) -> InvoiceRow {
        InvoiceRow {
            id: Uuid::now_v7(),
            user_id,
            hash: hash.to_string(),
            bolt11: "lnbc1incoming".to_string(),
            msats_requested: 50_000,
            msats_received: None,
            expires_at,
            confirmed_at: None,
            confirmed_index: None,
            cancelled: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn settled_invoices_credit_the_user_and_record_the_index() {
        let h = harness();
        let user_id = Uuid::now_v7();
        h.ledger.insert_user(user_id, 10_000, None, None).await;
        h.ledger
            .insert_invoice(open_invoice(user_id, "bb22", Utc::now() + Duration::hours(1)))
            .await;
        h.node.script_invoice(InvoiceUpdate {
            hash: "bb22".to_string(),
            settled: true,
            canceled: false,
            msats_received: 50_000,
            settle_index: 7,
            settled_at: Some(Utc::now()),
        });

        super::check_invoice(&h.ctx, "bb22").await.expect("check");

        assert_eq!(h.ledger.user_msats(user_id).await, Some(60_000));
        assert_eq!(
            h.ctx.ledger.max_confirmed_index().await.expect("index"),
            7
        );

        // Replays short-circuit on the confirmed row.
        super::check_invoice(&h.ctx, "bb22").await.expect("replay");
        assert_eq!(h.ledger.user_msats(user_id).await, Some(60_000));
    }

    #[tokio::test]
    async fn dead_invoices_are_cancelled() {
        let h = harness();
        let user_id = Uuid::now_v7();
        h.ledger.insert_user(user_id, 10_000, None, None).await;

        // Cancelled on the node.
        h.ledger
            .insert_invoice(open_invoice(user_id, "cc33", Utc::now() + Duration::hours(1)))
            .await;
        h.node.script_invoice(InvoiceUpdate {
            hash: "cc33".to_string(),
            settled: false,
            canceled: true,
            msats_received: 0,
            settle_index: 0,
            settled_at: None,
        });
        super::check_invoice(&h.ctx, "cc33").await.expect("check");

        // Expired unpaid, node still lists it as open.
        h.ledger
            .insert_invoice(open_invoice(user_id, "dd44", Utc::now() - Duration::minutes(1)))
            .await;
        h.node.script_invoice(InvoiceUpdate {
            hash: "dd44".to_string(),
            settled: false,
            canceled: false,
            msats_received: 0,
            settle_index: 0,
            settled_at: None,
        });
        super::check_invoice(&h.ctx, "dd44").await.expect("check");

        // Expired and unknown to the node.
        h.ledger
            .insert_invoice(open_invoice(user_id, "ee55", Utc::now() - Duration::minutes(1)))
            .await;
        super::check_invoice(&h.ctx, "ee55").await.expect("check");

        assert_eq!(h.ledger.user_msats(user_id).await, Some(10_000));
    }

    #[tokio::test]
    async fn retention_runs_against_the_configured_cutoff() {
        let h = harness();
        let (_user_id, hash) = funded_withdrawal(&h).await;
        h.node
            .script_status(&hash, PaymentStatus::Succeeded { fee_msats: 1_000 });
        super::check_withdrawal(&h.ctx, &hash).await.expect("settle");

        // Settled but newer than the 10 day retention window.
        super::drop_bolt11s(&h.ctx).await.expect("retention");
        assert!(h.ledger.withdrawals().await[0].bolt11.is_some());
    }
}
