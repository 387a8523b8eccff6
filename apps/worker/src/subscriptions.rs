//! Node event subscriptions.
//!
//! Each settle or terminal-payment event becomes a queue job rather than a
//! direct ledger write, so a crash between event and settlement costs
//! nothing: the check job re-reads the node and the recovery scan re-seeds
//! anything that was in flight.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use thiserror::Error;

use crate::jobs;
use crate::node::{EventStream, InvoiceUpdate, PaymentStatus, PaymentUpdate};
use crate::queue::{Enqueue, JobQueue};

/// Why an event loop stopped. Either way the caller reconnects.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("stream error: {0}")]
    Stream(String),
    #[error("stream ended")]
    Ended,
}

/// Drains invoice settle events into `check_invoice` jobs. Runs until the
/// stream errors or ends.
pub async fn run_invoice_events(
    mut events: EventStream<InvoiceUpdate>,
    queue: Arc<dyn JobQueue>,
    retry_limit: u32,
) -> SubscriptionError {
    while let Some(event) = events.next().await {
        match event {
            Ok(update) if update.settled || update.canceled => {
                tracing::debug!(hash = %update.hash, settled = update.settled, "invoice event");
                enqueue_check(&queue, jobs::CHECK_INVOICE, &update.hash, retry_limit).await;
            }
            // Creations and in-progress updates settle nothing.
            Ok(_) => {}
            Err(error) => return SubscriptionError::Stream(error.to_string()),
        }
    }
    SubscriptionError::Ended
}

/// Drains terminal payment updates into `check_withdrawal` jobs.
pub async fn run_payment_events(
    mut events: EventStream<PaymentUpdate>,
    queue: Arc<dyn JobQueue>,
    retry_limit: u32,
) -> SubscriptionError {
    while let Some(event) = events.next().await {
        match event {
            Ok(update) => match update.status {
                PaymentStatus::InFlight => {}
                PaymentStatus::Succeeded { .. } | PaymentStatus::Failed { .. } => {
                    tracing::debug!(hash = %update.hash, "terminal payment event");
                    enqueue_check(&queue, jobs::CHECK_WITHDRAWAL, &update.hash, retry_limit)
                        .await;
                }
            },
            Err(error) => return SubscriptionError::Stream(error.to_string()),
        }
    }
    SubscriptionError::Ended
}

/// The checks are idempotent, so a lost enqueue is only a delay: the
/// recovery scan or the next event covers it.
async fn enqueue_check(queue: &Arc<dyn JobQueue>, name: &str, hash: &str, retry_limit: u32) {
    let job = Enqueue {
        name: name.to_string(),
        payload: serde_json::json!({ "hash": hash }),
        retry_limit,
        retry_backoff: true,
        start_after: Utc::now(),
    };
    if let Err(error) = queue.enqueue(job).await {
        tracing::warn!(hash, job = name, reason = %error, "could not enqueue the settlement check");
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{run_invoice_events, run_payment_events, SubscriptionError};
    use crate::jobs;
    use crate::node::{InvoiceUpdate, LightningNode as _, NodeError, PaymentStatus, PaymentUpdate};
    use crate::queue::MemoryJobQueue;
    use crate::testutil::FakeNode;

    fn settled(hash: &str, index: u64) -> InvoiceUpdate {
        InvoiceUpdate {
            hash: hash.to_string(),
            settled: true,
            canceled: false,
            msats_received: 1_000,
            settle_index: index,
            settled_at: Some(Utc::now()),
        }
    }

    fn open(hash: &str) -> InvoiceUpdate {
        InvoiceUpdate {
            hash: hash.to_string(),
            settled: false,
            canceled: false,
            msats_received: 0,
            settle_index: 0,
            settled_at: None,
        }
    }

    #[tokio::test]
    async fn settle_events_become_check_jobs() {
        let node = FakeNode::shared();
        let queue = MemoryJobQueue::shared(30);
        node.push_invoice_event(Ok(open("aa11")));
        node.push_invoice_event(Ok(settled("bb22", 6)));

        let events = node.subscribe_invoices(5).await.expect("subscribe");
        let stopped = run_invoice_events(events, queue.clone(), 21).await;

        assert!(matches!(stopped, SubscriptionError::Ended));
        assert_eq!(node.subscribed_from(), vec![5]);
        let jobs_after = queue.jobs().await;
        assert_eq!(jobs_after.len(), 1);
        assert_eq!(jobs_after[0].name, jobs::CHECK_INVOICE);
        assert_eq!(jobs_after[0].payload["hash"], "bb22");
        assert!(jobs_after[0].retry_backoff);
    }

    #[tokio::test]
    async fn stream_errors_surface_after_the_events_before_them() {
        let node = FakeNode::shared();
        let queue = MemoryJobQueue::shared(30);
        node.push_invoice_event(Ok(settled("cc33", 9)));
        node.push_invoice_event(Err(NodeError::Unavailable("eof".to_string())));

        let events = node.subscribe_invoices(0).await.expect("subscribe");
        let stopped = run_invoice_events(events, queue.clone(), 21).await;

        match stopped {
            SubscriptionError::Stream(reason) => assert!(reason.contains("eof")),
            other => panic!("unexpected stop: {other:?}"),
        }
        assert_eq!(queue.jobs().await.len(), 1);
    }

    #[tokio::test]
    async fn only_terminal_payment_updates_become_check_jobs() {
        let node = FakeNode::shared();
        let queue = MemoryJobQueue::shared(30);
        node.push_payment_event(Ok(PaymentUpdate {
            hash: "aa11".to_string(),
            status: PaymentStatus::InFlight,
        }));
        node.push_payment_event(Ok(PaymentUpdate {
            hash: "bb22".to_string(),
            status: PaymentStatus::Succeeded { fee_msats: 500 },
        }));
        node.push_payment_event(Ok(PaymentUpdate {
            hash: "cc33".to_string(),
            status: PaymentStatus::Failed {
                reason: "no route".to_string(),
            },
        }));

        let events = node.subscribe_payments().await.expect("subscribe");
        let stopped = run_payment_events(events, queue.clone(), 21).await;

        assert!(matches!(stopped, SubscriptionError::Ended));
        let jobs_after = queue.jobs().await;
        assert_eq!(jobs_after.len(), 2);
        assert!(jobs_after
            .iter()
            .all(|job| job.name == jobs::CHECK_WITHDRAWAL));
        let hashes: Vec<_> = jobs_after
            .iter()
            .map(|job| job.payload["hash"].as_str().unwrap_or_default().to_string())
            .collect();
        assert!(hashes.contains(&"bb22".to_string()));
        assert!(hashes.contains(&"cc33".to_string()));
    }
}
