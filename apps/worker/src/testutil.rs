//! Scripted fakes shared by the worker's unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use futures::StreamExt;
use rails::wallet::{UserContext, Wallet};
use rails::{PaymentRails, RailError};
use uuid::Uuid;

use crate::node::{
    DecodedPaymentRequest, EventStream, InvoiceUpdate, LightningNode, NodeError, PaymentStatus,
    PaymentUpdate,
};

#[derive(Debug, Clone)]
pub struct SentPayment {
    pub bolt11: String,
    pub max_fee_sats: u64,
    pub timeout_seconds: u64,
}

/// Node double: unary calls answer from scripted maps, subscriptions drain
/// their queued events into a finite stream.
#[derive(Default)]
pub struct FakeNode {
    decodes: Mutex<HashMap<String, DecodedPaymentRequest>>,
    statuses: Mutex<HashMap<String, PaymentStatus>>,
    invoices: Mutex<HashMap<String, InvoiceUpdate>>,
    invoice_events: Mutex<Vec<Result<InvoiceUpdate, NodeError>>>,
    payment_events: Mutex<Vec<Result<PaymentUpdate, NodeError>>>,
    sent: Mutex<Vec<SentPayment>>,
    fail_sends: AtomicBool,
    subscribed_from: Mutex<Vec<u64>>,
}

/// Decoded invoice that expires comfortably in the future.
pub fn decoded(hash: &str, num_msats: u64) -> DecodedPaymentRequest {
    DecodedPaymentRequest {
        payment_hash: hash.to_string(),
        num_msats,
        expires_at: Utc::now() + Duration::minutes(5),
        description_hash: None,
    }
}

impl FakeNode {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_decode(&self, bolt11: &str, decoded: DecodedPaymentRequest) {
        self.decodes
            .lock()
            .expect("decodes lock")
            .insert(bolt11.to_string(), decoded);
    }

    pub fn script_status(&self, hash: &str, status: PaymentStatus) {
        self.statuses
            .lock()
            .expect("statuses lock")
            .insert(hash.to_string(), status);
    }

    pub fn script_invoice(&self, update: InvoiceUpdate) {
        self.invoices
            .lock()
            .expect("invoices lock")
            .insert(update.hash.clone(), update);
    }

    pub fn push_invoice_event(&self, event: Result<InvoiceUpdate, NodeError>) {
        self.invoice_events
            .lock()
            .expect("invoice events lock")
            .push(event);
    }

    pub fn push_payment_event(&self, event: Result<PaymentUpdate, NodeError>) {
        self.payment_events
            .lock()
            .expect("payment events lock")
            .push(event);
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentPayment> {
        self.sent.lock().expect("sent lock").clone()
    }

    pub fn subscribed_from(&self) -> Vec<u64> {
        self.subscribed_from.lock().expect("subscribed lock").clone()
    }
}

#[async_trait]
impl LightningNode for FakeNode {
    fn backend(&self) -> &'static str {
        "fake"
    }

    async fn decode_payment_request(
        &self,
        bolt11: &str,
    ) -> Result<DecodedPaymentRequest, NodeError> {
        self.decodes
            .lock()
            .expect("decodes lock")
            .get(bolt11.trim())
            .cloned()
            .ok_or_else(|| NodeError::Api {
                status: 400,
                message: "checksum failed".to_string(),
            })
    }

    async fn send_payment(
        &self,
        bolt11: &str,
        max_fee_sats: u64,
        timeout_seconds: u64,
    ) -> Result<(), NodeError> {
        self.sent.lock().expect("sent lock").push(SentPayment {
            bolt11: bolt11.to_string(),
            max_fee_sats,
            timeout_seconds,
        });
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(NodeError::Unavailable("scripted send failure".to_string()));
        }
        Ok(())
    }

    async fn payment_status(&self, hash: &str) -> Result<PaymentStatus, NodeError> {
        self.statuses
            .lock()
            .expect("statuses lock")
            .get(hash)
            .cloned()
            .ok_or_else(|| NodeError::Api {
                status: 404,
                message: "payment isn't initiated".to_string(),
            })
    }

    async fn lookup_invoice(&self, hash: &str) -> Result<InvoiceUpdate, NodeError> {
        self.invoices
            .lock()
            .expect("invoices lock")
            .get(hash)
            .cloned()
            .ok_or_else(|| NodeError::Api {
                status: 404,
                message: "unable to locate invoice".to_string(),
            })
    }

    async fn subscribe_invoices(
        &self,
        settle_index: u64,
    ) -> Result<EventStream<InvoiceUpdate>, NodeError> {
        self.subscribed_from
            .lock()
            .expect("subscribed lock")
            .push(settle_index);
        let events = std::mem::take(
            &mut *self.invoice_events.lock().expect("invoice events lock"),
        );
        Ok(futures::stream::iter(events).boxed())
    }

    async fn subscribe_payments(&self) -> Result<EventStream<PaymentUpdate>, NodeError> {
        let events = std::mem::take(
            &mut *self.payment_events.lock().expect("payment events lock"),
        );
        Ok(futures::stream::iter(events).boxed())
    }
}

#[derive(Debug, Clone)]
pub struct RailAttempt {
    pub wallet_id: Uuid,
    pub amount_sats: u64,
    pub max_fee_sats: u64,
}

/// Rails double: per-wallet scripted outcomes, attempts recorded in order.
#[derive(Default)]
pub struct FakeRails {
    outcomes: Mutex<HashMap<Uuid, Result<(), String>>>,
    attempts: Mutex<Vec<RailAttempt>>,
}

impl FakeRails {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn succeed_for(&self, wallet_id: Uuid) {
        self.outcomes
            .lock()
            .expect("outcomes lock")
            .insert(wallet_id, Ok(()));
    }

    pub fn fail_for(&self, wallet_id: Uuid, detail: &str) {
        self.outcomes
            .lock()
            .expect("outcomes lock")
            .insert(wallet_id, Err(detail.to_string()));
    }

    pub fn attempts(&self) -> Vec<RailAttempt> {
        self.attempts.lock().expect("attempts lock").clone()
    }
}

#[async_trait]
impl PaymentRails for FakeRails {
    async fn attempt(
        &self,
        wallet: &Wallet,
        amount_sats: u64,
        max_fee_sats: u64,
        _user: &UserContext,
    ) -> Result<Uuid, RailError> {
        self.attempts.lock().expect("attempts lock").push(RailAttempt {
            wallet_id: wallet.id,
            amount_sats,
            max_fee_sats,
        });
        match self.outcomes.lock().expect("outcomes lock").get(&wallet.id) {
            Some(Ok(())) => Ok(Uuid::now_v7()),
            Some(Err(detail)) => Err(RailError::Rejected(detail.clone())),
            None => Err(RailError::Misconfigured("wallet not scripted".to_string())),
        }
    }
}
