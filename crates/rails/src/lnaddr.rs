//! Lightning-address rail: the wallet stores a static address; resolution and
//! payment happen in the withdrawal-execution path.

use uuid::Uuid;

use crate::WithdrawalSink;
use crate::error::{RailError, required};
use crate::wallet::UserContext;

pub async fn attempt(
    address: Option<&str>,
    amount_sats: u64,
    max_fee_sats: u64,
    user: &UserContext,
    sink: &dyn WithdrawalSink,
) -> Result<Uuid, RailError> {
    let address = required(address, "wallet has no lightning address on record")?;
    sink.send_to_external_address(address, amount_sats, max_fee_sats, user)
        .await
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::attempt;
    use crate::error::RailError;
    use crate::testutil::RecordingSink;
    use crate::wallet::UserContext;

    fn user() -> UserContext {
        UserContext {
            user_id: uuid::Uuid::new_v4(),
            hide_invoice_desc: false,
        }
    }

    #[tokio::test]
    async fn missing_address_is_a_configuration_error() -> Result<()> {
        let sink = RecordingSink::succeeding();

        let result = attempt(None, 9, 1, &user(), &sink).await;
        assert!(matches!(result, Err(RailError::Misconfigured(_))));

        let blank = attempt(Some("   "), 9, 1, &user(), &sink).await;
        assert!(matches!(blank, Err(RailError::Misconfigured(_))));

        assert!(sink.sent_to_addresses().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn address_is_trimmed_and_passed_through() -> Result<()> {
        let sink = RecordingSink::succeeding();

        let withdrawal_id = attempt(Some("  alice@zap.example.org  "), 9, 1, &user(), &sink).await?;
        assert_eq!(withdrawal_id, sink.withdrawal_id);

        let sent = sink.sent_to_addresses();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].address, "alice@zap.example.org");
        assert_eq!(sent[0].amount_sats, 9);
        assert_eq!(sent[0].max_fee_sats, 1);
        Ok(())
    }

    #[tokio::test]
    async fn execution_failures_pass_back_unchanged() -> Result<()> {
        let sink = RecordingSink::failing("address resolution timed out");

        let result = attempt(Some("alice@zap.example.org"), 9, 1, &user(), &sink).await;
        match result {
            Err(RailError::Rejected(detail)) => assert_eq!(detail, "address resolution timed out"),
            other => assert!(false, "expected rejection, got {other:?}"),
        }
        Ok(())
    }
}
