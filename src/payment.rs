//! Payment attempts linked to a document
use super::document::TimeStamp;
use super::error::LifecycleError;
use super::utils;
use chrono::{DateTime, Utc};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaymentStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Processing,
    #[n(2)]
    Succeeded,
    #[n(3)]
    Failed,
    #[n(4)]
    Refunded,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Payment {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub document_id: String,
    #[n(2)]
    pub recipient_id: Option<String>,
    #[n(3)]
    pub intent_id: String, // processor reference, unique per attempt
    #[n(4)]
    pub amount: u64,
    #[n(5)]
    pub status: PaymentStatus,
    #[n(6)]
    pub created_at: TimeStamp<Utc>,
    #[n(7)]
    pub updated_at: TimeStamp<Utc>,
}

/// Webhook payload from the payment processor, already verified upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentNotice {
    pub document_id: String,
    pub recipient_id: Option<String>,
    pub intent_id: String,
    pub amount: u64,
    pub status: PaymentStatus,
}

/// What applying a notice changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerChange {
    Recorded,
    /// Same intent already carries this status, e.g. a redelivered webhook.
    Unchanged,
}

/// Every payment attempt of one document.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct PaymentLedger {
    #[n(0)]
    pub payments: Vec<Payment>,
}

impl PaymentLedger {
    pub fn is_empty(&self) -> bool {
        self.payments.is_empty()
    }

    pub fn has_succeeded(&self) -> bool {
        self.payments
            .iter()
            .any(|p| p.status == PaymentStatus::Succeeded)
    }

    /// Upsert by intent id.
    pub fn apply(
        &mut self,
        notice: &PaymentNotice,
        now: DateTime<Utc>,
    ) -> Result<LedgerChange, LifecycleError> {
        if notice.intent_id.trim().is_empty() {
            return Err(LifecycleError::validation("intentId", "must not be empty"));
        }

        if let Some(existing) = self
            .payments
            .iter_mut()
            .find(|p| p.intent_id == notice.intent_id)
        {
            if existing.status == notice.status {
                return Ok(LedgerChange::Unchanged);
            }
            // a refund is the only way out of succeeded
            if existing.status == PaymentStatus::Succeeded
                && notice.status != PaymentStatus::Refunded
            {
                return Ok(LedgerChange::Unchanged);
            }
            existing.status = notice.status;
            existing.amount = notice.amount;
            existing.updated_at = now.into();
            return Ok(LedgerChange::Recorded);
        }

        self.payments.push(Payment {
            id: utils::new_uuid_to_bech32("pay_").map_err(|e| LifecycleError::Codec(e.to_string()))?,
            document_id: notice.document_id.clone(),
            recipient_id: notice.recipient_id.clone(),
            intent_id: notice.intent_id.clone(),
            amount: notice.amount,
            status: notice.status,
            created_at: now.into(),
            updated_at: now.into(),
        });
        Ok(LedgerChange::Recorded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice(intent: &str, status: PaymentStatus) -> PaymentNotice {
        PaymentNotice {
            document_id: "doc_1".into(),
            recipient_id: None,
            intent_id: intent.into(),
            amount: 4_200,
            status,
        }
    }

    #[test]
    fn redelivered_webhooks_are_unchanged() {
        let mut ledger = PaymentLedger::default();
        let now = Utc::now();

        assert_eq!(
            ledger.apply(&notice("pi_1", PaymentStatus::Succeeded), now).unwrap(),
            LedgerChange::Recorded
        );
        assert_eq!(
            ledger.apply(&notice("pi_1", PaymentStatus::Succeeded), now).unwrap(),
            LedgerChange::Unchanged
        );
        assert_eq!(ledger.payments.len(), 1);
        assert!(ledger.has_succeeded());
    }

    #[test]
    fn late_failure_does_not_undo_success() {
        let mut ledger = PaymentLedger::default();
        let now = Utc::now();
        ledger.apply(&notice("pi_1", PaymentStatus::Succeeded), now).unwrap();

        assert_eq!(
            ledger.apply(&notice("pi_1", PaymentStatus::Failed), now).unwrap(),
            LedgerChange::Unchanged
        );
        assert!(ledger.has_succeeded());

        ledger.apply(&notice("pi_1", PaymentStatus::Refunded), now).unwrap();
        assert!(!ledger.has_succeeded());
    }

    #[test]
    fn attempts_accumulate() {
        let mut ledger = PaymentLedger::default();
        let now = Utc::now();
        ledger.apply(&notice("pi_1", PaymentStatus::Failed), now).unwrap();
        ledger.apply(&notice("pi_2", PaymentStatus::Succeeded), now).unwrap();

        assert_eq!(ledger.payments.len(), 2);
        assert!(ledger.has_succeeded());
    }
}
