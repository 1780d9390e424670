//! Instructions handed to external collaborators
//!
//! The engine never delivers mail, talks to integrations or writes to a chain
//! itself. It hands these traits a value and a deadline, and treats any
//! [`ExternalError`] as a per-item failure.
use super::error::ExternalError;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    SigningRequest,
    Reminder {
        day_number: u32,
        reminder_number: u32,
        total_reminders: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub kind: MessageKind,
    pub document_id: String,
    pub document_title: String,
    pub recipient_id: String,
    pub email: String,
    pub name: String,
    pub signing_url: String,
    pub custom_message: Option<String>,
}

/// Lifecycle notices consumed by backup, CRM and accounting integrations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleNotice {
    Completed { document_id: String },
    Declined { document_id: String, recipient_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorReceipt {
    pub tx_hash: String,
}

pub trait Mailer: Send + Sync {
    fn dispatch(&self, message: &OutboundMessage, timeout: Duration) -> Result<(), ExternalError>;
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notice: &LifecycleNotice, timeout: Duration) -> Result<(), ExternalError>;
}

pub trait Anchor: Send + Sync {
    fn anchor(&self, verification_hash: &[u8], timeout: Duration)
    -> Result<AnchorReceipt, ExternalError>;

    /// Whether `tx_hash` carries exactly `verification_hash`.
    fn confirm(
        &self,
        verification_hash: &[u8],
        tx_hash: &str,
        timeout: Duration,
    ) -> Result<bool, ExternalError>;
}

/// Default mailer and notifier: records the instruction in the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOutbox;

impl Mailer for LogOutbox {
    fn dispatch(&self, message: &OutboundMessage, _: Duration) -> Result<(), ExternalError> {
        tracing::info!(
            document_id = %message.document_id,
            recipient_id = %message.recipient_id,
            kind = ?message.kind,
            "outbound message"
        );
        Ok(())
    }
}

impl Notifier for LogOutbox {
    fn notify(&self, notice: &LifecycleNotice, _: Duration) -> Result<(), ExternalError> {
        tracing::info!(?notice, "lifecycle notice");
        Ok(())
    }
}

/// Used when no anchoring service is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAnchor;

impl Anchor for NoAnchor {
    fn anchor(&self, _: &[u8], _: Duration) -> Result<AnchorReceipt, ExternalError> {
        Err(ExternalError::Rejected {
            service: "anchor",
            message: "no anchoring service configured".into(),
        })
    }

    fn confirm(&self, _: &[u8], _: &str, _: Duration) -> Result<bool, ExternalError> {
        Err(ExternalError::Rejected {
            service: "anchor",
            message: "no anchoring service configured".into(),
        })
    }
}
