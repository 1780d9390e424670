//! Append-only audit log of a document
//!
//! Every transition appends one [`DocumentEvent`]. The `event_type()` names are
//! read by analytics and CRM sync; new kinds may be added, existing names are
//! never repurposed.
use super::document::TimeStamp;
use super::version::ChangeType;
use chrono::{DateTime, Utc};

#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone)]
pub struct DocumentEvent {
    #[n(0)]
    pub id: u64, // store-wide sequence, orders events of one document
    #[n(1)]
    pub document_id: String,
    #[n(2)]
    pub recipient_id: Option<String>,
    #[n(3)]
    pub actor: Option<String>,
    #[n(4)]
    pub kind: EventKind,
    #[n(5)]
    pub created_at: TimeStamp<Utc>,
}

#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone)]
pub enum EventKind {
    #[n(0)]
    DocumentCreated {
        #[n(0)]
        source_document_id: Option<String>, // set for duplicates and template instances
    },
    #[n(1)]
    TemplateCreated,
    #[n(2)]
    DocumentSent {
        #[n(0)]
        recipient_count: u32,
        #[n(1)]
        expires_at: TimeStamp<Utc>,
    },
    #[n(3)]
    DocumentViewed,
    #[n(4)]
    DocumentSigned,
    #[n(5)]
    DocumentDeclined {
        #[n(0)]
        reason: Option<String>,
    },
    #[n(6)]
    RecipientDeclined {
        #[n(0)]
        reason: Option<String>,
    },
    #[n(7)]
    DocumentEdited {
        #[n(0)]
        previous_version: u32,
        #[n(1)]
        new_version: u32,
        #[n(2)]
        change_type: ChangeType,
    },
    #[n(8)]
    DocumentCompleted {
        #[n(0)]
        payment_collected: bool,
    },
    #[n(9)]
    DocumentExpired,
    #[n(10)]
    PaymentSucceeded {
        #[n(0)]
        intent_id: String,
        #[n(1)]
        amount: u64,
    },
    #[n(11)]
    PaymentFailed {
        #[n(0)]
        intent_id: String,
        #[n(1)]
        amount: u64,
    },
    #[n(12)]
    PaymentRefunded {
        #[n(0)]
        intent_id: String,
        #[n(1)]
        amount: u64,
    },
    #[n(13)]
    ReminderSent {
        #[n(0)]
        day_number: u32,
        #[n(1)]
        reminder_number: u32,
        #[n(2)]
        total_reminders: u32,
    },
    #[n(14)]
    BlockchainVerified {
        #[n(0)]
        tx_hash: String,
        #[n(1)]
        verification_hash: String,
    },
}

impl EventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            EventKind::DocumentCreated { .. } => "document_created",
            EventKind::TemplateCreated => "template_created",
            EventKind::DocumentSent { .. } => "document_sent",
            EventKind::DocumentViewed => "document_viewed",
            EventKind::DocumentSigned => "document_signed",
            EventKind::DocumentDeclined { .. } => "document_declined",
            EventKind::RecipientDeclined { .. } => "recipient_declined",
            EventKind::DocumentEdited { .. } => "document_edited",
            EventKind::DocumentCompleted { .. } => "document_completed",
            EventKind::DocumentExpired => "document_expired",
            EventKind::PaymentSucceeded { .. } => "payment_succeeded",
            EventKind::PaymentFailed { .. } => "payment_failed",
            EventKind::PaymentRefunded { .. } => "payment_refunded",
            EventKind::ReminderSent { .. } => "reminder_sent",
            EventKind::BlockchainVerified { .. } => "blockchain_verified",
        }
    }
}

impl DocumentEvent {
    pub fn new(
        id: u64,
        document_id: &str,
        recipient_id: Option<&str>,
        actor: Option<&str>,
        kind: EventKind,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            document_id: document_id.to_string(),
            recipient_id: recipient_id.map(str::to_string),
            actor: actor.map(str::to_string),
            kind,
            created_at: created_at.into(),
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }

    /// The milestone day of a reminder event, if this is one.
    pub fn reminder_day(&self) -> Option<u32> {
        match self.kind {
            EventKind::ReminderSent { day_number, .. } => Some(day_number),
            _ => None,
        }
    }
}

/// Print a timeline of events, oldest first.
pub fn view_history(events: &[DocumentEvent]) {
    for event in events {
        println!(
            "{} {:<20} recipient={:<30} actor={}",
            event.created_at.to_datetime_utc().to_rfc3339(),
            event.event_type(),
            event.recipient_id.as_deref().unwrap_or("-"),
            event.actor.as_deref().unwrap_or("-"),
        );
    }
}
