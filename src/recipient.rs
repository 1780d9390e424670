//! Recipient roster of a document
//!
//! All recipients of a document are stored as one [`Roster`] record, so replacing
//! the roster on send is a single write and no caller ever sees half of an old
//! roster next to half of a new one. The operations here are pure; the service
//! runs them inside storage transactions.
use super::document::TimeStamp;
use super::error::LifecycleError;
use super::payment::PaymentStatus;
use super::token;
use super::utils;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    #[n(0)]
    Signer,
    #[n(1)]
    Viewer,
    #[n(2)]
    Approver,
}

impl Role {
    pub fn parse(raw: &str) -> Result<Self, LifecycleError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "signer" => Ok(Role::Signer),
            "viewer" => Ok(Role::Viewer),
            "approver" => Ok(Role::Approver),
            other => Err(LifecycleError::validation(
                "recipients.role",
                format!("unknown role '{other}', expected signer, viewer or approver"),
            )),
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecipientStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Viewed,
    #[n(2)]
    Signed,
    #[n(3)]
    Declined,
}

impl RecipientStatus {
    pub fn has_acted(&self) -> bool {
        matches!(self, RecipientStatus::Signed | RecipientStatus::Declined)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub document_id: String,
    #[n(2)]
    pub email: String,
    #[n(3)]
    pub name: String,
    #[n(4)]
    pub role: Role,
    #[n(5)]
    pub signing_order: u32, // exposed for UI sequencing, not enforced
    #[n(6)]
    pub status: RecipientStatus,
    #[n(7)]
    pub access_token: String,
    #[n(8)]
    pub viewed_at: Option<TimeStamp<Utc>>,
    #[n(9)]
    pub signed_at: Option<TimeStamp<Utc>>,
    #[n(10)]
    pub signature_data: Option<String>,
    #[n(11)]
    pub decline_reason: Option<String>,
    #[n(12)]
    pub payment_status: Option<PaymentStatus>,
    #[n(13)]
    pub payment_amount: Option<u64>,
    #[n(14)]
    pub payment_intent_id: Option<String>,
}

/// Recipient as supplied by the sender.
#[derive(Debug, Clone)]
pub struct RecipientInput {
    pub email: String,
    pub name: String,
    pub role: String,
    pub signing_order: Option<u32>,
}

impl RecipientInput {
    pub fn new(email: &str, name: &str, role: &str) -> Self {
        Self {
            email: email.to_string(),
            name: name.to_string(),
            role: role.to_string(),
            signing_order: None,
        }
    }

    pub fn signer(email: &str, name: &str) -> Self {
        Self::new(email, name, "signer")
    }

    pub fn with_order(mut self, order: u32) -> Self {
        self.signing_order = Some(order);
        self
    }
}

/// Token swap produced by a roster reissue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reissued {
    pub recipient_id: String,
    pub retired: String,
    pub issued: String,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Roster {
    #[n(0)]
    pub document_id: String,
    #[n(1)]
    pub recipients: Vec<Recipient>,
}

impl Roster {
    pub fn empty(document_id: &str) -> Self {
        Self {
            document_id: document_id.to_string(),
            recipients: vec![],
        }
    }

    /// Validate the sender's list and mint a token per recipient.
    pub fn build(document_id: &str, inputs: &[RecipientInput]) -> Result<Self, LifecycleError> {
        if inputs.is_empty() {
            return Err(LifecycleError::validation(
                "recipients",
                "at least one recipient is required",
            ));
        }

        let mut emails = HashSet::new();
        let mut recipients = Vec::with_capacity(inputs.len());
        for (position, input) in inputs.iter().enumerate() {
            let role = Role::parse(&input.role)?;
            let email = utils::normalise_email(&input.email);
            validate_email(&email)?;
            if !emails.insert(email.clone()) {
                return Err(LifecycleError::validation(
                    "recipients.email",
                    format!("{email} is listed more than once"),
                ));
            }
            let name = match input.name.trim() {
                "" => email.clone(),
                name => name.to_string(),
            };

            recipients.push(Recipient {
                id: utils::new_uuid_to_bech32("rcpt_")
                    .map_err(|e| LifecycleError::Codec(e.to_string()))?,
                document_id: document_id.to_string(),
                email,
                name,
                role,
                signing_order: input.signing_order.unwrap_or(position as u32 + 1),
                status: RecipientStatus::Pending,
                access_token: token::issue()?.into_string(),
                viewed_at: None,
                signed_at: None,
                signature_data: None,
                decline_reason: None,
                payment_status: None,
                payment_amount: None,
                payment_intent_id: None,
            });
        }

        Ok(Self {
            document_id: document_id.to_string(),
            recipients,
        })
    }

    pub fn find(&self, recipient_id: &str) -> Option<&Recipient> {
        self.recipients.iter().find(|r| r.id == recipient_id)
    }

    pub fn find_mut(&mut self, recipient_id: &str) -> Option<&mut Recipient> {
        self.recipients.iter_mut().find(|r| r.id == recipient_id)
    }

    pub fn signers(&self) -> impl Iterator<Item = &Recipient> {
        self.recipients.iter().filter(|r| r.role == Role::Signer)
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.recipients.iter().map(|r| r.access_token.as_str())
    }

    /// New tokens for every recipient that has not signed, forcing re-review.
    /// Signed recipients keep their token and status.
    pub fn reissue_unsigned(&mut self) -> Result<Vec<Reissued>, LifecycleError> {
        let mut swaps = vec![];
        for recipient in self
            .recipients
            .iter_mut()
            .filter(|r| r.status != RecipientStatus::Signed)
        {
            let issued = token::issue()?.into_string();
            let retired = std::mem::replace(&mut recipient.access_token, issued.clone());
            recipient.status = RecipientStatus::Pending;
            recipient.viewed_at = None;
            recipient.decline_reason = None;
            swaps.push(Reissued {
                recipient_id: recipient.id.clone(),
                retired,
                issued,
            });
        }
        Ok(swaps)
    }

    /// Returns true only on the recipient's first view.
    pub fn apply_view(
        &mut self,
        recipient_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, LifecycleError> {
        let recipient = self
            .find_mut(recipient_id)
            .ok_or_else(|| LifecycleError::not_found("recipient"))?;

        // declining without opening the link leaves viewed_at unset for good
        if recipient.viewed_at.is_some() || recipient.status.has_acted() {
            return Ok(false);
        }
        recipient.viewed_at = Some(now.into());
        if recipient.status == RecipientStatus::Pending {
            recipient.status = RecipientStatus::Viewed;
        }
        Ok(true)
    }

    pub fn apply_signature(
        &mut self,
        recipient_id: &str,
        signature_data: &str,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        let recipient = self
            .find_mut(recipient_id)
            .ok_or_else(|| LifecycleError::not_found("recipient"))?;

        check_not_acted(recipient)?;
        if recipient.role != Role::Signer {
            return Err(LifecycleError::invalid("only signers can sign this document"));
        }
        if signature_data.trim().is_empty() {
            return Err(LifecycleError::validation("signatureData", "must not be empty"));
        }

        // a signature implies the document was seen
        if recipient.viewed_at.is_none() {
            recipient.viewed_at = Some(now.into());
        }
        recipient.signed_at = Some(now.into());
        recipient.signature_data = Some(signature_data.to_string());
        recipient.status = RecipientStatus::Signed;
        Ok(())
    }

    /// Returns the declining recipient's role.
    pub fn apply_decline(
        &mut self,
        recipient_id: &str,
        reason: Option<&str>,
    ) -> Result<Role, LifecycleError> {
        let recipient = self
            .find_mut(recipient_id)
            .ok_or_else(|| LifecycleError::not_found("recipient"))?;

        check_not_acted(recipient)?;
        recipient.status = RecipientStatus::Declined;
        recipient.decline_reason = reason.map(str::to_string);
        Ok(recipient.role)
    }
}

fn check_not_acted(recipient: &Recipient) -> Result<(), LifecycleError> {
    match recipient.status {
        RecipientStatus::Signed => Err(LifecycleError::AlreadyActioned("signed".into())),
        RecipientStatus::Declined => Err(LifecycleError::AlreadyActioned("declined".into())),
        _ => Ok(()),
    }
}

fn validate_email(email: &str) -> Result<(), LifecycleError> {
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(LifecycleError::validation(
            "recipients.email",
            format!("'{email}' is not a valid address"),
        ))
    }
}
