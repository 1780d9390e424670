//! Recipient actions behind a signing link, and payment notices
//!
//! Every action resolves its token inside the same transaction as the write,
//! so a link rotated concurrently fails with `LinkExpired` instead of acting on
//! a superseded version. Completion is decided in that transaction too; the
//! downstream notice goes out after commit, only from the call that completed.
use super::completion::{self, CompletionOutcome};
use super::document::{ContentBlock, Document, DocumentStatus};
use super::error::LifecycleError;
use super::event::EventKind;
use super::outbound::LifecycleNotice;
use super::payment::{LedgerChange, PaymentNotice, PaymentStatus};
use super::recipient::{Recipient, Role, Roster};
use super::service::DocumentService;
use super::store::{OrAbort, Tx, TxResult};
use super::token::{AccessToken, TokenBinding};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct SignatureReceipt {
    pub recipient: Recipient,
    pub completion: CompletionOutcome,
}

/// What the portal renders for a recipient.
#[derive(Debug, Clone)]
pub struct SigningSession {
    pub recipient: Recipient,
    pub document_id: String,
    pub title: String,
    pub content: Vec<ContentBlock>,
    pub variables: BTreeMap<String, String>,
    pub status: DocumentStatus,
    pub first_view: bool,
}

impl DocumentService {
    /// Record that a recipient opened their link. Returns true on the first view.
    pub fn record_view(&self, token: &str) -> Result<bool, LifecycleError> {
        let (first_view, _, _) = self.view(token)?;
        Ok(first_view)
    }

    /// Record the view and return everything the portal needs to render.
    pub fn open_signing_session(&self, token: &str) -> Result<SigningSession, LifecycleError> {
        let (first_view, document, recipient) = self.view(token)?;
        Ok(SigningSession {
            recipient,
            document_id: document.id,
            title: document.title,
            content: document.content,
            variables: document.variables,
            status: document.status,
            first_view,
        })
    }

    fn view(&self, token: &str) -> Result<(bool, Document, Recipient), LifecycleError> {
        let now = self.prepare_action(token)?;

        let (first_view, document, recipient) = self.store.transact(|tx| {
            let binding = tx.resolve_token(token)?;
            let mut document = tx.require_document(&binding.document_id)?;
            let mut roster = tx.roster(&document.id)?;

            // completed documents stay readable, nothing more is recorded
            if document.status == DocumentStatus::Completed {
                let recipient = recipient_of(&roster, &binding).or_abort()?;
                return Ok((false, document, recipient));
            }
            ensure_live(&document).or_abort()?;

            let first_view = roster.apply_view(&binding.recipient_id, now).or_abort()?;
            if first_view {
                tx.put_roster(&roster)?;
                tx.append_event(
                    &document.id,
                    Some(&binding.recipient_id),
                    None,
                    EventKind::DocumentViewed,
                    now,
                )?;
                if document.status == DocumentStatus::Sent {
                    document.status = DocumentStatus::Viewed;
                    document.updated_at = now.into();
                    tx.put_document(&document)?;
                }
            }
            let recipient = recipient_of(&roster, &binding).or_abort()?;
            Ok((first_view, document, recipient))
        })?;

        if first_view {
            tracing::info!(document_id = %document.id, recipient_id = %recipient.id, "document viewed");
        }
        Ok((first_view, document, recipient))
    }

    /// Sign as the recipient holding `token`. Locks the document and evaluates
    /// completion in the same transaction.
    pub fn record_signature(
        &self,
        token: &str,
        signature_data: &str,
    ) -> Result<SignatureReceipt, LifecycleError> {
        let now = self.prepare_action(token)?;

        let (document, recipient, completion) = self.store.transact(|tx| {
            let binding = tx.resolve_token(token)?;
            let mut document = tx.require_document(&binding.document_id)?;
            ensure_live(&document).or_abort()?;

            let mut roster = tx.roster(&document.id)?;
            roster
                .apply_signature(&binding.recipient_id, signature_data, now)
                .or_abort()?;
            tx.put_roster(&roster)?;
            tx.append_event(
                &document.id,
                Some(&binding.recipient_id),
                None,
                EventKind::DocumentSigned,
                now,
            )?;

            if document.locked_at.is_none() {
                document.locked_at = Some(now.into());
            }
            if document.status == DocumentStatus::Sent {
                document.status = DocumentStatus::Viewed;
            }
            let completion = settle_completion(tx, &mut document, &roster, now)?;
            document.updated_at = now.into();
            tx.put_document(&document)?;

            let recipient = recipient_of(&roster, &binding).or_abort()?;
            Ok((document, recipient, completion))
        })?;

        tracing::info!(
            document_id = %document.id,
            recipient_id = %recipient.id,
            completion = ?completion,
            "document signed"
        );
        if completion == CompletionOutcome::Completed {
            self.announce(LifecycleNotice::Completed {
                document_id: document.id.clone(),
            });
        }
        Ok(SignatureReceipt {
            recipient,
            completion,
        })
    }

    /// Decline as the recipient holding `token`. A signer declining ends the
    /// document; other roles only record their own decline.
    pub fn record_decline(
        &self,
        token: &str,
        reason: Option<&str>,
    ) -> Result<Recipient, LifecycleError> {
        let now = self.prepare_action(token)?;
        let reason = reason.map(str::trim).filter(|r| !r.is_empty());

        let (document, recipient) = self.store.transact(|tx| {
            let binding = tx.resolve_token(token)?;
            let mut document = tx.require_document(&binding.document_id)?;
            ensure_live(&document).or_abort()?;

            let mut roster = tx.roster(&document.id)?;
            let role = roster
                .apply_decline(&binding.recipient_id, reason)
                .or_abort()?;
            tx.put_roster(&roster)?;

            let reason = reason.map(str::to_string);
            let kind = if role == Role::Signer {
                document.status = DocumentStatus::Declined;
                document.updated_at = now.into();
                tx.put_document(&document)?;
                EventKind::DocumentDeclined { reason }
            } else {
                EventKind::RecipientDeclined { reason }
            };
            tx.append_event(&document.id, Some(&binding.recipient_id), None, kind, now)?;

            let recipient = recipient_of(&roster, &binding).or_abort()?;
            Ok((document, recipient))
        })?;

        tracing::info!(
            document_id = %document.id,
            recipient_id = %recipient.id,
            role = ?recipient.role,
            "recipient declined"
        );
        if document.status == DocumentStatus::Declined {
            self.announce(LifecycleNotice::Declined {
                document_id: document.id.clone(),
                recipient_id: recipient.id.clone(),
            });
        }
        Ok(recipient)
    }

    /// Apply a verified payment processor notice. Idempotent per intent id.
    pub fn record_payment(&self, notice: PaymentNotice) -> Result<CompletionOutcome, LifecycleError> {
        let now = self.now();
        self.refresh_expiry(&notice.document_id, now)?;

        let (change, completion) = self.store.transact(|tx| {
            let mut document = tx.require_document(&notice.document_id)?;
            let mut ledger = tx.ledger(&document.id)?;
            let change = ledger.apply(&notice, now).or_abort()?;

            if change == LedgerChange::Unchanged {
                let outcome = if document.status == DocumentStatus::Completed {
                    CompletionOutcome::AlreadyCompleted
                } else {
                    CompletionOutcome::Pending
                };
                return Ok((change, outcome));
            }
            tx.put_ledger(&document.id, &ledger)?;

            let mut roster = tx.roster(&document.id)?;
            if let Some(recipient_id) = &notice.recipient_id {
                let recipient = roster
                    .find_mut(recipient_id)
                    .ok_or_else(|| LifecycleError::not_found("recipient"))
                    .or_abort()?;
                recipient.payment_status = Some(notice.status);
                recipient.payment_amount = Some(notice.amount);
                recipient.payment_intent_id = Some(notice.intent_id.clone());
                tx.put_roster(&roster)?;
            }

            let intent_id = notice.intent_id.clone();
            let amount = notice.amount;
            let kind = match notice.status {
                PaymentStatus::Succeeded => Some(EventKind::PaymentSucceeded { intent_id, amount }),
                PaymentStatus::Failed => Some(EventKind::PaymentFailed { intent_id, amount }),
                PaymentStatus::Refunded => Some(EventKind::PaymentRefunded { intent_id, amount }),
                PaymentStatus::Pending | PaymentStatus::Processing => None,
            };
            if let Some(kind) = kind {
                tx.append_event(&document.id, notice.recipient_id.as_deref(), None, kind, now)?;
            }

            let completion = if notice.status == PaymentStatus::Succeeded {
                let outcome = settle_completion(tx, &mut document, &roster, now)?;
                if outcome == CompletionOutcome::Completed {
                    document.updated_at = now.into();
                    tx.put_document(&document)?;
                }
                outcome
            } else if document.status == DocumentStatus::Completed {
                CompletionOutcome::AlreadyCompleted
            } else {
                CompletionOutcome::Pending
            };
            Ok((change, completion))
        })?;

        match change {
            LedgerChange::Recorded => tracing::info!(
                document_id = %notice.document_id,
                intent_id = %notice.intent_id,
                status = ?notice.status,
                "payment recorded"
            ),
            LedgerChange::Unchanged => tracing::debug!(
                document_id = %notice.document_id,
                intent_id = %notice.intent_id,
                "payment notice already applied"
            ),
        }
        if completion == CompletionOutcome::Completed {
            self.announce(LifecycleNotice::Completed {
                document_id: notice.document_id.clone(),
            });
        }
        Ok(completion)
    }

    /// Reject malformed tokens early and expire the target document when due,
    /// so the action transaction sees the current status.
    fn prepare_action(&self, token: &str) -> Result<DateTime<Utc>, LifecycleError> {
        AccessToken::parse(token)?;
        let binding = self.store.lookup_token(token)?;
        let now = self.now();
        self.refresh_expiry(&binding.document_id, now)?;
        Ok(now)
    }

    fn announce(&self, notice: LifecycleNotice) {
        if let Err(err) = self.notifier.notify(&notice, self.config.external_timeout()) {
            tracing::warn!(?notice, %err, "lifecycle notice failed");
        }
    }
}

/// Move the document to `completed` when the roster and payments allow it.
/// The flip is conditional, so racing triggers complete it exactly once.
fn settle_completion(
    tx: &Tx<'_>,
    document: &mut Document,
    roster: &Roster,
    now: DateTime<Utc>,
) -> TxResult<CompletionOutcome> {
    if document.status == DocumentStatus::Completed {
        return Ok(CompletionOutcome::AlreadyCompleted);
    }
    if !document.status.is_live() {
        return Ok(CompletionOutcome::Pending);
    }

    let ledger = tx.ledger(&document.id)?;
    let owed = completion::payment_required(document.settings.payment_required, &ledger);
    if !completion::is_complete(roster, &ledger, owed) {
        return Ok(CompletionOutcome::Pending);
    }

    document.status = DocumentStatus::Completed;
    document.completed_at = Some(now.into());
    tx.append_event(
        &document.id,
        None,
        None,
        EventKind::DocumentCompleted {
            payment_collected: ledger.has_succeeded(),
        },
        now,
    )?;
    Ok(CompletionOutcome::Completed)
}

fn ensure_live(document: &Document) -> Result<(), LifecycleError> {
    if document.status.is_live() {
        return Ok(());
    }
    let reason = match document.status {
        DocumentStatus::Draft => "document has not been sent".to_string(),
        status => format!("document is {}", status.as_str()),
    };
    Err(LifecycleError::invalid(reason))
}

fn recipient_of(roster: &Roster, binding: &TokenBinding) -> Result<Recipient, LifecycleError> {
    roster
        .find(&binding.recipient_id)
        .cloned()
        .ok_or_else(|| LifecycleError::not_found("recipient"))
}
