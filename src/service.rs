//! Service layer API for document lifecycle operations
//!
//! Owner-facing operations live here: create, edit, send, delete and the read
//! side. Recipient and payment entry points are in [`crate::signing`], the
//! reminder sweep in [`crate::reminder`] and anchoring in [`crate::verification`].
use super::clock::{Clock, SystemClock};
use super::config::Config;
use super::document::{Actor, Document, DocumentDraft, DocumentStatus, DocumentUpdate};
use super::error::LifecycleError;
use super::event::{DocumentEvent, EventKind};
use super::outbound::{Anchor, LogOutbox, Mailer, MessageKind, NoAnchor, Notifier, OutboundMessage};
use super::recipient::{Recipient, RecipientInput, Roster};
use super::store::{OrAbort, Store, Tx, TxResult};
use super::token::TokenBinding;
use super::version::{self, ChangeType, DocumentVersion};
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub struct DocumentService {
    pub(crate) store: Store,
    pub(crate) config: Config,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) mailer: Arc<dyn Mailer>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) anchor: Arc<dyn Anchor>,
}

/// Body of a send request.
#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    /// Replaces the stored roster when non-empty.
    pub recipients: Vec<RecipientInput>,
    pub message: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningLink {
    pub recipient_id: String,
    pub email: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub document: Document,
    pub links: Vec<SigningLink>,
}

impl DocumentService {
    pub fn new(instance: Arc<sled::Db>, config: Config) -> Result<Self, LifecycleError> {
        let store = Store::open(instance)?;
        let resumed = store.resume_purges()?;
        if resumed > 0 {
            tracing::info!(resumed, "finished interrupted document deletes");
        }
        Ok(Self {
            store,
            config,
            clock: Arc::new(SystemClock),
            mailer: Arc::new(LogOutbox),
            notifier: Arc::new(LogOutbox),
            anchor: Arc::new(NoAnchor),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = mailer;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_anchor(mut self, anchor: Arc<dyn Anchor>) -> Self {
        self.anchor = anchor;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Create a draft, or a template when the draft is marked as one.
    pub fn create_document(
        &self,
        actor: &Actor,
        draft: DocumentDraft,
    ) -> Result<Document, LifecycleError> {
        let now = self.now();
        let kind = if draft.is_template() {
            EventKind::TemplateCreated
        } else {
            EventKind::DocumentCreated {
                source_document_id: None,
            }
        };
        let document = draft.validate_and_finalise(actor, now)?;

        self.store.transact(|tx| {
            tx.put_document(&document)?;
            tx.append_event(&document.id, None, Some(&actor.user_id), kind.clone(), now)?;
            Ok(())
        })?;

        tracing::info!(document_id = %document.id, template = document.is_template, "document created");
        Ok(document)
    }

    pub fn create_template(
        &self,
        actor: &Actor,
        draft: DocumentDraft,
    ) -> Result<Document, LifecycleError> {
        self.create_document(actor, draft.as_template())
    }

    /// Copy a document (or template) into a new one of the same kind.
    pub fn duplicate_document(
        &self,
        actor: &Actor,
        document_id: &str,
    ) -> Result<Document, LifecycleError> {
        let source = self.visible_document(actor, document_id)?;
        let title = format!("{} (copy)", source.title);
        self.copy_into_draft(actor, &source, &title, source.is_template)
    }

    /// Start a new draft from a template.
    pub fn instantiate_template(
        &self,
        actor: &Actor,
        template_id: &str,
        title: Option<&str>,
    ) -> Result<Document, LifecycleError> {
        let template = self.visible_document(actor, template_id)?;
        if !template.is_template {
            return Err(LifecycleError::invalid("source document is not a template"));
        }
        let title = title.unwrap_or(&template.title).to_string();
        self.copy_into_draft(actor, &template, &title, false)
    }

    fn copy_into_draft(
        &self,
        actor: &Actor,
        source: &Document,
        title: &str,
        as_template: bool,
    ) -> Result<Document, LifecycleError> {
        let now = self.now();
        let mut draft = DocumentDraft::new()
            .set_title(title)
            .set_content(source.content.clone())
            .set_settings(source.settings.clone());
        for (key, value) in &source.variables {
            draft = draft.set_variable(key, value);
        }
        if as_template {
            draft = draft.as_template();
        }
        if let super::document::Owner::Organization(org) = &source.owner {
            draft = draft.for_organization(org);
        }
        let document = draft.validate_and_finalise(actor, now)?;

        self.store.transact(|tx| {
            tx.put_document(&document)?;
            let kind = if as_template {
                EventKind::TemplateCreated
            } else {
                EventKind::DocumentCreated {
                    source_document_id: Some(source.id.clone()),
                }
            };
            tx.append_event(&document.id, None, Some(&actor.user_id), kind, now)?;
            Ok(())
        })?;

        tracing::info!(document_id = %document.id, source_id = %source.id, "document copied");
        Ok(document)
    }

    /// Current state of a document, expiring it first when it is overdue.
    pub fn get_document(&self, actor: &Actor, document_id: &str) -> Result<Document, LifecycleError> {
        self.visible_document(actor, document_id)
    }

    pub fn list_recipients(
        &self,
        actor: &Actor,
        document_id: &str,
    ) -> Result<Vec<Recipient>, LifecycleError> {
        let document = self.visible_document(actor, document_id)?;
        Ok(self.store.roster(&document.id)?.recipients)
    }

    /// Audit log, newest first.
    pub fn list_events(
        &self,
        actor: &Actor,
        document_id: &str,
    ) -> Result<Vec<DocumentEvent>, LifecycleError> {
        let document = self.visible_document(actor, document_id)?;
        let mut events = self.store.events(&document.id)?;
        events.reverse();
        Ok(events)
    }

    pub fn list_versions(
        &self,
        actor: &Actor,
        document_id: &str,
    ) -> Result<Vec<DocumentVersion>, LifecycleError> {
        let document = self.visible_document(actor, document_id)?;
        self.store.versions(&document.id)
    }

    /// Replace the roster of a draft. Tokens minted here are rotated again on send.
    pub fn set_roster(
        &self,
        actor: &Actor,
        document_id: &str,
        recipients: &[RecipientInput],
    ) -> Result<Vec<Recipient>, LifecycleError> {
        let document = self.visible_document(actor, document_id)?;
        ensure_sendable(&document)?;
        let roster = Roster::build(&document.id, recipients)?;
        let now = self.now();

        self.store.transact(|tx| {
            let current = tx.require_document(&document.id)?;
            ensure_sendable(&current).or_abort()?;
            replace_roster(tx, &roster, now)?;
            Ok(())
        })?;

        tracing::info!(document_id = %document.id, recipients = roster.recipients.len(), "roster replaced");
        Ok(roster.recipients)
    }

    /// Send a draft to its recipients.
    ///
    /// Every recipient gets a fresh token. Delivery happens before the state
    /// change is committed: if any message cannot be handed off, the document
    /// stays a draft and the error is returned.
    ///
    /// Recipients mailed before the failing hand-off hold links whose tokens
    /// were never bound, so those links resolve to not found. Sending again
    /// mails everyone a fresh link.
    pub fn send_document(
        &self,
        actor: &Actor,
        document_id: &str,
        request: SendRequest,
    ) -> Result<SendReceipt, LifecycleError> {
        let document = self.visible_document(actor, document_id)?;
        ensure_sendable(&document)?;
        let now = self.now();

        let stored = self.store.roster(&document.id)?;
        let roster = if request.recipients.is_empty() {
            if stored.recipients.is_empty() {
                return Err(LifecycleError::validation(
                    "recipients",
                    "at least one recipient is required",
                ));
            }
            let mut rotated = stored.clone();
            rotated.reissue_unsigned()?;
            rotated
        } else {
            Roster::build(&document.id, &request.recipients)?
        };

        let expires_at = match request.expires_at {
            Some(at) if at <= now => {
                return Err(LifecycleError::validation("expiresAt", "must be in the future"));
            }
            Some(at) => at,
            None => document.expiry_from(now, self.config.default_expiration_days),
        };

        let links: Vec<SigningLink> = roster
            .recipients
            .iter()
            .map(|r| SigningLink {
                recipient_id: r.id.clone(),
                email: r.email.clone(),
                url: self.config.signing_url(&r.access_token),
            })
            .collect();

        for (recipient, link) in roster.recipients.iter().zip(&links) {
            let message = OutboundMessage {
                kind: MessageKind::SigningRequest,
                document_id: document.id.clone(),
                document_title: document.title.clone(),
                recipient_id: recipient.id.clone(),
                email: recipient.email.clone(),
                name: recipient.name.clone(),
                signing_url: link.url.clone(),
                custom_message: request.message.clone(),
            };
            if let Err(err) = self.mailer.dispatch(&message, self.config.external_timeout()) {
                tracing::warn!(document_id = %document.id, recipient_id = %recipient.id, %err, "send aborted, delivery failed");
                return Err(err.into());
            }
        }

        let sent = self.store.transact(|tx| {
            let mut current = tx.require_document(&document.id)?;
            ensure_sendable(&current).or_abort()?;
            if request.recipients.is_empty() && tx.roster(&current.id)? != stored {
                return Err(sled::transaction::ConflictableTransactionError::Abort(
                    LifecycleError::invalid("recipients changed while sending, send again"),
                ));
            }
            replace_roster(tx, &roster, now)?;

            current.status = DocumentStatus::Sent;
            current.sent_at = Some(now.into());
            current.expires_at = Some(expires_at.into());
            current.updated_at = now.into();
            tx.put_document(&current)?;
            tx.append_event(
                &current.id,
                None,
                Some(&actor.user_id),
                EventKind::DocumentSent {
                    recipient_count: roster.recipients.len() as u32,
                    expires_at: expires_at.into(),
                },
                now,
            )?;
            Ok(current)
        })?;

        tracing::info!(document_id = %sent.id, recipients = links.len(), "document sent");
        Ok(SendReceipt {
            document: sent,
            links,
        })
    }

    /// Partial update. Content or title changes on a sent document snapshot the
    /// previous version and rotate every unsigned recipient's link.
    pub fn update_document(
        &self,
        actor: &Actor,
        document_id: &str,
        update: DocumentUpdate,
    ) -> Result<Document, LifecycleError> {
        self.apply_update(actor, document_id, &update, ChangeType::Edited)
    }

    /// Bring back the title, content and variables of an earlier version.
    pub fn restore_version(
        &self,
        actor: &Actor,
        document_id: &str,
        version_number: u32,
    ) -> Result<Document, LifecycleError> {
        let document = self.visible_document(actor, document_id)?;
        let version = self
            .store
            .version(&document.id, version_number)?
            .ok_or_else(|| LifecycleError::not_found(format!("version {version_number}")))?;

        let update = DocumentUpdate::new()
            .set_title(&version.title)
            .set_content(version.content)
            .set_variables(version.variables)
            .describe(&format!("restored version {version_number}"));
        self.apply_update(actor, document_id, &update, ChangeType::Restored)
    }

    fn apply_update(
        &self,
        actor: &Actor,
        document_id: &str,
        update: &DocumentUpdate,
        change_type: ChangeType,
    ) -> Result<Document, LifecycleError> {
        update.validate()?;
        let document = self.visible_document(actor, document_id)?;
        let now = self.now();

        let updated = self.store.transact(|tx| {
            let mut current = tx.require_document(&document.id)?;
            let status = requested_status(&current, update).or_abort()?;
            check_editable(&current, update).or_abort()?;

            if update.changes_content_of(&current) && current.status.is_live() {
                let snapshot = version::snapshot(
                    &current,
                    change_type,
                    update.change_description.as_deref(),
                    &actor.user_id,
                    now,
                );
                tx.put_version(&snapshot)?;

                let previous_version = current.current_version;
                current.current_version += 1;
                tx.append_event(
                    &current.id,
                    None,
                    Some(&actor.user_id),
                    EventKind::DocumentEdited {
                        previous_version,
                        new_version: current.current_version,
                        change_type,
                    },
                    now,
                )?;

                let mut roster = tx.roster(&current.id)?;
                for swap in roster.reissue_unsigned().or_abort()? {
                    tx.retire_token(&swap.retired, &current.id, now)?;
                    tx.bind_token(
                        &swap.issued,
                        &TokenBinding {
                            document_id: current.id.clone(),
                            recipient_id: swap.recipient_id.clone(),
                        },
                    )?;
                }
                tx.put_roster(&roster)?;
                // every unsigned recipient has to look again
                current.status = DocumentStatus::Sent;
            }

            update.apply_to(&mut current);
            if let Some(DocumentStatus::Expired) = status {
                current.status = DocumentStatus::Expired;
                tx.append_event(&current.id, None, Some(&actor.user_id), EventKind::DocumentExpired, now)?;
            }
            current.updated_at = now.into();
            tx.put_document(&current)?;
            Ok(current)
        })?;

        tracing::info!(
            document_id = %updated.id,
            version = updated.current_version,
            status = updated.status.as_str(),
            "document updated"
        );
        Ok(updated)
    }

    /// Hard delete, cascading to everything recorded against the document.
    ///
    /// The document row goes first, together with a purge marker; history is
    /// purged afterwards and an interrupted purge is finished on the next open.
    pub fn delete_document(&self, actor: &Actor, document_id: &str) -> Result<(), LifecycleError> {
        let document = self.visible_document(actor, document_id)?;

        self.store.transact(|tx| {
            let roster = tx.roster(&document.id)?;
            for token in roster.tokens() {
                tx.unbind_token(token)?;
            }
            tx.remove_document(&document.id)?;
            Ok(())
        })?;
        self.store.purge_history(&document.id)?;

        tracing::info!(document_id = %document.id, "document deleted");
        Ok(())
    }

    /// Expire every live document past its deadline. Returns the expired ids.
    pub fn expire_overdue(&self) -> Result<Vec<String>, LifecycleError> {
        let now = self.now();
        let mut expired = vec![];
        for document in self.store.documents() {
            let document = document?;
            if document.is_overdue(now) {
                self.refresh_expiry(&document.id, now)?;
                expired.push(document.id);
            }
        }
        Ok(expired)
    }

    /// Lazily move an overdue document to `expired`. Only the call that
    /// performs the transition records the event.
    pub(crate) fn refresh_expiry(
        &self,
        document_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Document, LifecycleError> {
        let document = self
            .store
            .document(document_id)?
            .ok_or_else(|| LifecycleError::not_found("document"))?;
        if !document.is_overdue(now) {
            return Ok(document);
        }

        let (document, expired) = self.store.transact(|tx| {
            let mut current = tx.require_document(document_id)?;
            if !current.is_overdue(now) {
                return Ok((current, false));
            }
            current.status = DocumentStatus::Expired;
            current.updated_at = now.into();
            tx.put_document(&current)?;
            tx.append_event(&current.id, None, None, EventKind::DocumentExpired, now)?;
            Ok((current, true))
        })?;

        if expired {
            tracing::info!(document_id = %document.id, "document expired");
        }
        Ok(document)
    }

    /// Load a document the actor may see. Missing and invisible look the same.
    pub(crate) fn visible_document(
        &self,
        actor: &Actor,
        document_id: &str,
    ) -> Result<Document, LifecycleError> {
        let document = self.refresh_expiry(document_id, self.now())?;
        if !actor.can_access(&document) {
            tracing::debug!(document_id, user_id = %actor.user_id, "document hidden from actor");
            return Err(LifecycleError::not_found("document"));
        }
        Ok(document)
    }
}

fn ensure_sendable(document: &Document) -> Result<(), LifecycleError> {
    if document.is_template {
        return Err(LifecycleError::invalid("templates cannot be sent"));
    }
    if document.status != DocumentStatus::Draft {
        return Err(LifecycleError::invalid(format!(
            "only drafts can be sent, document is {}",
            document.status.as_str()
        )));
    }
    Ok(())
}

/// Swap the stored roster for `roster`, retiring every previously issued token.
fn replace_roster(tx: &Tx<'_>, roster: &Roster, now: DateTime<Utc>) -> TxResult<()> {
    let previous = tx.roster(&roster.document_id)?;
    for token in previous.tokens() {
        tx.retire_token(token, &roster.document_id, now)?;
    }
    for recipient in &roster.recipients {
        tx.bind_token(
            &recipient.access_token,
            &TokenBinding {
                document_id: roster.document_id.clone(),
                recipient_id: recipient.id.clone(),
            },
        )?;
    }
    tx.put_roster(roster)
}

// Only expiring a live document by hand is allowed through an update.
fn requested_status(
    document: &Document,
    update: &DocumentUpdate,
) -> Result<Option<DocumentStatus>, LifecycleError> {
    match update.status {
        None => Ok(None),
        Some(status) if status == document.status => Ok(None),
        Some(DocumentStatus::Expired) if document.status.is_live() => {
            Ok(Some(DocumentStatus::Expired))
        }
        Some(status) => Err(LifecycleError::invalid(format!(
            "cannot move a {} document to {}",
            document.status.as_str(),
            status.as_str()
        ))),
    }
}

fn check_editable(document: &Document, update: &DocumentUpdate) -> Result<(), LifecycleError> {
    if document.status.is_terminal() {
        return Err(LifecycleError::invalid(format!(
            "document is {} and can no longer be edited",
            document.status.as_str()
        )));
    }
    if document.is_locked() {
        // after the first signature only the deadline may move
        let touches_more_than_expiry = update.title.is_some()
            || update.content.is_some()
            || update.variables.is_some()
            || update.settings.is_some();
        if touches_more_than_expiry {
            return Err(LifecycleError::invalid(
                "document is locked because it has been signed",
            ));
        }
    }
    Ok(())
}
