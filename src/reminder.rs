//! Reminder sweep over documents still out for signature
//!
//! The sweep is a function of `now` and persisted state only. Concurrent runs
//! are safe: each (document, recipient, milestone) is claimed with a
//! compare-and-swap marker before any mail goes out, and the `reminder_sent`
//! events carry the dedupe history.
use super::document::{Document, DocumentStatus};
use super::error::LifecycleError;
use super::event::{DocumentEvent, EventKind};
use super::outbound::{MessageKind, OutboundMessage};
use super::recipient::Recipient;
use super::service::DocumentService;
use super::store;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderDispatch {
    pub document_id: String,
    pub recipient_id: String,
    pub day_number: u32,
    pub reminder_number: u32,
    pub total_reminders: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepFailure {
    pub document_id: String,
    pub recipient_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Live documents looked at.
    pub examined: usize,
    pub sent: Vec<ReminderDispatch>,
    pub expired: Vec<String>,
    /// Recipients due a milestone but already reminded.
    pub skipped: usize,
    pub failures: Vec<SweepFailure>,
}

pub struct ReminderScheduler {
    service: Arc<DocumentService>,
}

impl ReminderScheduler {
    pub fn new(service: Arc<DocumentService>) -> Self {
        Self { service }
    }

    /// Entry point for the cron trigger. The presented secret must match the
    /// configured one; with no secret configured every trigger is refused.
    pub fn run_scheduled(&self, secret: &str) -> Result<SweepReport, LifecycleError> {
        let authorised = self
            .service
            .config
            .cron_secret
            .as_deref()
            .is_some_and(|expected| constant_time_eq(expected.as_bytes(), secret.as_bytes()));
        if !authorised {
            tracing::warn!("scheduled sweep refused, bad cron secret");
            return Err(LifecycleError::Unauthorized("invalid cron secret".into()));
        }
        self.sweep(self.service.now())
    }

    pub fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, LifecycleError> {
        let mut report = SweepReport::default();

        for document in self.service.store.documents() {
            let document = document?;
            if document.is_template || !document.status.is_live() {
                continue;
            }
            let Some(sent_at) = document.sent_at.as_ref().map(|at| at.to_datetime_utc()) else {
                continue;
            };
            report.examined += 1;

            if document.is_overdue(now) {
                match self.service.refresh_expiry(&document.id, now) {
                    Ok(current) if current.status == DocumentStatus::Expired => {
                        report.expired.push(document.id.clone())
                    }
                    Ok(_) => {}
                    Err(err) => report.failures.push(SweepFailure {
                        document_id: document.id.clone(),
                        recipient_id: None,
                        reason: err.to_string(),
                    }),
                }
                continue;
            }

            let elapsed = (now - sent_at).num_days();
            let Ok(day) = u32::try_from(elapsed) else {
                continue;
            };
            let milestones = self.milestones(&document);
            let Some(position) = milestones.iter().position(|m| *m == day) else {
                continue;
            };

            if let Err(err) = self.remind_document(&document, day, position, &milestones, now, &mut report) {
                report.failures.push(SweepFailure {
                    document_id: document.id.clone(),
                    recipient_id: None,
                    reason: err.to_string(),
                });
            }
        }

        tracing::info!(
            examined = report.examined,
            sent = report.sent.len(),
            expired = report.expired.len(),
            skipped = report.skipped,
            failures = report.failures.len(),
            "reminder sweep finished"
        );
        Ok(report)
    }

    fn milestones(&self, document: &Document) -> Vec<u32> {
        let mut days = document
            .settings
            .reminder_days
            .clone()
            .unwrap_or_else(|| self.service.config.default_reminder_days.clone());
        days.sort_unstable();
        days.dedup();
        days
    }

    fn remind_document(
        &self,
        document: &Document,
        day: u32,
        position: usize,
        milestones: &[u32],
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<(), LifecycleError> {
        let roster = self.service.store.roster(&document.id)?;
        let events = self.service.store.events(&document.id)?;
        let cooldown = Duration::hours(i64::from(self.service.config.reminder_cooldown_hours));

        // only signers hold up completion; viewers and approvers are never reminded
        for recipient in roster.signers().filter(|r| !r.status.has_acted()) {
            if already_reminded(&events, &recipient.id, day, cooldown, now) {
                tracing::debug!(document_id = %document.id, recipient_id = %recipient.id, day, "reminder skipped");
                report.skipped += 1;
                continue;
            }

            let key = store::reminder_key(&document.id, &recipient.id, day);
            if !self.service.store.claim_reminder(&key, now)? {
                tracing::debug!(document_id = %document.id, recipient_id = %recipient.id, day, "reminder claimed elsewhere");
                report.skipped += 1;
                continue;
            }

            let dispatch = ReminderDispatch {
                document_id: document.id.clone(),
                recipient_id: recipient.id.clone(),
                day_number: day,
                reminder_number: position as u32 + 1,
                total_reminders: milestones.len() as u32,
            };
            match self.remind(document, recipient, &dispatch, now) {
                Ok(()) => report.sent.push(dispatch),
                Err(err) => {
                    tracing::warn!(document_id = %document.id, recipient_id = %recipient.id, %err, "reminder failed");
                    report.failures.push(SweepFailure {
                        document_id: document.id.clone(),
                        recipient_id: Some(recipient.id.clone()),
                        reason: err.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn remind(
        &self,
        document: &Document,
        recipient: &Recipient,
        dispatch: &ReminderDispatch,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        let key = store::reminder_key(&document.id, &recipient.id, dispatch.day_number);
        let message = OutboundMessage {
            kind: MessageKind::Reminder {
                day_number: dispatch.day_number,
                reminder_number: dispatch.reminder_number,
                total_reminders: dispatch.total_reminders,
            },
            document_id: document.id.clone(),
            document_title: document.title.clone(),
            recipient_id: recipient.id.clone(),
            email: recipient.email.clone(),
            name: recipient.name.clone(),
            signing_url: self.service.config.signing_url(&recipient.access_token),
            custom_message: None,
        };

        if let Err(err) = self
            .service
            .mailer
            .dispatch(&message, self.service.config.external_timeout())
        {
            // let a later sweep retry this milestone
            self.service.store.release_reminder(&key)?;
            return Err(err.into());
        }

        self.service.store.transact(|tx| {
            tx.append_event(
                &document.id,
                Some(&recipient.id),
                None,
                EventKind::ReminderSent {
                    day_number: dispatch.day_number,
                    reminder_number: dispatch.reminder_number,
                    total_reminders: dispatch.total_reminders,
                },
                now,
            )?;
            Ok(())
        })?;

        tracing::info!(
            document_id = %document.id,
            recipient_id = %recipient.id,
            day = dispatch.day_number,
            "reminder sent"
        );
        Ok(())
    }
}

fn already_reminded(
    events: &[DocumentEvent],
    recipient_id: &str,
    day: u32,
    cooldown: Duration,
    now: DateTime<Utc>,
) -> bool {
    events
        .iter()
        .filter(|e| e.recipient_id.as_deref() == Some(recipient_id))
        .filter_map(|e| e.reminder_day().map(|d| (d, e.created_at.to_datetime_utc())))
        .any(|(reminded_day, at)| reminded_day == day || now - at < cooldown)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
