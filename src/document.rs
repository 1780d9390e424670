//! Core document types and the draft/update builders
use super::error::LifecycleError;
use super::utils;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::{BTreeMap, HashSet};

const MAX_TITLE_LEN: usize = 500;
const MAX_SETTING_DAYS: u32 = 365;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentStatus {
    #[n(0)]
    Draft,
    #[n(1)]
    Sent,
    #[n(2)]
    Viewed,
    /// Reserved. Completion is always decided from the roster and payments,
    /// so a fully signed document awaiting payment stays `Sent`/`Viewed`.
    #[n(3)]
    Signed,
    #[n(4)]
    Completed,
    #[n(5)]
    Expired,
    #[n(6)]
    Declined,
}

impl DocumentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DocumentStatus::Completed | DocumentStatus::Expired | DocumentStatus::Declined
        )
    }

    /// Out with recipients and still awaiting their actions.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            DocumentStatus::Sent | DocumentStatus::Viewed | DocumentStatus::Signed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Draft => "draft",
            DocumentStatus::Sent => "sent",
            DocumentStatus::Viewed => "viewed",
            DocumentStatus::Signed => "signed",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Expired => "expired",
            DocumentStatus::Declined => "declined",
        }
    }
}

/// One block of the editor canvas. `data` is never interpreted here.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ContentBlock {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub block_type: String,
    #[n(2)]
    pub data: String,
}

impl ContentBlock {
    pub fn new(id: &str, block_type: &str, data: &str) -> Self {
        Self {
            id: id.to_string(),
            block_type: block_type.to_string(),
            data: data.to_string(),
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    #[n(0)]
    pub expiration_days: Option<u32>,
    #[n(1)]
    pub reminder_days: Option<Vec<u32>>,
    #[n(2)]
    pub payment_required: bool,
    #[n(3)]
    pub payment_amount: Option<u64>, // minor units
    // passed through to rendering and delivery
    #[n(4)]
    pub extra: BTreeMap<String, String>,
}

impl Settings {
    pub fn validate(&self) -> Result<(), LifecycleError> {
        if let Some(days) = self.expiration_days {
            if days == 0 || days > MAX_SETTING_DAYS {
                return Err(LifecycleError::validation(
                    "settings.expirationDays",
                    format!("must be between 1 and {MAX_SETTING_DAYS}"),
                ));
            }
        }
        if let Some(days) = &self.reminder_days {
            if days.iter().any(|d| *d == 0 || *d > MAX_SETTING_DAYS) {
                return Err(LifecycleError::validation(
                    "settings.reminderDays",
                    format!("each milestone must be between 1 and {MAX_SETTING_DAYS}"),
                ));
            }
        }
        if self.payment_required && self.payment_amount == Some(0) {
            return Err(LifecycleError::validation(
                "settings.paymentAmount",
                "a required payment cannot be zero",
            ));
        }
        Ok(())
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    #[n(0)]
    User(#[n(0)] String),
    #[n(1)]
    Organization(#[n(0)] String),
}

/// An already authenticated caller, with its active organization memberships
/// resolved upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
    pub organization_ids: Vec<String>,
}

impl Actor {
    pub fn user(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            organization_ids: vec![],
        }
    }

    pub fn member_of(mut self, organization_id: &str) -> Self {
        self.organization_ids.push(organization_id.to_string());
        self
    }

    pub fn can_access(&self, document: &Document) -> bool {
        match &document.owner {
            Owner::User(id) => *id == self.user_id,
            Owner::Organization(id) => self.organization_ids.iter().any(|org| org == id),
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Document {
    #[n(0)]
    pub id: String, // bech32 encoded uuid7
    #[n(1)]
    pub title: String,
    #[n(2)]
    pub status: DocumentStatus,
    #[n(3)]
    pub content: Vec<ContentBlock>,
    #[n(4)]
    pub variables: BTreeMap<String, String>,
    #[n(5)]
    pub settings: Settings,
    #[n(6)]
    pub is_template: bool,
    #[n(7)]
    pub current_version: u32,
    #[n(8)]
    pub locked_at: Option<TimeStamp<Utc>>,
    #[n(9)]
    pub sent_at: Option<TimeStamp<Utc>>,
    #[n(10)]
    pub expires_at: Option<TimeStamp<Utc>>,
    #[n(11)]
    pub completed_at: Option<TimeStamp<Utc>>,
    #[n(12)]
    pub blockchain_tx_hash: Option<String>,
    #[n(13)]
    pub blockchain_verified_at: Option<TimeStamp<Utc>>,
    #[n(14)]
    pub owner: Owner,
    #[n(15)]
    pub created_by: String,
    #[n(16)]
    pub created_at: TimeStamp<Utc>,
    #[n(17)]
    pub updated_at: TimeStamp<Utc>,
}

impl Document {
    pub fn is_locked(&self) -> bool {
        self.locked_at.is_some()
    }

    /// True once `now` is past `expires_at` on a live document.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status.is_live()
            && self
                .expires_at
                .as_ref()
                .is_some_and(|at| now > at.to_datetime_utc())
    }

    /// Hash over what a signer actually saw: title and ordered blocks.
    pub fn content_hash(&self) -> anyhow::Result<String> {
        let (hash, _) = utils::cbor_digest(&(&self.title, &self.content))?;
        Ok(hash)
    }

    pub fn expiry_from(&self, sent_at: DateTime<Utc>, default_days: u32) -> DateTime<Utc> {
        let days = self.settings.expiration_days.unwrap_or(default_days);
        sent_at + Duration::days(i64::from(days))
    }
}

// Used for constructing new drafts and templates
#[derive(Debug, Default, Clone)]
pub struct DocumentDraft {
    title: Option<String>,
    content: Vec<ContentBlock>,
    variables: BTreeMap<String, String>,
    settings: Settings,
    is_template: bool,
    organization_id: Option<String>,
}

impl DocumentDraft {
    /// Construct a new builder object, this becomes the basis for a draft
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_title(mut self, title: &str) -> Self {
        self.title = Some(title.to_string());
        self
    }
    pub fn push_block(mut self, block: ContentBlock) -> Self {
        self.content.push(block);
        self
    }
    pub fn set_content(mut self, content: Vec<ContentBlock>) -> Self {
        self.content = content;
        self
    }
    pub fn set_variable(mut self, key: &str, value: &str) -> Self {
        self.variables.insert(key.to_string(), value.to_string());
        self
    }
    pub fn set_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }
    pub fn as_template(mut self) -> Self {
        self.is_template = true;
        self
    }
    /// Owned by the organization rather than the creating user.
    pub fn for_organization(mut self, organization_id: &str) -> Self {
        self.organization_id = Some(organization_id.to_string());
        self
    }
    pub(crate) fn is_template(&self) -> bool {
        self.is_template
    }

    /// Checks fields and produces the stored draft.
    pub fn validate_and_finalise(
        self,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<Document, LifecycleError> {
        let title = self.title.unwrap_or_default();
        validate_title(&title)?;
        validate_content(&self.content)?;
        self.settings.validate()?;

        let owner = match self.organization_id {
            Some(org) if actor.organization_ids.contains(&org) => Owner::Organization(org),
            Some(_) => {
                return Err(LifecycleError::Unauthorized(
                    "not a member of the owning organization".into(),
                ));
            }
            None => Owner::User(actor.user_id.clone()),
        };

        let id = utils::new_uuid_to_bech32("doc_").map_err(|e| LifecycleError::Codec(e.to_string()))?;

        Ok(Document {
            id,
            title,
            status: DocumentStatus::Draft,
            content: self.content,
            variables: self.variables,
            settings: self.settings,
            is_template: self.is_template,
            current_version: 1,
            locked_at: None,
            sent_at: None,
            expires_at: None,
            completed_at: None,
            blockchain_tx_hash: None,
            blockchain_verified_at: None,
            owner,
            created_by: actor.user_id.clone(),
            created_at: now.into(),
            updated_at: now.into(),
        })
    }
}

/// Partial update of a document. Unset fields are left untouched.
#[derive(Debug, Default, Clone)]
pub struct DocumentUpdate {
    pub title: Option<String>,
    pub content: Option<Vec<ContentBlock>>,
    pub status: Option<DocumentStatus>,
    pub variables: Option<BTreeMap<String, String>>,
    pub settings: Option<Settings>,
    pub expires_at: Option<DateTime<Utc>>,
    pub change_description: Option<String>,
}

impl DocumentUpdate {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_title(mut self, title: &str) -> Self {
        self.title = Some(title.to_string());
        self
    }
    pub fn set_content(mut self, content: Vec<ContentBlock>) -> Self {
        self.content = Some(content);
        self
    }
    pub fn set_status(mut self, status: DocumentStatus) -> Self {
        self.status = Some(status);
        self
    }
    pub fn set_variables(mut self, variables: BTreeMap<String, String>) -> Self {
        self.variables = Some(variables);
        self
    }
    pub fn set_settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }
    pub fn set_expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }
    pub fn describe(mut self, description: &str) -> Self {
        self.change_description = Some(description.to_string());
        self
    }

    /// Whether applying this update would change what signers see.
    pub fn changes_content_of(&self, document: &Document) -> bool {
        let title_changed = self.title.as_ref().is_some_and(|t| *t != document.title);
        let content_changed = self.content.as_ref().is_some_and(|c| *c != document.content);
        title_changed || content_changed
    }

    pub fn validate(&self) -> Result<(), LifecycleError> {
        if let Some(title) = &self.title {
            validate_title(title)?;
        }
        if let Some(content) = &self.content {
            validate_content(content)?;
        }
        if let Some(settings) = &self.settings {
            settings.validate()?;
        }
        Ok(())
    }

    /// Write the requested fields onto `document`. Status is handled by the caller.
    pub(crate) fn apply_to(&self, document: &mut Document) {
        if let Some(title) = &self.title {
            document.title = title.clone();
        }
        if let Some(content) = &self.content {
            document.content = content.clone();
        }
        if let Some(variables) = &self.variables {
            document.variables = variables.clone();
        }
        if let Some(settings) = &self.settings {
            document.settings = settings.clone();
        }
        if let Some(at) = self.expires_at {
            document.expires_at = Some(at.into());
        }
    }
}

fn validate_title(title: &str) -> Result<(), LifecycleError> {
    if title.trim().is_empty() {
        return Err(LifecycleError::validation("title", "must not be empty"));
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(LifecycleError::validation(
            "title",
            format!("must be at most {MAX_TITLE_LEN} characters"),
        ));
    }
    Ok(())
}

// block order is significant, ids must be unique so the editor can address them
fn validate_content(content: &[ContentBlock]) -> Result<(), LifecycleError> {
    let mut seen = HashSet::new();
    for block in content {
        if block.id.is_empty() {
            return Err(LifecycleError::validation("content", "block id is empty"));
        }
        if !seen.insert(block.id.as_str()) {
            return Err(LifecycleError::validation(
                "content",
                format!("duplicate block id {}", block.id),
            ));
        }
    }
    Ok(())
}
