//! sled-backed persistence for documents, rosters, tokens, events, versions and payments
//!
//! Records are CBOR encoded. Multi-record transitions go through
//! [`Store::transact`], a serializable transaction over every lifecycle tree;
//! sled retries the closure on conflict, so closures must not have side effects
//! beyond the transactional trees.
use super::document::Document;
use super::error::LifecycleError;
use super::event::{DocumentEvent, EventKind};
use super::payment::PaymentLedger;
use super::recipient::Roster;
use super::token::{RetiredToken, TokenBinding};
use super::version::DocumentVersion;
use chrono::{DateTime, Utc};
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionalTree,
};
use sled::{Batch, Transactional, Tree};
use std::sync::Arc;

pub(crate) type TxResult<T> = ConflictableTransactionResult<T, LifecycleError>;

/// Turn a domain error into a transaction abort.
pub(crate) trait OrAbort<T> {
    fn or_abort(self) -> TxResult<T>;
}

impl<T> OrAbort<T> for Result<T, LifecycleError> {
    fn or_abort(self) -> TxResult<T> {
        self.map_err(ConflictableTransactionError::Abort)
    }
}

pub(crate) fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, LifecycleError> {
    minicbor::to_vec(value).map_err(|e| LifecycleError::Codec(e.to_string()))
}

pub(crate) fn decode<T>(bytes: &[u8]) -> Result<T, LifecycleError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    minicbor::decode(bytes).map_err(|e| LifecycleError::Codec(e.to_string()))
}

// `{document_id}/` groups per-document records; ids are bech32 and never contain '/'
fn prefix(document_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(document_id.len() + 1);
    key.extend_from_slice(document_id.as_bytes());
    key.push(b'/');
    key
}

fn event_key(document_id: &str, id: u64) -> Vec<u8> {
    let mut key = prefix(document_id);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn version_key(document_id: &str, version: u32) -> Vec<u8> {
    let mut key = prefix(document_id);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

// `{document_id}/{token}` lists a document's retired tokens for purging;
// bare token keys in the same tree answer lookups
fn retired_index_key(document_id: &str, token: &str) -> Vec<u8> {
    let mut key = prefix(document_id);
    key.extend_from_slice(token.as_bytes());
    key
}

pub(crate) fn reminder_key(document_id: &str, recipient_id: &str, day: u32) -> Vec<u8> {
    let mut key = prefix(document_id);
    key.extend_from_slice(recipient_id.as_bytes());
    key.push(b'/');
    key.extend_from_slice(&day.to_be_bytes());
    key
}

pub struct Store {
    documents: Tree,
    rosters: Tree,
    tokens: Tree,
    retired_tokens: Tree,
    events: Tree,
    versions: Tree,
    payments: Tree,
    reminder_claims: Tree,
    // documents deleted but whose history is not purged yet
    purges: Tree,
}

/// Transactional view handed to [`Store::transact`] closures.
pub(crate) struct Tx<'a> {
    documents: &'a TransactionalTree,
    rosters: &'a TransactionalTree,
    tokens: &'a TransactionalTree,
    retired_tokens: &'a TransactionalTree,
    events: &'a TransactionalTree,
    versions: &'a TransactionalTree,
    payments: &'a TransactionalTree,
    purges: &'a TransactionalTree,
}

impl Store {
    pub fn open(instance: Arc<sled::Db>) -> Result<Self, LifecycleError> {
        Ok(Self {
            documents: instance.open_tree("documents")?,
            rosters: instance.open_tree("rosters")?,
            tokens: instance.open_tree("tokens")?,
            retired_tokens: instance.open_tree("retired_tokens")?,
            events: instance.open_tree("events")?,
            versions: instance.open_tree("versions")?,
            payments: instance.open_tree("payments")?,
            reminder_claims: instance.open_tree("reminder_claims")?,
            purges: instance.open_tree("purges")?,
        })
    }

    pub(crate) fn transact<A, F>(&self, f: F) -> Result<A, LifecycleError>
    where
        F: Fn(&Tx<'_>) -> TxResult<A>,
    {
        let trees = (
            &self.documents,
            &self.rosters,
            &self.tokens,
            &self.retired_tokens,
            &self.events,
            &self.versions,
            &self.payments,
            &self.purges,
        );
        let result = trees.transaction(
            |(documents, rosters, tokens, retired_tokens, events, versions, payments, purges)| {
                let tx = Tx {
                    documents,
                    rosters,
                    tokens,
                    retired_tokens,
                    events,
                    versions,
                    payments,
                    purges,
                };
                f(&tx)
            },
        );
        Ok(result?)
    }

    pub fn document(&self, document_id: &str) -> Result<Option<Document>, LifecycleError> {
        match self.documents.get(document_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn documents(&self) -> impl Iterator<Item = Result<Document, LifecycleError>> + '_ {
        self.documents
            .iter()
            .values()
            .map(|value| -> Result<Document, LifecycleError> { decode(&value?) })
    }

    pub fn roster(&self, document_id: &str) -> Result<Roster, LifecycleError> {
        match self.rosters.get(document_id.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Ok(Roster::empty(document_id)),
        }
    }

    pub fn ledger(&self, document_id: &str) -> Result<PaymentLedger, LifecycleError> {
        match self.payments.get(document_id.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Ok(PaymentLedger::default()),
        }
    }

    /// Live binding only; use inside a transaction for anything that writes.
    pub fn lookup_token(&self, token: &str) -> Result<TokenBinding, LifecycleError> {
        if let Some(bytes) = self.tokens.get(token.as_bytes())? {
            return decode(&bytes);
        }
        if self.retired_tokens.contains_key(token.as_bytes())? {
            return Err(LifecycleError::LinkExpired);
        }
        Err(LifecycleError::not_found("signing link"))
    }

    /// Events of a document, oldest first.
    pub fn events(&self, document_id: &str) -> Result<Vec<DocumentEvent>, LifecycleError> {
        self.events
            .scan_prefix(prefix(document_id))
            .values()
            .map(|value| -> Result<DocumentEvent, LifecycleError> { decode(&value?) })
            .collect()
    }

    /// Snapshots of a document, oldest first.
    pub fn versions(&self, document_id: &str) -> Result<Vec<DocumentVersion>, LifecycleError> {
        self.versions
            .scan_prefix(prefix(document_id))
            .values()
            .map(|value| -> Result<DocumentVersion, LifecycleError> { decode(&value?) })
            .collect()
    }

    pub fn version(
        &self,
        document_id: &str,
        version: u32,
    ) -> Result<Option<DocumentVersion>, LifecycleError> {
        match self.versions.get(version_key(document_id, version))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Claim a reminder milestone. Only one caller ever gets `true` for a key.
    pub fn claim_reminder(&self, key: &[u8], now: DateTime<Utc>) -> Result<bool, LifecycleError> {
        let stamp = now.timestamp().to_be_bytes();
        let swapped = self
            .reminder_claims
            .compare_and_swap(key, None as Option<&[u8]>, Some(&stamp[..]))?;
        Ok(swapped.is_ok())
    }

    pub fn release_reminder(&self, key: &[u8]) -> Result<(), LifecycleError> {
        self.reminder_claims.remove(key)?;
        Ok(())
    }

    /// Drop the per-document records that live outside the document row, then
    /// clear the purge marker. Safe to repeat.
    pub(crate) fn purge_history(&self, document_id: &str) -> Result<(), LifecycleError> {
        let scope = prefix(document_id);
        for tree in [&self.events, &self.versions, &self.reminder_claims] {
            let mut batch = Batch::default();
            for key in tree.scan_prefix(&scope).keys() {
                batch.remove(key?);
            }
            tree.apply_batch(batch)?;
        }

        let mut batch = Batch::default();
        for key in self.retired_tokens.scan_prefix(&scope).keys() {
            let key = key?;
            batch.remove(&key[scope.len()..]);
            batch.remove(key);
        }
        self.retired_tokens.apply_batch(batch)?;

        self.purges.remove(document_id.as_bytes())?;
        Ok(())
    }

    /// Finish purges interrupted by a crash after their delete committed.
    pub(crate) fn resume_purges(&self) -> Result<usize, LifecycleError> {
        let pending = self
            .purges
            .iter()
            .keys()
            .map(|key| -> Result<String, LifecycleError> {
                Ok(String::from_utf8_lossy(&key?).into_owned())
            })
            .collect::<Result<Vec<_>, _>>()?;
        for document_id in &pending {
            self.purge_history(document_id)?;
        }
        Ok(pending.len())
    }
}

impl Tx<'_> {
    pub fn document(&self, document_id: &str) -> TxResult<Option<Document>> {
        match self.documents.get(document_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes).or_abort()?)),
            None => Ok(None),
        }
    }

    pub fn require_document(&self, document_id: &str) -> TxResult<Document> {
        self.document(document_id)?
            .ok_or_else(|| LifecycleError::not_found("document"))
            .or_abort()
    }

    pub fn put_document(&self, document: &Document) -> TxResult<()> {
        self.documents
            .insert(document.id.as_bytes(), encode(document).or_abort()?)?;
        Ok(())
    }

    /// Remove the document, roster and payments, and mark the rest for
    /// [`Store::purge_history`].
    pub fn remove_document(&self, document_id: &str) -> TxResult<()> {
        self.documents.remove(document_id.as_bytes())?;
        self.rosters.remove(document_id.as_bytes())?;
        self.payments.remove(document_id.as_bytes())?;
        self.purges.insert(document_id.as_bytes(), Vec::<u8>::new())?;
        Ok(())
    }

    pub fn roster(&self, document_id: &str) -> TxResult<Roster> {
        match self.rosters.get(document_id.as_bytes())? {
            Some(bytes) => decode(&bytes).or_abort(),
            None => Ok(Roster::empty(document_id)),
        }
    }

    pub fn put_roster(&self, roster: &Roster) -> TxResult<()> {
        self.rosters
            .insert(roster.document_id.as_bytes(), encode(roster).or_abort()?)?;
        Ok(())
    }

    pub fn ledger(&self, document_id: &str) -> TxResult<PaymentLedger> {
        match self.payments.get(document_id.as_bytes())? {
            Some(bytes) => decode(&bytes).or_abort(),
            None => Ok(PaymentLedger::default()),
        }
    }

    pub fn put_ledger(&self, document_id: &str, ledger: &PaymentLedger) -> TxResult<()> {
        self.payments
            .insert(document_id.as_bytes(), encode(ledger).or_abort()?)?;
        Ok(())
    }

    /// Resolve a presented token against the live index. Reading the index
    /// here makes a concurrent roster replacement conflict with this action.
    pub fn resolve_token(&self, token: &str) -> TxResult<TokenBinding> {
        if let Some(bytes) = self.tokens.get(token.as_bytes())? {
            return decode(&bytes).or_abort();
        }
        if self.retired_tokens.get(token.as_bytes())?.is_some() {
            return Err(ConflictableTransactionError::Abort(LifecycleError::LinkExpired));
        }
        Err(ConflictableTransactionError::Abort(LifecycleError::not_found(
            "signing link",
        )))
    }

    pub fn bind_token(&self, token: &str, binding: &TokenBinding) -> TxResult<()> {
        self.tokens
            .insert(token.as_bytes(), encode(binding).or_abort()?)?;
        Ok(())
    }

    /// Move a token from the live index to the retired one.
    pub fn retire_token(&self, token: &str, document_id: &str, now: DateTime<Utc>) -> TxResult<()> {
        self.tokens.remove(token.as_bytes())?;
        let retired = RetiredToken {
            document_id: document_id.to_string(),
            retired_at: now.into(),
        };
        self.retired_tokens
            .insert(token.as_bytes(), encode(&retired).or_abort()?)?;
        self.retired_tokens
            .insert(retired_index_key(document_id, token), Vec::<u8>::new())?;
        Ok(())
    }

    pub fn unbind_token(&self, token: &str) -> TxResult<()> {
        self.tokens.remove(token.as_bytes())?;
        Ok(())
    }

    pub fn put_version(&self, version: &DocumentVersion) -> TxResult<()> {
        let key = version_key(&version.document_id, version.version_number);
        self.versions.insert(key, encode(version).or_abort()?)?;
        Ok(())
    }

    pub fn append_event(
        &self,
        document_id: &str,
        recipient_id: Option<&str>,
        actor: Option<&str>,
        kind: EventKind,
        now: DateTime<Utc>,
    ) -> TxResult<DocumentEvent> {
        let id = self.events.generate_id()?;
        let event = DocumentEvent::new(id, document_id, recipient_id, actor, kind, now);
        self.events
            .insert(event_key(document_id, id), encode(&event).or_abort()?)?;
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Actor, DocumentDraft};
    use tempfile::tempdir;

    fn open_store() -> anyhow::Result<(tempfile::TempDir, Store)> {
        let temp_dir = tempdir()?;
        let db = sled::open(temp_dir.path().join("store.db"))?;
        let store = Store::open(Arc::new(db))?;
        Ok((temp_dir, store))
    }

    #[test]
    fn aborted_transaction_leaves_nothing_behind() -> anyhow::Result<()> {
        let (_dir, store) = open_store()?;
        let doc = DocumentDraft::new()
            .set_title("Quote")
            .validate_and_finalise(&Actor::user("user_a"), Utc::now())?;

        let res: Result<(), LifecycleError> = store.transact(|tx| {
            tx.put_document(&doc)?;
            tx.append_event(&doc.id, None, None, EventKind::TemplateCreated, Utc::now())?;
            Err(ConflictableTransactionError::Abort(LifecycleError::invalid("no")))
        });

        assert!(res.is_err());
        assert!(store.document(&doc.id)?.is_none());
        assert!(store.events(&doc.id)?.is_empty());
        Ok(())
    }

    #[test]
    fn events_come_back_in_append_order() -> anyhow::Result<()> {
        let (_dir, store) = open_store()?;
        let now = Utc::now();

        store.transact(|tx| {
            tx.append_event("doc_a", None, None, EventKind::DocumentViewed, now)?;
            tx.append_event("doc_b", None, None, EventKind::DocumentViewed, now)?;
            tx.append_event("doc_a", None, None, EventKind::DocumentSigned, now)?;
            Ok(())
        })?;

        let events = store.events("doc_a")?;
        let types: Vec<_> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(types, vec!["document_viewed", "document_signed"]);
        Ok(())
    }

    #[test]
    fn appending_events_never_blocks_the_transaction() -> anyhow::Result<()> {
        let (_dir, store) = open_store()?;
        let (done, finished) = std::sync::mpsc::channel();

        std::thread::spawn(move || {
            let appended = store.transact(|tx| {
                let first = tx.append_event("doc_a", None, None, EventKind::DocumentViewed, Utc::now())?;
                let second = tx.append_event("doc_a", None, None, EventKind::DocumentSigned, Utc::now())?;
                Ok((first.id, second.id))
            });
            let _ = done.send(appended.map_err(|e| e.to_string()));
        });

        let (first, second) = finished
            .recv_timeout(std::time::Duration::from_secs(10))
            .map_err(|_| anyhow::anyhow!("event append hung inside the transaction"))?
            .map_err(anyhow::Error::msg)?;
        assert!(second > first);
        Ok(())
    }

    #[test]
    fn retired_tokens_report_link_expired() -> anyhow::Result<()> {
        let (_dir, store) = open_store()?;
        let binding = TokenBinding {
            document_id: "doc_a".into(),
            recipient_id: "rcpt_a".into(),
        };

        store.transact(|tx| tx.bind_token("sign1old", &binding))?;
        assert_eq!(store.lookup_token("sign1old")?, binding);

        store.transact(|tx| tx.retire_token("sign1old", "doc_a", Utc::now()))?;
        assert!(matches!(
            store.lookup_token("sign1old"),
            Err(LifecycleError::LinkExpired)
        ));
        assert!(matches!(
            store.lookup_token("sign1never"),
            Err(LifecycleError::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn purge_only_touches_its_own_document() -> anyhow::Result<()> {
        let (_dir, store) = open_store()?;
        let now = Utc::now();

        store.transact(|tx| {
            tx.retire_token("sign1gone", "doc_a", now)?;
            tx.retire_token("sign1kept", "doc_b", now)?;
            tx.append_event("doc_a", None, None, EventKind::DocumentViewed, now)?;
            tx.append_event("doc_b", None, None, EventKind::DocumentViewed, now)?;
            Ok(())
        })?;

        store.purge_history("doc_a")?;

        assert!(matches!(
            store.lookup_token("sign1gone"),
            Err(LifecycleError::NotFound(_))
        ));
        assert!(matches!(
            store.lookup_token("sign1kept"),
            Err(LifecycleError::LinkExpired)
        ));
        assert!(store.events("doc_a")?.is_empty());
        assert_eq!(store.events("doc_b")?.len(), 1);
        Ok(())
    }

    #[test]
    fn interrupted_delete_is_finished_on_reopen() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let db = Arc::new(sled::open(temp_dir.path().join("purge.db"))?);
        let now = Utc::now();

        let store = Store::open(db.clone())?;
        store.transact(|tx| {
            tx.append_event("doc_a", None, None, EventKind::DocumentViewed, now)?;
            tx.retire_token("sign1old", "doc_a", now)?;
            Ok(())
        })?;
        // delete committed, history purge never ran
        store.transact(|tx| tx.remove_document("doc_a"))?;
        assert_eq!(store.events("doc_a")?.len(), 1);
        drop(store);

        let store = Store::open(db)?;
        assert_eq!(store.resume_purges()?, 1);
        assert!(store.events("doc_a")?.is_empty());
        assert!(store.lookup_token("sign1old").is_err());
        assert_eq!(store.resume_purges()?, 0);
        Ok(())
    }

    #[test]
    fn reminder_claims_are_exclusive() -> anyhow::Result<()> {
        let (_dir, store) = open_store()?;
        let key = reminder_key("doc_a", "rcpt_a", 3);

        assert!(store.claim_reminder(&key, Utc::now())?);
        assert!(!store.claim_reminder(&key, Utc::now())?);

        store.release_reminder(&key)?;
        assert!(store.claim_reminder(&key, Utc::now())?);
        Ok(())
    }
}
