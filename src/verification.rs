//! Tamper evidence for completed documents
//!
//! A completed document is reduced to a canonical CBOR record whose SHA-256 is
//! handed to an external anchoring service. Signer emails are hashed before
//! they enter the record, so the anchored value carries no personal data.
use super::document::{Actor, Document, DocumentStatus, TimeStamp};
use super::error::LifecycleError;
use super::event::EventKind;
use super::payment::PaymentLedger;
use super::recipient::{RecipientStatus, Roster};
use super::service::DocumentService;
use super::store::OrAbort;
use super::utils;
use chrono::{DateTime, Utc};

#[derive(minicbor::Encode, Debug, Clone, PartialEq, Eq)]
struct SignerProof {
    #[n(0)]
    email_hash: String,
    #[n(1)]
    signed_at: TimeStamp<Utc>,
}

#[derive(minicbor::Encode, Debug, Clone, PartialEq, Eq)]
struct CanonicalRecord {
    #[n(0)]
    content_hash: String,
    #[n(1)]
    signers: Vec<SignerProof>,
    #[n(2)]
    payment_collected: bool,
    #[n(3)]
    completed_at: TimeStamp<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorResult {
    pub document_id: String,
    pub tx_hash: String,
    pub verification_hash: String,
    pub verified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationStatus {
    /// Only completed documents can be verified.
    NotCompleted,
    NotAnchored { verification_hash: String },
    Anchored {
        tx_hash: String,
        verification_hash: String,
        verified_at: Option<DateTime<Utc>>,
        /// False when the anchored value no longer matches the stored document.
        matches: bool,
    },
}

/// Hex SHA-256 of the canonical record of a completed document.
pub fn verification_hash(
    document: &Document,
    roster: &Roster,
    ledger: &PaymentLedger,
) -> Result<String, LifecycleError> {
    let completed_at = document
        .completed_at
        .clone()
        .ok_or_else(|| LifecycleError::invalid("document has not been completed"))?;
    let content_hash = document
        .content_hash()
        .map_err(|e| LifecycleError::Codec(e.to_string()))?;

    let mut signers: Vec<SignerProof> = roster
        .signers()
        .filter(|r| r.status == RecipientStatus::Signed)
        .filter_map(|r| {
            r.signed_at.clone().map(|signed_at| SignerProof {
                email_hash: sha256::digest(utils::normalise_email(&r.email)),
                signed_at,
            })
        })
        .collect();
    signers.sort_by(|a, b| a.email_hash.cmp(&b.email_hash));

    let record = CanonicalRecord {
        content_hash,
        signers,
        payment_collected: ledger.has_succeeded(),
        completed_at,
    };
    let (hash, _) = utils::cbor_digest(&record).map_err(|e| LifecycleError::Codec(e.to_string()))?;
    Ok(hash)
}

fn hash_bytes(hash: &str) -> Result<Vec<u8>, LifecycleError> {
    hex::decode(hash).map_err(|e| LifecycleError::Codec(e.to_string()))
}

impl DocumentService {
    /// Anchor a completed document. The stored transaction reference is write-once.
    pub fn anchor_document(
        &self,
        actor: &Actor,
        document_id: &str,
    ) -> Result<AnchorResult, LifecycleError> {
        let document = self.visible_document(actor, document_id)?;
        ensure_anchorable(&document)?;

        let roster = self.store.roster(&document.id)?;
        let ledger = self.store.ledger(&document.id)?;
        let hash = verification_hash(&document, &roster, &ledger)?;

        let receipt = match self.anchor.anchor(&hash_bytes(&hash)?, self.config.external_timeout()) {
            Ok(receipt) => receipt,
            Err(err) => {
                tracing::warn!(document_id = %document.id, %err, "anchoring failed");
                return Err(err.into());
            }
        };
        let now = self.now();

        self.store.transact(|tx| {
            let mut current = tx.require_document(&document.id)?;
            ensure_anchorable(&current).or_abort()?;
            current.blockchain_tx_hash = Some(receipt.tx_hash.clone());
            current.blockchain_verified_at = Some(now.into());
            tx.put_document(&current)?;
            tx.append_event(
                &current.id,
                None,
                Some(&actor.user_id),
                EventKind::BlockchainVerified {
                    tx_hash: receipt.tx_hash.clone(),
                    verification_hash: hash.clone(),
                },
                now,
            )?;
            Ok(())
        })?;

        tracing::info!(document_id = %document.id, tx_hash = %receipt.tx_hash, "document anchored");
        Ok(AnchorResult {
            document_id: document.id,
            tx_hash: receipt.tx_hash,
            verification_hash: hash,
            verified_at: now,
        })
    }

    /// Recompute the hash and check it against the anchored transaction.
    pub fn verification_status(
        &self,
        actor: &Actor,
        document_id: &str,
    ) -> Result<VerificationStatus, LifecycleError> {
        let document = self.visible_document(actor, document_id)?;
        if document.status != DocumentStatus::Completed {
            return Ok(VerificationStatus::NotCompleted);
        }

        let roster = self.store.roster(&document.id)?;
        let ledger = self.store.ledger(&document.id)?;
        let hash = verification_hash(&document, &roster, &ledger)?;

        let Some(tx_hash) = document.blockchain_tx_hash else {
            return Ok(VerificationStatus::NotAnchored {
                verification_hash: hash,
            });
        };

        let matches = self
            .anchor
            .confirm(&hash_bytes(&hash)?, &tx_hash, self.config.external_timeout())?;
        if !matches {
            tracing::warn!(document_id = %document.id, %tx_hash, "anchored hash does not match document");
        }
        Ok(VerificationStatus::Anchored {
            tx_hash,
            verification_hash: hash,
            verified_at: document
                .blockchain_verified_at
                .map(|at| at.to_datetime_utc()),
            matches,
        })
    }
}

fn ensure_anchorable(document: &Document) -> Result<(), LifecycleError> {
    if document.status != DocumentStatus::Completed {
        return Err(LifecycleError::invalid("only completed documents can be anchored"));
    }
    if document.blockchain_tx_hash.is_some() {
        return Err(LifecycleError::invalid("document is already anchored"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipient::RecipientInput;

    fn completed() -> (Document, Roster) {
        let mut document = crate::document::DocumentDraft::new()
            .set_title("Quote")
            .validate_and_finalise(&Actor::user("user_a"), Utc::now())
            .unwrap();
        let mut roster = Roster::build(
            &document.id,
            &[
                RecipientInput::signer("Ann@Example.com", "Ann"),
                RecipientInput::signer("bob@example.com", "Bob"),
            ],
        )
        .unwrap();
        let ids: Vec<String> = roster.recipients.iter().map(|r| r.id.clone()).collect();
        for id in ids {
            roster.apply_signature(&id, "sig", Utc::now()).unwrap();
        }
        document.status = DocumentStatus::Completed;
        document.completed_at = Some(Utc::now().into());
        (document, roster)
    }

    #[test]
    fn hash_ignores_roster_order() {
        let (document, roster) = completed();
        let mut reversed = roster.clone();
        reversed.recipients.reverse();

        let ledger = PaymentLedger::default();
        assert_eq!(
            verification_hash(&document, &roster, &ledger).unwrap(),
            verification_hash(&document, &reversed, &ledger).unwrap()
        );
    }

    #[test]
    fn content_change_changes_the_hash() {
        let (document, roster) = completed();
        let mut tampered = document.clone();
        tampered.title = "Quote (amended)".into();

        let ledger = PaymentLedger::default();
        assert_ne!(
            verification_hash(&document, &roster, &ledger).unwrap(),
            verification_hash(&tampered, &roster, &ledger).unwrap()
        );
    }

    #[test]
    fn incomplete_documents_have_no_hash() {
        let (mut document, roster) = completed();
        document.completed_at = None;

        assert!(verification_hash(&document, &roster, &PaymentLedger::default()).is_err());
    }
}
