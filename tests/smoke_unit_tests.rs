mod common;

use proposal_lifecycle::config::Config;
use proposal_lifecycle::document::{Actor, ContentBlock, DocumentDraft, DocumentStatus};
use proposal_lifecycle::error::{ErrorKind, LifecycleError};
use proposal_lifecycle::recipient::RecipientInput;
use proposal_lifecycle::service::SendRequest;
use proposal_lifecycle::token;

/// Test that a fresh draft is visible to its creator only
#[test]
fn create_and_read_draft() -> anyhow::Result<()> {
    let h = common::harness("smoke_create")?;
    let owner = Actor::user("user_a");

    let doc = h.service.create_document(
        &owner,
        DocumentDraft::new()
            .set_title("Proposal")
            .push_block(ContentBlock::new("b1", "text", "hi")),
    )?;

    let read = h.service.get_document(&owner, &doc.id)?;
    assert_eq!(read, doc);
    assert_eq!(read.status, DocumentStatus::Draft);

    let err = h
        .service
        .get_document(&Actor::user("user_b"), &doc.id)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    Ok(())
}

/// Test that organization documents are shared between members
#[test]
fn organization_members_share_documents() -> anyhow::Result<()> {
    let h = common::harness("smoke_org")?;
    let alice = Actor::user("user_a").member_of("org_acme");
    let bob = Actor::user("user_b").member_of("org_acme");

    let doc = h.service.create_document(
        &alice,
        DocumentDraft::new().set_title("Team quote").for_organization("org_acme"),
    )?;

    assert_eq!(h.service.get_document(&bob, &doc.id)?.id, doc.id);
    Ok(())
}

/// Test that sending without recipients is a validation error
#[test]
fn send_requires_recipients() -> anyhow::Result<()> {
    let h = common::harness("smoke_empty_send")?;
    let owner = Actor::user("user_a");
    let doc = h
        .service
        .create_document(&owner, DocumentDraft::new().set_title("Quote"))?;

    let res = h.service.send_document(&owner, &doc.id, SendRequest::default());
    assert!(matches!(res, Err(LifecycleError::Validation { .. })));
    Ok(())
}

/// Test that a stored roster is reused, with fresh links, when the send names nobody
#[test]
fn send_reuses_stored_roster() -> anyhow::Result<()> {
    let h = common::harness("smoke_roster")?;
    let owner = Actor::user("user_a");
    let doc = h
        .service
        .create_document(&owner, DocumentDraft::new().set_title("Quote"))?;

    let drafted = h
        .service
        .set_roster(&owner, &doc.id, &[RecipientInput::signer("a@example.com", "A")])?;
    let receipt = h.service.send_document(&owner, &doc.id, SendRequest::default())?;

    assert_eq!(receipt.links.len(), 1);
    assert_eq!(receipt.links[0].recipient_id, drafted[0].id);
    assert_ne!(common::token_of(&receipt.links[0].url), drafted[0].access_token);
    assert!(matches!(
        h.service.record_view(&drafted[0].access_token),
        Err(LifecycleError::LinkExpired)
    ));
    Ok(())
}

/// Test that a sent document cannot be sent again
#[test]
fn double_send_is_rejected() -> anyhow::Result<()> {
    let h = common::harness("smoke_double_send")?;
    let owner = Actor::user("user_a");
    let doc = h
        .service
        .create_document(&owner, DocumentDraft::new().set_title("Quote"))?;
    let request = SendRequest {
        recipients: vec![RecipientInput::signer("a@example.com", "A")],
        ..SendRequest::default()
    };

    h.service.send_document(&owner, &doc.id, request.clone())?;
    let res = h.service.send_document(&owner, &doc.id, request);
    assert!(matches!(res, Err(LifecycleError::InvalidTransition(_))));
    Ok(())
}

/// Test that signing twice reports the earlier action
#[test]
fn second_signature_is_already_actioned() -> anyhow::Result<()> {
    let h = common::harness("smoke_resign")?;
    let owner = Actor::user("user_a");
    let doc = h
        .service
        .create_document(&owner, DocumentDraft::new().set_title("Quote"))?;
    let receipt = h.service.send_document(
        &owner,
        &doc.id,
        SendRequest {
            recipients: vec![
                RecipientInput::signer("a@example.com", "A"),
                RecipientInput::signer("b@example.com", "B"),
            ],
            ..SendRequest::default()
        },
    )?;
    let tokens = common::tokens(&receipt);

    h.service.record_signature(&tokens[0], "sig")?;
    assert!(matches!(
        h.service.record_signature(&tokens[0], "sig"),
        Err(LifecycleError::AlreadyActioned(_))
    ));
    assert!(matches!(
        h.service.record_decline(&tokens[0], None),
        Err(LifecycleError::AlreadyActioned(_))
    ));
    Ok(())
}

/// Test that a well formed token nobody issued is unknown, not expired
#[test]
fn unissued_token_is_not_found() -> anyhow::Result<()> {
    let h = common::harness("smoke_token")?;
    let stranger = token::issue()?;

    assert!(matches!(
        h.service.record_view(stranger.as_str()),
        Err(LifecycleError::NotFound(_))
    ));
    Ok(())
}

/// Test that duplicating keeps content and starts a new draft
#[test]
fn duplicate_starts_a_new_draft() -> anyhow::Result<()> {
    let h = common::harness("smoke_duplicate")?;
    let owner = Actor::user("user_a");
    let doc = h.service.create_document(
        &owner,
        DocumentDraft::new()
            .set_title("Quote")
            .push_block(ContentBlock::new("b1", "text", "terms")),
    )?;

    let copy = h.service.duplicate_document(&owner, &doc.id)?;

    assert_ne!(copy.id, doc.id);
    assert_eq!(copy.title, "Quote (copy)");
    assert_eq!(copy.content, doc.content);
    assert_eq!(copy.status, DocumentStatus::Draft);
    assert_eq!(copy.current_version, 1);
    Ok(())
}

/// Test that the engine runs with its default, log-only collaborators
#[test]
fn default_collaborators_log_only() -> anyhow::Result<()> {
    let temp_dir = tempfile::tempdir()?;
    let db = sled::open(temp_dir.path().join("smoke_defaults.db"))?;
    let service =
        proposal_lifecycle::service::DocumentService::new(std::sync::Arc::new(db), Config::default())?;
    let owner = Actor::user("user_a");

    let doc = service.create_document(&owner, DocumentDraft::new().set_title("Quote"))?;
    let receipt = service.send_document(
        &owner,
        &doc.id,
        SendRequest {
            recipients: vec![RecipientInput::signer("a@example.com", "A")],
            ..SendRequest::default()
        },
    )?;
    service.record_signature(&common::token_of(&receipt.links[0].url), "sig")?;

    // no anchoring service is configured
    let err = service.anchor_document(&owner, &doc.id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExternalDependency);
    assert_eq!(err.kind().http_status(), 502);
    Ok(())
}
