//! Completion criteria: every signer signed, and payment collected when owed
use super::payment::PaymentLedger;
use super::recipient::{RecipientStatus, Roster};

/// Result of evaluating completion after a signature or a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// This call moved the document to `completed`.
    Completed,
    /// Another trigger got there first; nothing left to do.
    AlreadyCompleted,
    Pending,
}

/// Payment is owed when the sender asked for it or when any attempt exists.
pub fn payment_required(setting: bool, ledger: &PaymentLedger) -> bool {
    setting || !ledger.is_empty()
}

pub fn is_complete(roster: &Roster, ledger: &PaymentLedger, payment_required: bool) -> bool {
    let mut signers = roster.signers().peekable();
    if signers.peek().is_none() {
        return false;
    }
    let all_signed = signers.all(|r| r.status == RecipientStatus::Signed);

    all_signed && (!payment_required || ledger.has_succeeded())
}
