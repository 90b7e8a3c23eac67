//! Ledger error taxonomy.

use thiserror::Error;

use vikoba_core::{DomainError, Money};
use vikoba_lending::{ExcessPayment, LoanId};

use crate::chart::AccountKey;

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Errors raised while turning transactions into committed journal entries.
///
/// Everything except [`LedgerError::ExcessPayment`] is a programming or
/// data-integrity error: the triggering operation is aborted with no state
/// change and retrying the same input yields the same error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("unknown account: {0}")]
    UnknownAccount(AccountKey),

    #[error(
        "declared components sum to {components} but {total} was deposited (tolerance {tolerance})"
    )]
    UnbalancedDeclaration {
        total: Money,
        components: Money,
        tolerance: Money,
    },

    #[error("rule `{rule}` produced unbalanced postings: debits {debits}, credits {credits}")]
    UnbalancedPosting {
        rule: &'static str,
        debits: Money,
        credits: Money,
    },

    #[error("journal entry does not balance: debits {debits}, credits {credits}")]
    ImbalancedEntry { debits: Money, credits: Money },

    #[error("crediting {credit} to {account} exceeds its outstanding balance {outstanding}")]
    OverpaymentExceedsOutstanding {
        account: AccountKey,
        outstanding: Money,
        credit: Money,
    },

    #[error("payment on loan {loan_id} exceeds the amount owed by {}", .excess.amount)]
    ExcessPayment {
        loan_id: LoanId,
        excess: ExcessPayment,
    },

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl LedgerError {
    /// Business condition the caller may resolve (e.g. by recording a credit),
    /// as opposed to an integrity failure.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, LedgerError::ExcessPayment { .. })
    }
}
