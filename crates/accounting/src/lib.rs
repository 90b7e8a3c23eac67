//! Accounting module (double-entry ledger for a village-bank group).
//!
//! Pure domain logic only: no IO, no persistence concerns.
//!
//! - [`chart`]: chart of accounts (group accounts + lazily provisioned member accounts)
//! - [`rules`]: rule engine turning domain transactions into balanced postings
//! - [`journal`]: journal entries and the `Ledger` aggregate guarding them
//! - [`balances`]: signed balance arithmetic shared by stores and reconciliation
//! - [`snapshot`]: point-in-time view of a group's books

pub mod balances;
pub mod chart;
pub mod error;
pub mod journal;
pub mod rules;
pub mod snapshot;

pub use balances::Balances;
pub use chart::{
    Account, AccountCategory, AccountKey, ChartOfAccounts, GroupAccount, MemberAccount, Side,
};
pub use error::{LedgerError, LedgerResult};
pub use journal::{
    CommittedEntry, JournalCommand, JournalEntry, JournalEntryId, JournalEntryPosted, JournalLine, Ledger,
    LedgerEvent, LedgerId, PostJournalEntry, SourceRef,
};
pub use rules::{
    ExcessPaymentPolicy, LoanDisbursement, LoanRepayment, PenaltyCharge, PenaltyDebitTarget,
    PenaltySettlement, PostingSet, RuleEngine, RulePolicy, SavingsDeposit, Transaction,
};
pub use snapshot::{JournalSnapshot, OrphanedLine};
