//! Journal persistence boundary.
//!
//! A `JournalStore` owns a group's committed entries, its chart of accounts
//! and the materialised account balances. `commit` is the single atomic
//! boundary: the entry, its lines and every balance it touches are written
//! together or not at all.
//!
//! ## Commit checks
//!
//! Implementations must, before anything becomes visible:
//! - validate the entry (lines present, amounts positive, debits == credits)
//! - resolve every line's account, provisioning registered members' accounts
//! - enforce reversal rules (original exists, not yet reversed, not itself a reversal)
//! - keep every loan and penalty receivable at or above zero
//! - assign the next sequence number

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use vikoba_accounting::{
    Account, AccountKey, JournalEntry, JournalEntryId, JournalSnapshot, LedgerError,
};
use vikoba_core::{AggregateId, DomainError, GroupId, MemberId, Money};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryJournalStore;
pub use vikoba_accounting::CommittedEntry;
pub use postgres::PostgresJournalStore;

/// Aggregate id of a group's ledger.
pub fn ledger_stream_id(group_id: GroupId) -> AggregateId {
    AggregateId::from_uuid(*group_id.as_uuid())
}

/// Journal store operation error.
///
/// `Ledger` carries deterministic business failures (unbalanced entry,
/// unknown account, receivable floor). The remaining variants are
/// infrastructure failures.
#[derive(Debug, Error)]
pub enum JournalStoreError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("conflicting commit: {0}")]
    Conflict(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("corrupt stored data: {0}")]
    Corrupt(String),
}

impl From<DomainError> for JournalStoreError {
    fn from(value: DomainError) -> Self {
        JournalStoreError::Ledger(LedgerError::Domain(value))
    }
}

#[async_trait]
pub trait JournalStore: Send + Sync {
    /// Register a member so their accounts can be provisioned. Idempotent.
    async fn register_member(&self, group_id: GroupId, member: MemberId) -> Result<(), JournalStoreError>;

    /// Resolve an account, provisioning a registered member's account on
    /// first use. Concurrent first use yields a single account.
    async fn resolve_account(&self, group_id: GroupId, key: AccountKey) -> Result<Account, JournalStoreError>;

    /// Validate and append `entry`, updating balances atomically.
    async fn commit(&self, entry: JournalEntry) -> Result<CommittedEntry, JournalStoreError>;

    /// Look up a committed entry.
    async fn entry(
        &self,
        group_id: GroupId,
        id: JournalEntryId,
    ) -> Result<Option<JournalEntry>, JournalStoreError>;

    /// Signed balance of `key`; with `as_of`, only entries that occurred at
    /// or before it count.
    async fn balance_of(
        &self,
        group_id: GroupId,
        key: AccountKey,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Money, JournalStoreError>;

    /// Consistent point-in-time copy of the group's books.
    async fn snapshot(&self, group_id: GroupId) -> Result<JournalSnapshot, JournalStoreError>;

    /// Commit the reversing entry for `id`.
    async fn reverse(
        &self,
        group_id: GroupId,
        id: JournalEntryId,
        occurred_at: DateTime<Utc>,
        memo: String,
    ) -> Result<CommittedEntry, JournalStoreError> {
        let original = self
            .entry(group_id, id)
            .await?
            .ok_or_else(|| JournalStoreError::from(DomainError::not_found()))?;
        let reversal = original.reversal(JournalEntryId::generate(), occurred_at, memo);
        self.commit(reversal).await
    }
}

#[async_trait]
impl<S> JournalStore for Arc<S>
where
    S: JournalStore + ?Sized,
{
    async fn register_member(&self, group_id: GroupId, member: MemberId) -> Result<(), JournalStoreError> {
        (**self).register_member(group_id, member).await
    }

    async fn resolve_account(&self, group_id: GroupId, key: AccountKey) -> Result<Account, JournalStoreError> {
        (**self).resolve_account(group_id, key).await
    }

    async fn commit(&self, entry: JournalEntry) -> Result<CommittedEntry, JournalStoreError> {
        (**self).commit(entry).await
    }

    async fn entry(
        &self,
        group_id: GroupId,
        id: JournalEntryId,
    ) -> Result<Option<JournalEntry>, JournalStoreError> {
        (**self).entry(group_id, id).await
    }

    async fn balance_of(
        &self,
        group_id: GroupId,
        key: AccountKey,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Money, JournalStoreError> {
        (**self).balance_of(group_id, key, as_of).await
    }

    async fn snapshot(&self, group_id: GroupId) -> Result<JournalSnapshot, JournalStoreError> {
        (**self).snapshot(group_id).await
    }

    async fn reverse(
        &self,
        group_id: GroupId,
        id: JournalEntryId,
        occurred_at: DateTime<Utc>,
        memo: String,
    ) -> Result<CommittedEntry, JournalStoreError> {
        (**self).reverse(group_id, id, occurred_at, memo).await
    }
}
