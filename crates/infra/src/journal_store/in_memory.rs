use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vikoba_accounting::{
    Account, AccountKey, Balances, ChartOfAccounts, CommittedEntry, JournalCommand, JournalEntry, JournalEntryId,
    JournalSnapshot, Ledger, LedgerError, LedgerId, PostJournalEntry,
};
use vikoba_core::{Aggregate, GroupId, MemberId, Money};

use super::{JournalStore, JournalStoreError, ledger_stream_id};

/// One group's books.
#[derive(Debug, Clone)]
struct GroupBooks {
    group_id: GroupId,
    ledger: Ledger,
    chart: ChartOfAccounts,
    balances: Balances,
    entries: Vec<CommittedEntry>,
    index: HashMap<JournalEntryId, usize>,
}

impl GroupBooks {
    fn new(group_id: GroupId) -> Self {
        Self {
            group_id,
            ledger: Ledger::empty(LedgerId::new(ledger_stream_id(group_id))),
            chart: ChartOfAccounts::standard(group_id),
            balances: Balances::new(),
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// All checks run before the first mutation, so a rejected entry leaves
    /// the books untouched.
    fn commit(&mut self, entry: JournalEntry) -> Result<CommittedEntry, LedgerError> {
        let cmd = JournalCommand::PostJournalEntry(PostJournalEntry {
            ledger_id: self.ledger.id_typed(),
            entry: entry.clone(),
        });
        let events = self.ledger.handle(&cmd)?;

        if let Some(line) = entry.lines.iter().find(|l| !self.chart.can_resolve(&l.account)) {
            return Err(LedgerError::UnknownAccount(line.account));
        }

        self.balances.apply(&entry)?;
        for line in &entry.lines {
            self.chart.resolve_or_provision(&line.account)?;
        }
        for event in &events {
            self.ledger.apply(event);
        }

        let sequence = self.entries.len() as u64 + 1;
        self.index.insert(entry.id, self.entries.len());
        let committed = CommittedEntry::new(sequence, entry);
        self.entries.push(committed.clone());
        Ok(committed)
    }

    fn balance_as_of(&self, key: &AccountKey, as_of: DateTime<Utc>) -> Result<Money, LedgerError> {
        let mut balance = Money::ZERO;
        for entry in self.entries.iter().map(|e| &e.entry) {
            if entry.occurred_at > as_of {
                continue;
            }
            for line in entry.lines.iter().filter(|l| l.account == *key) {
                balance = balance.try_add(line.signed_amount())?;
            }
        }
        Ok(balance)
    }

    fn snapshot(&self) -> JournalSnapshot {
        JournalSnapshot {
            group_id: self.group_id,
            taken_at: Utc::now(),
            last_sequence: self.entries.len() as u64,
            chart: self.chart.clone(),
            entries: self.entries.clone(),
            cached_balances: self.balances.clone(),
            orphaned_lines: Vec::new(),
        }
    }
}

/// In-memory journal store.
///
/// Intended for tests/dev and for reconciling exported snapshots. One lock
/// guards every group's books, so commits serialise and readers see either
/// none or all of an entry.
#[derive(Debug, Default)]
pub struct InMemoryJournalStore {
    groups: RwLock<HashMap<GroupId, GroupBooks>>,
}

fn poisoned<T>(_: T) -> JournalStoreError {
    JournalStoreError::Storage("lock poisoned".to_string())
}

impl InMemoryJournalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed entries for `group_id`.
    pub fn entry_count(&self, group_id: GroupId) -> Result<usize, JournalStoreError> {
        let groups = self.groups.read().map_err(poisoned)?;
        Ok(groups.get(&group_id).map(|b| b.entries.len()).unwrap_or(0))
    }
}

#[async_trait]
impl JournalStore for InMemoryJournalStore {
    async fn register_member(&self, group_id: GroupId, member: MemberId) -> Result<(), JournalStoreError> {
        let mut groups = self.groups.write().map_err(poisoned)?;
        let books = groups.entry(group_id).or_insert_with(|| GroupBooks::new(group_id));
        if books.chart.register_member(member) {
            tracing::debug!(group_id = %group_id, member_id = %member, "member registered");
        }
        Ok(())
    }

    async fn resolve_account(&self, group_id: GroupId, key: AccountKey) -> Result<Account, JournalStoreError> {
        let mut groups = self.groups.write().map_err(poisoned)?;
        let books = groups.entry(group_id).or_insert_with(|| GroupBooks::new(group_id));
        Ok(books.chart.resolve_or_provision(&key)?.clone())
    }

    async fn commit(&self, entry: JournalEntry) -> Result<CommittedEntry, JournalStoreError> {
        let group_id = entry.group_id;
        let entry_id = entry.id;
        let mut groups = self.groups.write().map_err(poisoned)?;
        let books = groups.entry(group_id).or_insert_with(|| GroupBooks::new(group_id));

        match books.commit(entry) {
            Ok(committed) => {
                tracing::debug!(
                    group_id = %group_id,
                    entry_id = %entry_id,
                    sequence = committed.sequence,
                    "journal entry committed"
                );
                Ok(committed)
            }
            Err(err) => {
                tracing::warn!(group_id = %group_id, entry_id = %entry_id, error = %err, "journal entry rejected");
                Err(err.into())
            }
        }
    }

    async fn entry(
        &self,
        group_id: GroupId,
        id: JournalEntryId,
    ) -> Result<Option<JournalEntry>, JournalStoreError> {
        let groups = self.groups.read().map_err(poisoned)?;
        Ok(groups.get(&group_id).and_then(|books| {
            books
                .index
                .get(&id)
                .map(|&i| books.entries[i].entry.clone())
        }))
    }

    async fn balance_of(
        &self,
        group_id: GroupId,
        key: AccountKey,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Money, JournalStoreError> {
        let groups = self.groups.read().map_err(poisoned)?;
        let Some(books) = groups.get(&group_id) else {
            return Ok(Money::ZERO);
        };
        Ok(match as_of {
            None => books.balances.get(&key),
            Some(at) => books.balance_as_of(&key, at)?,
        })
    }

    async fn snapshot(&self, group_id: GroupId) -> Result<JournalSnapshot, JournalStoreError> {
        let groups = self.groups.read().map_err(poisoned)?;
        Ok(match groups.get(&group_id) {
            Some(books) => books.snapshot(),
            None => GroupBooks::new(group_id).snapshot(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Duration;
    use proptest::prelude::*;
    use vikoba_accounting::{JournalLine, SourceRef};
    use vikoba_core::DomainError;

    fn entry(group_id: GroupId, at: DateTime<Utc>, lines: Vec<JournalLine>) -> JournalEntry {
        JournalEntry {
            id: JournalEntryId::generate(),
            group_id,
            occurred_at: at,
            source: SourceRef::Migration("test".to_string()),
            member: None,
            memo: String::new(),
            lines,
            reverses: None,
        }
    }

    fn deposit(group_id: GroupId, member: MemberId, at: DateTime<Utc>, minor: i64) -> JournalEntry {
        entry(
            group_id,
            at,
            vec![
                JournalLine::debit(AccountKey::bank_cash(), Money::from_minor(minor)),
                JournalLine::credit(AccountKey::member_savings(member), Money::from_minor(minor)),
            ],
        )
    }

    #[tokio::test]
    async fn commit_updates_balances_and_sequence() {
        let store = InMemoryJournalStore::new();
        let group_id = GroupId::new();
        let member = MemberId::new();
        store.register_member(group_id, member).await.unwrap();

        let first = store.commit(deposit(group_id, member, Utc::now(), 1_000)).await.unwrap();
        let second = store.commit(deposit(group_id, member, Utc::now(), 250)).await.unwrap();

        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(
            store
                .balance_of(group_id, AccountKey::member_savings(member), None)
                .await
                .unwrap(),
            Money::from_minor(1_250)
        );
    }

    #[tokio::test]
    async fn unregistered_member_account_is_unknown() {
        let store = InMemoryJournalStore::new();
        let group_id = GroupId::new();
        let stranger = MemberId::new();

        let err = store
            .commit(deposit(group_id, stranger, Utc::now(), 100))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            JournalStoreError::Ledger(LedgerError::UnknownAccount(key)) if key == AccountKey::member_savings(stranger)
        ));
        assert_eq!(store.entry_count(group_id).unwrap(), 0);
        assert_eq!(
            store.balance_of(group_id, AccountKey::bank_cash(), None).await.unwrap(),
            Money::ZERO
        );
    }

    #[tokio::test]
    async fn rejected_commit_leaves_no_trace() {
        let store = InMemoryJournalStore::new();
        let group_id = GroupId::new();
        let member = MemberId::new();
        store.register_member(group_id, member).await.unwrap();

        let overdrawn = entry(
            group_id,
            Utc::now(),
            vec![
                JournalLine::debit(AccountKey::bank_cash(), Money::from_minor(10)),
                JournalLine::credit(AccountKey::loans_receivable(member), Money::from_minor(10)),
            ],
        );
        let err = store.commit(overdrawn).await.unwrap_err();
        assert!(matches!(
            err,
            JournalStoreError::Ledger(LedgerError::OverpaymentExceedsOutstanding { .. })
        ));

        let snapshot = store.snapshot(group_id).await.unwrap();
        assert!(snapshot.entries.is_empty());
        assert!(snapshot.cached_balances.is_empty());
        assert!(snapshot.chart.resolve(&AccountKey::loans_receivable(member)).is_err());
    }

    #[tokio::test]
    async fn as_of_balance_excludes_later_entries() {
        let store = InMemoryJournalStore::new();
        let group_id = GroupId::new();
        let member = MemberId::new();
        store.register_member(group_id, member).await.unwrap();

        let jan = Utc::now() - Duration::days(60);
        let feb = jan + Duration::days(31);
        store.commit(deposit(group_id, member, jan, 500)).await.unwrap();
        store.commit(deposit(group_id, member, feb, 700)).await.unwrap();

        let key = AccountKey::member_savings(member);
        assert_eq!(
            store.balance_of(group_id, key, Some(jan + Duration::days(1))).await.unwrap(),
            Money::from_minor(500)
        );
        assert_eq!(store.balance_of(group_id, key, None).await.unwrap(), Money::from_minor(1_200));
    }

    #[tokio::test]
    async fn reversal_restores_balances_once() {
        let store = InMemoryJournalStore::new();
        let group_id = GroupId::new();
        let member = MemberId::new();
        store.register_member(group_id, member).await.unwrap();

        let original = store.commit(deposit(group_id, member, Utc::now(), 900)).await.unwrap();
        let original_id = original.id();

        let reversal = store
            .reverse(group_id, original_id, Utc::now(), "posted twice".to_string())
            .await
            .unwrap();
        assert_eq!(reversal.entry.reverses, Some(original_id));
        assert_eq!(
            store.balance_of(group_id, AccountKey::member_savings(member), None).await.unwrap(),
            Money::ZERO
        );

        let again = store
            .reverse(group_id, original_id, Utc::now(), "again".to_string())
            .await
            .unwrap_err();
        assert!(matches!(
            again,
            JournalStoreError::Ledger(LedgerError::Domain(DomainError::Conflict(_)))
        ));

        let missing = store
            .reverse(group_id, JournalEntryId::generate(), Utc::now(), "nothing".to_string())
            .await
            .unwrap_err();
        assert!(matches!(
            missing,
            JournalStoreError::Ledger(LedgerError::Domain(DomainError::NotFound))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_use_provisions_one_account() {
        let store = Arc::new(InMemoryJournalStore::new());
        let group_id = GroupId::new();
        let member = MemberId::new();
        store.register_member(group_id, member).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .resolve_account(group_id, AccountKey::penalty_receivable(member))
                    .await
            }));
        }
        let mut accounts = Vec::new();
        for handle in handles {
            accounts.push(handle.await.unwrap().unwrap());
        }

        assert!(accounts.windows(2).all(|w| w[0] == w[1]));
        let snapshot = store.snapshot(group_id).await.unwrap();
        let provisioned = snapshot
            .chart
            .accounts()
            .filter(|a| a.key == AccountKey::penalty_receivable(member))
            .count();
        assert_eq!(provisioned, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_commits_do_not_lose_updates() {
        let store = Arc::new(InMemoryJournalStore::new());
        let group_id = GroupId::new();
        let member = MemberId::new();
        store.register_member(group_id, member).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.commit(deposit(group_id, member, Utc::now(), 10)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let snapshot = store.snapshot(group_id).await.unwrap();
        assert_eq!(snapshot.last_sequence, 50);
        assert_eq!(snapshot.cached_balances.get(&AccountKey::bank_cash()), Money::from_minor(500));
        assert_eq!(snapshot.recompute_balances().unwrap(), snapshot.cached_balances);
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Deposit(i64),
        Disburse(i64),
        Repay(i64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1i64..50_000).prop_map(Op::Deposit),
            (1i64..50_000).prop_map(Op::Disburse),
            (1i64..50_000).prop_map(Op::Repay),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

        #[test]
        fn cache_matches_recomputation_and_receivable_never_negative(ops in proptest::collection::vec(op(), 1..40)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let store = InMemoryJournalStore::new();
                let group_id = GroupId::new();
                let member = MemberId::new();
                store.register_member(group_id, member).await.unwrap();
                let receivable = AccountKey::loans_receivable(member);

                for op in ops {
                    let (debit, credit, minor) = match op {
                        Op::Deposit(m) => (AccountKey::bank_cash(), AccountKey::member_savings(member), m),
                        Op::Disburse(m) => (receivable, AccountKey::bank_cash(), m),
                        Op::Repay(m) => (AccountKey::bank_cash(), receivable, m),
                    };
                    let before = store.balance_of(group_id, receivable, None).await.unwrap();
                    let result = store
                        .commit(entry(
                            group_id,
                            Utc::now(),
                            vec![
                                JournalLine::debit(debit, Money::from_minor(minor)),
                                JournalLine::credit(credit, Money::from_minor(minor)),
                            ],
                        ))
                        .await;
                    if let Op::Repay(m) = op {
                        assert_eq!(result.is_err(), m > before.minor());
                    } else {
                        assert!(result.is_ok());
                    }
                    assert!(!store.balance_of(group_id, receivable, None).await.unwrap().is_negative());
                }

                let snapshot = store.snapshot(group_id).await.unwrap();
                assert_eq!(snapshot.recompute_balances().unwrap(), snapshot.cached_balances);
            });
        }
    }
}
