//! Signed account balances derived from journal lines.
//!
//! A balance is positive on the account's normal side (debit for assets and
//! expenses, credit for liabilities, funds and income).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use vikoba_core::Money;

use crate::chart::AccountKey;
use crate::error::{LedgerError, LedgerResult};
use crate::journal::JournalEntry;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Balances(BTreeMap<AccountKey, Money>);

impl Balances {
    pub fn new() -> Self {
        Self::default()
    }

    /// Balance of `key`; accounts never posted to read as zero.
    pub fn get(&self, key: &AccountKey) -> Money {
        self.0.get(key).copied().unwrap_or(Money::ZERO)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AccountKey, &Money)> + '_ {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Net change per account produced by `entry`.
    pub fn deltas(entry: &JournalEntry) -> LedgerResult<BTreeMap<AccountKey, Money>> {
        let mut out: BTreeMap<AccountKey, Money> = BTreeMap::new();
        for line in &entry.lines {
            let slot = out.entry(line.account).or_insert(Money::ZERO);
            *slot = slot.try_add(line.signed_amount())?;
        }
        Ok(out)
    }

    /// Balances `entry` would leave behind, without mutating `self`.
    ///
    /// Fails with `OverpaymentExceedsOutstanding` when a floored account
    /// (loans or penalties receivable) would go below zero.
    pub fn preview(&self, entry: &JournalEntry) -> LedgerResult<BTreeMap<AccountKey, Money>> {
        let mut next = BTreeMap::new();
        for (key, delta) in Self::deltas(entry)? {
            let current = self.get(&key);
            let after = current.try_add(delta)?;
            if key.has_zero_floor() && after.is_negative() {
                return Err(LedgerError::OverpaymentExceedsOutstanding {
                    account: key,
                    outstanding: current,
                    credit: delta.abs(),
                });
            }
            next.insert(key, after);
        }
        Ok(next)
    }

    /// Check floors, then apply `entry`. Leaves `self` untouched on error.
    pub fn apply(&mut self, entry: &JournalEntry) -> LedgerResult<()> {
        let next = self.preview(entry)?;
        self.0.extend(next);
        Ok(())
    }

    /// Overwrite a single balance (used when loading cached rows).
    pub fn set(&mut self, key: AccountKey, balance: Money) {
        self.0.insert(key, balance);
    }

    /// Recompute balances from scratch. Floors are not enforced here so a
    /// damaged log can still be inspected.
    pub fn from_entries<'a, I>(entries: I) -> LedgerResult<Self>
    where
        I: IntoIterator<Item = &'a JournalEntry>,
    {
        let mut balances = Balances::new();
        for entry in entries {
            for (key, delta) in Self::deltas(entry)? {
                let slot = balances.0.entry(key).or_insert(Money::ZERO);
                *slot = slot.try_add(delta)?;
            }
        }
        Ok(balances)
    }
}

impl FromIterator<(AccountKey, Money)> for Balances {
    fn from_iter<T: IntoIterator<Item = (AccountKey, Money)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{JournalEntryId, JournalLine, SourceRef};
    use chrono::Utc;
    use vikoba_core::{GroupId, MemberId};

    fn entry(lines: Vec<JournalLine>) -> JournalEntry {
        JournalEntry {
            id: JournalEntryId::generate(),
            group_id: GroupId::new(),
            occurred_at: Utc::now(),
            source: SourceRef::Migration("t".to_string()),
            member: None,
            memo: String::new(),
            lines,
            reverses: None,
        }
    }

    #[test]
    fn balances_are_signed_by_normal_side() {
        let member = MemberId::new();
        let mut balances = Balances::new();
        balances
            .apply(&entry(vec![
                JournalLine::debit(AccountKey::bank_cash(), Money::from_minor(100)),
                JournalLine::credit(AccountKey::member_savings(member), Money::from_minor(100)),
            ]))
            .unwrap();

        assert_eq!(balances.get(&AccountKey::bank_cash()), Money::from_minor(100));
        assert_eq!(balances.get(&AccountKey::member_savings(member)), Money::from_minor(100));
        assert_eq!(balances.get(&AccountKey::social_fund()), Money::ZERO);
    }

    #[test]
    fn receivable_cannot_go_negative() {
        let member = MemberId::new();
        let mut balances = Balances::new();
        balances
            .apply(&entry(vec![
                JournalLine::debit(AccountKey::loans_receivable(member), Money::from_minor(400)),
                JournalLine::credit(AccountKey::bank_cash(), Money::from_minor(400)),
            ]))
            .unwrap();

        let before = balances.clone();
        let err = balances
            .apply(&entry(vec![
                JournalLine::debit(AccountKey::bank_cash(), Money::from_minor(450)),
                JournalLine::credit(AccountKey::loans_receivable(member), Money::from_minor(450)),
            ]))
            .unwrap_err();

        assert_eq!(
            err,
            LedgerError::OverpaymentExceedsOutstanding {
                account: AccountKey::loans_receivable(member),
                outstanding: Money::from_minor(400),
                credit: Money::from_minor(450),
            }
        );
        assert_eq!(balances, before);
    }

    #[test]
    fn from_entries_matches_incremental_apply() {
        let member = MemberId::new();
        let entries = vec![
            entry(vec![
                JournalLine::debit(AccountKey::bank_cash(), Money::from_minor(70)),
                JournalLine::credit(AccountKey::member_savings(member), Money::from_minor(50)),
                JournalLine::credit(AccountKey::social_fund(), Money::from_minor(20)),
            ]),
            entry(vec![
                JournalLine::debit(AccountKey::member_savings(member), Money::from_minor(10)),
                JournalLine::credit(AccountKey::penalty_income(), Money::from_minor(10)),
            ]),
        ];

        let mut incremental = Balances::new();
        for e in &entries {
            incremental.apply(e).unwrap();
        }
        assert_eq!(Balances::from_entries(&entries).unwrap(), incremental);
        assert_eq!(incremental.get(&AccountKey::member_savings(member)), Money::from_minor(40));
    }
}
