//! Point-in-time view of a group's books.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use vikoba_core::{GroupId, Money};

use crate::balances::Balances;
use crate::chart::{AccountKey, ChartOfAccounts};
use crate::error::LedgerResult;
use crate::journal::{CommittedEntry, JournalEntry, JournalLine};

/// A stored line whose entry no longer resolves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanedLine {
    pub entry_id: Uuid,
    pub line: JournalLine,
}

/// Consistent copy of the journal taken in a single read.
///
/// Entries are in commit order. `cached_balances` are the materialised
/// balances as stored, which the integrity sweep compares against a
/// recomputation from `entries`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalSnapshot {
    pub group_id: GroupId,
    pub taken_at: DateTime<Utc>,
    pub last_sequence: u64,
    pub chart: ChartOfAccounts,
    pub entries: Vec<CommittedEntry>,
    pub cached_balances: Balances,
    #[serde(default)]
    pub orphaned_lines: Vec<OrphanedLine>,
}

impl JournalSnapshot {
    pub fn entries(&self) -> impl Iterator<Item = &JournalEntry> + '_ {
        self.entries.iter().map(|e| &e.entry)
    }

    /// Signed balance of `key`, from the cache or, with `as_of`, from the
    /// lines of entries that occurred at or before it.
    pub fn balance_of(&self, key: &AccountKey, as_of: Option<DateTime<Utc>>) -> LedgerResult<Money> {
        let Some(as_of) = as_of else {
            return Ok(self.cached_balances.get(key));
        };
        let mut balance = Money::ZERO;
        for entry in self.entries().filter(|e| e.occurred_at <= as_of) {
            for line in entry.lines.iter().filter(|l| l.account == *key) {
                balance = balance.try_add(line.signed_amount())?;
            }
        }
        Ok(balance)
    }

    /// Balances derived from the entries alone.
    pub fn recompute_balances(&self) -> LedgerResult<Balances> {
        Balances::from_entries(self.entries())
    }
}
