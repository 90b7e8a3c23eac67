use serde::{Deserialize, Serialize};
use uuid::Uuid;

use vikoba_accounting::AccountKey;
use vikoba_core::{GroupId, MemberId, Money};

use crate::validator::DerivedTotals;

/// Entity a discrepancy is reported against. Group sorts before members.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum DiscrepancyEntity {
    Group,
    Member(MemberId),
}

impl core::fmt::Display for DiscrepancyEntity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DiscrepancyEntity::Group => write!(f, "group"),
            DiscrepancyEntity::Member(id) => write!(f, "member {id}"),
        }
    }
}

/// A reference figure that does not match the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub entity: DiscrepancyEntity,
    pub field: String,
    pub expected: Money,
    pub actual: Money,
    /// `actual - expected`.
    pub delta: Money,
}

/// Structural problem found in the journal itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntegrityIssue {
    UnbalancedEntry {
        entry_id: Uuid,
        debits: Money,
        credits: Money,
    },
    EmptyEntry {
        entry_id: Uuid,
    },
    ForeignEntry {
        entry_id: Uuid,
        group_id: GroupId,
    },
    UnresolvedAccount {
        entry_id: Uuid,
        account: AccountKey,
    },
    OrphanedLine {
        entry_id: Uuid,
        account: AccountKey,
    },
    DanglingReversal {
        entry_id: Uuid,
        reverses: Uuid,
    },
    BalanceDrift {
        account: AccountKey,
        cached: Money,
        recomputed: Money,
    },
    /// Commit sequence did not increase from the previous entry.
    SequenceOutOfOrder {
        entry_id: Uuid,
        sequence: u64,
        previous: u64,
    },
    /// Amounts overflow when summed. `None` means the overflow is across
    /// entries rather than within one.
    AmountOverflow {
        entry_id: Option<Uuid>,
    },
    UnmappedSourceId {
        map: String,
        source_id: String,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Passed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub group_id: GroupId,
    /// Last journal sequence covered by the snapshot.
    pub through_sequence: u64,
    pub tolerance: Money,
    pub outcome: RunOutcome,
    pub derived: DerivedTotals,
    pub discrepancies: Vec<Discrepancy>,
    pub integrity_issues: Vec<IntegrityIssue>,
}

impl ReconciliationReport {
    pub fn passed(&self) -> bool {
        self.outcome == RunOutcome::Passed
    }

    /// Discrepancies reported against one member.
    pub fn for_member(&self, member: MemberId) -> impl Iterator<Item = &Discrepancy> + '_ {
        self.discrepancies
            .iter()
            .filter(move |d| d.entity == DiscrepancyEntity::Member(member))
    }
}
