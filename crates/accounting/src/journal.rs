use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use vikoba_contributions::{DeclarationId, PenaltyId};
use vikoba_core::{
    Aggregate, AggregateId, AggregateRoot, DomainError, GroupId, MemberId, Money, ValueObject,
};
use vikoba_events::Event;
use vikoba_lending::LoanId;

use crate::chart::{AccountKey, Side};
use crate::error::{LedgerError, LedgerResult};

/// Journal entry identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JournalEntryId(pub AggregateId);

impl JournalEntryId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(AggregateId::new())
    }
}

impl core::fmt::Display for JournalEntryId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// The domain record an entry was produced from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum SourceRef {
    Declaration(DeclarationId),
    LoanDisbursement(LoanId),
    Repayment(LoanId),
    Penalty(PenaltyId),
    PenaltySettlement(PenaltyId),
    Reversal(JournalEntryId),
    /// Opening balances carried over from a legacy system.
    Migration(String),
}

impl SourceRef {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceRef::Declaration(_) => "declaration",
            SourceRef::LoanDisbursement(_) => "loan_disbursement",
            SourceRef::Repayment(_) => "repayment",
            SourceRef::Penalty(_) => "penalty",
            SourceRef::PenaltySettlement(_) => "penalty_settlement",
            SourceRef::Reversal(_) => "reversal",
            SourceRef::Migration(_) => "migration",
        }
    }

    /// Id half of the (kind, id) pair used for storage.
    pub fn id_string(&self) -> String {
        match self {
            SourceRef::Declaration(id) => id.to_string(),
            SourceRef::LoanDisbursement(id) | SourceRef::Repayment(id) => id.to_string(),
            SourceRef::Penalty(id) | SourceRef::PenaltySettlement(id) => id.to_string(),
            SourceRef::Reversal(id) => id.to_string(),
            SourceRef::Migration(id) => id.clone(),
        }
    }

    /// Inverse of (`kind`, `id_string`).
    pub fn from_parts(kind: &str, id: &str) -> Result<Self, DomainError> {
        let aggregate = || id.parse::<AggregateId>();
        Ok(match kind {
            "declaration" => SourceRef::Declaration(DeclarationId(aggregate()?)),
            "loan_disbursement" => SourceRef::LoanDisbursement(LoanId(aggregate()?)),
            "repayment" => SourceRef::Repayment(LoanId(aggregate()?)),
            "penalty" => SourceRef::Penalty(PenaltyId(aggregate()?)),
            "penalty_settlement" => SourceRef::PenaltySettlement(PenaltyId(aggregate()?)),
            "reversal" => SourceRef::Reversal(JournalEntryId(aggregate()?)),
            "migration" => SourceRef::Migration(id.to_string()),
            other => {
                return Err(DomainError::validation(format!("unknown source kind: {other}")));
            }
        })
    }
}

/// One side of a journal entry (immutable).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalLine {
    pub account: AccountKey,
    pub side: Side,
    /// Positive amount in minor units.
    pub amount: Money,
}

impl ValueObject for JournalLine {}

impl JournalLine {
    pub fn debit(account: AccountKey, amount: Money) -> Self {
        Self {
            account,
            side: Side::Debit,
            amount,
        }
    }

    pub fn credit(account: AccountKey, amount: Money) -> Self {
        Self {
            account,
            side: Side::Credit,
            amount,
        }
    }

    /// Contribution of this line to its account's balance, positive on the
    /// account's normal side.
    pub fn signed_amount(&self) -> Money {
        if self.side == self.account.category().normal_side() {
            self.amount
        } else {
            Money::from_minor(-self.amount.minor())
        }
    }
}

/// Debit and credit totals of a set of lines.
pub fn totals(lines: &[JournalLine]) -> LedgerResult<(Money, Money)> {
    let mut debits = Money::ZERO;
    let mut credits = Money::ZERO;
    for line in lines {
        match line.side {
            Side::Debit => debits = debits.try_add(line.amount)?,
            Side::Credit => credits = credits.try_add(line.amount)?,
        }
    }
    Ok((debits, credits))
}

/// A balanced, immutable journal entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: JournalEntryId,
    pub group_id: GroupId,
    pub occurred_at: DateTime<Utc>,
    pub source: SourceRef,
    /// Member the entry is attributed to (interest and penalty totals per member).
    pub member: Option<MemberId>,
    pub memo: String,
    pub lines: Vec<JournalLine>,
    pub reverses: Option<JournalEntryId>,
}

impl JournalEntry {
    /// Structural checks: lines present, positive amounts, debits == credits.
    pub fn validate(&self) -> LedgerResult<()> {
        if self.lines.is_empty() {
            return Err(DomainError::validation("journal entry must have lines").into());
        }
        if self.lines.iter().any(|l| !l.amount.is_positive()) {
            return Err(DomainError::validation("amount must be positive").into());
        }
        let (debits, credits) = totals(&self.lines)?;
        if debits != credits {
            return Err(LedgerError::ImbalancedEntry { debits, credits });
        }
        Ok(())
    }

    /// Total moved by the entry (sum of either side).
    pub fn amount(&self) -> LedgerResult<Money> {
        Ok(totals(&self.lines)?.0)
    }

    /// Entry undoing this one: same accounts and amounts, sides swapped.
    pub fn reversal(&self, id: JournalEntryId, occurred_at: DateTime<Utc>, memo: impl Into<String>) -> JournalEntry {
        JournalEntry {
            id,
            group_id: self.group_id,
            occurred_at,
            source: SourceRef::Reversal(self.id),
            member: self.member,
            memo: memo.into(),
            lines: self
                .lines
                .iter()
                .map(|l| JournalLine {
                    account: l.account,
                    side: l.side.opposite(),
                    amount: l.amount,
                })
                .collect(),
            reverses: Some(self.id),
        }
    }
}

/// An entry as written to the journal.
///
/// `sequence` orders entries within a group and is strictly increasing in
/// commit order; it need not be contiguous. `commit_id` identifies the write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedEntry {
    pub commit_id: Uuid,
    pub sequence: u64,
    pub entry: JournalEntry,
}

impl CommittedEntry {
    pub fn new(sequence: u64, entry: JournalEntry) -> Self {
        Self {
            commit_id: Uuid::now_v7(),
            sequence,
            entry,
        }
    }

    pub fn id(&self) -> JournalEntryId {
        self.entry.id
    }
}

/// Ledger identifier (aggregate id).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LedgerId(pub AggregateId);

impl LedgerId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for LedgerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Aggregate root: Ledger (a group's journal).
///
/// The ledger does NOT hold balances; it tracks identity and which entries
/// exist and have been reversed. Balances are derived from posted entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ledger {
    id: LedgerId,
    group_id: Option<GroupId>,
    posted: HashSet<JournalEntryId>,
    reversed: HashSet<JournalEntryId>,
    reversals: HashSet<JournalEntryId>,
    version: u64,
}

impl Ledger {
    /// Empty aggregate for rehydration.
    pub fn empty(id: LedgerId) -> Self {
        Self {
            id,
            group_id: None,
            posted: HashSet::new(),
            reversed: HashSet::new(),
            reversals: HashSet::new(),
            version: 0,
        }
    }

    pub fn id_typed(&self) -> LedgerId {
        self.id
    }

    pub fn group_id(&self) -> Option<GroupId> {
        self.group_id
    }

    pub fn contains(&self, id: JournalEntryId) -> bool {
        self.posted.contains(&id)
    }

    pub fn is_reversed(&self, id: JournalEntryId) -> bool {
        self.reversed.contains(&id)
    }
}

impl AggregateRoot for Ledger {
    type Id = LedgerId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: PostJournalEntry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostJournalEntry {
    pub ledger_id: LedgerId,
    pub entry: JournalEntry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalCommand {
    PostJournalEntry(PostJournalEntry),
}

/// Event: JournalEntryPosted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntryPosted {
    pub ledger_id: LedgerId,
    pub entry: JournalEntry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    JournalEntryPosted(JournalEntryPosted),
}

impl Event for LedgerEvent {
    fn event_type(&self) -> &'static str {
        match self {
            LedgerEvent::JournalEntryPosted(_) => "accounting.ledger.journal_entry_posted",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            LedgerEvent::JournalEntryPosted(e) => e.entry.occurred_at,
        }
    }
}

impl Aggregate for Ledger {
    type Command = JournalCommand;
    type Event = LedgerEvent;
    type Error = LedgerError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            LedgerEvent::JournalEntryPosted(e) => {
                self.id = e.ledger_id;
                if self.group_id.is_none() {
                    self.group_id = Some(e.entry.group_id);
                }
                self.posted.insert(e.entry.id);
                if let Some(original) = e.entry.reverses {
                    self.reversed.insert(original);
                    self.reversals.insert(e.entry.id);
                }
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            JournalCommand::PostJournalEntry(cmd) => self.handle_post(cmd),
        }
    }
}

impl Ledger {
    fn ensure_group(&self, group_id: GroupId) -> Result<(), DomainError> {
        match self.group_id {
            Some(g) if g != group_id => Err(DomainError::invariant("group mismatch")),
            _ => Ok(()),
        }
    }

    fn handle_post(&self, cmd: &PostJournalEntry) -> Result<Vec<LedgerEvent>, LedgerError> {
        let entry = &cmd.entry;
        self.ensure_group(entry.group_id)?;

        if self.posted.contains(&entry.id) {
            return Err(DomainError::conflict(format!("journal entry {} already posted", entry.id)).into());
        }

        entry.validate()?;

        if let Some(original) = entry.reverses {
            if !self.posted.contains(&original) {
                return Err(DomainError::not_found().into());
            }
            if self.reversed.contains(&original) {
                return Err(DomainError::conflict(format!("journal entry {original} already reversed")).into());
            }
            if self.reversals.contains(&original) {
                return Err(DomainError::conflict("a reversal cannot itself be reversed").into());
            }
        }

        Ok(vec![LedgerEvent::JournalEntryPosted(JournalEntryPosted {
            ledger_id: cmd.ledger_id,
            entry: entry.clone(),
        })])
    }
}
