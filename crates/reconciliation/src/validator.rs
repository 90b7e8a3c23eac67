//! Reconciliation run: `Idle → Computing → Reporting → Passed | Failed`.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use vikoba_accounting::journal::totals;
use vikoba_accounting::{AccountKey, Balances, GroupAccount, JournalSnapshot, LedgerError, MemberAccount};
use vikoba_core::{DomainError, GroupId, MemberId, Money};

use crate::reference::{MemberReference, ReferenceTotals};
use crate::report::{
    Discrepancy, DiscrepancyEntity, IntegrityIssue, ReconciliationReport, RunOutcome,
};

#[derive(Debug, Error)]
pub enum ReconciliationError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    Computing,
    Reporting,
    Passed,
    Failed,
}

impl RunState {
    pub fn can_transition_to(self, next: RunState) -> bool {
        matches!(
            (self, next),
            (RunState::Idle, RunState::Computing)
                | (RunState::Computing, RunState::Reporting)
                | (RunState::Reporting, RunState::Passed)
                | (RunState::Reporting, RunState::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Passed | RunState::Failed)
    }
}

/// Figures derived for one member.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberTotals {
    pub savings: Money,
    pub outstanding_loan: Money,
    pub interest_paid: Money,
    pub penalties: Money,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupTotals {
    pub bank_cash: Money,
    pub loans_receivable: Money,
    pub social_fund: Money,
    pub admin_fund: Money,
    pub interest_income: Money,
    pub penalty_income: Money,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedTotals {
    pub members: BTreeMap<MemberId, MemberTotals>,
    pub group: GroupTotals,
}

impl DerivedTotals {
    /// Derive totals from the snapshot's entries (never from its cache).
    pub fn from_snapshot(snapshot: &JournalSnapshot) -> Result<Self, ReconciliationError> {
        let balances = snapshot.recompute_balances()?;

        let mut members: BTreeSet<MemberId> = snapshot.chart.members().collect();
        members.extend(balances.iter().filter_map(|(key, _)| key.member_id()));
        members.extend(snapshot.entries().filter_map(|e| e.member));

        let mut derived = DerivedTotals::default();
        for member in members {
            derived.members.insert(
                member,
                MemberTotals {
                    savings: balances.get(&AccountKey::member_savings(member)),
                    outstanding_loan: balances.get(&AccountKey::loans_receivable(member)),
                    ..MemberTotals::default()
                },
            );
        }

        // Income is attributed through the entry's member.
        for entry in snapshot.entries() {
            let Some(member) = entry.member else { continue };
            let member_totals = derived.members.entry(member).or_default();
            for line in &entry.lines {
                match line.account {
                    AccountKey::Group(GroupAccount::InterestIncome) => {
                        member_totals.interest_paid =
                            member_totals.interest_paid.try_add(line.signed_amount())?;
                    }
                    AccountKey::Group(GroupAccount::PenaltyIncome) => {
                        member_totals.penalties = member_totals.penalties.try_add(line.signed_amount())?;
                    }
                    _ => {}
                }
            }
        }

        let mut loans_receivable = Money::ZERO;
        for (key, balance) in balances.iter() {
            if let AccountKey::Member {
                account: MemberAccount::LoansReceivable,
                ..
            } = key
            {
                loans_receivable = loans_receivable.try_add(*balance)?;
            }
        }

        derived.group = GroupTotals {
            bank_cash: balances.get(&AccountKey::bank_cash()),
            loans_receivable,
            social_fund: balances.get(&AccountKey::social_fund()),
            admin_fund: balances.get(&AccountKey::admin_fund()),
            interest_income: balances.get(&AccountKey::interest_income()),
            penalty_income: balances.get(&AccountKey::penalty_income()),
        };
        Ok(derived)
    }
}

/// Structural sweep of a snapshot. Reports every problem found and never
/// stops early.
pub fn integrity_sweep(snapshot: &JournalSnapshot) -> Vec<IntegrityIssue> {
    let mut issues = Vec::new();
    let ids: HashSet<_> = snapshot.entries().map(|e| e.id).collect();

    let mut previous: Option<u64> = None;
    for committed in &snapshot.entries {
        let entry = &committed.entry;
        let entry_id = *entry.id.0.as_uuid();

        if let Some(previous) = previous.filter(|p| committed.sequence <= *p) {
            issues.push(IntegrityIssue::SequenceOutOfOrder {
                entry_id,
                sequence: committed.sequence,
                previous,
            });
        }
        previous = Some(previous.map_or(committed.sequence, |p| p.max(committed.sequence)));

        if entry.group_id != snapshot.group_id {
            issues.push(IntegrityIssue::ForeignEntry {
                entry_id,
                group_id: entry.group_id,
            });
        }
        if entry.lines.is_empty() {
            issues.push(IntegrityIssue::EmptyEntry { entry_id });
        }

        match totals(&entry.lines) {
            Ok((debits, credits)) if debits != credits => {
                issues.push(IntegrityIssue::UnbalancedEntry {
                    entry_id,
                    debits,
                    credits,
                });
            }
            Ok(_) => {}
            Err(_) => issues.push(IntegrityIssue::AmountOverflow {
                entry_id: Some(entry_id),
            }),
        }

        for line in &entry.lines {
            if snapshot.chart.resolve(&line.account).is_err() {
                issues.push(IntegrityIssue::UnresolvedAccount {
                    entry_id,
                    account: line.account,
                });
            }
        }

        if let Some(original) = entry.reverses {
            if !ids.contains(&original) {
                issues.push(IntegrityIssue::DanglingReversal {
                    entry_id,
                    reverses: *original.0.as_uuid(),
                });
            }
        }
    }

    for orphan in &snapshot.orphaned_lines {
        issues.push(IntegrityIssue::OrphanedLine {
            entry_id: orphan.entry_id,
            account: orphan.line.account,
        });
    }

    match snapshot.recompute_balances() {
        Ok(recomputed) => issues.extend(balance_drift(&snapshot.cached_balances, &recomputed)),
        Err(_) => issues.push(IntegrityIssue::AmountOverflow { entry_id: None }),
    }
    issues
}

fn balance_drift(cached: &Balances, recomputed: &Balances) -> Vec<IntegrityIssue> {
    let keys: BTreeSet<AccountKey> = cached
        .iter()
        .chain(recomputed.iter())
        .map(|(k, _)| *k)
        .collect();
    keys.into_iter()
        .filter_map(|account| {
            let cached = cached.get(&account);
            let recomputed = recomputed.get(&account);
            (cached != recomputed).then_some(IntegrityIssue::BalanceDrift {
                account,
                cached,
                recomputed,
            })
        })
        .collect()
}

fn compare(
    out: &mut Vec<Discrepancy>,
    entity: DiscrepancyEntity,
    field: &str,
    expected: Option<Money>,
    actual: Money,
    tolerance: Money,
) {
    let Some(expected) = expected else {
        return;
    };
    let delta = actual
        .try_sub(expected)
        .unwrap_or_else(|_| Money::from_minor(actual.minor().saturating_sub(expected.minor())));
    if delta.abs() > tolerance {
        out.push(Discrepancy {
            entity,
            field: field.to_string(),
            expected,
            actual,
            delta,
        });
    }
}

fn compare_totals(out: &mut Vec<Discrepancy>, derived: &DerivedTotals, reference: &ReferenceTotals, tolerance: Money) {
    let members: BTreeSet<MemberId> = derived
        .members
        .keys()
        .chain(reference.members.keys())
        .copied()
        .collect();
    // A member missing on one side is held to zero on every field.
    let absent = MemberReference {
        savings: Some(Money::ZERO),
        outstanding_loan: Some(Money::ZERO),
        interest_paid: Some(Money::ZERO),
        penalties: Some(Money::ZERO),
    };
    for member in members {
        let actual = derived.members.get(&member).copied().unwrap_or_default();
        let expected = reference.members.get(&member).unwrap_or(&absent);
        let entity = DiscrepancyEntity::Member(member);
        compare(out, entity, "savings", expected.savings, actual.savings, tolerance);
        compare(
            out,
            entity,
            "outstanding_loan",
            expected.outstanding_loan,
            actual.outstanding_loan,
            tolerance,
        );
        compare(
            out,
            entity,
            "interest_paid",
            expected.interest_paid,
            actual.interest_paid,
            tolerance,
        );
        compare(out, entity, "penalties", expected.penalties, actual.penalties, tolerance);
    }

    let g = &reference.group;
    let d = &derived.group;
    let entity = DiscrepancyEntity::Group;
    compare(out, entity, "bank_cash", g.bank_cash, d.bank_cash, tolerance);
    compare(out, entity, "loans_receivable", g.loans_receivable, d.loans_receivable, tolerance);
    compare(out, entity, "social_fund", g.social_fund, d.social_fund, tolerance);
    compare(out, entity, "admin_fund", g.admin_fund, d.admin_fund, tolerance);
    compare(out, entity, "interest_income", g.interest_income, d.interest_income, tolerance);
    compare(out, entity, "penalty_income", g.penalty_income, d.penalty_income, tolerance);
}

/// One validation run over one snapshot.
#[derive(Debug, Clone)]
pub struct ReconciliationRun {
    state: RunState,
    tolerance: Money,
    group_id: Option<GroupId>,
    through_sequence: u64,
    derived: Option<DerivedTotals>,
    discrepancies: Vec<Discrepancy>,
    integrity_issues: Vec<IntegrityIssue>,
}

impl ReconciliationRun {
    pub fn new(tolerance: Money) -> Self {
        Self {
            state: RunState::Idle,
            tolerance: tolerance.abs(),
            group_id: None,
            through_sequence: 0,
            derived: None,
            discrepancies: Vec::new(),
            integrity_issues: Vec::new(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn derived(&self) -> Option<&DerivedTotals> {
        self.derived.as_ref()
    }

    fn transition(&mut self, next: RunState) -> Result<(), ReconciliationError> {
        if !self.state.can_transition_to(next) {
            return Err(DomainError::invalid_transition("reconciliation run", self.state, next).into());
        }
        tracing::debug!(from = ?self.state, to = ?next, "reconciliation phase");
        self.state = next;
        Ok(())
    }

    /// Derive totals and sweep the snapshot. Totals that cannot be derived
    /// are left unset and the comparison phase is skipped; the sweep has
    /// already recorded why.
    pub fn compute(&mut self, snapshot: &JournalSnapshot) -> Result<Option<&DerivedTotals>, ReconciliationError> {
        self.transition(RunState::Computing)?;
        self.group_id = Some(snapshot.group_id);
        self.through_sequence = snapshot.last_sequence;
        self.integrity_issues = integrity_sweep(snapshot);
        self.derived = match DerivedTotals::from_snapshot(snapshot) {
            Ok(derived) => Some(derived),
            Err(error) => {
                tracing::warn!(group_id = %snapshot.group_id, error = %error, "totals could not be derived");
                if !self
                    .integrity_issues
                    .iter()
                    .any(|i| matches!(i, IntegrityIssue::AmountOverflow { .. }))
                {
                    self.integrity_issues.push(IntegrityIssue::AmountOverflow { entry_id: None });
                }
                None
            }
        };
        Ok(self.derived.as_ref())
    }

    /// Compare derived totals with `reference` and check id-map coverage.
    pub fn report(&mut self, reference: &ReferenceTotals) -> Result<(), ReconciliationError> {
        self.transition(RunState::Reporting)?;
        let mut out = Vec::new();
        if let Some(derived) = &self.derived {
            compare_totals(&mut out, derived, reference, self.tolerance);
        }
        out.sort_by(|a, b| (a.entity, &a.field).cmp(&(b.entity, &b.field)));
        self.discrepancies = out;

        for (name, map) in &reference.id_maps {
            for source_id in map.unmapped() {
                self.integrity_issues.push(IntegrityIssue::UnmappedSourceId {
                    map: name.clone(),
                    source_id: source_id.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Close the run as `Passed` or `Failed` and hand back the report.
    pub fn finish(&mut self) -> Result<ReconciliationReport, ReconciliationError> {
        let clean = self.discrepancies.is_empty() && self.integrity_issues.is_empty();
        let (next, outcome) = if clean {
            (RunState::Passed, RunOutcome::Passed)
        } else {
            (RunState::Failed, RunOutcome::Failed)
        };
        self.transition(next)?;

        let group_id = self
            .group_id
            .ok_or_else(|| DomainError::invariant("finished run has no group"))?;
        let derived = self.derived.clone().unwrap_or_default();

        tracing::info!(
            group_id = %group_id,
            outcome = ?outcome,
            discrepancies = self.discrepancies.len(),
            integrity_issues = self.integrity_issues.len(),
            "reconciliation finished"
        );

        Ok(ReconciliationReport {
            group_id,
            through_sequence: self.through_sequence,
            tolerance: self.tolerance,
            outcome,
            derived,
            discrepancies: self.discrepancies.clone(),
            integrity_issues: self.integrity_issues.clone(),
        })
    }
}

/// Run every phase over `snapshot` against `reference`.
pub fn reconcile(
    snapshot: &JournalSnapshot,
    reference: &ReferenceTotals,
    tolerance: Money,
) -> Result<ReconciliationReport, ReconciliationError> {
    let mut run = ReconciliationRun::new(tolerance);
    run.compute(snapshot)?;
    run.report(reference)?;
    run.finish()
}
