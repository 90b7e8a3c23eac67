//! Posting service (application-level orchestration).
//!
//! `LedgerService` binds one group's journal store to a configured rule
//! engine. Every posting follows the same pipeline:
//!
//! ```text
//! Transaction
//!   ↓
//! 1. Register the member (idempotent; enables lazy account provisioning)
//!   ↓
//! 2. Rule engine computes a balanced PostingSet
//!   ↓
//! 3. Store commits the JournalEntry atomically (or rejects it untouched)
//! ```
//!
//! ## Workflow adapters
//!
//! `approve_declaration`, `disburse_loan`, `record_repayment`,
//! `approve_penalty` and `settle_penalty` drive the lending and contributions
//! aggregates. Each one asks the aggregate for its events, turns them into a
//! `Transaction`, commits, and only then applies the events. A rejected entry
//! therefore leaves the aggregate exactly as it was.
//!
//! Entries that move a loan receivable can only be undone through
//! `reverse_repayment`, which reverses the loan and the journal together.
//! The bare `reverse` refuses them.

use chrono::{DateTime, Utc};
use thiserror::Error;

use vikoba_accounting::{
    AccountKey, JournalEntry, JournalEntryId, JournalSnapshot, LedgerError, LoanDisbursement,
    LoanRepayment, MemberAccount, PenaltyCharge, PenaltySettlement, PostingSet, RuleEngine,
    SavingsDeposit, SourceRef, Transaction,
};
use vikoba_contributions::{
    ApproveDeclaration, ApprovePenalty, Declaration, DeclarationCommand, DeclarationEvent,
    MarkPenaltyPaid, PenaltyCommand, PenaltyEvent, PenaltyRecord,
};
use vikoba_core::{Aggregate, DomainError, GroupId, Money};
use vikoba_events::Event;
use vikoba_lending::{
    Allocation, DisburseLoan, Loan, LoanCommand, LoanEvent, RecordRepayment, RepaymentRecorded,
    ReverseRepayment,
};
use vikoba_reconciliation::{ReconciliationError, ReconciliationReport, ReferenceTotals, reconcile};

use crate::config::LedgerConfig;
use crate::journal_store::{JournalStore, JournalStoreError};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] JournalStoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Reconciliation(#[from] ReconciliationError),
}

impl ServiceError {
    /// The ledger error behind this failure, wherever it was raised.
    pub fn ledger_error(&self) -> Option<&LedgerError> {
        match self {
            ServiceError::Ledger(e) => Some(e),
            ServiceError::Store(JournalStoreError::Ledger(e)) => Some(e),
            _ => None,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.ledger_error().is_some_and(LedgerError::is_recoverable)
    }
}

/// Outcome of a posting.
///
/// `entry_id`/`sequence` are `None` when the rule produced no lines (a
/// penalty settled from savings, for instance).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostReceipt {
    pub entry_id: Option<JournalEntryId>,
    pub sequence: Option<u64>,
    pub allocation: Option<Allocation>,
}

impl PostReceipt {
    pub fn posted(&self) -> bool {
        self.entry_id.is_some()
    }
}

#[derive(Debug)]
pub struct LedgerService<S> {
    store: S,
    group_id: GroupId,
    engine: RuleEngine,
    config: LedgerConfig,
}

impl<S> LedgerService<S> {
    pub fn new(store: S, group_id: GroupId, config: LedgerConfig) -> Self {
        Self {
            engine: RuleEngine::new(config.rule_policy()),
            store,
            group_id,
            config,
        }
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn engine(&self) -> &RuleEngine {
        &self.engine
    }

    fn ensure_group(&self, group_id: GroupId) -> Result<(), DomainError> {
        if group_id != self.group_id {
            return Err(DomainError::invariant(format!(
                "command for group {group_id} sent to ledger of group {}",
                self.group_id
            )));
        }
        Ok(())
    }
}

impl<S> LedgerService<S>
where
    S: JournalStore,
{
    /// Compute and commit the postings for `transaction`.
    #[tracing::instrument(
        name = "ledger.post",
        skip_all,
        fields(group_id = %self.group_id, kind = transaction.kind(), member_id = %transaction.member())
    )]
    pub async fn post(
        &self,
        transaction: &Transaction,
        occurred_at: DateTime<Utc>,
    ) -> Result<PostReceipt, ServiceError> {
        let set = self.engine.postings(transaction)?;
        self.commit_set(set, occurred_at).await
    }

    async fn commit_set(
        &self,
        set: PostingSet,
        occurred_at: DateTime<Utc>,
    ) -> Result<PostReceipt, ServiceError> {
        if let Some(member) = set.member {
            self.store.register_member(self.group_id, member).await?;
        }

        let allocation = set.allocation;
        if set.is_empty() {
            tracing::debug!(rule = set.rule, "rule produced no postings; nothing committed");
            return Ok(PostReceipt {
                entry_id: None,
                sequence: None,
                allocation,
            });
        }

        let rule = set.rule;
        let entry = set.into_entry(JournalEntryId::generate(), self.group_id, occurred_at);
        let committed = self.store.commit(entry).await?;
        tracing::info!(
            rule,
            entry_id = %committed.id(),
            sequence = committed.sequence,
            "journal entry posted"
        );

        Ok(PostReceipt {
            entry_id: Some(committed.id()),
            sequence: Some(committed.sequence),
            allocation,
        })
    }

    /// Commit the reversing entry for `id`.
    ///
    /// Refuses entries that move a loan receivable; those belong to a loan
    /// and go through [`LedgerService::reverse_repayment`].
    #[tracing::instrument(name = "ledger.reverse", skip(self, memo), fields(group_id = %self.group_id))]
    pub async fn reverse(
        &self,
        id: JournalEntryId,
        occurred_at: DateTime<Utc>,
        memo: impl Into<String> + Send,
    ) -> Result<PostReceipt, ServiceError> {
        if let Some(entry) = self.store.entry(self.group_id, id).await? {
            if moves_loan(&entry) {
                return Err(DomainError::invariant(format!(
                    "entry {id} moves a loan receivable; reverse it through its loan"
                ))
                .into());
            }
        }
        self.commit_reversal(id, occurred_at, memo.into()).await
    }

    /// Reverse the loan's most recent repayment and its journal entry.
    ///
    /// The loan is only updated once the reversing entry is committed.
    #[tracing::instrument(
        name = "ledger.reverse_repayment",
        skip(self, loan, memo),
        fields(group_id = %self.group_id, loan_id = %loan.id_typed())
    )]
    pub async fn reverse_repayment(
        &self,
        loan: &mut Loan,
        id: JournalEntryId,
        occurred_at: DateTime<Utc>,
        memo: impl Into<String> + Send,
    ) -> Result<PostReceipt, ServiceError> {
        let entry = self
            .store
            .entry(self.group_id, id)
            .await?
            .ok_or_else(DomainError::not_found)?;
        if entry.source != SourceRef::Repayment(loan.id_typed()) {
            return Err(DomainError::invariant(format!(
                "entry {id} is not a repayment of loan {}",
                loan.id_typed()
            ))
            .into());
        }

        let events = loan.handle(&LoanCommand::ReverseRepayment(ReverseRepayment {
            group_id: self.group_id,
            loan_id: loan.id_typed(),
            paid_at: entry.occurred_at,
            amount: entry.amount()?,
            occurred_at,
        }))?;
        let receipt = self.commit_reversal(id, occurred_at, memo.into()).await?;
        apply_events(loan, &events);
        Ok(receipt)
    }

    async fn commit_reversal(
        &self,
        id: JournalEntryId,
        occurred_at: DateTime<Utc>,
        memo: String,
    ) -> Result<PostReceipt, ServiceError> {
        let committed = self.store.reverse(self.group_id, id, occurred_at, memo).await?;
        tracing::info!(
            reversal_id = %committed.id(),
            sequence = committed.sequence,
            "journal entry reversed"
        );
        Ok(PostReceipt {
            entry_id: Some(committed.id()),
            sequence: Some(committed.sequence),
            allocation: None,
        })
    }

    pub async fn balance_of(
        &self,
        key: AccountKey,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Money, ServiceError> {
        Ok(self.store.balance_of(self.group_id, key, as_of).await?)
    }

    pub async fn snapshot(&self) -> Result<JournalSnapshot, ServiceError> {
        Ok(self.store.snapshot(self.group_id).await?)
    }

    /// Reconcile the group's books against externally supplied totals.
    #[tracing::instrument(name = "ledger.reconcile", skip_all, fields(group_id = %self.group_id))]
    pub async fn run_reconciliation(
        &self,
        reference: &ReferenceTotals,
    ) -> Result<ReconciliationReport, ServiceError> {
        let snapshot = self.store.snapshot(self.group_id).await?;
        let report = reconcile(&snapshot, reference, self.config.reconciliation_tolerance)?;
        tracing::info!(
            outcome = ?report.outcome,
            discrepancies = report.discrepancies.len(),
            integrity_issues = report.integrity_issues.len(),
            "reconciliation finished"
        );
        Ok(report)
    }

    /// Approve a declaration and post the deposit, plus the loan payment it
    /// carries (if any) as a single entry.
    ///
    /// The deposit total is the deposited amount minus the declared loan
    /// payment; a declaration with a loan payment requires `loan`.
    pub async fn approve_declaration(
        &self,
        declaration: &mut Declaration,
        cmd: ApproveDeclaration,
        loan: Option<&mut Loan>,
    ) -> Result<PostReceipt, ServiceError> {
        self.ensure_group(cmd.group_id)?;
        let events = declaration.handle(&DeclarationCommand::ApproveDeclaration(cmd.clone()))?;
        let approved = events
            .iter()
            .find_map(|e| match e {
                DeclarationEvent::DeclarationApproved(a) => Some(a.clone()),
                _ => None,
            })
            .ok_or_else(|| DomainError::invariant("approval produced no DeclarationApproved event"))?;

        let amounts = approved.amounts;
        let loan_payment = amounts.loan_payment()?;
        let deposit = Transaction::SavingsDeposit(SavingsDeposit {
            declaration_id: approved.declaration_id,
            member: approved.member_id,
            total: approved.total_deposited.try_sub(loan_payment)?,
            savings: amounts.savings,
            social_fund: amounts.social_fund,
            admin_fund: amounts.admin_fund,
            penalties: amounts.penalties,
        });
        let mut set = self.engine.postings(&deposit)?;

        let mut loan_update = None;
        if loan_payment.is_positive() {
            let loan = loan.ok_or_else(|| {
                DomainError::validation("declaration includes a loan payment but no loan was given")
            })?;
            if loan.member_id() != Some(approved.member_id) {
                return Err(DomainError::invariant("loan belongs to a different member").into());
            }
            let loan_events = loan.handle(&LoanCommand::RecordRepayment(RecordRepayment {
                group_id: cmd.group_id,
                loan_id: loan.id_typed(),
                amount: loan_payment,
                occurred_at: cmd.occurred_at,
            }))?;
            let recorded = repayment_recorded(&loan_events)?;
            set = set.merge(self.engine.postings(&repayment_transaction(&recorded))?);
            loan_update = Some((loan, loan_events));
        }

        let receipt = self.commit_set(set, cmd.occurred_at).await?;

        apply_events(declaration, &events);
        if let Some((loan, loan_events)) = loan_update {
            apply_events(loan, &loan_events);
        }
        tracing::info!(declaration_id = %cmd.declaration_id, "declaration approved");
        Ok(receipt)
    }

    pub async fn disburse_loan(
        &self,
        loan: &mut Loan,
        cmd: DisburseLoan,
    ) -> Result<PostReceipt, ServiceError> {
        self.ensure_group(cmd.group_id)?;
        let events = loan.handle(&LoanCommand::DisburseLoan(cmd.clone()))?;
        let disbursed = events
            .iter()
            .find_map(|e| match e {
                LoanEvent::LoanDisbursed(d) => Some(d),
                _ => None,
            })
            .ok_or_else(|| DomainError::invariant("disbursement produced no LoanDisbursed event"))?;

        let transaction = Transaction::LoanDisbursement(LoanDisbursement {
            loan_id: disbursed.loan_id,
            member: disbursed.member_id,
            principal: disbursed.principal,
        });
        let receipt = self.post(&transaction, cmd.occurred_at).await?;

        apply_events(loan, &events);
        Ok(receipt)
    }

    /// Record a repayment: the loan's allocation drives the postings, so the
    /// loan's outstanding principal and the journal's receivable move together.
    pub async fn record_repayment(
        &self,
        loan: &mut Loan,
        cmd: RecordRepayment,
    ) -> Result<PostReceipt, ServiceError> {
        self.ensure_group(cmd.group_id)?;
        let events = loan.handle(&LoanCommand::RecordRepayment(cmd.clone()))?;
        let recorded = repayment_recorded(&events)?;

        let receipt = self
            .post(&repayment_transaction(&recorded), cmd.occurred_at)
            .await?;

        apply_events(loan, &events);
        if recorded.settles_loan {
            tracing::info!(loan_id = %cmd.loan_id, "loan settled");
        }
        Ok(receipt)
    }

    pub async fn approve_penalty(
        &self,
        penalty: &mut PenaltyRecord,
        cmd: ApprovePenalty,
    ) -> Result<PostReceipt, ServiceError> {
        self.ensure_group(cmd.group_id)?;
        let events = penalty.handle(&PenaltyCommand::ApprovePenalty(cmd.clone()))?;
        let approved = events
            .iter()
            .find_map(|e| match e {
                PenaltyEvent::PenaltyApproved(a) => Some(a),
                _ => None,
            })
            .ok_or_else(|| DomainError::invariant("approval produced no PenaltyApproved event"))?;

        let transaction = Transaction::Penalty(PenaltyCharge {
            penalty_id: approved.penalty_id,
            member: approved.member_id,
            fee: approved.fee,
        });
        let receipt = self.post(&transaction, cmd.occurred_at).await?;

        apply_events(penalty, &events);
        Ok(receipt)
    }

    pub async fn settle_penalty(
        &self,
        penalty: &mut PenaltyRecord,
        cmd: MarkPenaltyPaid,
    ) -> Result<PostReceipt, ServiceError> {
        self.ensure_group(cmd.group_id)?;
        let events = penalty.handle(&PenaltyCommand::MarkPenaltyPaid(cmd.clone()))?;
        let paid = events
            .iter()
            .find_map(|e| match e {
                PenaltyEvent::PenaltyPaid(p) => Some(p),
                _ => None,
            })
            .ok_or_else(|| DomainError::invariant("settlement produced no PenaltyPaid event"))?;

        let transaction = Transaction::PenaltySettlement(PenaltySettlement {
            penalty_id: paid.penalty_id,
            member: paid.member_id,
            fee: paid.fee,
        });
        let receipt = self.post(&transaction, cmd.occurred_at).await?;

        apply_events(penalty, &events);
        Ok(receipt)
    }
}

fn apply_events<A>(aggregate: &mut A, events: &[A::Event])
where
    A: Aggregate,
    A::Event: Event,
{
    for event in events {
        tracing::debug!(
            event_type = event.event_type(),
            version = event.version(),
            occurred_at = %event.occurred_at(),
            "event applied"
        );
        aggregate.apply(event);
    }
}

fn moves_loan(entry: &JournalEntry) -> bool {
    matches!(entry.source, SourceRef::LoanDisbursement(_) | SourceRef::Repayment(_))
        || entry.lines.iter().any(|line| {
            matches!(
                line.account,
                AccountKey::Member {
                    account: MemberAccount::LoansReceivable,
                    ..
                }
            )
        })
}

fn repayment_recorded(events: &[LoanEvent]) -> Result<RepaymentRecorded, DomainError> {
    events
        .iter()
        .find_map(|e| match e {
            LoanEvent::RepaymentRecorded(r) => Some(r.clone()),
            _ => None,
        })
        .ok_or_else(|| DomainError::invariant("repayment produced no RepaymentRecorded event"))
}

fn repayment_transaction(recorded: &RepaymentRecorded) -> Transaction {
    Transaction::Repayment(LoanRepayment {
        loan_id: recorded.loan_id,
        member: recorded.member_id,
        amount: recorded.repayment.amount,
        outstanding_principal: recorded.outstanding_before,
        interest_due: recorded.interest_due,
        on_excess: None,
    })
}
