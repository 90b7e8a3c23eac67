//! Rule engine: domain transactions to balanced postings.
//!
//! Rules are pure. They never look at balances; floors and account existence
//! are the journal's concern at commit time.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vikoba_contributions::{DeclarationId, PenaltyId};
use vikoba_core::{DomainError, GroupId, MemberId, Money};
use vikoba_lending::{Allocation, LoanId, split_payment};

use crate::chart::AccountKey;
use crate::error::{LedgerError, LedgerResult};
use crate::journal::{JournalEntry, JournalEntryId, JournalLine, SourceRef, totals};

/// What to do with the part of a repayment that exceeds everything owed.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExcessPaymentPolicy {
    /// Refuse the repayment with a recoverable `ExcessPayment` error.
    #[default]
    Reject,
    /// Hold the excess on the member's standing credit account.
    StandingCredit,
}

impl FromStr for ExcessPaymentPolicy {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reject" => Ok(Self::Reject),
            "standing_credit" => Ok(Self::StandingCredit),
            other => Err(DomainError::validation(format!("unknown excess payment policy: {other}"))),
        }
    }
}

/// Account debited when a penalty is approved.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PenaltyDebitTarget {
    #[default]
    MemberSavings,
    PenaltyReceivable,
}

impl PenaltyDebitTarget {
    pub fn account(self, member: MemberId) -> AccountKey {
        match self {
            PenaltyDebitTarget::MemberSavings => AccountKey::member_savings(member),
            PenaltyDebitTarget::PenaltyReceivable => AccountKey::penalty_receivable(member),
        }
    }
}

impl FromStr for PenaltyDebitTarget {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "member_savings" => Ok(Self::MemberSavings),
            "penalty_receivable" => Ok(Self::PenaltyReceivable),
            other => Err(DomainError::validation(format!("unknown penalty debit target: {other}"))),
        }
    }
}

/// Business policy the rules are evaluated under.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulePolicy {
    /// Allowed gap between declared components and the deposited total.
    pub declaration_tolerance: Money,
    pub penalty_debit: PenaltyDebitTarget,
    pub excess_payment: ExcessPaymentPolicy,
}

impl Default for RulePolicy {
    fn default() -> Self {
        Self {
            declaration_tolerance: Money::from_minor(1),
            penalty_debit: PenaltyDebitTarget::default(),
            excess_payment: ExcessPaymentPolicy::default(),
        }
    }
}

/// Cash deposit split by the member's declared breakdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavingsDeposit {
    pub declaration_id: DeclarationId,
    pub member: MemberId,
    pub total: Money,
    pub savings: Money,
    pub social_fund: Money,
    pub admin_fund: Money,
    /// Penalties settled in cash with the deposit.
    #[serde(default)]
    pub penalties: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanDisbursement {
    pub loan_id: LoanId,
    pub member: MemberId,
    pub principal: Money,
}

/// Repayment against a loan position as it stands at payment time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanRepayment {
    pub loan_id: LoanId,
    pub member: MemberId,
    pub amount: Money,
    pub outstanding_principal: Money,
    pub interest_due: Money,
    /// Overrides the engine's excess policy for this payment.
    #[serde(default)]
    pub on_excess: Option<ExcessPaymentPolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PenaltyCharge {
    pub penalty_id: PenaltyId,
    pub member: MemberId,
    pub fee: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PenaltySettlement {
    pub penalty_id: PenaltyId,
    pub member: MemberId,
    pub fee: Money,
}

/// Every transaction type the ledger accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transaction {
    SavingsDeposit(SavingsDeposit),
    LoanDisbursement(LoanDisbursement),
    Repayment(LoanRepayment),
    Penalty(PenaltyCharge),
    PenaltySettlement(PenaltySettlement),
}

impl Transaction {
    pub fn kind(&self) -> &'static str {
        match self {
            Transaction::SavingsDeposit(_) => "savings_deposit",
            Transaction::LoanDisbursement(_) => "loan_disbursement",
            Transaction::Repayment(_) => "repayment",
            Transaction::Penalty(_) => "penalty",
            Transaction::PenaltySettlement(_) => "penalty_settlement",
        }
    }

    pub fn member(&self) -> MemberId {
        match self {
            Transaction::SavingsDeposit(t) => t.member,
            Transaction::LoanDisbursement(t) => t.member,
            Transaction::Repayment(t) => t.member,
            Transaction::Penalty(t) => t.member,
            Transaction::PenaltySettlement(t) => t.member,
        }
    }
}

/// Balanced output of one rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostingSet {
    pub rule: &'static str,
    pub source: SourceRef,
    pub member: Option<MemberId>,
    pub memo: String,
    pub lines: Vec<JournalLine>,
    /// Present for repayments.
    pub allocation: Option<Allocation>,
}

impl PostingSet {
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Append another rule's postings, keeping this set's source.
    pub fn merge(mut self, other: PostingSet) -> PostingSet {
        self.lines.extend(other.lines);
        if other.allocation.is_some() {
            self.allocation = other.allocation;
        }
        if self.member.is_none() {
            self.member = other.member;
        }
        if !other.memo.is_empty() {
            self.memo = format!("{}; {}", self.memo, other.memo);
        }
        self
    }

    pub fn into_entry(
        self,
        id: JournalEntryId,
        group_id: GroupId,
        occurred_at: DateTime<Utc>,
    ) -> JournalEntry {
        JournalEntry {
            id,
            group_id,
            occurred_at,
            source: self.source,
            member: self.member,
            memo: self.memo,
            lines: self.lines,
            reverses: None,
        }
    }
}

fn push_debit(lines: &mut Vec<JournalLine>, account: AccountKey, amount: Money) {
    if !amount.is_zero() {
        lines.push(JournalLine::debit(account, amount));
    }
}

fn push_credit(lines: &mut Vec<JournalLine>, account: AccountKey, amount: Money) {
    if !amount.is_zero() {
        lines.push(JournalLine::credit(account, amount));
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuleEngine {
    policy: RulePolicy,
}

impl RuleEngine {
    pub fn new(policy: RulePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RulePolicy {
        &self.policy
    }

    /// Compute the postings for `transaction`.
    ///
    /// The result is self-checked: a rule whose debits and credits differ
    /// fails with `UnbalancedPosting` and never reaches the journal.
    pub fn postings(&self, transaction: &Transaction) -> LedgerResult<PostingSet> {
        let set = match transaction {
            Transaction::SavingsDeposit(t) => self.savings_deposit(t)?,
            Transaction::LoanDisbursement(t) => self.loan_disbursement(t)?,
            Transaction::Repayment(t) => self.repayment(t)?,
            Transaction::Penalty(t) => self.penalty(t)?,
            Transaction::PenaltySettlement(t) => self.penalty_settlement(t)?,
        };

        let (debits, credits) = totals(&set.lines)?;
        if debits != credits {
            return Err(LedgerError::UnbalancedPosting {
                rule: set.rule,
                debits,
                credits,
            });
        }

        tracing::debug!(
            rule = set.rule,
            member = ?set.member,
            lines = set.lines.len(),
            amount = %debits,
            "postings computed"
        );
        Ok(set)
    }

    fn savings_deposit(&self, t: &SavingsDeposit) -> LedgerResult<PostingSet> {
        for amount in [t.savings, t.social_fund, t.admin_fund, t.penalties] {
            if amount.is_negative() {
                return Err(DomainError::validation("declared amounts cannot be negative").into());
            }
        }
        let components = Money::try_sum([t.savings, t.social_fund, t.admin_fund, t.penalties])?;
        let gap = components.try_sub(t.total)?.abs();
        if gap > self.policy.declaration_tolerance {
            return Err(LedgerError::UnbalancedDeclaration {
                total: t.total,
                components,
                tolerance: self.policy.declaration_tolerance,
            });
        }

        let mut lines = Vec::with_capacity(5);
        push_debit(&mut lines, AccountKey::bank_cash(), components);
        push_credit(&mut lines, AccountKey::member_savings(t.member), t.savings);
        push_credit(&mut lines, AccountKey::social_fund(), t.social_fund);
        push_credit(&mut lines, AccountKey::admin_fund(), t.admin_fund);
        push_credit(&mut lines, self.policy.penalty_debit.account(t.member), t.penalties);

        Ok(PostingSet {
            rule: "savings_deposit",
            source: SourceRef::Declaration(t.declaration_id),
            member: Some(t.member),
            memo: format!("monthly contribution {components}"),
            lines,
            allocation: None,
        })
    }

    fn loan_disbursement(&self, t: &LoanDisbursement) -> LedgerResult<PostingSet> {
        if !t.principal.is_positive() {
            return Err(DomainError::validation("principal must be positive").into());
        }
        Ok(PostingSet {
            rule: "loan_disbursement",
            source: SourceRef::LoanDisbursement(t.loan_id),
            member: Some(t.member),
            memo: format!("loan {} disbursed", t.loan_id),
            lines: vec![
                JournalLine::debit(AccountKey::loans_receivable(t.member), t.principal),
                JournalLine::credit(AccountKey::bank_cash(), t.principal),
            ],
            allocation: None,
        })
    }

    fn repayment(&self, t: &LoanRepayment) -> LedgerResult<PostingSet> {
        let allocation = split_payment(t.outstanding_principal, t.interest_due, t.amount)?;
        let policy = t.on_excess.unwrap_or(self.policy.excess_payment);

        if let Some(excess) = allocation.excess_payment() {
            if policy == ExcessPaymentPolicy::Reject {
                tracing::info!(loan_id = %t.loan_id, excess = %excess.amount, "repayment exceeds amount owed");
                return Err(LedgerError::ExcessPayment {
                    loan_id: t.loan_id,
                    excess,
                });
            }
        }

        let mut lines = Vec::with_capacity(4);
        push_debit(&mut lines, AccountKey::bank_cash(), t.amount);
        push_credit(&mut lines, AccountKey::loans_receivable(t.member), allocation.principal);
        push_credit(&mut lines, AccountKey::interest_income(), allocation.interest);
        push_credit(&mut lines, AccountKey::standing_credit(t.member), allocation.excess);

        Ok(PostingSet {
            rule: "repayment",
            source: SourceRef::Repayment(t.loan_id),
            member: Some(t.member),
            memo: format!(
                "repayment on loan {}: principal {}, interest {}",
                t.loan_id, allocation.principal, allocation.interest
            ),
            lines,
            allocation: Some(allocation),
        })
    }

    fn penalty(&self, t: &PenaltyCharge) -> LedgerResult<PostingSet> {
        if !t.fee.is_positive() {
            return Err(DomainError::validation("penalty fee must be positive").into());
        }
        Ok(PostingSet {
            rule: "penalty",
            source: SourceRef::Penalty(t.penalty_id),
            member: Some(t.member),
            memo: format!("penalty {} approved", t.penalty_id),
            lines: vec![
                JournalLine::debit(self.policy.penalty_debit.account(t.member), t.fee),
                JournalLine::credit(AccountKey::penalty_income(), t.fee),
            ],
            allocation: None,
        })
    }

    /// Cash received for a receivable penalty. Penalties charged to savings
    /// were settled at approval, so nothing is posted for them.
    fn penalty_settlement(&self, t: &PenaltySettlement) -> LedgerResult<PostingSet> {
        if !t.fee.is_positive() {
            return Err(DomainError::validation("penalty fee must be positive").into());
        }
        let lines = match self.policy.penalty_debit {
            PenaltyDebitTarget::MemberSavings => Vec::new(),
            PenaltyDebitTarget::PenaltyReceivable => vec![
                JournalLine::debit(AccountKey::bank_cash(), t.fee),
                JournalLine::credit(AccountKey::penalty_receivable(t.member), t.fee),
            ],
        };
        Ok(PostingSet {
            rule: "penalty_settlement",
            source: SourceRef::PenaltySettlement(t.penalty_id),
            member: Some(t.member),
            memo: format!("penalty {} paid", t.penalty_id),
            lines,
            allocation: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::Side;
    use vikoba_core::AggregateId;

    fn line(side: Side, account: AccountKey, major: i64) -> JournalLine {
        JournalLine {
            account,
            side,
            amount: Money::from_major(major),
        }
    }

    fn repayment(member: MemberId, amount: i64, outstanding: i64, interest: i64) -> Transaction {
        Transaction::Repayment(LoanRepayment {
            loan_id: LoanId(AggregateId::new()),
            member,
            amount: Money::from_major(amount),
            outstanding_principal: Money::from_major(outstanding),
            interest_due: Money::from_major(interest),
            on_excess: None,
        })
    }

    #[test]
    fn savings_deposit_splits_declared_components() {
        let member = MemberId::new();
        let engine = RuleEngine::default();
        let set = engine
            .postings(&Transaction::SavingsDeposit(SavingsDeposit {
                declaration_id: DeclarationId(AggregateId::new()),
                member,
                total: Money::from_major(100),
                savings: Money::from_major(50),
                social_fund: Money::from_major(20),
                admin_fund: Money::from_major(30),
                penalties: Money::ZERO,
            }))
            .unwrap();

        assert_eq!(
            set.lines,
            vec![
                line(Side::Debit, AccountKey::bank_cash(), 100),
                line(Side::Credit, AccountKey::member_savings(member), 50),
                line(Side::Credit, AccountKey::social_fund(), 20),
                line(Side::Credit, AccountKey::admin_fund(), 30),
            ]
        );
    }

    #[test]
    fn savings_deposit_outside_tolerance_is_unbalanced() {
        let engine = RuleEngine::default();
        let deposit = |total_minor: i64| {
            Transaction::SavingsDeposit(SavingsDeposit {
                declaration_id: DeclarationId(AggregateId::new()),
                member: MemberId::new(),
                total: Money::from_minor(total_minor),
                savings: Money::from_minor(5_000),
                social_fund: Money::from_minor(2_000),
                admin_fund: Money::from_minor(3_000),
                penalties: Money::ZERO,
            })
        };

        // One minor unit of rounding is tolerated; bank cash follows the components.
        let set = engine.postings(&deposit(10_001)).unwrap();
        assert_eq!(set.lines[0].amount, Money::from_minor(10_000));

        assert_eq!(
            engine.postings(&deposit(10_002)).unwrap_err(),
            LedgerError::UnbalancedDeclaration {
                total: Money::from_minor(10_002),
                components: Money::from_minor(10_000),
                tolerance: Money::from_minor(1),
            }
        );
    }

    #[test]
    fn zero_components_produce_no_lines() {
        let member = MemberId::new();
        let set = RuleEngine::default()
            .postings(&Transaction::SavingsDeposit(SavingsDeposit {
                declaration_id: DeclarationId(AggregateId::new()),
                member,
                total: Money::from_major(50),
                savings: Money::from_major(50),
                social_fund: Money::ZERO,
                admin_fund: Money::ZERO,
                penalties: Money::ZERO,
            }))
            .unwrap();
        assert_eq!(set.lines.len(), 2);
    }

    #[test]
    fn loan_disbursement_moves_cash_to_receivable() {
        let member = MemberId::new();
        let set = RuleEngine::default()
            .postings(&Transaction::LoanDisbursement(LoanDisbursement {
                loan_id: LoanId(AggregateId::new()),
                member,
                principal: Money::from_major(500),
            }))
            .unwrap();
        assert_eq!(
            set.lines,
            vec![
                line(Side::Debit, AccountKey::loans_receivable(member), 500),
                line(Side::Credit, AccountKey::bank_cash(), 500),
            ]
        );
    }

    #[test]
    fn repayment_serves_interest_then_principal() {
        let member = MemberId::new();
        let set = RuleEngine::default()
            .postings(&repayment(member, 120, 400, 20))
            .unwrap();

        assert_eq!(
            set.lines,
            vec![
                line(Side::Debit, AccountKey::bank_cash(), 120),
                line(Side::Credit, AccountKey::loans_receivable(member), 100),
                line(Side::Credit, AccountKey::interest_income(), 20),
            ]
        );
        let allocation = set.allocation.unwrap();
        assert_eq!(allocation.interest, Money::from_major(20));
        assert_eq!(allocation.principal, Money::from_major(100));
        assert_eq!(allocation.outstanding_after, Money::from_major(300));
    }

    #[test]
    fn excess_repayment_is_rejected_by_default() {
        let err = RuleEngine::default()
            .postings(&repayment(MemberId::new(), 450, 400, 20))
            .unwrap_err();
        match err {
            LedgerError::ExcessPayment { excess, .. } => {
                assert_eq!(excess.amount, Money::from_major(30));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(
            RuleEngine::default()
                .postings(&repayment(MemberId::new(), 450, 400, 20))
                .unwrap_err()
                .is_recoverable()
        );
    }

    #[test]
    fn excess_repayment_can_become_standing_credit() {
        let member = MemberId::new();
        let engine = RuleEngine::new(RulePolicy {
            excess_payment: ExcessPaymentPolicy::StandingCredit,
            ..RulePolicy::default()
        });
        let set = engine.postings(&repayment(member, 450, 400, 20)).unwrap();
        assert_eq!(
            set.lines,
            vec![
                line(Side::Debit, AccountKey::bank_cash(), 450),
                line(Side::Credit, AccountKey::loans_receivable(member), 400),
                line(Side::Credit, AccountKey::interest_income(), 20),
                line(Side::Credit, AccountKey::standing_credit(member), 30),
            ]
        );
    }

    #[test]
    fn penalty_debits_savings_by_default() {
        let member = MemberId::new();
        let set = RuleEngine::default()
            .postings(&Transaction::Penalty(PenaltyCharge {
                penalty_id: PenaltyId(AggregateId::new()),
                member,
                fee: Money::from_major(50),
            }))
            .unwrap();
        assert_eq!(
            set.lines,
            vec![
                line(Side::Debit, AccountKey::member_savings(member), 50),
                line(Side::Credit, AccountKey::penalty_income(), 50),
            ]
        );
    }

    #[test]
    fn receivable_penalty_is_settled_in_cash() {
        let member = MemberId::new();
        let penalty_id = PenaltyId(AggregateId::new());
        let engine = RuleEngine::new(RulePolicy {
            penalty_debit: PenaltyDebitTarget::PenaltyReceivable,
            ..RulePolicy::default()
        });

        let charge = engine
            .postings(&Transaction::Penalty(PenaltyCharge {
                penalty_id,
                member,
                fee: Money::from_major(50),
            }))
            .unwrap();
        assert_eq!(charge.lines[0].account, AccountKey::penalty_receivable(member));

        let settle = Transaction::PenaltySettlement(PenaltySettlement {
            penalty_id,
            member,
            fee: Money::from_major(50),
        });
        let settled = engine.postings(&settle).unwrap();
        assert_eq!(
            settled.lines,
            vec![
                line(Side::Debit, AccountKey::bank_cash(), 50),
                line(Side::Credit, AccountKey::penalty_receivable(member), 50),
            ]
        );
        assert!(RuleEngine::default().postings(&settle).unwrap().is_empty());
    }

    #[test]
    fn merged_sets_keep_first_source() {
        let member = MemberId::new();
        let declaration_id = DeclarationId(AggregateId::new());
        let engine = RuleEngine::default();
        let deposit = engine
            .postings(&Transaction::SavingsDeposit(SavingsDeposit {
                declaration_id,
                member,
                total: Money::from_major(10),
                savings: Money::from_major(10),
                social_fund: Money::ZERO,
                admin_fund: Money::ZERO,
                penalties: Money::ZERO,
            }))
            .unwrap();
        let repay = engine.postings(&repayment(member, 120, 400, 20)).unwrap();
        let merged = deposit.merge(repay);

        assert_eq!(merged.source, SourceRef::Declaration(declaration_id));
        assert_eq!(merged.lines.len(), 5);
        assert!(merged.allocation.is_some());
        let (debits, credits) = totals(&merged.lines).unwrap();
        assert_eq!(debits, credits);
    }

    #[test]
    fn policies_parse_from_config_strings() {
        assert_eq!(
            "standing_credit".parse::<ExcessPaymentPolicy>().unwrap(),
            ExcessPaymentPolicy::StandingCredit
        );
        assert_eq!(
            "penalty_receivable".parse::<PenaltyDebitTarget>().unwrap(),
            PenaltyDebitTarget::PenaltyReceivable
        );
        assert!("absorb".parse::<ExcessPaymentPolicy>().is_err());
    }
}
