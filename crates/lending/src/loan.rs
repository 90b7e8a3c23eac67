use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vikoba_core::{Aggregate, AggregateId, AggregateRoot, DomainError, GroupId, MemberId, Money, UserId};
use vikoba_events::Event;

use crate::amortization::{self, Allocation, Installment, LoanPosition};

/// Loan identifier (group-scoped via `group_id` fields in events/commands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LoanId(pub AggregateId);

impl LoanId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for LoanId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Loan lifecycle.
///
/// ```text
/// Requested ──► Approved ──► Disbursed ──► Settled
///     │
///     └──► Rejected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanStatus {
    Requested,
    Approved,
    Rejected,
    Disbursed,
    Settled,
}

impl LoanStatus {
    pub fn can_transition_to(self, next: LoanStatus) -> bool {
        use LoanStatus::*;
        matches!(
            (self, next),
            (Requested, Approved) | (Requested, Rejected) | (Approved, Disbursed) | (Disbursed, Settled)
        )
    }

    fn ensure_transition(self, next: LoanStatus) -> Result<(), DomainError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(DomainError::invalid_transition("loan", self, next))
        }
    }
}

/// A recorded repayment with its computed split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repayment {
    pub loan_id: LoanId,
    pub paid_at: DateTime<Utc>,
    pub amount: Money,
    pub principal: Money,
    pub interest: Money,
    pub excess: Money,
    pub outstanding_after: Money,
    pub interest_carried: Money,
    /// Interest periods charged once this repayment is recorded.
    pub periods_charged: u32,
}

/// Aggregate root: Loan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loan {
    id: LoanId,
    group_id: Option<GroupId>,
    member_id: Option<MemberId>,
    principal: Money,
    monthly_rate_bps: u32,
    term_months: u32,
    status: LoanStatus,
    disbursed_at: Option<DateTime<Utc>>,
    outstanding_principal: Money,
    accrued_interest: Money,
    periods_charged: u32,
    last_payment_at: Option<DateTime<Utc>>,
    schedule: Vec<Installment>,
    repayments: Vec<Repayment>,
    version: u64,
    created: bool,
}

impl Loan {
    /// Create an empty, not-yet-requested aggregate instance for rehydration.
    pub fn empty(id: LoanId) -> Self {
        Self {
            id,
            group_id: None,
            member_id: None,
            principal: Money::ZERO,
            monthly_rate_bps: 0,
            term_months: 0,
            status: LoanStatus::Requested,
            disbursed_at: None,
            outstanding_principal: Money::ZERO,
            accrued_interest: Money::ZERO,
            periods_charged: 0,
            last_payment_at: None,
            schedule: Vec::new(),
            repayments: Vec::new(),
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> LoanId {
        self.id
    }

    pub fn group_id(&self) -> Option<GroupId> {
        self.group_id
    }

    pub fn member_id(&self) -> Option<MemberId> {
        self.member_id
    }

    pub fn principal(&self) -> Money {
        self.principal
    }

    pub fn monthly_rate_bps(&self) -> u32 {
        self.monthly_rate_bps
    }

    pub fn term_months(&self) -> u32 {
        self.term_months
    }

    pub fn status(&self) -> LoanStatus {
        self.status
    }

    pub fn disbursed_at(&self) -> Option<DateTime<Utc>> {
        self.disbursed_at
    }

    pub fn outstanding_principal(&self) -> Money {
        self.outstanding_principal
    }

    pub fn accrued_interest(&self) -> Money {
        self.accrued_interest
    }

    pub fn repayments(&self) -> &[Repayment] {
        &self.repayments
    }

    /// Planned installments, fixed at disbursement.
    pub fn schedule(&self) -> &[Installment] {
        &self.schedule
    }

    /// Amortization inputs; `None` until the loan is disbursed.
    pub fn position(&self) -> Option<LoanPosition> {
        if !matches!(self.status, LoanStatus::Disbursed | LoanStatus::Settled) {
            return None;
        }
        Some(LoanPosition {
            outstanding_principal: self.outstanding_principal,
            accrued_interest: self.accrued_interest,
            monthly_rate_bps: self.monthly_rate_bps,
            disbursed_at: self.disbursed_at?,
            periods_charged: self.periods_charged,
            last_payment_at: self.last_payment_at?,
        })
    }

    /// Split a prospective payment without recording it.
    pub fn allocate(&self, payment: Money, at: DateTime<Utc>) -> Result<Allocation, DomainError> {
        let position = self
            .position()
            .ok_or_else(|| DomainError::invariant("loan has not been disbursed"))?;
        amortization::allocate(&position, payment, at)
    }
}

impl AggregateRoot for Loan {
    type Id = LoanId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: RequestLoan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestLoan {
    pub group_id: GroupId,
    pub loan_id: LoanId,
    pub member_id: MemberId,
    pub principal: Money,
    pub monthly_rate_bps: u32,
    pub term_months: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ApproveLoan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproveLoan {
    pub group_id: GroupId,
    pub loan_id: LoanId,
    pub approved_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RejectLoan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectLoan {
    pub group_id: GroupId,
    pub loan_id: LoanId,
    pub rejected_by: UserId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: DisburseLoan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisburseLoan {
    pub group_id: GroupId,
    pub loan_id: LoanId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordRepayment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRepayment {
    pub group_id: GroupId,
    pub loan_id: LoanId,
    pub amount: Money,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReverseRepayment.
///
/// Only the most recent repayment can be reversed; `paid_at` and `amount`
/// must match it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReverseRepayment {
    pub group_id: GroupId,
    pub loan_id: LoanId,
    pub paid_at: DateTime<Utc>,
    pub amount: Money,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoanCommand {
    RequestLoan(RequestLoan),
    ApproveLoan(ApproveLoan),
    RejectLoan(RejectLoan),
    DisburseLoan(DisburseLoan),
    RecordRepayment(RecordRepayment),
    ReverseRepayment(ReverseRepayment),
}

/// Event: LoanRequested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanRequested {
    pub group_id: GroupId,
    pub loan_id: LoanId,
    pub member_id: MemberId,
    pub principal: Money,
    pub monthly_rate_bps: u32,
    pub term_months: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LoanApproved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanApproved {
    pub group_id: GroupId,
    pub loan_id: LoanId,
    pub approved_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LoanRejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanRejected {
    pub group_id: GroupId,
    pub loan_id: LoanId,
    pub rejected_by: UserId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LoanDisbursed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanDisbursed {
    pub group_id: GroupId,
    pub loan_id: LoanId,
    pub member_id: MemberId,
    pub principal: Money,
    pub schedule: Vec<Installment>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RepaymentRecorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepaymentRecorded {
    pub group_id: GroupId,
    pub loan_id: LoanId,
    pub member_id: MemberId,
    pub repayment: Repayment,
    /// Interest owed at the moment of payment (carried + newly accrued).
    pub interest_due: Money,
    pub outstanding_before: Money,
    /// Nothing left to pay after this repayment.
    pub settles_loan: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RepaymentReversed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepaymentReversed {
    pub group_id: GroupId,
    pub loan_id: LoanId,
    pub member_id: MemberId,
    pub repayment: Repayment,
    /// Outstanding principal once the repayment is undone.
    pub outstanding_after: Money,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoanEvent {
    LoanRequested(LoanRequested),
    LoanApproved(LoanApproved),
    LoanRejected(LoanRejected),
    LoanDisbursed(LoanDisbursed),
    RepaymentRecorded(RepaymentRecorded),
    RepaymentReversed(RepaymentReversed),
}

impl Event for LoanEvent {
    fn event_type(&self) -> &'static str {
        match self {
            LoanEvent::LoanRequested(_) => "lending.loan.requested",
            LoanEvent::LoanApproved(_) => "lending.loan.approved",
            LoanEvent::LoanRejected(_) => "lending.loan.rejected",
            LoanEvent::LoanDisbursed(_) => "lending.loan.disbursed",
            LoanEvent::RepaymentRecorded(_) => "lending.loan.repayment_recorded",
            LoanEvent::RepaymentReversed(_) => "lending.loan.repayment_reversed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            LoanEvent::LoanRequested(e) => e.occurred_at,
            LoanEvent::LoanApproved(e) => e.occurred_at,
            LoanEvent::LoanRejected(e) => e.occurred_at,
            LoanEvent::LoanDisbursed(e) => e.occurred_at,
            LoanEvent::RepaymentRecorded(e) => e.occurred_at,
            LoanEvent::RepaymentReversed(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Loan {
    type Command = LoanCommand;
    type Event = LoanEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            LoanEvent::LoanRequested(e) => {
                self.id = e.loan_id;
                self.group_id = Some(e.group_id);
                self.member_id = Some(e.member_id);
                self.principal = e.principal;
                self.monthly_rate_bps = e.monthly_rate_bps;
                self.term_months = e.term_months;
                self.status = LoanStatus::Requested;
                self.created = true;
            }
            LoanEvent::LoanApproved(_) => {
                self.status = LoanStatus::Approved;
            }
            LoanEvent::LoanRejected(_) => {
                self.status = LoanStatus::Rejected;
            }
            LoanEvent::LoanDisbursed(e) => {
                self.status = LoanStatus::Disbursed;
                self.disbursed_at = Some(e.occurred_at);
                self.outstanding_principal = e.principal;
                self.accrued_interest = Money::ZERO;
                self.periods_charged = 0;
                self.last_payment_at = Some(e.occurred_at);
                self.schedule = e.schedule.clone();
            }
            LoanEvent::RepaymentRecorded(e) => {
                self.outstanding_principal = e.repayment.outstanding_after;
                self.accrued_interest = e.repayment.interest_carried;
                self.periods_charged = e.repayment.periods_charged;
                self.last_payment_at = Some(e.repayment.paid_at);
                self.repayments.push(e.repayment.clone());
                if e.settles_loan {
                    self.status = LoanStatus::Settled;
                }
            }
            LoanEvent::RepaymentReversed(e) => {
                self.repayments.pop();
                self.outstanding_principal = e.outstanding_after;
                match self.repayments.last() {
                    Some(previous) => {
                        self.accrued_interest = previous.interest_carried;
                        self.periods_charged = previous.periods_charged;
                        self.last_payment_at = Some(previous.paid_at);
                    }
                    None => {
                        self.accrued_interest = Money::ZERO;
                        self.periods_charged = 0;
                        self.last_payment_at = self.disbursed_at;
                    }
                }
                self.status = LoanStatus::Disbursed;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            LoanCommand::RequestLoan(cmd) => self.handle_request(cmd),
            LoanCommand::ApproveLoan(cmd) => self.handle_approve(cmd),
            LoanCommand::RejectLoan(cmd) => self.handle_reject(cmd),
            LoanCommand::DisburseLoan(cmd) => self.handle_disburse(cmd),
            LoanCommand::RecordRepayment(cmd) => self.handle_repayment(cmd),
            LoanCommand::ReverseRepayment(cmd) => self.handle_reverse_repayment(cmd),
        }
    }
}

impl Loan {
    fn ensure_existing(&self, group_id: GroupId, loan_id: LoanId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.group_id != Some(group_id) {
            return Err(DomainError::invariant("group mismatch"));
        }
        if self.id != loan_id {
            return Err(DomainError::invariant("loan_id mismatch"));
        }
        Ok(())
    }

    fn member(&self) -> Result<MemberId, DomainError> {
        self.member_id
            .ok_or_else(|| DomainError::invariant("loan has no member"))
    }

    fn handle_request(&self, cmd: &RequestLoan) -> Result<Vec<LoanEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("loan already exists"));
        }
        if !cmd.principal.is_positive() {
            return Err(DomainError::validation("loan principal must be positive"));
        }
        if cmd.term_months == 0 {
            return Err(DomainError::validation("loan term must be at least one month"));
        }
        if cmd.monthly_rate_bps as i64 > amortization::BASIS_POINTS {
            return Err(DomainError::validation("monthly rate cannot exceed 100%"));
        }

        Ok(vec![LoanEvent::LoanRequested(LoanRequested {
            group_id: cmd.group_id,
            loan_id: cmd.loan_id,
            member_id: cmd.member_id,
            principal: cmd.principal,
            monthly_rate_bps: cmd.monthly_rate_bps,
            term_months: cmd.term_months,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_approve(&self, cmd: &ApproveLoan) -> Result<Vec<LoanEvent>, DomainError> {
        self.ensure_existing(cmd.group_id, cmd.loan_id)?;
        self.status.ensure_transition(LoanStatus::Approved)?;

        Ok(vec![LoanEvent::LoanApproved(LoanApproved {
            group_id: cmd.group_id,
            loan_id: cmd.loan_id,
            approved_by: cmd.approved_by,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_reject(&self, cmd: &RejectLoan) -> Result<Vec<LoanEvent>, DomainError> {
        self.ensure_existing(cmd.group_id, cmd.loan_id)?;
        self.status.ensure_transition(LoanStatus::Rejected)?;

        Ok(vec![LoanEvent::LoanRejected(LoanRejected {
            group_id: cmd.group_id,
            loan_id: cmd.loan_id,
            rejected_by: cmd.rejected_by,
            reason: cmd.reason.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_disburse(&self, cmd: &DisburseLoan) -> Result<Vec<LoanEvent>, DomainError> {
        self.ensure_existing(cmd.group_id, cmd.loan_id)?;
        self.status.ensure_transition(LoanStatus::Disbursed)?;
        let schedule = amortization::repayment_schedule(
            self.principal,
            self.monthly_rate_bps,
            self.term_months,
            cmd.occurred_at,
        )?;

        Ok(vec![LoanEvent::LoanDisbursed(LoanDisbursed {
            group_id: cmd.group_id,
            loan_id: cmd.loan_id,
            member_id: self.member()?,
            principal: self.principal,
            schedule,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_repayment(&self, cmd: &RecordRepayment) -> Result<Vec<LoanEvent>, DomainError> {
        self.ensure_existing(cmd.group_id, cmd.loan_id)?;
        if self.status != LoanStatus::Disbursed {
            return Err(DomainError::invalid_transition(
                "loan",
                self.status,
                "repayment",
            ));
        }

        let position = self
            .position()
            .ok_or_else(|| DomainError::invariant("loan has not been disbursed"))?;
        let allocation = amortization::allocate(&position, cmd.amount, cmd.occurred_at)?;
        let settles_loan =
            allocation.outstanding_after.is_zero() && allocation.interest_carried.is_zero();

        Ok(vec![LoanEvent::RepaymentRecorded(RepaymentRecorded {
            group_id: cmd.group_id,
            loan_id: cmd.loan_id,
            member_id: self.member()?,
            repayment: Repayment {
                loan_id: cmd.loan_id,
                paid_at: cmd.occurred_at,
                amount: cmd.amount,
                principal: allocation.principal,
                interest: allocation.interest,
                excess: allocation.excess,
                outstanding_after: allocation.outstanding_after,
                interest_carried: allocation.interest_carried,
                periods_charged: position.periods_through(cmd.occurred_at),
            },
            interest_due: allocation.interest_due,
            outstanding_before: allocation.outstanding_before,
            settles_loan,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_reverse_repayment(&self, cmd: &ReverseRepayment) -> Result<Vec<LoanEvent>, DomainError> {
        self.ensure_existing(cmd.group_id, cmd.loan_id)?;
        if !matches!(self.status, LoanStatus::Disbursed | LoanStatus::Settled) {
            return Err(DomainError::invalid_transition(
                "loan",
                self.status,
                "repayment reversal",
            ));
        }
        let last = self
            .repayments
            .last()
            .ok_or_else(|| DomainError::conflict("loan has no repayment to reverse"))?;
        // Stored timestamps keep microsecond precision.
        let same_instant = last.paid_at.timestamp_micros() == cmd.paid_at.timestamp_micros();
        if !same_instant || last.amount != cmd.amount {
            return Err(DomainError::conflict(
                "only the most recent repayment can be reversed",
            ));
        }

        Ok(vec![LoanEvent::RepaymentReversed(RepaymentReversed {
            group_id: cmd.group_id,
            loan_id: cmd.loan_id,
            member_id: self.member()?,
            repayment: last.clone(),
            outstanding_after: last.outstanding_after.try_add(last.principal)?,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 9, 0, 0).unwrap()
    }

    fn k(major: i64) -> Money {
        Money::from_major(major)
    }

    fn run(loan: &mut Loan, cmd: LoanCommand) -> Vec<LoanEvent> {
        let events = loan.handle(&cmd).unwrap();
        for e in &events {
            loan.apply(e);
        }
        events
    }

    fn disbursed_loan(principal: Money, rate_bps: u32) -> (Loan, GroupId, LoanId) {
        let group_id = GroupId::new();
        let loan_id = LoanId::new(AggregateId::new());
        let mut loan = Loan::empty(loan_id);
        run(
            &mut loan,
            LoanCommand::RequestLoan(RequestLoan {
                group_id,
                loan_id,
                member_id: MemberId::new(),
                principal,
                monthly_rate_bps: rate_bps,
                term_months: 3,
                occurred_at: at(2024, 1, 1),
            }),
        );
        run(
            &mut loan,
            LoanCommand::ApproveLoan(ApproveLoan {
                group_id,
                loan_id,
                approved_by: UserId::new(),
                occurred_at: at(2024, 1, 2),
            }),
        );
        run(
            &mut loan,
            LoanCommand::DisburseLoan(DisburseLoan {
                group_id,
                loan_id,
                occurred_at: at(2024, 1, 5),
            }),
        );
        (loan, group_id, loan_id)
    }

    #[test]
    fn disbursement_opens_outstanding_principal() {
        let (loan, _, _) = disbursed_loan(k(500), 500);
        assert_eq!(loan.status(), LoanStatus::Disbursed);
        assert_eq!(loan.outstanding_principal(), k(500));
        assert_eq!(loan.version(), 3);
    }

    #[test]
    fn cannot_disburse_before_approval() {
        let group_id = GroupId::new();
        let loan_id = LoanId::new(AggregateId::new());
        let mut loan = Loan::empty(loan_id);
        run(
            &mut loan,
            LoanCommand::RequestLoan(RequestLoan {
                group_id,
                loan_id,
                member_id: MemberId::new(),
                principal: k(100),
                monthly_rate_bps: 500,
                term_months: 1,
                occurred_at: at(2024, 1, 1),
            }),
        );
        let err = loan
            .handle(&LoanCommand::DisburseLoan(DisburseLoan {
                group_id,
                loan_id,
                occurred_at: at(2024, 1, 2),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition { entity: "loan", .. }));
    }

    #[test]
    fn repayment_reduces_outstanding_and_settles() {
        let (mut loan, group_id, loan_id) = disbursed_loan(k(400), 500);

        // One month in: 20.00 interest due.
        run(
            &mut loan,
            LoanCommand::RecordRepayment(RecordRepayment {
                group_id,
                loan_id,
                amount: k(120),
                occurred_at: at(2024, 2, 5),
            }),
        );
        assert_eq!(loan.outstanding_principal(), k(300));
        assert_eq!(loan.repayments()[0].interest, k(20));
        assert_eq!(loan.status(), LoanStatus::Disbursed);

        // Next month: 15.00 interest on 300.00, pay everything off.
        let events = run(
            &mut loan,
            LoanCommand::RecordRepayment(RecordRepayment {
                group_id,
                loan_id,
                amount: k(315),
                occurred_at: at(2024, 3, 5),
            }),
        );
        match &events[0] {
            LoanEvent::RepaymentRecorded(e) => {
                assert!(e.settles_loan);
                assert_eq!(e.repayment.interest, k(15));
                assert_eq!(e.repayment.principal, k(300));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(loan.status(), LoanStatus::Settled);
        assert_eq!(loan.outstanding_principal(), Money::ZERO);
    }

    #[test]
    fn settled_loan_rejects_further_repayments() {
        let (mut loan, group_id, loan_id) = disbursed_loan(k(100), 0);
        run(
            &mut loan,
            LoanCommand::RecordRepayment(RecordRepayment {
                group_id,
                loan_id,
                amount: k(100),
                occurred_at: at(2024, 1, 20),
            }),
        );
        assert_eq!(loan.status(), LoanStatus::Settled);
        let err = loan
            .handle(&LoanCommand::RecordRepayment(RecordRepayment {
                group_id,
                loan_id,
                amount: k(1),
                occurred_at: at(2024, 1, 21),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition { .. }));
    }

    #[test]
    fn rejected_loan_cannot_be_approved() {
        let group_id = GroupId::new();
        let loan_id = LoanId::new(AggregateId::new());
        let mut loan = Loan::empty(loan_id);
        run(
            &mut loan,
            LoanCommand::RequestLoan(RequestLoan {
                group_id,
                loan_id,
                member_id: MemberId::new(),
                principal: k(100),
                monthly_rate_bps: 500,
                term_months: 1,
                occurred_at: at(2024, 1, 1),
            }),
        );
        run(
            &mut loan,
            LoanCommand::RejectLoan(RejectLoan {
                group_id,
                loan_id,
                rejected_by: UserId::new(),
                reason: Some("insufficient savings".to_string()),
                occurred_at: at(2024, 1, 2),
            }),
        );
        assert!(loan
            .handle(&LoanCommand::ApproveLoan(ApproveLoan {
                group_id,
                loan_id,
                approved_by: UserId::new(),
                occurred_at: at(2024, 1, 3),
            }))
            .is_err());
    }

    #[test]
    fn transition_table() {
        use LoanStatus::*;
        assert!(Requested.can_transition_to(Approved));
        assert!(Requested.can_transition_to(Rejected));
        assert!(!Requested.can_transition_to(Disbursed));
        assert!(!Rejected.can_transition_to(Approved));
        assert!(!Settled.can_transition_to(Disbursed));
    }

    fn repay(loan: &mut Loan, group_id: GroupId, loan_id: LoanId, amount: Money, at: DateTime<Utc>) {
        run(
            loan,
            LoanCommand::RecordRepayment(RecordRepayment {
                group_id,
                loan_id,
                amount,
                occurred_at: at,
            }),
        );
    }

    #[test]
    fn repayments_within_one_period_share_its_interest() {
        let (mut loan, group_id, loan_id) = disbursed_loan(k(400), 500);

        repay(&mut loan, group_id, loan_id, k(50), at(2024, 1, 15));
        repay(&mut loan, group_id, loan_id, k(50), at(2024, 1, 16));

        let charged: Money =
            Money::try_sum(loan.repayments().iter().map(|r| r.interest)).unwrap();
        assert_eq!(charged, k(20));
        assert_eq!(loan.repayments()[1].interest, Money::ZERO);
        assert_eq!(loan.outstanding_principal(), k(320));
    }

    #[test]
    fn disbursement_fixes_the_repayment_plan() {
        let (loan, _, _) = disbursed_loan(k(300), 500);
        let plan = loan.schedule();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0].principal, k(100));
        assert_eq!(plan[0].interest, k(15));
        assert_eq!(plan[0].due_date, at(2024, 2, 5));
        assert_eq!(plan[2].balance_after, Money::ZERO);
    }

    #[test]
    fn reversing_the_last_repayment_restores_the_position() {
        let (mut loan, group_id, loan_id) = disbursed_loan(k(400), 500);
        repay(&mut loan, group_id, loan_id, k(120), at(2024, 2, 5));
        let before = loan.clone();
        repay(&mut loan, group_id, loan_id, k(315), at(2024, 3, 5));
        assert_eq!(loan.status(), LoanStatus::Settled);

        // Only the most recent repayment can be undone.
        let stale = loan.handle(&LoanCommand::ReverseRepayment(ReverseRepayment {
            group_id,
            loan_id,
            paid_at: at(2024, 2, 5),
            amount: k(120),
            occurred_at: at(2024, 3, 6),
        }));
        assert!(matches!(stale, Err(DomainError::Conflict(_))));

        let events = run(
            &mut loan,
            LoanCommand::ReverseRepayment(ReverseRepayment {
                group_id,
                loan_id,
                paid_at: at(2024, 3, 5),
                amount: k(315),
                occurred_at: at(2024, 3, 6),
            }),
        );
        assert!(matches!(&events[0], LoanEvent::RepaymentReversed(e) if e.outstanding_after == k(300)));
        assert_eq!(loan.status(), LoanStatus::Disbursed);
        assert_eq!(loan.outstanding_principal(), before.outstanding_principal());
        assert_eq!(loan.accrued_interest(), before.accrued_interest());
        assert_eq!(loan.repayments(), before.repayments());
        assert_eq!(loan.position(), before.position());
    }

    #[test]
    fn events_carry_stable_names_and_business_time() {
        let (mut loan, group_id, loan_id) = disbursed_loan(k(100), 0);
        let events = loan
            .handle(&LoanCommand::RecordRepayment(RecordRepayment {
                group_id,
                loan_id,
                amount: k(40),
                occurred_at: at(2024, 1, 9),
            }))
            .unwrap();
        loan.apply(&events[0]);
        assert_eq!(events[0].event_type(), "lending.loan.repayment_recorded");
        assert_eq!(events[0].occurred_at(), at(2024, 1, 9));
        assert_eq!(events[0].version(), 1);
    }
}
