//! Repayment allocation for fixed-rate, short-term group loans.
//!
//! Interest is simple (never compounded). Periods are whole months counted
//! from the disbursement date; every period that has started by the time of a
//! payment is charged once, at `outstanding × monthly_rate_bps / 10_000`.
//! Interest left unpaid by a repayment is carried forward, not capitalised.

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};

use vikoba_core::{DomainError, DomainResult, Money};

/// Basis points in one whole (100%).
pub const BASIS_POINTS: i64 = 10_000;

/// The parts of a loan's state that amortization needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanPosition {
    pub outstanding_principal: Money,
    /// Interest accrued in earlier periods and not yet paid.
    pub accrued_interest: Money,
    pub monthly_rate_bps: u32,
    pub disbursed_at: DateTime<Utc>,
    /// Interest periods already charged, counted from disbursement.
    pub periods_charged: u32,
    /// Last repayment, or disbursement when nothing was repaid yet.
    pub last_payment_at: DateTime<Utc>,
}

impl LoanPosition {
    /// Periods charged once a payment is made at `at`.
    pub fn periods_through(&self, at: DateTime<Utc>) -> u32 {
        started_months(self.disbursed_at, at).max(self.periods_charged)
    }

    /// Interest owed if a payment were made at `at`.
    pub fn interest_due(&self, at: DateTime<Utc>) -> DomainResult<Money> {
        let fresh_periods = self.periods_through(at) - self.periods_charged;
        let per_month = self
            .outstanding_principal
            .mul_div_round(self.monthly_rate_bps as i64, BASIS_POINTS)?;
        let fresh = per_month
            .minor()
            .checked_mul(fresh_periods as i64)
            .map(Money::from_minor)
            .ok_or_else(|| DomainError::invariant("interest overflow"))?;
        self.accrued_interest.try_add(fresh)
    }
}

/// Part of a payment that exceeds everything the loan owes.
///
/// A recoverable business condition: the caller decides whether to hold it
/// as a standing credit or to refuse the repayment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcessPayment {
    pub amount: Money,
}

/// Result of splitting one payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub payment: Money,
    pub interest_due: Money,
    pub interest: Money,
    pub principal: Money,
    pub excess: Money,
    pub outstanding_before: Money,
    pub outstanding_after: Money,
    /// Interest still owed after this payment.
    pub interest_carried: Money,
}

impl Allocation {
    pub fn excess_payment(&self) -> Option<ExcessPayment> {
        self.excess
            .is_positive()
            .then_some(ExcessPayment { amount: self.excess })
    }
}

/// Split `payment` into interest, principal and excess.
///
/// Interest is served first, then principal up to what is outstanding; the
/// remainder is excess. `interest + principal + excess == payment` always.
pub fn split_payment(
    outstanding_principal: Money,
    interest_due: Money,
    payment: Money,
) -> DomainResult<Allocation> {
    if !payment.is_positive() {
        return Err(DomainError::validation("payment amount must be positive"));
    }
    if outstanding_principal.is_negative() || interest_due.is_negative() {
        return Err(DomainError::invariant("loan position cannot be negative"));
    }

    let interest = payment.min(interest_due);
    let after_interest = payment.try_sub(interest)?;
    let principal = after_interest.min(outstanding_principal);
    let excess = after_interest.try_sub(principal)?;

    Ok(Allocation {
        payment,
        interest_due,
        interest,
        principal,
        excess,
        outstanding_before: outstanding_principal,
        outstanding_after: outstanding_principal.try_sub(principal)?,
        interest_carried: interest_due.try_sub(interest)?,
    })
}

/// Allocate a payment made at `at` against a loan position.
pub fn allocate(position: &LoanPosition, payment: Money, at: DateTime<Utc>) -> DomainResult<Allocation> {
    if at < position.last_payment_at {
        return Err(DomainError::validation(
            "repayment cannot predate the last repayment or disbursement",
        ));
    }
    let due = position.interest_due(at)?;
    split_payment(position.outstanding_principal, due, payment)
}

/// Number of months started between `from` and `to`.
///
/// Exactly one month later counts as 1; one month and a day counts as 2; any
/// instant after `from` within the first month counts as 1.
pub fn started_months(from: DateTime<Utc>, to: DateTime<Utc>) -> u32 {
    if to <= from {
        return 0;
    }
    let mut whole = 0u32;
    loop {
        let next = match from.checked_add_months(Months::new(whole + 1)) {
            Some(next) => next,
            None => return whole + 1,
        };
        if next > to {
            break;
        }
        whole += 1;
    }
    let anchor = from
        .checked_add_months(Months::new(whole))
        .unwrap_or(from);
    if anchor < to { whole + 1 } else { whole }
}

/// One line of a planned repayment schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Installment {
    pub number: u32,
    pub due_date: DateTime<Utc>,
    pub principal: Money,
    pub interest: Money,
    pub total: Money,
    pub balance_after: Money,
}

/// Equal-principal plan with interest on the declining balance.
///
/// Any indivisible remainder of the principal is added to the last
/// installment so the plan always sums to the principal exactly.
pub fn repayment_schedule(
    principal: Money,
    monthly_rate_bps: u32,
    term_months: u32,
    disbursed_at: DateTime<Utc>,
) -> DomainResult<Vec<Installment>> {
    if !principal.is_positive() {
        return Err(DomainError::validation("principal must be positive"));
    }
    if term_months == 0 {
        return Err(DomainError::validation("term must be at least one month"));
    }

    let base = principal.minor() / term_months as i64;
    let remainder = principal.minor() % term_months as i64;

    let mut balance = principal;
    let mut plan = Vec::with_capacity(term_months as usize);
    for n in 1..=term_months {
        let part = if n == term_months { base + remainder } else { base };
        let part = Money::from_minor(part);
        let interest = balance.mul_div_round(monthly_rate_bps as i64, BASIS_POINTS)?;
        balance = balance.try_sub(part)?;
        let due_date = disbursed_at
            .checked_add_months(Months::new(n))
            .ok_or_else(|| DomainError::invariant("due date out of range"))?;
        plan.push(Installment {
            number: n,
            due_date,
            principal: part,
            interest,
            total: part.try_add(interest)?,
            balance_after: balance,
        });
    }
    Ok(plan)
}
