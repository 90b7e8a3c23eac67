//! Lending domain module.
//!
//! Loan lifecycle (request → approval → disbursement → settlement) and the
//! amortization policy that splits a repayment into interest and principal.
//! Pure domain logic only: no IO, no persistence concerns.

pub mod amortization;
pub mod loan;

pub use amortization::{
    Allocation, ExcessPayment, Installment, LoanPosition, allocate, repayment_schedule,
    split_payment, started_months,
};
pub use loan::{
    ApproveLoan, DisburseLoan, Loan, LoanApproved, LoanCommand, LoanDisbursed, LoanEvent, LoanId,
    LoanRejected, LoanRequested, LoanStatus, RecordRepayment, RejectLoan, Repayment,
    RepaymentRecorded, RepaymentReversed, RequestLoan, ReverseRepayment,
};
