//! Migration reconciliation.
//!
//! Re-derives per-member and per-group figures from a journal snapshot,
//! compares them with reference totals exported from a legacy system and
//! sweeps the snapshot for integrity problems. Runs are exhaustive: every
//! mismatch is collected, nothing stops at the first one.

pub mod reference;
pub mod report;
pub mod validator;

pub use reference::{GroupReference, IdMap, MemberReference, ReferenceTotals};
pub use report::{
    Discrepancy, DiscrepancyEntity, IntegrityIssue, ReconciliationReport, RunOutcome,
};
pub use validator::{
    DerivedTotals, GroupTotals, MemberTotals, ReconciliationError, ReconciliationRun, RunState,
    reconcile,
};
