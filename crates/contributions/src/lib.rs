//! Member contributions: monthly declarations and penalties.
//!
//! Both are closed state machines with explicit transition tables. They never
//! touch balances; approval events are handed to the ledger's rule engine.

pub mod declaration;
pub mod penalty;

pub use declaration::{
    ApproveDeclaration, Declaration, DeclarationApproved, DeclarationCommand, DeclarationEdited,
    DeclarationEvent, DeclarationId, DeclarationRejected, DeclarationStatus, DeclarationSubmitted,
    DeclaredAmounts, EditDeclaration, ProofUploaded, RejectDeclaration, SubmitDeclaration,
    UploadProof,
};
pub use penalty::{
    ApprovePenalty, IssuePenalty, MarkPenaltyPaid, PenaltyApproved, PenaltyCommand, PenaltyEvent,
    PenaltyId, PenaltyIssued, PenaltyPaid, PenaltyRecord, PenaltyRejected, PenaltyStatus,
    PenaltyType, RejectPenalty,
};
