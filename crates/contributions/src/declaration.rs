use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use vikoba_core::{Aggregate, AggregateId, AggregateRoot, DomainError, GroupId, MemberId, Money, UserId};
use vikoba_events::Event;

/// Declaration identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeclarationId(pub AggregateId);

impl DeclarationId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for DeclarationId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Declaration lifecycle.
///
/// ```text
/// Pending ──► ProofUploaded ──► Approved
///    ▲              │
///    │              ▼
///    └───────── Rejected   (member edits and resubmits)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclarationStatus {
    Pending,
    ProofUploaded,
    Approved,
    Rejected,
}

impl DeclarationStatus {
    pub fn can_transition_to(self, next: DeclarationStatus) -> bool {
        use DeclarationStatus::*;
        matches!(
            (self, next),
            (Pending, Pending)
                | (Pending, ProofUploaded)
                | (ProofUploaded, Approved)
                | (ProofUploaded, Rejected)
                | (Rejected, Pending)
        )
    }

    fn ensure_transition(self, next: DeclarationStatus) -> Result<(), DomainError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(DomainError::invalid_transition("declaration", self, next))
        }
    }
}

/// Amounts a member declares for one month.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredAmounts {
    pub savings: Money,
    pub social_fund: Money,
    pub admin_fund: Money,
    pub penalties: Money,
    pub interest_on_loan: Money,
    pub loan_repayment: Money,
}

impl DeclaredAmounts {
    fn validate(&self) -> Result<(), DomainError> {
        let all = [
            self.savings,
            self.social_fund,
            self.admin_fund,
            self.penalties,
            self.interest_on_loan,
            self.loan_repayment,
        ];
        if all.iter().any(|m| m.is_negative()) {
            return Err(DomainError::validation("declared amounts cannot be negative"));
        }
        if all.iter().all(|m| m.is_zero()) {
            return Err(DomainError::validation("declaration must declare something"));
        }
        Ok(())
    }

    /// Savings + social fund + admin fund: the part posted as a savings deposit.
    pub fn deposit_components(&self) -> Result<Money, DomainError> {
        Money::try_sum([self.savings, self.social_fund, self.admin_fund])
    }

    /// Interest + principal the member intends to pay on their loan.
    pub fn loan_payment(&self) -> Result<Money, DomainError> {
        self.interest_on_loan.try_add(self.loan_repayment)
    }
}

/// Aggregate root: Declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    id: DeclarationId,
    group_id: Option<GroupId>,
    member_id: Option<MemberId>,
    effective_month: Option<NaiveDate>,
    amounts: DeclaredAmounts,
    total_deposited: Option<Money>,
    proof_reference: Option<String>,
    status: DeclarationStatus,
    reviewed_by: Option<UserId>,
    rejection_reason: Option<String>,
    version: u64,
    created: bool,
}

impl Declaration {
    pub fn empty(id: DeclarationId) -> Self {
        Self {
            id,
            group_id: None,
            member_id: None,
            effective_month: None,
            amounts: DeclaredAmounts::default(),
            total_deposited: None,
            proof_reference: None,
            status: DeclarationStatus::Pending,
            reviewed_by: None,
            rejection_reason: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> DeclarationId {
        self.id
    }

    pub fn group_id(&self) -> Option<GroupId> {
        self.group_id
    }

    pub fn member_id(&self) -> Option<MemberId> {
        self.member_id
    }

    pub fn effective_month(&self) -> Option<NaiveDate> {
        self.effective_month
    }

    pub fn amounts(&self) -> &DeclaredAmounts {
        &self.amounts
    }

    pub fn total_deposited(&self) -> Option<Money> {
        self.total_deposited
    }

    pub fn proof_reference(&self) -> Option<&str> {
        self.proof_reference.as_deref()
    }

    pub fn status(&self) -> DeclarationStatus {
        self.status
    }

    pub fn reviewed_by(&self) -> Option<UserId> {
        self.reviewed_by
    }

    pub fn rejection_reason(&self) -> Option<&str> {
        self.rejection_reason.as_deref()
    }
}

impl AggregateRoot for Declaration {
    type Id = DeclarationId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: SubmitDeclaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitDeclaration {
    pub group_id: GroupId,
    pub declaration_id: DeclarationId,
    pub member_id: MemberId,
    /// First day of the month the declaration covers.
    pub effective_month: NaiveDate,
    pub amounts: DeclaredAmounts,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UploadProof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadProof {
    pub group_id: GroupId,
    pub declaration_id: DeclarationId,
    /// Opaque pointer into the external proof-of-payment store.
    pub proof_reference: String,
    /// Amount shown on the proof of payment.
    pub total_deposited: Money,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ApproveDeclaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproveDeclaration {
    pub group_id: GroupId,
    pub declaration_id: DeclarationId,
    pub approved_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RejectDeclaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectDeclaration {
    pub group_id: GroupId,
    pub declaration_id: DeclarationId,
    pub rejected_by: UserId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: EditDeclaration (member response to a rejection, or a pre-proof fix).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditDeclaration {
    pub group_id: GroupId,
    pub declaration_id: DeclarationId,
    pub amounts: DeclaredAmounts,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeclarationCommand {
    SubmitDeclaration(SubmitDeclaration),
    UploadProof(UploadProof),
    ApproveDeclaration(ApproveDeclaration),
    RejectDeclaration(RejectDeclaration),
    EditDeclaration(EditDeclaration),
}

/// Event: DeclarationSubmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclarationSubmitted {
    pub group_id: GroupId,
    pub declaration_id: DeclarationId,
    pub member_id: MemberId,
    pub effective_month: NaiveDate,
    pub amounts: DeclaredAmounts,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ProofUploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofUploaded {
    pub group_id: GroupId,
    pub declaration_id: DeclarationId,
    pub proof_reference: String,
    pub total_deposited: Money,
    pub occurred_at: DateTime<Utc>,
}

/// Event: DeclarationApproved. Carries everything the ledger needs to post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclarationApproved {
    pub group_id: GroupId,
    pub declaration_id: DeclarationId,
    pub member_id: MemberId,
    pub effective_month: NaiveDate,
    pub amounts: DeclaredAmounts,
    pub total_deposited: Money,
    pub approved_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: DeclarationRejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclarationRejected {
    pub group_id: GroupId,
    pub declaration_id: DeclarationId,
    pub rejected_by: UserId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: DeclarationEdited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclarationEdited {
    pub group_id: GroupId,
    pub declaration_id: DeclarationId,
    pub amounts: DeclaredAmounts,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeclarationEvent {
    DeclarationSubmitted(DeclarationSubmitted),
    ProofUploaded(ProofUploaded),
    DeclarationApproved(DeclarationApproved),
    DeclarationRejected(DeclarationRejected),
    DeclarationEdited(DeclarationEdited),
}

impl Event for DeclarationEvent {
    fn event_type(&self) -> &'static str {
        match self {
            DeclarationEvent::DeclarationSubmitted(_) => "contributions.declaration.submitted",
            DeclarationEvent::ProofUploaded(_) => "contributions.declaration.proof_uploaded",
            DeclarationEvent::DeclarationApproved(_) => "contributions.declaration.approved",
            DeclarationEvent::DeclarationRejected(_) => "contributions.declaration.rejected",
            DeclarationEvent::DeclarationEdited(_) => "contributions.declaration.edited",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            DeclarationEvent::DeclarationSubmitted(e) => e.occurred_at,
            DeclarationEvent::ProofUploaded(e) => e.occurred_at,
            DeclarationEvent::DeclarationApproved(e) => e.occurred_at,
            DeclarationEvent::DeclarationRejected(e) => e.occurred_at,
            DeclarationEvent::DeclarationEdited(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Declaration {
    type Command = DeclarationCommand;
    type Event = DeclarationEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            DeclarationEvent::DeclarationSubmitted(e) => {
                self.id = e.declaration_id;
                self.group_id = Some(e.group_id);
                self.member_id = Some(e.member_id);
                self.effective_month = Some(e.effective_month);
                self.amounts = e.amounts;
                self.status = DeclarationStatus::Pending;
                self.created = true;
            }
            DeclarationEvent::ProofUploaded(e) => {
                self.proof_reference = Some(e.proof_reference.clone());
                self.total_deposited = Some(e.total_deposited);
                self.status = DeclarationStatus::ProofUploaded;
            }
            DeclarationEvent::DeclarationApproved(e) => {
                self.reviewed_by = Some(e.approved_by);
                self.status = DeclarationStatus::Approved;
            }
            DeclarationEvent::DeclarationRejected(e) => {
                self.reviewed_by = Some(e.rejected_by);
                self.rejection_reason = Some(e.reason.clone());
                self.status = DeclarationStatus::Rejected;
            }
            DeclarationEvent::DeclarationEdited(e) => {
                self.amounts = e.amounts;
                self.proof_reference = None;
                self.total_deposited = None;
                self.status = DeclarationStatus::Pending;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            DeclarationCommand::SubmitDeclaration(cmd) => self.handle_submit(cmd),
            DeclarationCommand::UploadProof(cmd) => self.handle_upload(cmd),
            DeclarationCommand::ApproveDeclaration(cmd) => self.handle_approve(cmd),
            DeclarationCommand::RejectDeclaration(cmd) => self.handle_reject(cmd),
            DeclarationCommand::EditDeclaration(cmd) => self.handle_edit(cmd),
        }
    }
}

impl Declaration {
    fn ensure_existing(&self, group_id: GroupId, id: DeclarationId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.group_id != Some(group_id) {
            return Err(DomainError::invariant("group mismatch"));
        }
        if self.id != id {
            return Err(DomainError::invariant("declaration_id mismatch"));
        }
        Ok(())
    }

    fn handle_submit(&self, cmd: &SubmitDeclaration) -> Result<Vec<DeclarationEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("declaration already exists"));
        }
        if cmd.effective_month.day() != 1 {
            return Err(DomainError::validation(
                "effective month must be the first day of a month",
            ));
        }
        cmd.amounts.validate()?;

        Ok(vec![DeclarationEvent::DeclarationSubmitted(DeclarationSubmitted {
            group_id: cmd.group_id,
            declaration_id: cmd.declaration_id,
            member_id: cmd.member_id,
            effective_month: cmd.effective_month,
            amounts: cmd.amounts,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_upload(&self, cmd: &UploadProof) -> Result<Vec<DeclarationEvent>, DomainError> {
        self.ensure_existing(cmd.group_id, cmd.declaration_id)?;
        self.status.ensure_transition(DeclarationStatus::ProofUploaded)?;
        if cmd.proof_reference.trim().is_empty() {
            return Err(DomainError::validation("proof reference is required"));
        }
        if !cmd.total_deposited.is_positive() {
            return Err(DomainError::validation("deposited total must be positive"));
        }

        Ok(vec![DeclarationEvent::ProofUploaded(ProofUploaded {
            group_id: cmd.group_id,
            declaration_id: cmd.declaration_id,
            proof_reference: cmd.proof_reference.clone(),
            total_deposited: cmd.total_deposited,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_approve(&self, cmd: &ApproveDeclaration) -> Result<Vec<DeclarationEvent>, DomainError> {
        self.ensure_existing(cmd.group_id, cmd.declaration_id)?;
        self.status.ensure_transition(DeclarationStatus::Approved)?;

        let member_id = self
            .member_id
            .ok_or_else(|| DomainError::invariant("declaration has no member"))?;
        let effective_month = self
            .effective_month
            .ok_or_else(|| DomainError::invariant("declaration has no month"))?;
        let total_deposited = self
            .total_deposited
            .ok_or_else(|| DomainError::invariant("declaration has no deposited total"))?;

        Ok(vec![DeclarationEvent::DeclarationApproved(DeclarationApproved {
            group_id: cmd.group_id,
            declaration_id: cmd.declaration_id,
            member_id,
            effective_month,
            amounts: self.amounts,
            total_deposited,
            approved_by: cmd.approved_by,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_reject(&self, cmd: &RejectDeclaration) -> Result<Vec<DeclarationEvent>, DomainError> {
        self.ensure_existing(cmd.group_id, cmd.declaration_id)?;
        self.status.ensure_transition(DeclarationStatus::Rejected)?;
        if cmd.reason.trim().is_empty() {
            return Err(DomainError::validation("rejection reason is required"));
        }

        Ok(vec![DeclarationEvent::DeclarationRejected(DeclarationRejected {
            group_id: cmd.group_id,
            declaration_id: cmd.declaration_id,
            rejected_by: cmd.rejected_by,
            reason: cmd.reason.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_edit(&self, cmd: &EditDeclaration) -> Result<Vec<DeclarationEvent>, DomainError> {
        self.ensure_existing(cmd.group_id, cmd.declaration_id)?;
        self.status.ensure_transition(DeclarationStatus::Pending)?;
        cmd.amounts.validate()?;

        Ok(vec![DeclarationEvent::DeclarationEdited(DeclarationEdited {
            group_id: cmd.group_id,
            declaration_id: cmd.declaration_id,
            amounts: cmd.amounts,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn month() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    fn amounts() -> DeclaredAmounts {
        DeclaredAmounts {
            savings: Money::from_major(50),
            social_fund: Money::from_major(20),
            admin_fund: Money::from_major(30),
            ..DeclaredAmounts::default()
        }
    }

    fn run(d: &mut Declaration, cmd: DeclarationCommand) -> Vec<DeclarationEvent> {
        let events = d.handle(&cmd).unwrap();
        for e in &events {
            d.apply(e);
        }
        events
    }

    fn submitted() -> (Declaration, GroupId, DeclarationId) {
        let group_id = GroupId::new();
        let id = DeclarationId::new(AggregateId::new());
        let mut d = Declaration::empty(id);
        run(
            &mut d,
            DeclarationCommand::SubmitDeclaration(SubmitDeclaration {
                group_id,
                declaration_id: id,
                member_id: MemberId::new(),
                effective_month: month(),
                amounts: amounts(),
                occurred_at: Utc::now(),
            }),
        );
        (d, group_id, id)
    }

    fn upload(d: &mut Declaration, group_id: GroupId, id: DeclarationId) {
        run(
            d,
            DeclarationCommand::UploadProof(UploadProof {
                group_id,
                declaration_id: id,
                proof_reference: "proofs/2024-03/receipt.jpg".to_string(),
                total_deposited: Money::from_major(100),
                occurred_at: Utc::now(),
            }),
        );
    }

    #[test]
    fn approval_requires_uploaded_proof() {
        let (d, group_id, id) = submitted();
        let err = d
            .handle(&DeclarationCommand::ApproveDeclaration(ApproveDeclaration {
                group_id,
                declaration_id: id,
                approved_by: UserId::new(),
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition { entity: "declaration", .. }));
    }

    #[test]
    fn approval_carries_amounts_and_deposit() {
        let (mut d, group_id, id) = submitted();
        upload(&mut d, group_id, id);
        let events = run(
            &mut d,
            DeclarationCommand::ApproveDeclaration(ApproveDeclaration {
                group_id,
                declaration_id: id,
                approved_by: UserId::new(),
                occurred_at: Utc::now(),
            }),
        );
        match &events[0] {
            DeclarationEvent::DeclarationApproved(e) => {
                assert_eq!(e.total_deposited, Money::from_major(100));
                assert_eq!(e.amounts.deposit_components().unwrap(), Money::from_major(100));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(d.status(), DeclarationStatus::Approved);
    }

    #[test]
    fn rejected_declaration_can_be_edited_and_resubmitted() {
        let (mut d, group_id, id) = submitted();
        upload(&mut d, group_id, id);
        run(
            &mut d,
            DeclarationCommand::RejectDeclaration(RejectDeclaration {
                group_id,
                declaration_id: id,
                rejected_by: UserId::new(),
                reason: "proof is unreadable".to_string(),
                occurred_at: Utc::now(),
            }),
        );
        assert_eq!(d.status(), DeclarationStatus::Rejected);
        assert_eq!(d.rejection_reason(), Some("proof is unreadable"));

        let mut edited = amounts();
        edited.savings = Money::from_major(60);
        run(
            &mut d,
            DeclarationCommand::EditDeclaration(EditDeclaration {
                group_id,
                declaration_id: id,
                amounts: edited,
                occurred_at: Utc::now(),
            }),
        );
        assert_eq!(d.status(), DeclarationStatus::Pending);
        assert_eq!(d.amounts().savings, Money::from_major(60));
        assert_eq!(d.total_deposited(), None);
    }

    #[test]
    fn approved_declaration_is_final() {
        let (mut d, group_id, id) = submitted();
        upload(&mut d, group_id, id);
        run(
            &mut d,
            DeclarationCommand::ApproveDeclaration(ApproveDeclaration {
                group_id,
                declaration_id: id,
                approved_by: UserId::new(),
                occurred_at: Utc::now(),
            }),
        );
        assert!(d
            .handle(&DeclarationCommand::EditDeclaration(EditDeclaration {
                group_id,
                declaration_id: id,
                amounts: amounts(),
                occurred_at: Utc::now(),
            }))
            .is_err());
    }

    #[test]
    fn negative_amounts_are_rejected() {
        let d = Declaration::empty(DeclarationId::new(AggregateId::new()));
        let mut bad = amounts();
        bad.admin_fund = Money::from_minor(-1);
        let err = d
            .handle(&DeclarationCommand::SubmitDeclaration(SubmitDeclaration {
                group_id: GroupId::new(),
                declaration_id: *d.id(),
                member_id: MemberId::new(),
                effective_month: month(),
                amounts: bad,
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }
}
