use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vikoba_core::{Aggregate, AggregateId, AggregateRoot, DomainError, GroupId, MemberId, Money, UserId};
use vikoba_events::Event;

/// Penalty identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PenaltyId(pub AggregateId);

impl PenaltyId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for PenaltyId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Catalogued penalty (e.g. "late declaration", fixed fee).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PenaltyType {
    pub name: String,
    pub fee: Money,
}

/// Penalty lifecycle: `Pending → Approved → Paid`, or `Pending → Rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PenaltyStatus {
    Pending,
    Approved,
    Paid,
    Rejected,
}

impl PenaltyStatus {
    pub fn can_transition_to(self, next: PenaltyStatus) -> bool {
        use PenaltyStatus::*;
        matches!(
            (self, next),
            (Pending, Approved) | (Pending, Rejected) | (Approved, Paid)
        )
    }

    fn ensure_transition(self, next: PenaltyStatus) -> Result<(), DomainError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(DomainError::invalid_transition("penalty", self, next))
        }
    }
}

/// Aggregate root: PenaltyRecord.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PenaltyRecord {
    id: PenaltyId,
    group_id: Option<GroupId>,
    member_id: Option<MemberId>,
    penalty_type: Option<PenaltyType>,
    status: PenaltyStatus,
    approver: Option<UserId>,
    version: u64,
    created: bool,
}

impl PenaltyRecord {
    pub fn empty(id: PenaltyId) -> Self {
        Self {
            id,
            group_id: None,
            member_id: None,
            penalty_type: None,
            status: PenaltyStatus::Pending,
            approver: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> PenaltyId {
        self.id
    }

    pub fn group_id(&self) -> Option<GroupId> {
        self.group_id
    }

    pub fn member_id(&self) -> Option<MemberId> {
        self.member_id
    }

    pub fn penalty_type(&self) -> Option<&PenaltyType> {
        self.penalty_type.as_ref()
    }

    pub fn status(&self) -> PenaltyStatus {
        self.status
    }

    pub fn approver(&self) -> Option<UserId> {
        self.approver
    }

    fn fee(&self) -> Result<Money, DomainError> {
        self.penalty_type
            .as_ref()
            .map(|t| t.fee)
            .ok_or_else(|| DomainError::invariant("penalty has no type"))
    }

    fn member(&self) -> Result<MemberId, DomainError> {
        self.member_id
            .ok_or_else(|| DomainError::invariant("penalty has no member"))
    }
}

impl AggregateRoot for PenaltyRecord {
    type Id = PenaltyId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: IssuePenalty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuePenalty {
    pub group_id: GroupId,
    pub penalty_id: PenaltyId,
    pub member_id: MemberId,
    pub penalty_type: PenaltyType,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ApprovePenalty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovePenalty {
    pub group_id: GroupId,
    pub penalty_id: PenaltyId,
    pub approved_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RejectPenalty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectPenalty {
    pub group_id: GroupId,
    pub penalty_id: PenaltyId,
    pub rejected_by: UserId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkPenaltyPaid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkPenaltyPaid {
    pub group_id: GroupId,
    pub penalty_id: PenaltyId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PenaltyCommand {
    IssuePenalty(IssuePenalty),
    ApprovePenalty(ApprovePenalty),
    RejectPenalty(RejectPenalty),
    MarkPenaltyPaid(MarkPenaltyPaid),
}

/// Event: PenaltyIssued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PenaltyIssued {
    pub group_id: GroupId,
    pub penalty_id: PenaltyId,
    pub member_id: MemberId,
    pub penalty_type: PenaltyType,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PenaltyApproved. The only penalty event that charges the member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PenaltyApproved {
    pub group_id: GroupId,
    pub penalty_id: PenaltyId,
    pub member_id: MemberId,
    pub fee: Money,
    pub approved_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PenaltyRejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PenaltyRejected {
    pub group_id: GroupId,
    pub penalty_id: PenaltyId,
    pub rejected_by: UserId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PenaltyPaid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PenaltyPaid {
    pub group_id: GroupId,
    pub penalty_id: PenaltyId,
    pub member_id: MemberId,
    pub fee: Money,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PenaltyEvent {
    PenaltyIssued(PenaltyIssued),
    PenaltyApproved(PenaltyApproved),
    PenaltyRejected(PenaltyRejected),
    PenaltyPaid(PenaltyPaid),
}

impl Event for PenaltyEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PenaltyEvent::PenaltyIssued(_) => "contributions.penalty.issued",
            PenaltyEvent::PenaltyApproved(_) => "contributions.penalty.approved",
            PenaltyEvent::PenaltyRejected(_) => "contributions.penalty.rejected",
            PenaltyEvent::PenaltyPaid(_) => "contributions.penalty.paid",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            PenaltyEvent::PenaltyIssued(e) => e.occurred_at,
            PenaltyEvent::PenaltyApproved(e) => e.occurred_at,
            PenaltyEvent::PenaltyRejected(e) => e.occurred_at,
            PenaltyEvent::PenaltyPaid(e) => e.occurred_at,
        }
    }
}

impl Aggregate for PenaltyRecord {
    type Command = PenaltyCommand;
    type Event = PenaltyEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            PenaltyEvent::PenaltyIssued(e) => {
                self.id = e.penalty_id;
                self.group_id = Some(e.group_id);
                self.member_id = Some(e.member_id);
                self.penalty_type = Some(e.penalty_type.clone());
                self.status = PenaltyStatus::Pending;
                self.created = true;
            }
            PenaltyEvent::PenaltyApproved(e) => {
                self.approver = Some(e.approved_by);
                self.status = PenaltyStatus::Approved;
            }
            PenaltyEvent::PenaltyRejected(e) => {
                self.approver = Some(e.rejected_by);
                self.status = PenaltyStatus::Rejected;
            }
            PenaltyEvent::PenaltyPaid(_) => {
                self.status = PenaltyStatus::Paid;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            PenaltyCommand::IssuePenalty(cmd) => self.handle_issue(cmd),
            PenaltyCommand::ApprovePenalty(cmd) => self.handle_approve(cmd),
            PenaltyCommand::RejectPenalty(cmd) => self.handle_reject(cmd),
            PenaltyCommand::MarkPenaltyPaid(cmd) => self.handle_paid(cmd),
        }
    }
}

impl PenaltyRecord {
    fn ensure_existing(&self, group_id: GroupId, id: PenaltyId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.group_id != Some(group_id) {
            return Err(DomainError::invariant("group mismatch"));
        }
        if self.id != id {
            return Err(DomainError::invariant("penalty_id mismatch"));
        }
        Ok(())
    }

    fn handle_issue(&self, cmd: &IssuePenalty) -> Result<Vec<PenaltyEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("penalty already exists"));
        }
        if cmd.penalty_type.name.trim().is_empty() {
            return Err(DomainError::validation("penalty type name is required"));
        }
        if !cmd.penalty_type.fee.is_positive() {
            return Err(DomainError::validation("penalty fee must be positive"));
        }

        Ok(vec![PenaltyEvent::PenaltyIssued(PenaltyIssued {
            group_id: cmd.group_id,
            penalty_id: cmd.penalty_id,
            member_id: cmd.member_id,
            penalty_type: cmd.penalty_type.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_approve(&self, cmd: &ApprovePenalty) -> Result<Vec<PenaltyEvent>, DomainError> {
        self.ensure_existing(cmd.group_id, cmd.penalty_id)?;
        self.status.ensure_transition(PenaltyStatus::Approved)?;

        Ok(vec![PenaltyEvent::PenaltyApproved(PenaltyApproved {
            group_id: cmd.group_id,
            penalty_id: cmd.penalty_id,
            member_id: self.member()?,
            fee: self.fee()?,
            approved_by: cmd.approved_by,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_reject(&self, cmd: &RejectPenalty) -> Result<Vec<PenaltyEvent>, DomainError> {
        self.ensure_existing(cmd.group_id, cmd.penalty_id)?;
        self.status.ensure_transition(PenaltyStatus::Rejected)?;

        Ok(vec![PenaltyEvent::PenaltyRejected(PenaltyRejected {
            group_id: cmd.group_id,
            penalty_id: cmd.penalty_id,
            rejected_by: cmd.rejected_by,
            reason: cmd.reason.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_paid(&self, cmd: &MarkPenaltyPaid) -> Result<Vec<PenaltyEvent>, DomainError> {
        self.ensure_existing(cmd.group_id, cmd.penalty_id)?;
        self.status.ensure_transition(PenaltyStatus::Paid)?;

        Ok(vec![PenaltyEvent::PenaltyPaid(PenaltyPaid {
            group_id: cmd.group_id,
            penalty_id: cmd.penalty_id,
            member_id: self.member()?,
            fee: self.fee()?,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issued() -> (PenaltyRecord, GroupId, PenaltyId) {
        let group_id = GroupId::new();
        let penalty_id = PenaltyId::new(AggregateId::new());
        let mut p = PenaltyRecord::empty(penalty_id);
        let events = p
            .handle(&PenaltyCommand::IssuePenalty(IssuePenalty {
                group_id,
                penalty_id,
                member_id: MemberId::new(),
                penalty_type: PenaltyType {
                    name: "late declaration".to_string(),
                    fee: Money::from_major(50),
                },
                occurred_at: Utc::now(),
            }))
            .unwrap();
        p.apply(&events[0]);
        (p, group_id, penalty_id)
    }

    #[test]
    fn approval_emits_fee() {
        let (mut p, group_id, penalty_id) = issued();
        let approver = UserId::new();
        let events = p
            .handle(&PenaltyCommand::ApprovePenalty(ApprovePenalty {
                group_id,
                penalty_id,
                approved_by: approver,
                occurred_at: Utc::now(),
            }))
            .unwrap();
        match &events[0] {
            PenaltyEvent::PenaltyApproved(e) => assert_eq!(e.fee, Money::from_major(50)),
            other => panic!("unexpected event {other:?}"),
        }
        p.apply(&events[0]);
        assert_eq!(p.status(), PenaltyStatus::Approved);
        assert_eq!(p.approver(), Some(approver));
    }

    #[test]
    fn pending_penalty_cannot_be_paid() {
        let (p, group_id, penalty_id) = issued();
        let err = p
            .handle(&PenaltyCommand::MarkPenaltyPaid(MarkPenaltyPaid {
                group_id,
                penalty_id,
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition { entity: "penalty", .. }));
    }

    #[test]
    fn rejected_penalty_cannot_be_approved() {
        let (mut p, group_id, penalty_id) = issued();
        let events = p
            .handle(&PenaltyCommand::RejectPenalty(RejectPenalty {
                group_id,
                penalty_id,
                rejected_by: UserId::new(),
                reason: None,
                occurred_at: Utc::now(),
            }))
            .unwrap();
        p.apply(&events[0]);
        assert!(p
            .handle(&PenaltyCommand::ApprovePenalty(ApprovePenalty {
                group_id,
                penalty_id,
                approved_by: UserId::new(),
                occurred_at: Utc::now(),
            }))
            .is_err());
    }

    #[test]
    fn transition_table() {
        use PenaltyStatus::*;
        assert!(Pending.can_transition_to(Approved));
        assert!(Approved.can_transition_to(Paid));
        assert!(!Pending.can_transition_to(Paid));
        assert!(!Paid.can_transition_to(Approved));
        assert!(!Rejected.can_transition_to(Paid));
    }
}
