//! Reference figures exported from the legacy system.
//!
//! Every figure is optional; only supplied figures are compared.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use vikoba_core::{MemberId, Money};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemberReference {
    pub savings: Option<Money>,
    pub outstanding_loan: Option<Money>,
    pub interest_paid: Option<Money>,
    pub penalties: Option<Money>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupReference {
    pub bank_cash: Option<Money>,
    pub loans_receivable: Option<Money>,
    pub social_fund: Option<Money>,
    pub admin_fund: Option<Money>,
    pub interest_income: Option<Money>,
    pub penalty_income: Option<Money>,
}

/// Legacy id → new id, plus the legacy ids the map must cover.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdMap {
    pub entries: BTreeMap<String, Uuid>,
    pub source_ids: Vec<String>,
}

impl IdMap {
    /// Legacy ids with no mapping, sorted and deduplicated.
    pub fn unmapped(&self) -> Vec<&str> {
        let mut missing: Vec<&str> = self
            .source_ids
            .iter()
            .filter(|id| !self.entries.contains_key(id.as_str()))
            .map(String::as_str)
            .collect();
        missing.sort_unstable();
        missing.dedup();
        missing
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceTotals {
    pub members: BTreeMap<MemberId, MemberReference>,
    pub group: GroupReference,
    /// Keyed by map name, e.g. `id_map_members`.
    pub id_maps: BTreeMap<String, IdMap>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmapped_ids_are_sorted_and_unique() {
        let map = IdMap {
            entries: BTreeMap::from([("7".to_string(), Uuid::now_v7())]),
            source_ids: vec!["9".into(), "7".into(), "3".into(), "9".into()],
        };
        assert_eq!(map.unmapped(), vec!["3", "9"]);
    }

    #[test]
    fn missing_fields_deserialize_as_not_supplied() {
        let member = MemberId::new();
        let json = format!(
            r#"{{"members": {{"{member}": {{"savings": 1050}}}}, "group": {{"bank_cash": 99}}}}"#
        );
        let reference: ReferenceTotals = serde_json::from_str(&json).unwrap();
        let m = &reference.members[&member];
        assert_eq!(m.savings, Some(Money::from_minor(1_050)));
        assert_eq!(m.outstanding_loan, None);
        assert_eq!(reference.group.social_fund, None);
        assert!(reference.id_maps.is_empty());
    }
}
