//! Chart of accounts.
//!
//! Group accounts are fixed and provisioned once per group. Member accounts
//! are provisioned lazily, keyed by (member, account kind), the first time a
//! posting needs them, and only for members registered with the chart.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use vikoba_core::{DomainError, Entity, GroupId, MemberId};

use crate::error::{LedgerError, LedgerResult};

/// Side of a journal line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Debit,
    Credit,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Debit => Side::Credit,
            Side::Credit => Side::Debit,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Debit => "debit",
            Side::Credit => "credit",
        }
    }
}

impl FromStr for Side {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debit" => Ok(Side::Debit),
            "credit" => Ok(Side::Credit),
            other => Err(DomainError::validation(format!("unknown side: {other}"))),
        }
    }
}

/// Account category (determines normal balance side).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountCategory {
    Asset,
    Liability,
    Fund,
    Income,
    Expense,
}

impl AccountCategory {
    /// Side on which this category's balance grows.
    pub fn normal_side(self) -> Side {
        match self {
            AccountCategory::Asset | AccountCategory::Expense => Side::Debit,
            AccountCategory::Liability | AccountCategory::Fund | AccountCategory::Income => {
                Side::Credit
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccountCategory::Asset => "asset",
            AccountCategory::Liability => "liability",
            AccountCategory::Fund => "fund",
            AccountCategory::Income => "income",
            AccountCategory::Expense => "expense",
        }
    }
}

/// Group-level (organisation) accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GroupAccount {
    BankCash,
    InterestIncome,
    PenaltyIncome,
    SocialFund,
    AdminFund,
}

impl GroupAccount {
    pub const ALL: [GroupAccount; 5] = [
        GroupAccount::BankCash,
        GroupAccount::InterestIncome,
        GroupAccount::PenaltyIncome,
        GroupAccount::SocialFund,
        GroupAccount::AdminFund,
    ];

    pub fn code(self) -> &'static str {
        match self {
            GroupAccount::BankCash => "BANK_CASH",
            GroupAccount::InterestIncome => "INTEREST_INCOME",
            GroupAccount::PenaltyIncome => "PENALTY_INCOME",
            GroupAccount::SocialFund => "SOCIAL_FUND",
            GroupAccount::AdminFund => "ADMIN_FUND",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            GroupAccount::BankCash => "Bank cash",
            GroupAccount::InterestIncome => "Interest income",
            GroupAccount::PenaltyIncome => "Penalty income",
            GroupAccount::SocialFund => "Social fund",
            GroupAccount::AdminFund => "Admin fund",
        }
    }

    pub fn category(self) -> AccountCategory {
        match self {
            GroupAccount::BankCash => AccountCategory::Asset,
            GroupAccount::InterestIncome | GroupAccount::PenaltyIncome => AccountCategory::Income,
            GroupAccount::SocialFund | GroupAccount::AdminFund => AccountCategory::Fund,
        }
    }
}

/// Member-scoped sub-accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MemberAccount {
    Savings,
    LoansReceivable,
    PenaltyReceivable,
    /// Overpayments held for the member.
    StandingCredit,
}

impl MemberAccount {
    pub const ALL: [MemberAccount; 4] = [
        MemberAccount::Savings,
        MemberAccount::LoansReceivable,
        MemberAccount::PenaltyReceivable,
        MemberAccount::StandingCredit,
    ];

    pub fn code(self) -> &'static str {
        match self {
            MemberAccount::Savings => "MEMBER_SAVINGS",
            MemberAccount::LoansReceivable => "LOANS_RECEIVABLE",
            MemberAccount::PenaltyReceivable => "PENALTY_RECEIVABLE",
            MemberAccount::StandingCredit => "STANDING_CREDIT",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MemberAccount::Savings => "Member savings",
            MemberAccount::LoansReceivable => "Loans receivable",
            MemberAccount::PenaltyReceivable => "Penalty receivable",
            MemberAccount::StandingCredit => "Standing credit",
        }
    }

    pub fn category(self) -> AccountCategory {
        match self {
            MemberAccount::Savings | MemberAccount::StandingCredit => AccountCategory::Liability,
            MemberAccount::LoansReceivable | MemberAccount::PenaltyReceivable => {
                AccountCategory::Asset
            }
        }
    }
}

/// Key identifying an account within a group's chart.
///
/// Rendered as its code: `BANK_CASH`, or `MEMBER_SAVINGS:<member uuid>` for
/// member accounts. Serialized as that string so it can key JSON maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AccountKey {
    Group(GroupAccount),
    Member {
        member: MemberId,
        account: MemberAccount,
    },
}

impl AccountKey {
    pub fn bank_cash() -> Self {
        AccountKey::Group(GroupAccount::BankCash)
    }

    pub fn interest_income() -> Self {
        AccountKey::Group(GroupAccount::InterestIncome)
    }

    pub fn penalty_income() -> Self {
        AccountKey::Group(GroupAccount::PenaltyIncome)
    }

    pub fn social_fund() -> Self {
        AccountKey::Group(GroupAccount::SocialFund)
    }

    pub fn admin_fund() -> Self {
        AccountKey::Group(GroupAccount::AdminFund)
    }

    pub fn member(member: MemberId, account: MemberAccount) -> Self {
        AccountKey::Member { member, account }
    }

    pub fn member_savings(member: MemberId) -> Self {
        Self::member(member, MemberAccount::Savings)
    }

    pub fn loans_receivable(member: MemberId) -> Self {
        Self::member(member, MemberAccount::LoansReceivable)
    }

    pub fn penalty_receivable(member: MemberId) -> Self {
        Self::member(member, MemberAccount::PenaltyReceivable)
    }

    pub fn standing_credit(member: MemberId) -> Self {
        Self::member(member, MemberAccount::StandingCredit)
    }

    pub fn member_id(&self) -> Option<MemberId> {
        match self {
            AccountKey::Group(_) => None,
            AccountKey::Member { member, .. } => Some(*member),
        }
    }

    pub fn category(&self) -> AccountCategory {
        match self {
            AccountKey::Group(g) => g.category(),
            AccountKey::Member { account, .. } => account.category(),
        }
    }

    /// Balance may never drop below zero: a loan or an approved penalty
    /// cannot be settled past nothing.
    pub fn has_zero_floor(&self) -> bool {
        matches!(
            self,
            AccountKey::Member {
                account: MemberAccount::LoansReceivable | MemberAccount::PenaltyReceivable,
                ..
            }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            AccountKey::Group(g) => g.name(),
            AccountKey::Member { account, .. } => account.name(),
        }
    }
}

impl core::fmt::Display for AccountKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AccountKey::Group(g) => f.write_str(g.code()),
            AccountKey::Member { member, account } => write!(f, "{}:{}", account.code(), member),
        }
    }
}

impl FromStr for AccountKey {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(g) = GroupAccount::ALL.iter().find(|g| g.code() == s) {
            return Ok(AccountKey::Group(*g));
        }
        let (code, member) = s
            .split_once(':')
            .ok_or_else(|| DomainError::invalid_id(format!("unknown account code: {s}")))?;
        let account = MemberAccount::ALL
            .iter()
            .find(|a| a.code() == code)
            .ok_or_else(|| DomainError::invalid_id(format!("unknown account code: {code}")))?;
        Ok(AccountKey::Member {
            member: member.parse()?,
            account: *account,
        })
    }
}

impl Serialize for AccountKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AccountKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A provisioned ledger account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub key: AccountKey,
    pub code: String,
    pub name: String,
    pub category: AccountCategory,
}

impl Account {
    pub fn for_key(key: AccountKey) -> Self {
        Self {
            key,
            code: key.to_string(),
            name: key.name().to_string(),
            category: key.category(),
        }
    }
}

impl Entity for Account {
    type Id = AccountKey;

    fn id(&self) -> &Self::Id {
        &self.key
    }
}

/// A group's chart of accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartOfAccounts {
    group_id: GroupId,
    accounts: BTreeMap<AccountKey, Account>,
    members: BTreeSet<MemberId>,
}

impl ChartOfAccounts {
    /// Chart with every group-level account provisioned and no members.
    pub fn standard(group_id: GroupId) -> Self {
        let accounts = GroupAccount::ALL
            .iter()
            .map(|g| {
                let key = AccountKey::Group(*g);
                (key, Account::for_key(key))
            })
            .collect();
        Self {
            group_id,
            accounts,
            members: BTreeSet::new(),
        }
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    /// Register a member; returns `false` if already registered.
    pub fn register_member(&mut self, member: MemberId) -> bool {
        self.members.insert(member)
    }

    pub fn is_member(&self, member: MemberId) -> bool {
        self.members.contains(&member)
    }

    pub fn members(&self) -> impl Iterator<Item = MemberId> + '_ {
        self.members.iter().copied()
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Account> + '_ {
        self.accounts.values()
    }

    /// Resolve an already provisioned account.
    pub fn resolve(&self, key: &AccountKey) -> LedgerResult<&Account> {
        self.accounts
            .get(key)
            .ok_or(LedgerError::UnknownAccount(*key))
    }

    /// Whether `resolve_or_provision` would succeed for `key`.
    pub fn can_resolve(&self, key: &AccountKey) -> bool {
        match key {
            AccountKey::Group(_) => self.accounts.contains_key(key),
            AccountKey::Member { member, .. } => self.members.contains(member),
        }
    }

    /// Resolve `key`, provisioning the member account on first use.
    ///
    /// Idempotent: repeated calls return the same account and never create a
    /// second one.
    pub fn resolve_or_provision(&mut self, key: &AccountKey) -> LedgerResult<&Account> {
        if !self.can_resolve(key) {
            return Err(LedgerError::UnknownAccount(*key));
        }
        Ok(self
            .accounts
            .entry(*key)
            .or_insert_with(|| Account::for_key(*key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_chart_has_group_accounts() {
        let chart = ChartOfAccounts::standard(GroupId::new());
        for g in GroupAccount::ALL {
            let account = chart.resolve(&AccountKey::Group(g)).unwrap();
            assert_eq!(account.code, g.code());
        }
        assert_eq!(chart.accounts().count(), GroupAccount::ALL.len());
    }

    #[test]
    fn member_accounts_require_registration() {
        let mut chart = ChartOfAccounts::standard(GroupId::new());
        let member = MemberId::new();
        let key = AccountKey::member_savings(member);

        assert_eq!(
            chart.resolve_or_provision(&key).unwrap_err(),
            LedgerError::UnknownAccount(key)
        );

        chart.register_member(member);
        assert!(chart.resolve(&key).is_err(), "not provisioned until first use");
        let account = chart.resolve_or_provision(&key).unwrap().clone();
        assert_eq!(account.category, AccountCategory::Liability);

        // Second resolution yields the same account, no duplicate.
        let again = chart.resolve_or_provision(&key).unwrap().clone();
        assert_eq!(account, again);
        assert_eq!(Entity::id(&again), &key);
        assert_eq!(chart.accounts().count(), GroupAccount::ALL.len() + 1);
    }

    #[test]
    fn account_key_codes_parse_back() {
        let member = MemberId::new();
        for key in [
            AccountKey::bank_cash(),
            AccountKey::admin_fund(),
            AccountKey::loans_receivable(member),
            AccountKey::standing_credit(member),
        ] {
            assert_eq!(key.to_string().parse::<AccountKey>().unwrap(), key);
        }
        assert!("NOT_AN_ACCOUNT".parse::<AccountKey>().is_err());
        assert!("MEMBER_SAVINGS:nope".parse::<AccountKey>().is_err());
    }

    #[test]
    fn normal_sides_follow_category() {
        assert_eq!(AccountKey::bank_cash().category().normal_side(), Side::Debit);
        assert_eq!(AccountKey::social_fund().category().normal_side(), Side::Credit);
        assert_eq!(AccountKey::interest_income().category().normal_side(), Side::Credit);
        let m = MemberId::new();
        assert_eq!(AccountKey::member_savings(m).category().normal_side(), Side::Credit);
        assert_eq!(AccountKey::loans_receivable(m).category().normal_side(), Side::Debit);
    }

    #[test]
    fn account_keys_serialize_as_codes() {
        let json = serde_json::to_string(&AccountKey::bank_cash()).unwrap();
        assert_eq!(json, "\"BANK_CASH\"");
        let key: AccountKey = serde_json::from_str(&json).unwrap();
        assert_eq!(key, AccountKey::bank_cash());
    }
}
