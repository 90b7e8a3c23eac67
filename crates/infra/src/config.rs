//! Configuration loading and representation.
//!
//! Defaults, then an optional JSON file, then `VIKOBA_*` environment
//! variables. Later sources override earlier ones field by field.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use vikoba_accounting::{ExcessPaymentPolicy, PenaltyDebitTarget, RulePolicy};
use vikoba_core::Money;
use vikoba_observability::LogFormat;

pub const ENV_RECONCILIATION_TOLERANCE: &str = "VIKOBA_RECONCILIATION_TOLERANCE";
pub const ENV_DECLARATION_TOLERANCE: &str = "VIKOBA_DECLARATION_TOLERANCE";
pub const ENV_PENALTY_DEBIT: &str = "VIKOBA_PENALTY_DEBIT";
pub const ENV_EXCESS_PAYMENT: &str = "VIKOBA_EXCESS_PAYMENT";
pub const ENV_LOG_FORMAT: &str = "VIKOBA_LOG_FORMAT";
pub const ENV_DATABASE_URL: &str = "VIKOBA_DATABASE_URL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value `{value}` for {name}: {reason}")]
    InvalidVar {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Ledger configuration.
///
/// Tolerances are in minor units in JSON; environment variables take decimal
/// strings such as `0.01`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Allowed |derived - reference| before a discrepancy is reported.
    pub reconciliation_tolerance: Money,
    pub declaration_tolerance: Money,
    pub penalty_debit: PenaltyDebitTarget,
    pub excess_payment: ExcessPaymentPolicy,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        let policy = RulePolicy::default();
        Self {
            reconciliation_tolerance: Money::ZERO,
            declaration_tolerance: policy.declaration_tolerance,
            penalty_debit: policy.penalty_debit,
            excess_payment: policy.excess_payment,
            log_format: LogFormat::default(),
            database_url: None,
        }
    }
}

fn parse_var<T>(name: &'static str, value: String) -> Result<T, ConfigError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    value.parse::<T>().map_err(|e| ConfigError::InvalidVar {
        name,
        reason: e.to_string(),
        value,
    })
}

impl LedgerConfig {
    pub fn rule_policy(&self) -> RulePolicy {
        RulePolicy {
            declaration_tolerance: self.declaration_tolerance,
            penalty_debit: self.penalty_debit,
            excess_payment: self.excess_payment,
        }
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Read a JSON file; missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// File (if given) then environment.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match file {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };
        base.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup` (an environment-like source).
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_RECONCILIATION_TOLERANCE) {
            self.reconciliation_tolerance = parse_var(ENV_RECONCILIATION_TOLERANCE, v)?;
        }
        if let Some(v) = lookup(ENV_DECLARATION_TOLERANCE) {
            self.declaration_tolerance = parse_var(ENV_DECLARATION_TOLERANCE, v)?;
        }
        if let Some(v) = lookup(ENV_PENALTY_DEBIT) {
            self.penalty_debit = parse_var(ENV_PENALTY_DEBIT, v)?;
        }
        if let Some(v) = lookup(ENV_EXCESS_PAYMENT) {
            self.excess_payment = parse_var(ENV_EXCESS_PAYMENT, v)?;
        }
        if let Some(v) = lookup(ENV_LOG_FORMAT) {
            self.log_format = parse_var(ENV_LOG_FORMAT, v)?;
        }
        if let Some(v) = lookup(ENV_DATABASE_URL).or_else(|| lookup("DATABASE_URL")) {
            self.database_url = Some(v);
        }

        for tolerance in [self.reconciliation_tolerance, self.declaration_tolerance] {
            if tolerance.is_negative() {
                return Err(ConfigError::InvalidVar {
                    name: "tolerance",
                    value: tolerance.to_string(),
                    reason: "must not be negative".to_string(),
                });
            }
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_match_business_policy() {
        let config = LedgerConfig::default();
        assert_eq!(config.reconciliation_tolerance, Money::ZERO);
        assert_eq!(config.declaration_tolerance, Money::from_minor(1));
        assert_eq!(config.excess_payment, ExcessPaymentPolicy::Reject);
        assert_eq!(config.penalty_debit, PenaltyDebitTarget::MemberSavings);
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = LedgerConfig::default()
            .with_overrides(env(&[
                (ENV_RECONCILIATION_TOLERANCE, "0.01"),
                (ENV_EXCESS_PAYMENT, "standing_credit"),
                (ENV_PENALTY_DEBIT, "penalty_receivable"),
                (ENV_LOG_FORMAT, "pretty"),
                ("DATABASE_URL", "postgres://localhost/vikoba"),
            ]))
            .unwrap();

        assert_eq!(config.reconciliation_tolerance, Money::from_minor(1));
        assert_eq!(config.excess_payment, ExcessPaymentPolicy::StandingCredit);
        assert_eq!(config.rule_policy().penalty_debit, PenaltyDebitTarget::PenaltyReceivable);
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/vikoba"));
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = LedgerConfig::default()
            .with_overrides(env(&[(ENV_DECLARATION_TOLERANCE, "0.001")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVar { name, .. } if name == ENV_DECLARATION_TOLERANCE));

        let negative = LedgerConfig::default()
            .with_overrides(env(&[(ENV_RECONCILIATION_TOLERANCE, "-1")]))
            .unwrap_err();
        assert!(matches!(negative, ConfigError::InvalidVar { .. }));
    }

    #[test]
    fn json_file_keeps_defaults_for_missing_fields() {
        let config: LedgerConfig =
            serde_json::from_str(r#"{"reconciliation_tolerance": 5, "excess_payment": "standing_credit"}"#).unwrap();
        assert_eq!(config.reconciliation_tolerance, Money::from_minor(5));
        assert_eq!(config.excess_payment, ExcessPaymentPolicy::StandingCredit);
        assert_eq!(config.declaration_tolerance, Money::from_minor(1));
    }
}
