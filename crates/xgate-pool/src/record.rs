use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use time::OffsetDateTime;

pub type TokenId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenClass {
    Basic,
    Super,
}

impl TokenClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenClass::Basic => "basic",
            TokenClass::Super => "super",
        }
    }
}

/// Soft class preference attached to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassHint {
    Basic,
    Super,
    SuperPreferred,
}

impl ClassHint {
    /// Quota bucket the selection tie-break should read. Only strict Super
    /// requests draw from the heavy budget.
    pub fn bucket(&self) -> QuotaBucket {
        match self {
            ClassHint::Super => QuotaBucket::Heavy,
            _ => QuotaBucket::Default,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum QuotaBucket {
    Default,
    Heavy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub remaining: i64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub window_reset_at: Option<OffsetDateTime>,
}

/// Persisted state for one upstream credential. The credential string
/// itself is the record key and never lives inside the record.
///
/// `extra` captures whatever fields a newer build (or an operator's tooling)
/// wrote, so a save round-trip preserves them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub class: TokenClass,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_used_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_refreshed_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_cleared_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_failure_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub last_failure_reason: Option<String>,
    #[serde(default)]
    pub quota: BTreeMap<QuotaBucket, QuotaSnapshot>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl TokenRecord {
    pub fn new(class: TokenClass) -> Self {
        Self {
            class,
            tags: BTreeSet::new(),
            note: String::new(),
            consecutive_failures: 0,
            disabled: false,
            last_used_at: None,
            last_refreshed_at: None,
            last_cleared_at: None,
            last_failure_at: None,
            last_failure_reason: None,
            quota: BTreeMap::new(),
            extra: Map::new(),
        }
    }

    /// Advisory remaining budget for a bucket; `None` when never observed.
    pub fn remaining(&self, bucket: QuotaBucket) -> Option<i64> {
        self.quota.get(&bucket).map(|snapshot| snapshot.remaining)
    }

    pub fn set_quota(
        &mut self,
        bucket: QuotaBucket,
        remaining: i64,
        window_reset_at: Option<OffsetDateTime>,
    ) {
        self.quota.insert(
            bucket,
            QuotaSnapshot {
                remaining,
                window_reset_at,
            },
        );
    }

    /// Clear transient state (failure accounting); quota snapshots stay.
    pub fn reset_transient(&mut self) {
        self.consecutive_failures = 0;
        self.last_failure_at = None;
        self.last_failure_reason = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_round_trips_unknown_fields() {
        let raw = json!({
            "class": "super",
            "tags": ["content-mode-enabled"],
            "consecutive_failures": 2,
            "quota": {"default": {"remaining": 40}},
            "operator_dashboard_color": "teal"
        });
        let record: TokenRecord = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(record.class, TokenClass::Super);
        assert_eq!(record.remaining(QuotaBucket::Default), Some(40));

        let back = serde_json::to_value(&record).unwrap();
        assert_eq!(back["operator_dashboard_color"], "teal");
    }

    #[test]
    fn hint_buckets() {
        assert_eq!(ClassHint::Super.bucket(), QuotaBucket::Heavy);
        assert_eq!(ClassHint::SuperPreferred.bucket(), QuotaBucket::Default);
        assert_eq!(ClassHint::Basic.bucket(), QuotaBucket::Default);
    }
}
