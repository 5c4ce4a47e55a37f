use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::date_util::watermark;
use crate::error::{Error, Result};

/// Backfill depth used when neither a lower bound nor a history limit is set.
const DEFAULT_BACKFILL_DAYS: i64 = 730;

/// One logical upstream feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKey {
    Sales,
    Returns,
    Logistics,
    Penalties,
    AdvertisingCost,
    StorageCost,
    AcceptanceCost,
    Stocks,
    OrderStats,
    Supplies,
    Catalog,
}

impl DatasetKey {
    pub const ALL: [DatasetKey; 11] = [
        DatasetKey::Sales,
        DatasetKey::Returns,
        DatasetKey::Logistics,
        DatasetKey::Penalties,
        DatasetKey::AdvertisingCost,
        DatasetKey::StorageCost,
        DatasetKey::AcceptanceCost,
        DatasetKey::Stocks,
        DatasetKey::OrderStats,
        DatasetKey::Supplies,
        DatasetKey::Catalog,
    ];

    /// Datasets derived from the shared finance report stream.
    pub const FINANCE: [DatasetKey; 4] = [
        DatasetKey::Sales,
        DatasetKey::Returns,
        DatasetKey::Logistics,
        DatasetKey::Penalties,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKey::Sales => "sales",
            DatasetKey::Returns => "returns",
            DatasetKey::Logistics => "logistics",
            DatasetKey::Penalties => "penalties",
            DatasetKey::AdvertisingCost => "advertising_cost",
            DatasetKey::StorageCost => "storage_cost",
            DatasetKey::AcceptanceCost => "acceptance_cost",
            DatasetKey::Stocks => "stocks",
            DatasetKey::OrderStats => "order_stats",
            DatasetKey::Supplies => "supplies",
            DatasetKey::Catalog => "catalog",
        }
    }

    pub fn is_finance(&self) -> bool {
        Self::FINANCE.contains(self)
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for DatasetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        DatasetKey::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::Config(format!("unknown dataset: {s}")))
    }
}

/// Backfill tuning for one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillPolicy {
    pub enabled: bool,
    /// Days per backward step for daily-chunked backfill.
    pub chunk_days: u32,
    pub lower_bound: Option<NaiveDate>,
}

/// Immutable per-dataset tuning, supplied once per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetPolicy {
    pub priority_days: u32,
    pub refresh_overlap_days: u32,
    pub catchup_chunk_days: u32,
    /// `None` means unbounded history.
    pub max_history_days: Option<u32>,
    pub refresh_every_minutes: u32,
    #[serde(default)]
    pub backfill: Option<BackfillPolicy>,
}

impl DatasetPolicy {
    /// Built-in defaults tuned to each feed's upstream rate limits.
    pub fn default_for(key: DatasetKey) -> Self {
        let finance_backfill = Some(BackfillPolicy {
            enabled: true,
            chunk_days: 7,
            lower_bound: None,
        });
        match key {
            DatasetKey::Sales
            | DatasetKey::Returns
            | DatasetKey::Logistics
            | DatasetKey::Penalties => Self {
                priority_days: 7,
                refresh_overlap_days: 3,
                catchup_chunk_days: 28,
                max_history_days: Some(90),
                refresh_every_minutes: 60,
                backfill: finance_backfill,
            },
            DatasetKey::AdvertisingCost => Self {
                priority_days: 7,
                refresh_overlap_days: 3,
                catchup_chunk_days: 31,
                max_history_days: Some(180),
                refresh_every_minutes: 60,
                backfill: None,
            },
            DatasetKey::StorageCost | DatasetKey::AcceptanceCost => Self {
                priority_days: 7,
                refresh_overlap_days: 2,
                catchup_chunk_days: 8,
                max_history_days: Some(90),
                refresh_every_minutes: 240,
                backfill: None,
            },
            DatasetKey::Stocks => Self {
                priority_days: 1,
                refresh_overlap_days: 1,
                catchup_chunk_days: 1,
                max_history_days: Some(1),
                refresh_every_minutes: 120,
                backfill: None,
            },
            DatasetKey::OrderStats => Self {
                priority_days: 7,
                refresh_overlap_days: 2,
                catchup_chunk_days: 7,
                max_history_days: Some(365),
                refresh_every_minutes: 120,
                backfill: None,
            },
            DatasetKey::Supplies => Self {
                priority_days: 14,
                refresh_overlap_days: 7,
                catchup_chunk_days: 30,
                max_history_days: Some(365),
                refresh_every_minutes: 240,
                backfill: None,
            },
            DatasetKey::Catalog => Self {
                priority_days: 1,
                refresh_overlap_days: 1,
                catchup_chunk_days: 1,
                max_history_days: Some(1),
                refresh_every_minutes: 720,
                backfill: None,
            },
        }
    }

    pub fn backfill_enabled(&self) -> bool {
        self.backfill.as_ref().is_some_and(|b| b.enabled)
    }

    /// Earliest date backfill may reach: the configured lower bound, else the
    /// history limit, else a fixed default depth.
    pub fn backfill_lower_bound(&self, today: NaiveDate) -> NaiveDate {
        if let Some(bound) = self.backfill.as_ref().and_then(|b| b.lower_bound) {
            return bound;
        }
        let wm = watermark(today);
        match self.max_history_days {
            Some(days) => wm - Duration::days(i64::from(days)) + Duration::days(1),
            None => wm - Duration::days(DEFAULT_BACKFILL_DAYS),
        }
    }

    fn validate(&self, key: DatasetKey) -> Result<()> {
        if self.priority_days == 0 || self.refresh_overlap_days == 0 || self.catchup_chunk_days == 0
        {
            return Err(Error::Config(format!(
                "{key}: priority_days, refresh_overlap_days and catchup_chunk_days must be positive"
            )));
        }
        if let Some(backfill) = &self.backfill {
            if backfill.chunk_days == 0 {
                return Err(Error::Config(format!(
                    "{key}: backfill chunk_days must be positive"
                )));
            }
        }
        Ok(())
    }
}

/// One policy per dataset; read-only after construction.
#[derive(Debug, Clone)]
pub struct PolicySet {
    policies: Vec<DatasetPolicy>,
}

impl Default for PolicySet {
    fn default() -> Self {
        Self {
            policies: DatasetKey::ALL
                .iter()
                .map(|k| DatasetPolicy::default_for(*k))
                .collect(),
        }
    }
}

impl PolicySet {
    pub fn get(&self, key: DatasetKey) -> &DatasetPolicy {
        &self.policies[key.index()]
    }

    /// Replace the policy for one dataset.
    pub fn with(mut self, key: DatasetKey, policy: DatasetPolicy) -> Result<Self> {
        policy.validate(key)?;
        self.policies[key.index()] = policy;
        Ok(self)
    }

    /// Parse overrides from a JSON object keyed by dataset name. Datasets not
    /// mentioned keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let overrides: std::collections::HashMap<String, DatasetPolicy> =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        let mut set = Self::default();
        for (name, policy) in overrides {
            let key: DatasetKey = name.parse()?;
            set = set.with(key, policy)?;
        }
        Ok(set)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("{}: {e}", path.as_ref().display())))?;
        Self::from_json(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_dataset_key_round_trip_names() {
        for key in DatasetKey::ALL {
            assert_eq!(key.as_str().parse::<DatasetKey>().unwrap(), key);
        }
        assert!("nope".parse::<DatasetKey>().is_err());
    }

    #[test]
    fn test_policy_set_covers_every_dataset() {
        let set = PolicySet::default();
        assert_eq!(set.get(DatasetKey::Sales).priority_days, 7);
        assert!(set.get(DatasetKey::Sales).backfill_enabled());
        assert!(!set.get(DatasetKey::Stocks).backfill_enabled());
    }

    #[test]
    fn test_from_json_overrides_one_dataset() {
        let set = PolicySet::from_json(
            r#"{"order_stats": {
                "priority_days": 3,
                "refresh_overlap_days": 1,
                "catchup_chunk_days": 5,
                "max_history_days": null,
                "refresh_every_minutes": 10
            }}"#,
        )
        .unwrap();
        let policy = set.get(DatasetKey::OrderStats);
        assert_eq!(policy.priority_days, 3);
        assert_eq!(policy.max_history_days, None);
        assert_eq!(policy.backfill, None);
        assert_eq!(set.get(DatasetKey::Sales).priority_days, 7);
    }

    #[test]
    fn test_from_json_rejects_zero_chunk() {
        let err = PolicySet::from_json(
            r#"{"sales": {
                "priority_days": 3,
                "refresh_overlap_days": 1,
                "catchup_chunk_days": 0,
                "max_history_days": 30,
                "refresh_every_minutes": 10
            }}"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_backfill_lower_bound_resolution() {
        let today = d(2024, 2, 7);
        let mut policy = DatasetPolicy::default_for(DatasetKey::Sales);
        policy.max_history_days = Some(10);
        assert_eq!(policy.backfill_lower_bound(today), d(2024, 1, 28));

        policy.max_history_days = None;
        assert_eq!(policy.backfill_lower_bound(today), d(2022, 2, 6));

        policy.backfill = Some(BackfillPolicy {
            enabled: true,
            chunk_days: 7,
            lower_bound: Some(d(2023, 1, 2)),
        });
        assert_eq!(policy.backfill_lower_bound(today), d(2023, 1, 2));
    }
}
