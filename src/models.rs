use crate::stats::conversion_rate;
use chrono::{DateTime, NaiveDate, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::{fmt, str::FromStr};
use thiserror::Error;

pub const SALES_COLLECTION: &str = "sales-data";

/// Raw counters for one user on one calendar day.
///
/// The conversion rate is derived from `knocks` and `rgus` on every read and
/// is never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStats {
    #[serde(default)]
    pub knocks: u64,
    #[serde(default)]
    pub effective_interactions: u64,
    #[serde(default)]
    pub rgus: u64,
}

impl DailyStats {
    pub fn new(knocks: u64, effective_interactions: u64, rgus: u64) -> Self {
        Self {
            knocks,
            effective_interactions,
            rgus,
        }
    }

    /// Percentage of knocks that produced an RGU, rounded to 2 decimals.
    pub fn conversion_rate(&self) -> f64 {
        conversion_rate(self.rgus, self.knocks)
    }

    pub fn is_active(&self) -> bool {
        self.knocks > 0 || self.effective_interactions > 0 || self.rgus > 0
    }

    pub fn get(&self, field: CounterField) -> u64 {
        match field {
            CounterField::Knocks => self.knocks,
            CounterField::EffectiveInteractions => self.effective_interactions,
            CounterField::Rgus => self.rgus,
        }
    }

    pub fn set(&mut self, field: CounterField, value: u64) {
        match field {
            CounterField::Knocks => self.knocks = value,
            CounterField::EffectiveInteractions => self.effective_interactions = value,
            CounterField::Rgus => self.rgus = value,
        }
    }

    /// Applies `delta` to one counter, clamping at zero.
    pub fn adjusted(mut self, field: CounterField, delta: i64) -> Self {
        let current = self.get(field);
        let next = if delta >= 0 {
            current.saturating_add(delta.unsigned_abs())
        } else {
            current.saturating_sub(delta.unsigned_abs())
        };
        self.set(field, next);
        self
    }
}

impl Serialize for DailyStats {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("DailyStats", 4)?;
        state.serialize_field("knocks", &self.knocks)?;
        state.serialize_field("effectiveInteractions", &self.effective_interactions)?;
        state.serialize_field("rgus", &self.rgus)?;
        state.serialize_field("conversionRate", &self.conversion_rate())?;
        state.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CounterField {
    Knocks,
    EffectiveInteractions,
    Rgus,
}

impl CounterField {
    pub const ALL: [CounterField; 3] = [
        CounterField::Knocks,
        CounterField::EffectiveInteractions,
        CounterField::Rgus,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CounterField::Knocks => "knocks",
            CounterField::EffectiveInteractions => "effectiveInteractions",
            CounterField::Rgus => "rgus",
        }
    }
}

impl fmt::Display for CounterField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("field must be 'knocks', 'effectiveInteractions' or 'rgus', got '{0}'")]
pub struct UnknownCounterField(pub String);

impl FromStr for CounterField {
    type Err = UnknownCounterField;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        CounterField::ALL
            .into_iter()
            .find(|field| field.as_str() == value)
            .ok_or_else(|| UnknownCounterField(value.to_string()))
    }
}

/// Identifies one user's record for one calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CounterKey {
    pub user_id: String,
    pub date: NaiveDate,
}

impl CounterKey {
    pub fn new(user_id: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            user_id: user_id.into(),
            date,
        }
    }

    pub fn date_key(&self) -> String {
        date_key(self.date)
    }

    pub fn document_id(&self) -> String {
        format!("{}-{}", self.user_id, self.date_key())
    }
}

pub fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Persisted shape of a per-user, per-day record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SalesDocument {
    pub user_id: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub knocks: u64,
    #[serde(default)]
    pub effective_interactions: u64,
    #[serde(default)]
    pub rgus: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl SalesDocument {
    pub fn stats(&self) -> DailyStats {
        DailyStats::new(self.knocks, self.effective_interactions, self.rgus)
    }
}

#[derive(Debug, Deserialize)]
pub struct AdjustRequest {
    pub field: String,
    #[serde(default = "default_delta")]
    pub delta: i64,
}

fn default_delta() -> i64 {
    1
}

#[derive(Debug, Deserialize)]
pub struct TeamQuery {
    pub date: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodayResponse {
    pub user_id: String,
    pub date: String,
    pub stats: DailyStats,
    pub persistent: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamResponse {
    pub date: String,
    #[serde(flatten)]
    pub team: crate::stats::TeamStats,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub date: String,
    pub persistent: bool,
}
