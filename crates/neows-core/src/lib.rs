//! Core record types for each NeoWs pipeline stage: raw feed, flattened, extracted.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub const CRATE_NAME: &str = "neows-core";

/// Status marker stamped on every archived raw document.
pub const RAW_STATUS: &str = "raw";

/// Raw feed payload exactly as the API returned it.
///
/// Kept untyped so the archive holds the full upstream document; the typed
/// view ([`RawFeed`]) is only built at the flattening boundary.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawFeedDocument(Map<String, Value>);

impl RawFeedDocument {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Accepts only JSON objects; anything else is not a feed document.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self(fields)),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Tag the document with `status` and `ingestion_date` before it is archived.
    pub fn annotate_for_archive(&mut self, ingestion_date: NaiveDate) {
        self.0
            .insert("status".to_string(), Value::String(RAW_STATUS.to_string()));
        self.0.insert(
            "ingestion_date".to_string(),
            Value::String(ingestion_date.format("%Y-%m-%d").to_string()),
        );
    }
}

/// Credential or password that must never end up in logs.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Decimal value the feed encodes as a string, occasionally as a bare number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumericText {
    Number(f64),
    Text(String),
}

impl NumericText {
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Text(text) => text.trim().parse().ok(),
        }
    }
}

impl fmt::Display for NumericText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::Text(text) => f.write_str(text),
        }
    }
}

/// Typed view of the feed: `{element_count, near_earth_objects: {date: [object]}}`.
///
/// Deserializing into this type is the required-field validation step.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawFeed {
    #[serde(default)]
    pub element_count: Option<u64>,
    pub near_earth_objects: BTreeMap<String, Vec<RawNearEarthObject>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawNearEarthObject {
    #[serde(deserialize_with = "integer_or_decimal_string")]
    pub neo_reference_id: i64,
    pub name: String,
    pub nasa_jpl_url: String,
    pub absolute_magnitude_h: f64,
    pub estimated_diameter: RawEstimatedDiameter,
    pub is_potentially_hazardous_asteroid: bool,
    pub close_approach_data: Vec<RawCloseApproach>,
    pub is_sentry_object: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawEstimatedDiameter {
    pub kilometers: RawDiameterRange,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawDiameterRange {
    pub estimated_diameter_min: f64,
    pub estimated_diameter_max: f64,
}

/// One approach event as delivered by the feed; numeric fields are still text.
/// Only the kilometre-based unit keys are read, other units are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCloseApproach {
    pub epoch_date_close_approach: i64,
    pub relative_velocity: RawRelativeVelocity,
    pub miss_distance: RawMissDistance,
    pub orbiting_body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRelativeVelocity {
    pub kilometers_per_second: NumericText,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMissDistance {
    pub kilometers: NumericText,
}

fn integer_or_decimal_string<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Integer(i64),
        Text(String),
    }

    match Repr::deserialize(deserializer)? {
        Repr::Integer(value) => Ok(value),
        Repr::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid integer id {text:?}"))),
    }
}

/// Persisted near-earth object, keyed by `reference_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearEarthObject {
    pub reference_id: i64,
    pub name: String,
    pub clean_name: String,
    pub jpl_url: String,
    pub absolute_magnitude: f64,
    pub diameter_min_km: f64,
    pub diameter_max_km: f64,
    pub is_potentially_hazardous: bool,
    pub is_sentry_object: bool,
}

/// Flattened object still carrying its unprocessed approach events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlatNearEarthObject {
    #[serde(flatten)]
    pub object: NearEarthObject,
    pub close_approaches: Vec<RawCloseApproach>,
}

/// Output of the flattening stage. Empty when the feed had no data.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct FlattenedFeed {
    pub count: Option<u64>,
    pub objects: Vec<FlatNearEarthObject>,
}

impl FlattenedFeed {
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Approach event split off its parent object; the orbiting body is still a name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseApproachRecord {
    pub reference_id: i64,
    pub approach_epoch_ms: i64,
    pub relative_velocity_kms: f64,
    pub miss_distance_km: f64,
    pub orbiting_body: String,
}

impl CloseApproachRecord {
    /// Absolute instant of closest approach; `None` if the epoch is out of range.
    pub fn approach_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.approach_epoch_ms)
    }
}

/// The two independent record sets handed to persistence.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ExtractedFeed {
    pub objects: Vec<NearEarthObject>,
    pub close_approaches: Vec<CloseApproachRecord>,
}
