//! Feed flattening, name normalisation and close-approach extraction.

use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use neows_core::{
    CloseApproachRecord, ExtractedFeed, FlatNearEarthObject, FlattenedFeed, NearEarthObject,
    NumericText, RawCloseApproach, RawFeed, RawFeedDocument, RawNearEarthObject,
};
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "neows-transform";

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("feed payload failed validation: {0}")]
    InvalidPayload(#[from] serde_json::Error),
    #[error("object {reference_id}: {field} value {value:?} is not a number")]
    InvalidNumber {
        reference_id: i64,
        field: &'static str,
        value: String,
    },
    #[error("object {reference_id}: close approach epoch {epoch_ms} is out of range")]
    InvalidTimestamp { reference_id: i64, epoch_ms: i64 },
}

/// Flatten the date-bucketed feed into one list of objects.
///
/// A missing or empty document is not an error: it flattens to an empty feed.
/// Buckets are visited in ascending date order and their keys are dropped.
pub fn flatten_feed(document: Option<&RawFeedDocument>) -> Result<FlattenedFeed, TransformError> {
    let Some(document) = document.filter(|doc| !doc.is_empty()) else {
        warn!("no data to transform");
        return Ok(FlattenedFeed::default());
    };

    let feed: RawFeed = serde_json::from_value(document.clone().into_value())?;
    let objects: Vec<FlatNearEarthObject> = feed
        .near_earth_objects
        .into_values()
        .flatten()
        .map(flatten_object)
        .collect();

    info!(
        element_count = ?feed.element_count,
        objects = objects.len(),
        "flattened feed, close approaches still embedded"
    );
    Ok(FlattenedFeed {
        count: feed.element_count,
        objects,
    })
}

fn flatten_object(raw: RawNearEarthObject) -> FlatNearEarthObject {
    FlatNearEarthObject {
        object: NearEarthObject {
            reference_id: raw.neo_reference_id,
            clean_name: raw.name.clone(),
            name: raw.name,
            jpl_url: raw.nasa_jpl_url,
            absolute_magnitude: raw.absolute_magnitude_h,
            diameter_min_km: raw.estimated_diameter.kilometers.estimated_diameter_min,
            diameter_max_km: raw.estimated_diameter.kilometers.estimated_diameter_max,
            is_potentially_hazardous: raw.is_potentially_hazardous_asteroid,
            is_sentry_object: raw.is_sentry_object,
        },
        close_approaches: raw.close_approach_data,
    }
}

fn designation_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\d{4} \w+").expect("designation pattern compiles"))
}

/// Catalog designation embedded in `name` ("YYYY XXnn"), or `name` unchanged.
///
/// `"465633 (2009 JR5)"` becomes `"2009 JR5"`; `"Ceres"` stays `"Ceres"`.
/// `\w` and `\d` are Unicode-aware, so non-ASCII designation suffixes match too.
pub fn clean_name(name: &str) -> String {
    designation_pattern()
        .find(name)
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| name.to_string())
}

pub fn normalize_names(objects: &mut [FlatNearEarthObject]) {
    for flat in objects.iter_mut() {
        flat.object.clean_name = clean_name(&flat.object.name);
        debug!(
            reference_id = flat.object.reference_id,
            name = %flat.object.name,
            clean_name = %flat.object.clean_name,
            "normalized name"
        );
    }
}

/// Split approach events off their parents.
///
/// Objects come back without their approach lists; approaches keep input order.
pub fn extract_close_approaches(feed: FlattenedFeed) -> Result<ExtractedFeed, TransformError> {
    let mut extracted = ExtractedFeed {
        objects: Vec::with_capacity(feed.objects.len()),
        close_approaches: Vec::new(),
    };

    for flat in feed.objects {
        let reference_id = flat.object.reference_id;
        for raw in flat.close_approaches {
            extracted
                .close_approaches
                .push(approach_record(reference_id, raw)?);
        }
        extracted.objects.push(flat.object);
    }

    info!(
        objects = extracted.objects.len(),
        close_approaches = extracted.close_approaches.len(),
        "extracted close approaches"
    );
    Ok(extracted)
}

fn approach_record(
    reference_id: i64,
    raw: RawCloseApproach,
) -> Result<CloseApproachRecord, TransformError> {
    let record = CloseApproachRecord {
        reference_id,
        approach_epoch_ms: raw.epoch_date_close_approach,
        relative_velocity_kms: coerce(
            reference_id,
            "relative_velocity.kilometers_per_second",
            &raw.relative_velocity.kilometers_per_second,
        )?,
        miss_distance_km: coerce(reference_id, "miss_distance.kilometers", &raw.miss_distance.kilometers)?,
        orbiting_body: raw.orbiting_body,
    };
    if record.approach_at().is_none() {
        return Err(TransformError::InvalidTimestamp {
            reference_id,
            epoch_ms: record.approach_epoch_ms,
        });
    }
    Ok(record)
}

fn coerce(reference_id: i64, field: &'static str, value: &NumericText) -> Result<f64, TransformError> {
    value.to_f64().ok_or_else(|| TransformError::InvalidNumber {
        reference_id,
        field,
        value: value.to_string(),
    })
}

/// Flatten, normalize and extract in one go.
pub fn transform_document(document: Option<&RawFeedDocument>) -> Result<ExtractedFeed, TransformError> {
    let mut flattened = flatten_feed(document)?;
    normalize_names(&mut flattened.objects);
    extract_close_approaches(flattened)
}

/// Load a saved feed document (e.g. an archived `raw-neo/<date>.json`).
pub fn load_feed_document(path: impl AsRef<Path>) -> Result<Option<RawFeedDocument>> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    Ok(RawFeedDocument::from_value(value))
}
