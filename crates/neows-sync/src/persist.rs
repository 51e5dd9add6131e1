use neows_core::ExtractedFeed;
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};

use crate::store::{NeoStore, StoreError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PersistReport {
    pub objects_upserted: usize,
    pub approaches_inserted: usize,
    pub approaches_skipped: usize,
}

/// Write one run's records: upsert objects, then resolve each approach's
/// orbiting body and append the approach.
///
/// Each statement commits on its own, so an error part-way leaves earlier
/// rows in place. Approaches whose body cannot be resolved to one id are
/// logged and skipped.
pub async fn persist_records(
    store: &mut dyn NeoStore,
    feed: &ExtractedFeed,
) -> Result<PersistReport, StoreError> {
    let span = info_span!(
        "persist",
        objects = feed.objects.len(),
        approaches = feed.close_approaches.len()
    );
    async {
        let mut report = PersistReport::default();

        for object in &feed.objects {
            store.upsert_near_earth_object(object).await?;
            report.objects_upserted += 1;
        }
        info!(count = report.objects_upserted, "near-earth objects upserted");

        for approach in &feed.close_approaches {
            match resolve_orbiting_body(store, &approach.orbiting_body).await? {
                Some(body_id) => {
                    store.insert_close_approach(approach, body_id).await?;
                    report.approaches_inserted += 1;
                }
                None => {
                    error!(
                        reference_id = approach.reference_id,
                        orbiting_body = %approach.orbiting_body,
                        "could not resolve orbiting body id; skipping close approach"
                    );
                    report.approaches_skipped += 1;
                }
            }
        }
        info!(
            inserted = report.approaches_inserted,
            skipped = report.approaches_skipped,
            "close approaches stored"
        );
        Ok::<_, StoreError>(report)
    }
    .instrument(span)
    .await
}

/// Body id via insert-or-fetch, falling back to a single plain lookup.
async fn resolve_orbiting_body(
    store: &mut dyn NeoStore,
    body: &str,
) -> Result<Option<i32>, StoreError> {
    let ids = store.insert_or_fetch_orbiting_body(body).await?;
    if let [id] = ids[..] {
        return Ok(Some(id));
    }

    warn!(body, rows = ids.len(), "insert-or-fetch did not yield one id; retrying lookup");
    let ids = store.lookup_orbiting_body(body).await?;
    match ids[..] {
        [id] => Ok(Some(id)),
        _ => Ok(None),
    }
}
