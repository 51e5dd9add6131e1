//! In-memory `NeoStore` used by the protocol and pipeline tests.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use neows_core::{CloseApproachRecord, NearEarthObject};
use uuid::Uuid;

use crate::store::{NeoStore, StoreError};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredApproach {
    pub id: Uuid,
    pub reference_id: i64,
    pub approach_epoch_ms: i64,
    pub relative_velocity_kms: f64,
    pub miss_distance_km: f64,
    pub orbiting_body_id: i32,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    pub schema_bootstraps: usize,
    pub objects: BTreeMap<i64, NearEarthObject>,
    pub bodies: BTreeMap<i32, String>,
    pub approaches: Vec<StoredApproach>,
    pub lookups: usize,
    unresolvable: HashSet<String>,
    ambiguous: HashSet<String>,
    raced: HashSet<String>,
    fail_approach_insert_after: Option<usize>,
}

impl MemoryStore {
    /// Both resolution statements come back empty for `body`.
    pub fn with_unresolvable(mut self, body: &str) -> Self {
        self.unresolvable.insert(body.to_string());
        self
    }

    /// Both resolution statements return two ids for `body`.
    pub fn with_ambiguous(mut self, body: &str) -> Self {
        self.ambiguous.insert(body.to_string());
        self
    }

    /// Insert-or-fetch returns nothing (as if a concurrent writer won) but
    /// the row exists for the follow-up lookup.
    pub fn with_raced_insert(mut self, body: &str) -> Self {
        self.raced.insert(body.to_string());
        self
    }

    pub fn with_failing_approach_insert_after(mut self, inserted: usize) -> Self {
        self.fail_approach_insert_after = Some(inserted);
        self
    }

    pub fn body_names(&self) -> Vec<&str> {
        self.bodies.values().map(String::as_str).collect()
    }

    pub fn body_name(&self, id: i32) -> Option<&str> {
        self.bodies.get(&id).map(String::as_str)
    }

    fn body_id(&self, body: &str) -> Option<i32> {
        self.bodies
            .iter()
            .find(|(_, name)| name.as_str() == body)
            .map(|(id, _)| *id)
    }

    fn ensure_body(&mut self, body: &str) -> i32 {
        if let Some(id) = self.body_id(body) {
            return id;
        }
        let id = self.bodies.keys().next_back().copied().unwrap_or(0) + 1;
        self.bodies.insert(id, body.to_string());
        id
    }
}

#[async_trait]
impl NeoStore for MemoryStore {
    async fn ensure_schema(&mut self) -> Result<(), StoreError> {
        self.schema_bootstraps += 1;
        Ok(())
    }

    async fn upsert_near_earth_object(&mut self, object: &NearEarthObject) -> Result<(), StoreError> {
        self.objects.insert(object.reference_id, object.clone());
        Ok(())
    }

    async fn insert_or_fetch_orbiting_body(&mut self, body: &str) -> Result<Vec<i32>, StoreError> {
        if self.unresolvable.contains(body) {
            return Ok(Vec::new());
        }
        if self.ambiguous.contains(body) {
            let id = self.ensure_body(body);
            return Ok(vec![id, id]);
        }
        if self.raced.contains(body) {
            self.ensure_body(body);
            return Ok(Vec::new());
        }
        Ok(vec![self.ensure_body(body)])
    }

    async fn lookup_orbiting_body(&mut self, body: &str) -> Result<Vec<i32>, StoreError> {
        self.lookups += 1;
        if self.unresolvable.contains(body) {
            return Ok(Vec::new());
        }
        let ids: Vec<i32> = self.body_id(body).into_iter().collect();
        if self.ambiguous.contains(body) {
            return Ok(ids.iter().chain(ids.iter()).copied().collect());
        }
        Ok(ids)
    }

    async fn insert_close_approach(
        &mut self,
        approach: &CloseApproachRecord,
        orbiting_body_id: i32,
    ) -> Result<Uuid, StoreError> {
        if self
            .fail_approach_insert_after
            .is_some_and(|limit| self.approaches.len() >= limit)
        {
            return Err(StoreError::Database(sqlx::Error::Protocol(
                "simulated connection loss".into(),
            )));
        }
        if !self.objects.contains_key(&approach.reference_id) {
            return Err(StoreError::Database(sqlx::Error::Protocol(format!(
                "foreign key violation: reference_id {}",
                approach.reference_id
            ))));
        }
        if !self.bodies.contains_key(&orbiting_body_id) {
            return Err(StoreError::Database(sqlx::Error::Protocol(format!(
                "foreign key violation: orbiting_body_id {orbiting_body_id}"
            ))));
        }
        let id = Uuid::new_v4();
        self.approaches.push(StoredApproach {
            id,
            reference_id: approach.reference_id,
            approach_epoch_ms: approach.approach_epoch_ms,
            relative_velocity_kms: approach.relative_velocity_kms,
            miss_distance_km: approach.miss_distance_km,
            orbiting_body_id,
        });
        Ok(id)
    }
}
