//! Postgres persistence for objects, orbiting bodies and close approaches.

use async_trait::async_trait;
use neows_core::{CloseApproachRecord, NearEarthObject};
use sqlx::{Connection, PgConnection, Row};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::DatabaseConfig;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid schema name {0:?}: expected [A-Za-z_][A-Za-z0-9_]*")]
    InvalidSchema(String),
    #[error("close approach for {reference_id} has out-of-range epoch {epoch_ms}")]
    InvalidTimestamp { reference_id: i64, epoch_ms: i64 },
}

/// Write surface the persistence protocol runs against.
#[async_trait]
pub trait NeoStore: Send {
    /// Idempotent table + index bootstrap.
    async fn ensure_schema(&mut self) -> Result<(), StoreError>;

    /// Insert, or replace every mutable field of the row with the same `reference_id`.
    async fn upsert_near_earth_object(&mut self, object: &NearEarthObject) -> Result<(), StoreError>;

    /// Single-statement insert-if-absent returning the body id. An empty result
    /// means a concurrent writer won the race and the caller should look it up.
    async fn insert_or_fetch_orbiting_body(&mut self, body: &str) -> Result<Vec<i32>, StoreError>;

    async fn lookup_orbiting_body(&mut self, body: &str) -> Result<Vec<i32>, StoreError>;

    async fn insert_close_approach(
        &mut self,
        approach: &CloseApproachRecord,
        orbiting_body_id: i32,
    ) -> Result<Uuid, StoreError>;
}

const CREATE_TABLES: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS orbiting_bodies (
        id SERIAL PRIMARY KEY,
        body TEXT NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS near_earth_objects (
        reference_id BIGINT PRIMARY KEY,
        name TEXT NOT NULL,
        clean_name TEXT NOT NULL,
        jpl_url TEXT NOT NULL,
        absolute_magnitude DOUBLE PRECISION NOT NULL,
        diameter_min_km DOUBLE PRECISION NOT NULL,
        diameter_max_km DOUBLE PRECISION NOT NULL,
        is_potentially_hazardous BOOLEAN NOT NULL,
        is_sentry_object BOOLEAN NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS close_approaches (
        id UUID PRIMARY KEY,
        reference_id BIGINT NOT NULL REFERENCES near_earth_objects (reference_id),
        approach_epoch_ms BIGINT NOT NULL,
        approach_at TIMESTAMPTZ NOT NULL,
        relative_velocity_kms DOUBLE PRECISION NOT NULL,
        miss_distance_km DOUBLE PRECISION NOT NULL,
        orbiting_body_id INTEGER NOT NULL REFERENCES orbiting_bodies (id)
    )
    "#,
];

const CREATE_INDEXES: [&str; 5] = [
    "CREATE INDEX IF NOT EXISTS idx_close_approaches_reference_id ON close_approaches (reference_id)",
    "CREATE INDEX IF NOT EXISTS idx_close_approaches_orbiting_body_id ON close_approaches (orbiting_body_id)",
    "CREATE INDEX IF NOT EXISTS idx_close_approaches_approach_at ON close_approaches (approach_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_near_earth_objects_hazardous ON near_earth_objects (reference_id) WHERE is_potentially_hazardous",
    "CREATE INDEX IF NOT EXISTS idx_close_approaches_at_miss_distance ON close_approaches (approach_at, miss_distance_km)",
];

const UPSERT_NEAR_EARTH_OBJECT: &str = r#"
    INSERT INTO near_earth_objects (
        reference_id, name, clean_name, jpl_url, absolute_magnitude,
        diameter_min_km, diameter_max_km, is_potentially_hazardous, is_sentry_object
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
    ON CONFLICT (reference_id) DO UPDATE
       SET name = EXCLUDED.name,
           clean_name = EXCLUDED.clean_name,
           jpl_url = EXCLUDED.jpl_url,
           absolute_magnitude = EXCLUDED.absolute_magnitude,
           diameter_min_km = EXCLUDED.diameter_min_km,
           diameter_max_km = EXCLUDED.diameter_max_km,
           is_potentially_hazardous = EXCLUDED.is_potentially_hazardous,
           is_sentry_object = EXCLUDED.is_sentry_object
"#;

const INSERT_OR_FETCH_ORBITING_BODY: &str = r#"
    WITH inserted AS (
        INSERT INTO orbiting_bodies (body)
        VALUES ($1)
        ON CONFLICT (body) DO NOTHING
        RETURNING id
    )
    SELECT id FROM inserted
    UNION ALL
    SELECT id FROM orbiting_bodies WHERE body = $1
"#;

const INSERT_CLOSE_APPROACH: &str = r#"
    INSERT INTO close_approaches (
        id, reference_id, approach_epoch_ms, approach_at,
        relative_velocity_kms, miss_distance_km, orbiting_body_id
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7)
"#;

/// Plain SQL identifier check used before a schema name is spliced into DDL.
pub fn validate_schema_name(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidSchema(name.to_string()))
    }
}

/// One Postgres connection, owned for the length of a run.
pub struct PgStore {
    conn: PgConnection,
    schema: Option<String>,
}

impl PgStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        if let Some(schema) = &config.schema {
            validate_schema_name(schema)?;
        }
        let options = config.connect_options()?;
        let conn = PgConnection::connect_with(&options).await?;
        info!(schema = ?config.schema, "connected to postgres");
        Ok(Self {
            conn,
            schema: config.schema.clone(),
        })
    }

    pub async fn close(self) -> Result<(), StoreError> {
        self.conn.close().await?;
        debug!("postgres connection closed");
        Ok(())
    }
}

#[async_trait]
impl NeoStore for PgStore {
    async fn ensure_schema(&mut self) -> Result<(), StoreError> {
        if let Some(schema) = &self.schema {
            validate_schema_name(schema)?;
            sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
                .execute(&mut self.conn)
                .await?;
            sqlx::query(&format!("SET search_path TO {schema}"))
                .execute(&mut self.conn)
                .await?;
        }
        for statement in CREATE_TABLES.iter().chain(CREATE_INDEXES.iter()) {
            sqlx::query(statement).execute(&mut self.conn).await?;
        }
        info!(schema = ?self.schema, "schema ready");
        Ok(())
    }

    async fn upsert_near_earth_object(&mut self, object: &NearEarthObject) -> Result<(), StoreError> {
        sqlx::query(UPSERT_NEAR_EARTH_OBJECT)
            .bind(object.reference_id)
            .bind(&object.name)
            .bind(&object.clean_name)
            .bind(&object.jpl_url)
            .bind(object.absolute_magnitude)
            .bind(object.diameter_min_km)
            .bind(object.diameter_max_km)
            .bind(object.is_potentially_hazardous)
            .bind(object.is_sentry_object)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    async fn insert_or_fetch_orbiting_body(&mut self, body: &str) -> Result<Vec<i32>, StoreError> {
        let rows = sqlx::query(INSERT_OR_FETCH_ORBITING_BODY)
            .bind(body)
            .fetch_all(&mut self.conn)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<i32, _>("id").map_err(StoreError::from))
            .collect()
    }

    async fn lookup_orbiting_body(&mut self, body: &str) -> Result<Vec<i32>, StoreError> {
        let rows = sqlx::query("SELECT id FROM orbiting_bodies WHERE body = $1")
            .bind(body)
            .fetch_all(&mut self.conn)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<i32, _>("id").map_err(StoreError::from))
            .collect()
    }

    async fn insert_close_approach(
        &mut self,
        approach: &CloseApproachRecord,
        orbiting_body_id: i32,
    ) -> Result<Uuid, StoreError> {
        let approach_at = approach
            .approach_at()
            .ok_or(StoreError::InvalidTimestamp {
                reference_id: approach.reference_id,
                epoch_ms: approach.approach_epoch_ms,
            })?;
        let id = Uuid::new_v4();
        sqlx::query(INSERT_CLOSE_APPROACH)
            .bind(id)
            .bind(approach.reference_id)
            .bind(approach.approach_epoch_ms)
            .bind(approach_at)
            .bind(approach.relative_velocity_kms)
            .bind(approach.miss_distance_km)
            .bind(orbiting_body_id)
            .execute(&mut self.conn)
            .await?;
        Ok(id)
    }
}
