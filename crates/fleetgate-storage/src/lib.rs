use chrono::{DateTime, TimeZone, Utc};
use fleetgate_core::{format_timestamp, Detection, TelemetryRecord};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const TELEMETRY_SCHEMA_VERSION: i64 = 1;

/// Workers and the supervisor share one database file.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp out of range: {0}")]
    Timestamp(i64),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// Append-only telemetry and detection history.
pub trait TelemetryStore {
    fn append(&self, record: &TelemetryRecord) -> Result<(), StorageError>;

    /// Every sensor id that has at least one telemetry record, sorted.
    fn list_distinct_sensor_ids(&self) -> Result<Vec<String>, StorageError>;

    /// Records of `sensor_id` with `start <= timestamp <= end`, in insertion order.
    fn query_by_id_and_range(
        &self,
        sensor_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TelemetryRecord>, StorageError>;

    fn append_detection(&self, detection: &Detection) -> Result<(), StorageError>;
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > TELEMETRY_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: TELEMETRY_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_telemetry.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn detections_for_sensor(&self, sensor_id: &str) -> Result<Vec<Detection>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT sensor_id, label, score, bbox_json, image, ts_ms
            FROM detections
            WHERE sensor_id = ?1
            ORDER BY id ASC
            ",
        )?;

        let rows = statement.query_map([sensor_id], |row| {
            let bbox_json: String = row.get(3)?;
            let bbox: [f64; 4] = serde_json::from_str(&bbox_json).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    3,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })?;
            let timestamp = from_millis(row.get(5)?).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    5,
                    rusqlite::types::Type::Integer,
                    Box::new(err),
                )
            })?;
            Ok(Detection {
                sensor_id: row.get(0)?,
                label: row.get(1)?,
                score: row.get(2)?,
                bbox,
                image: row.get(4)?,
                timestamp,
            })
        })?;

        let mut detections = Vec::new();
        for row in rows {
            detections.push(row?);
        }
        Ok(detections)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }
}

impl TelemetryStore for SqliteStore {
    fn append(&self, record: &TelemetryRecord) -> Result<(), StorageError> {
        let fields_json = serde_json::to_string(&record.fields)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;

        self.conn.execute(
            "
            INSERT INTO telemetry (sensor_id, ts_ms, ts, fields_json)
            VALUES (?1, ?2, ?3, ?4)
            ",
            params![
                record.sensor_id,
                record.timestamp.timestamp_millis(),
                format_timestamp(&record.timestamp),
                fields_json,
            ],
        )?;
        Ok(())
    }

    fn list_distinct_sensor_ids(&self) -> Result<Vec<String>, StorageError> {
        let mut statement = self
            .conn
            .prepare("SELECT DISTINCT sensor_id FROM telemetry ORDER BY sensor_id ASC")?;
        let rows = statement.query_map([], |row| row.get(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    fn query_by_id_and_range(
        &self,
        sensor_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TelemetryRecord>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT sensor_id, ts_ms, fields_json
            FROM telemetry
            WHERE sensor_id = ?1 AND ts_ms >= ?2 AND ts_ms <= ?3
            ORDER BY id ASC
            ",
        )?;

        let rows = statement.query_map(
            params![sensor_id, start.timestamp_millis(), end.timestamp_millis()],
            |row| {
                let timestamp = from_millis(row.get(1)?).map_err(|err| {
                    rusqlite::Error::FromSqlConversionFailure(
                        1,
                        rusqlite::types::Type::Integer,
                        Box::new(err),
                    )
                })?;
                let fields_json: String = row.get(2)?;
                let fields: BTreeMap<String, Value> = serde_json::from_str(&fields_json)
                    .map_err(|err| {
                        rusqlite::Error::FromSqlConversionFailure(
                            2,
                            rusqlite::types::Type::Text,
                            Box::new(err),
                        )
                    })?;
                Ok(TelemetryRecord {
                    sensor_id: row.get(0)?,
                    timestamp,
                    fields,
                })
            },
        )?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn append_detection(&self, detection: &Detection) -> Result<(), StorageError> {
        let bbox_json = serde_json::to_string(&detection.bbox)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;

        self.conn.execute(
            "
            INSERT INTO detections (sensor_id, label, score, bbox_json, image, ts_ms, ts)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                detection.sensor_id,
                detection.label,
                detection.score,
                bbox_json,
                detection.image,
                detection.timestamp.timestamp_millis(),
                format_timestamp(&detection.timestamp),
            ],
        )?;
        Ok(())
    }
}

fn from_millis(value: i64) -> Result<DateTime<Utc>, StorageError> {
    Utc.timestamp_millis_opt(value)
        .single()
        .ok_or(StorageError::Timestamp(value))
}
