//! Calibration persistence.
//!
//! Stores one calibration table per arm in a local SQLite database. Only the
//! four [`CalibrationRecord`] fields are kept; telemetry history and baseline
//! currents are session-scoped and never written here.
//!
//! # Storage layout
//!
//! | column        | type    | description                              |
//! |---------------|---------|------------------------------------------|
//! | arm_id        | TEXT    | Arm the record belongs to                |
//! | joint_id      | INTEGER | Bus id of the joint                      |
//! | homing_offset | INTEGER | Signed offset, position-sensor units     |
//! | range_min     | INTEGER | Lower bound, absolute sensor units       |
//! | range_max     | INTEGER | Upper bound, absolute sensor units       |
//! | drive_mode    | INTEGER | `0` normal, `1` inverted                 |
//!
//! Primary key: `(arm_id, joint_id)`.
//!
//! # Example
//!
//! ```rust
//! use armguard_memory::store::CalibrationStore;
//! use armguard_types::{CalibrationRecord, Direction, JointId};
//!
//! let store = CalibrationStore::open_in_memory().unwrap();
//! let record = CalibrationRecord {
//!     homing_offset: -12,
//!     range_min: 900,
//!     range_max: 3100,
//!     drive_mode: Direction::Normal,
//! };
//! store.save("left", JointId(1), &record).unwrap();
//!
//! assert_eq!(store.load("left").unwrap().get(&JointId(1)), Some(&record));
//! ```

use std::collections::BTreeMap;

use armguard_types::{ArmError, CalibrationRecord, Direction, JointId};
use parking_lot::Mutex;
use rusqlite::{Connection, params};
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Stored joint id {0} is out of range")]
    BadJointId(i64),
}

impl From<StoreError> for ArmError {
    fn from(err: StoreError) -> Self {
        ArmError::Storage(err.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CalibrationStore
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite-backed calibration tables, shareable across threads.
pub struct CalibrationStore {
    conn: Mutex<Connection>,
}

impl CalibrationStore {
    /// Open (or create) a persistent SQLite database at `path`.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open(path)?),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.lock().execute_batch(
            "CREATE TABLE IF NOT EXISTS calibrations (
                arm_id        TEXT    NOT NULL,
                joint_id      INTEGER NOT NULL,
                homing_offset INTEGER NOT NULL,
                range_min     INTEGER NOT NULL,
                range_max     INTEGER NOT NULL,
                drive_mode    INTEGER NOT NULL,
                PRIMARY KEY (arm_id, joint_id)
            );",
        )?;
        Ok(())
    }

    /// Insert or supersede the record of one joint.
    pub fn save(
        &self,
        arm_id: &str,
        joint: JointId,
        record: &CalibrationRecord,
    ) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO calibrations
                 (arm_id, joint_id, homing_offset, range_min, range_max, drive_mode)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                arm_id,
                joint.0,
                record.homing_offset,
                record.range_min,
                record.range_max,
                record.drive_mode.drive_mode(),
            ],
        )?;
        Ok(())
    }

    /// Every stored record of `arm_id`, keyed by joint.
    pub fn load(&self, arm_id: &str) -> Result<BTreeMap<JointId, CalibrationRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT joint_id, homing_offset, range_min, range_max, drive_mode
             FROM calibrations
             WHERE arm_id = ?1
             ORDER BY joint_id ASC",
        )?;
        let rows = stmt.query_map(params![arm_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i32>(1)?,
                row.get::<_, i32>(2)?,
                row.get::<_, i32>(3)?,
                row.get::<_, u8>(4)?,
            ))
        })?;

        let mut table = BTreeMap::new();
        for row in rows {
            let (joint_id, homing_offset, range_min, range_max, drive_mode) = row?;
            let joint = u8::try_from(joint_id).map_err(|_| StoreError::BadJointId(joint_id))?;
            table.insert(
                JointId(joint),
                CalibrationRecord {
                    homing_offset,
                    range_min,
                    range_max,
                    drive_mode: Direction::from_drive_mode(drive_mode),
                },
            );
        }
        Ok(table)
    }

    /// Returns `true` if a row was removed.
    pub fn delete(&self, arm_id: &str, joint: JointId) -> Result<bool, StoreError> {
        let n = self.conn.lock().execute(
            "DELETE FROM calibrations WHERE arm_id = ?1 AND joint_id = ?2",
            params![arm_id, joint.0],
        )?;
        Ok(n > 0)
    }

    /// Ids of every arm with at least one stored record.
    pub fn arms(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT DISTINCT arm_id FROM calibrations ORDER BY arm_id")?;
        let arms = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(arms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(offset: i32) -> CalibrationRecord {
        CalibrationRecord {
            homing_offset: offset,
            range_min: 1000,
            range_max: 3000,
            drive_mode: Direction::Inverted,
        }
    }

    #[test]
    fn save_supersedes_in_place() {
        let store = CalibrationStore::open_in_memory().unwrap();
        store.save("left", JointId(2), &record(10)).unwrap();
        store.save("left", JointId(2), &record(-30)).unwrap();

        let table = store.load("left").unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table[&JointId(2)], record(-30));
    }

    #[test]
    fn arms_are_isolated() {
        let store = CalibrationStore::open_in_memory().unwrap();
        store.save("left", JointId(1), &record(1)).unwrap();
        store.save("right", JointId(1), &record(2)).unwrap();

        assert_eq!(store.load("left").unwrap()[&JointId(1)].homing_offset, 1);
        assert_eq!(store.load("right").unwrap()[&JointId(1)].homing_offset, 2);
        assert_eq!(store.arms().unwrap(), vec!["left".to_string(), "right".to_string()]);
        assert!(store.load("nobody").unwrap().is_empty());
    }

    #[test]
    fn delete_reports_whether_a_row_existed() {
        let store = CalibrationStore::open_in_memory().unwrap();
        store.save("left", JointId(1), &record(0)).unwrap();
        assert!(store.delete("left", JointId(1)).unwrap());
        assert!(!store.delete("left", JointId(1)).unwrap());
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.db");
        let path = path.to_str().unwrap();

        {
            let store = CalibrationStore::open(path).unwrap();
            store.save("follower", JointId(6), &record(44)).unwrap();
        }
        let store = CalibrationStore::open(path).unwrap();
        assert_eq!(store.load("follower").unwrap()[&JointId(6)], record(44));
    }

    #[test]
    fn storage_errors_map_to_arm_error() {
        let err: ArmError = StoreError::BadJointId(900).into();
        assert!(matches!(err, ArmError::Storage(msg) if msg.contains("900")));
    }
}
