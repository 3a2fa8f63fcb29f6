//! [`CalibrationTable`] – the shared calibration table of one arm.
//!
//! Readers (range limiting, drift checks, the CLI) take a cheap read lock.
//! Writes come from exactly two places: the calibrator commits whole records
//! and the drift monitor adjusts a homing offset. With a store attached,
//! every write goes to SQLite first, so the in-memory table never claims a
//! record the disk does not have. The write lock is held across the store
//! call so concurrent writers reach disk and memory in the same order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use armguard_types::{ArmError, CalibrationRecord, JointId};
use parking_lot::RwLock;
use tracing::info;

use crate::store::CalibrationStore;

#[derive(Debug, Clone, Copy)]
struct Entry {
    record: CalibrationRecord,
    /// When the record was committed or loaded. Not persisted.
    committed_at: Instant,
}

pub struct CalibrationTable {
    arm_id: String,
    entries: RwLock<BTreeMap<JointId, Entry>>,
    store: Option<Arc<CalibrationStore>>,
}

impl CalibrationTable {
    /// An empty table with no persistence.
    pub fn new(arm_id: impl Into<String>) -> Self {
        Self {
            arm_id: arm_id.into(),
            entries: RwLock::new(BTreeMap::new()),
            store: None,
        }
    }

    /// A table backed by `store`, pre-loaded with the arm's stored records.
    pub fn with_store(
        arm_id: impl Into<String>,
        store: Arc<CalibrationStore>,
    ) -> Result<Self, ArmError> {
        let arm_id = arm_id.into();
        let now = Instant::now();
        let entries: BTreeMap<JointId, Entry> = store
            .load(&arm_id)?
            .into_iter()
            .map(|(joint, record)| {
                (
                    joint,
                    Entry {
                        record,
                        committed_at: now,
                    },
                )
            })
            .collect();
        info!(arm_id = %arm_id, joints = entries.len(), "calibration table loaded");
        Ok(Self {
            arm_id,
            entries: RwLock::new(entries),
            store: Some(store),
        })
    }

    pub fn arm_id(&self) -> &str {
        &self.arm_id
    }

    pub fn get(&self, joint: JointId) -> Option<CalibrationRecord> {
        self.entries.read().get(&joint).map(|e| e.record)
    }

    /// Time since the joint's record was committed (or loaded at connect).
    pub fn age(&self, joint: JointId) -> Option<Duration> {
        self.entries.read().get(&joint).map(|e| e.committed_at.elapsed())
    }

    /// Replace the joint's record. The previous record is discarded.
    pub fn commit(&self, joint: JointId, record: CalibrationRecord) -> Result<(), ArmError> {
        let mut entries = self.entries.write();
        if let Some(store) = &self.store {
            store.save(&self.arm_id, joint, &record)?;
        }
        entries.insert(
            joint,
            Entry {
                record,
                committed_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Overwrite only the homing offset, leaving the range untouched.
    ///
    /// Returns the previous offset.
    ///
    /// # Errors
    ///
    /// [`ArmError::UnknownJoint`] when the joint has no record.
    pub fn set_homing_offset(&self, joint: JointId, homing_offset: i32) -> Result<i32, ArmError> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(&joint).ok_or(ArmError::UnknownJoint(joint))?;
        let updated = CalibrationRecord {
            homing_offset,
            ..entry.record
        };
        if let Some(store) = &self.store {
            store.save(&self.arm_id, joint, &updated)?;
        }
        let old = entry.record.homing_offset;
        entry.record = updated;
        Ok(old)
    }

    pub fn remove(&self, joint: JointId) -> Result<Option<CalibrationRecord>, ArmError> {
        let mut entries = self.entries.write();
        if let Some(store) = &self.store {
            store.delete(&self.arm_id, joint)?;
        }
        Ok(entries.remove(&joint).map(|e| e.record))
    }

    pub fn snapshot(&self) -> BTreeMap<JointId, CalibrationRecord> {
        self.entries
            .read()
            .iter()
            .map(|(joint, e)| (*joint, e.record))
            .collect()
    }

    /// Pretty JSON keyed by joint id, the same shape calibration files use.
    pub fn to_json(&self) -> Result<String, ArmError> {
        serde_json::to_string_pretty(&self.snapshot())
            .map_err(|e| ArmError::Storage(format!("could not serialise calibration: {e}")))
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armguard_types::Direction;

    fn record() -> CalibrationRecord {
        CalibrationRecord {
            homing_offset: 0,
            range_min: 1100,
            range_max: 2900,
            drive_mode: Direction::Normal,
        }
    }

    #[test]
    fn commit_and_get() {
        let table = CalibrationTable::new("left");
        assert!(table.get(JointId(1)).is_none());
        table.commit(JointId(1), record()).unwrap();
        assert_eq!(table.get(JointId(1)), Some(record()));
        assert!(table.age(JointId(1)).unwrap() < Duration::from_secs(1));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn set_homing_offset_leaves_range_alone() {
        let table = CalibrationTable::new("left");
        table.commit(JointId(2), record()).unwrap();

        let old = table.set_homing_offset(JointId(2), 150).unwrap();
        assert_eq!(old, 0);
        let updated = table.get(JointId(2)).unwrap();
        assert_eq!(updated.homing_offset, 150);
        assert_eq!((updated.range_min, updated.range_max), (1100, 2900));
    }

    #[test]
    fn set_homing_offset_needs_a_record() {
        let table = CalibrationTable::new("left");
        assert_eq!(
            table.set_homing_offset(JointId(3), 5).unwrap_err(),
            ArmError::UnknownJoint(JointId(3))
        );
    }

    #[test]
    fn writes_go_through_to_the_store() {
        let store = Arc::new(CalibrationStore::open_in_memory().unwrap());
        let table = CalibrationTable::with_store("right", Arc::clone(&store)).unwrap();
        table.commit(JointId(4), record()).unwrap();
        table.set_homing_offset(JointId(4), -20).unwrap();

        let reloaded = CalibrationTable::with_store("right", store).unwrap();
        assert_eq!(reloaded.get(JointId(4)).unwrap().homing_offset, -20);
    }

    #[test]
    fn remove_deletes_from_store() {
        let store = Arc::new(CalibrationStore::open_in_memory().unwrap());
        let table = CalibrationTable::with_store("right", Arc::clone(&store)).unwrap();
        table.commit(JointId(1), record()).unwrap();
        assert_eq!(table.remove(JointId(1)).unwrap(), Some(record()));
        assert!(store.load("right").unwrap().is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn concurrent_writers_leave_store_and_memory_in_agreement() {
        let store = Arc::new(CalibrationStore::open_in_memory().unwrap());
        let table = CalibrationTable::with_store("right", Arc::clone(&store)).unwrap();
        table.commit(JointId(1), record()).unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..200 {
                    let recalibrated = CalibrationRecord {
                        homing_offset: i,
                        range_min: 1000 + i,
                        ..record()
                    };
                    table.commit(JointId(1), recalibrated).unwrap();
                }
            });
            scope.spawn(|| {
                for i in 0..200 {
                    table.set_homing_offset(JointId(1), -i).unwrap();
                }
            });
        });

        let on_disk: BTreeMap<JointId, CalibrationRecord> =
            store.load("right").unwrap().into_iter().collect();
        assert_eq!(on_disk, table.snapshot());
    }

    #[test]
    fn json_is_keyed_by_joint() {
        let table = CalibrationTable::new("left");
        table.commit(JointId(5), record()).unwrap();
        let json = table.to_json().unwrap();
        assert!(json.contains("\"5\""));
        assert!(json.contains("\"range_max\": 2900"));
    }
}
