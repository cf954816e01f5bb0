//! Requisition number allocator
//!
//! Numbers are globally unique and strictly increasing, never reused even
//! across deletion and restore. The high-water mark lives in a small JSON
//! control file (`{"numero": <int>}`) that is advanced and flushed to disk
//! before an allocated number is handed out, so a crash between allocation
//! and first use can never cause reuse.

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::db::RequisitionStore;
use crate::error::{CoreError, Result};

/// High-water mark seeded when both the store and the control file are
/// absent; the first allocated number is SEED + 1 = 5000.
const SEED_NUMBER: i64 = 4999;

#[derive(Debug, Serialize, Deserialize)]
struct SequenceControl {
    numero: i64,
}

/// Issues unique, ordered requisition numbers, durable across restarts
pub struct SequenceAllocator {
    control_path: PathBuf,
    lock_path: PathBuf,
    // Serializes in-process allocations; the file lock covers other processes
    guard: Mutex<()>,
}

impl SequenceAllocator {
    /// Creates the allocator, seeding the control file if it does not exist
    pub fn new<P: AsRef<Path>>(control_path: P) -> Result<Self> {
        let control_path = control_path.as_ref().to_path_buf();
        let lock_path = control_path.with_extension("json.lock");
        if let Some(parent) = control_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let allocator = Self {
            control_path,
            lock_path,
            guard: Mutex::new(()),
        };

        if !allocator.control_path.exists() {
            allocator.write_control(SEED_NUMBER)?;
        }
        Ok(allocator)
    }

    /// Path to the control file (archived alongside the stores)
    pub fn control_path(&self) -> &Path {
        &self.control_path
    }

    fn acquire_lock(&self) -> Result<File> {
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.lock_path)?;
        lock_file
            .lock_exclusive()
            .map_err(|e| CoreError::Persistence(format!("sequence lock: {}", e)))?;
        Ok(lock_file)
    }

    fn read_control(&self) -> Result<i64> {
        let raw = fs::read_to_string(&self.control_path)?;
        let control: SequenceControl = serde_json::from_str(&raw)
            .map_err(|e| CoreError::Persistence(format!("sequence control file: {}", e)))?;
        Ok(control.numero)
    }

    // Temp file + rename so a crash mid-write never truncates the control value
    fn write_control(&self, value: i64) -> Result<()> {
        let tmp_path = self.control_path.with_extension("json.tmp");
        let json = serde_json::to_string(&SequenceControl { numero: value })?;
        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, &self.control_path)?;
        Ok(())
    }

    /// Allocates the next requisition number.
    ///
    /// The returned value is one past the highest of the store's maximum
    /// assigned number and the persisted control value, and is recorded
    /// durably before being returned.
    pub fn next_number(&self, store: &RequisitionStore) -> Result<i64> {
        let _guard = self.guard.lock().unwrap();
        let _lock = self.acquire_lock()?;

        let control = self.read_control().unwrap_or(SEED_NUMBER);
        let store_max = store.max_number()?.unwrap_or(SEED_NUMBER);
        let next = control.max(store_max) + 1;

        self.write_control(next)?;
        Ok(next)
    }

    /// Raises the control value to at least `floor` (restore/import path),
    /// so future allocations never collide with restored numbers
    pub fn reconcile(&self, floor: i64) -> Result<()> {
        let _guard = self.guard.lock().unwrap();
        let _lock = self.acquire_lock()?;

        let current = self.read_control().unwrap_or(SEED_NUMBER);
        if floor > current {
            self.write_control(floor)?;
        }
        Ok(())
    }

    /// Current high-water mark (diagnostics)
    pub fn current(&self) -> Result<i64> {
        let _guard = self.guard.lock().unwrap();
        self.read_control()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LineItem, Requisition};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn first_number_on_fresh_system_is_5000() {
        let dir = TempDir::new().unwrap();
        let store = RequisitionStore::open(dir.path().join("requisitions.db")).unwrap();
        let allocator = SequenceAllocator::new(dir.path().join("sequence.json")).unwrap();

        assert_eq!(allocator.next_number(&store).unwrap(), 5000);
        assert_eq!(allocator.next_number(&store).unwrap(), 5001);
    }

    #[test]
    fn allocation_survives_restart_without_reuse() {
        let dir = TempDir::new().unwrap();
        let store = RequisitionStore::open(dir.path().join("requisitions.db")).unwrap();
        let control = dir.path().join("sequence.json");

        {
            let allocator = SequenceAllocator::new(&control).unwrap();
            // Allocated but never used (simulated crash before save).
            assert_eq!(allocator.next_number(&store).unwrap(), 5000);
        }

        let allocator = SequenceAllocator::new(&control).unwrap();
        assert_eq!(allocator.next_number(&store).unwrap(), 5001);
    }

    #[test]
    fn store_contents_dominate_a_stale_control_file() {
        let dir = TempDir::new().unwrap();
        let store = RequisitionStore::open(dir.path().join("requisitions.db")).unwrap();
        let allocator = SequenceAllocator::new(dir.path().join("sequence.json")).unwrap();

        let req = Requisition::new(
            6000,
            "ACME".to_string(),
            "SELLER1".to_string(),
            vec![LineItem::new("VALVE".to_string(), 1.0)],
        );
        store.save(&req).unwrap();

        assert_eq!(allocator.next_number(&store).unwrap(), 6001);
    }

    #[test]
    fn reconcile_never_lowers_the_mark() {
        let dir = TempDir::new().unwrap();
        let store = RequisitionStore::open(dir.path().join("requisitions.db")).unwrap();
        let allocator = SequenceAllocator::new(dir.path().join("sequence.json")).unwrap();

        allocator.reconcile(7000).unwrap();
        allocator.reconcile(5500).unwrap();
        assert_eq!(allocator.next_number(&store).unwrap(), 7001);
    }

    #[test]
    fn concurrent_allocations_are_strictly_increasing_without_duplicates() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RequisitionStore::open(dir.path().join("requisitions.db")).unwrap());
        let allocator = Arc::new(SequenceAllocator::new(dir.path().join("sequence.json")).unwrap());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = Arc::clone(&store);
            let allocator = Arc::clone(&allocator);
            handles.push(std::thread::spawn(move || {
                (0..25)
                    .map(|_| allocator.next_number(&store).unwrap())
                    .collect::<Vec<i64>>()
            }));
        }

        let mut all: Vec<i64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();

        // 100 calls: 5000..=5099, no duplicates, no gaps.
        let expected: Vec<i64> = (5000..5100).collect();
        assert_eq!(all, expected);
    }
}
