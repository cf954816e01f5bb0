//! SQLite-backed requisition store
//!
//! Single source of truth for the requisition lifecycle. Records are
//! written whole, keyed by number, as upserts; line items travel as one
//! JSON column and must round-trip exactly. A corrupt items blob degrades
//! to an empty list with the `items_corrupt` sentinel set instead of
//! failing the whole load.

use chrono::{DateTime, Utc};
use log::warn;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{CoreError, Result};
use crate::models::{LineItem, Requisition, RequisitionStatus};

/// Persistent store for requisitions
pub struct RequisitionStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl RequisitionStore {
    /// Opens (or creates) the store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(include_str!("requisitions_schema.sql"))?;

        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    /// Path to the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse_timestamp(s: Option<String>) -> Option<DateTime<Utc>> {
        s.as_deref().and_then(|s| {
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
        })
    }

    fn row_to_requisition(
        number: i64,
        client: String,
        seller: String,
        created_at: String,
        status: String,
        items_json: String,
        seller_notes: String,
        buyer_in_charge: Option<String>,
        accepted_at: Option<String>,
        responded_at: Option<String>,
        refusal_reason: Option<String>,
        buyer_notes: Option<String>,
    ) -> Requisition {
        // Data-loss-tolerant read: a corrupt blob must not take the whole
        // load down, but callers need to be able to tell it apart from a
        // legitimately empty requisition.
        let (items, items_corrupt) = match serde_json::from_str::<Vec<LineItem>>(&items_json) {
            Ok(items) => (items, false),
            Err(e) => {
                warn!("requisition {}: unparseable items blob ({})", number, e);
                (Vec::new(), true)
            }
        };

        Requisition {
            number,
            client,
            seller,
            created_at: Self::parse_timestamp(Some(created_at)).unwrap_or_else(Utc::now),
            status: RequisitionStatus::parse(&status),
            items,
            seller_notes,
            buyer_in_charge,
            accepted_at: Self::parse_timestamp(accepted_at),
            responded_at: Self::parse_timestamp(responded_at),
            refusal_reason,
            buyer_notes,
            items_corrupt,
        }
    }

    fn query_one(conn: &Connection, number: i64) -> Result<Option<Requisition>> {
        let row = conn
            .query_row(
                "SELECT number, client, seller, created_at, status, items, seller_notes,
                        buyer_in_charge, accepted_at, responded_at, refusal_reason, buyer_notes
                 FROM requisitions WHERE number = ?1",
                [number],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, Option<String>>(8)?,
                        row.get::<_, Option<String>>(9)?,
                        row.get::<_, Option<String>>(10)?,
                        row.get::<_, Option<String>>(11)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.map(
            |(number, client, seller, created_at, status, items, notes, buyer, acc, resp, reason, obs)| {
                Self::row_to_requisition(
                    number, client, seller, created_at, status, items, notes, buyer, acc, resp,
                    reason, obs,
                )
            },
        ))
    }

    fn upsert(conn: &Connection, req: &Requisition) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO requisitions
             (number, client, seller, created_at, status, items, seller_notes,
              buyer_in_charge, accepted_at, responded_at, refusal_reason, buyer_notes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                req.number,
                req.client,
                req.seller,
                req.created_at.to_rfc3339(),
                req.status.as_str(),
                serde_json::to_string(&req.items)?,
                req.seller_notes,
                req.buyer_in_charge,
                req.accepted_at.map(|t| t.to_rfc3339()),
                req.responded_at.map(|t| t.to_rfc3339()),
                req.refusal_reason,
                req.buyer_notes,
            ],
        )?;
        Ok(())
    }

    /// Writes the full record, keyed by number, as an upsert
    pub fn save(&self, req: &Requisition) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        Self::upsert(&conn, req)
    }

    /// Fetches one requisition by number
    pub fn get(&self, number: i64) -> Result<Option<Requisition>> {
        let conn = self.conn.lock().unwrap();
        Self::query_one(&conn, number)
    }

    /// Loads every requisition, ordered by number
    pub fn load_all(&self) -> Result<Vec<Requisition>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT number, client, seller, created_at, status, items, seller_notes,
                    buyer_in_charge, accepted_at, responded_at, refusal_reason, buyer_notes
             FROM requisitions ORDER BY number",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, Option<String>>(9)?,
                row.get::<_, Option<String>>(10)?,
                row.get::<_, Option<String>>(11)?,
            ))
        })?;

        let mut requisitions = Vec::new();
        for row in rows {
            let (number, client, seller, created_at, status, items, notes, buyer, acc, resp, reason, obs) =
                row?;
            requisitions.push(Self::row_to_requisition(
                number, client, seller, created_at, status, items, notes, buyer, acc, resp, reason,
                obs,
            ));
        }
        Ok(requisitions)
    }

    /// Number of stored requisitions
    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM requisitions", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Highest assigned number, if any
    pub fn max_number(&self) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        let max: Option<i64> =
            conn.query_row("SELECT MAX(number) FROM requisitions", [], |row| row.get(0))?;
        Ok(max)
    }

    /// Atomic read-modify-write of a single requisition.
    ///
    /// Re-reads the record inside an exclusive transaction and rejects with
    /// `ConcurrentModification` when its status no longer matches the status
    /// the caller observed, so two actors cannot both accept the same OPEN
    /// requisition. A record whose items blob failed to parse is never
    /// rewritten: upserting it would replace the on-disk blob with the
    /// degraded empty list.
    pub fn compare_and_swap<F>(
        &self,
        number: i64,
        expected: RequisitionStatus,
        apply: F,
    ) -> Result<Requisition>
    where
        F: FnOnce(&mut Requisition) -> Result<()>,
    {
        let conn = self.conn.lock().unwrap();
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = (|| {
            let mut req = Self::query_one(&conn, number)?.ok_or_else(|| {
                CoreError::Validation(format!("requisition {} not found", number))
            })?;
            if req.items_corrupt {
                return Err(CoreError::Persistence(format!(
                    "requisition {} has an unreadable items blob, refusing to rewrite it",
                    number
                )));
            }
            if req.status != expected {
                return Err(CoreError::ConcurrentModification { number });
            }
            apply(&mut req)?;
            Self::upsert(&conn, &req)?;
            Ok(req)
        })();

        match result {
            Ok(req) => {
                conn.execute("COMMIT", [])?;
                Ok(req)
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    /// Replaces the entire store contents in one transaction (restore path)
    pub fn replace_all(&self, requisitions: &[Requisition]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = (|| {
            conn.execute("DELETE FROM requisitions", [])?;
            for req in requisitions {
                Self::upsert(&conn, req)?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                conn.execute("COMMIT", [])?;
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    /// Runs SQLite's integrity check on the database
    pub fn integrity_check(&self) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let verdict: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        Ok(verdict == "ok")
    }

    /// Flushes the WAL into the main database file so a file-level copy
    /// sees every committed write
    pub fn checkpoint(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LineItem;
    use tempfile::TempDir;

    fn sample_requisition(number: i64) -> Requisition {
        let mut items = vec![
            LineItem::new("FAN MOTOR".to_string(), 3.0),
            LineItem::new("FILTER DRIER".to_string(), 1.5),
        ];
        items[0].internal_code = "FM-100".to_string();
        items[0].brand = "EMBRACO".to_string();
        Requisition::new(number, "ACME LTD".to_string(), "SELLER1".to_string(), items)
    }

    #[test]
    fn save_then_load_round_trips_items_exactly() {
        let dir = TempDir::new().unwrap();
        let store = RequisitionStore::open(dir.path().join("requisitions.db")).unwrap();

        let mut req = sample_requisition(5000);
        req.items[1].apply_quote(10.0, 20.0, "10 DAYS".to_string());
        store.save(&req).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], req);
        assert_eq!(loaded[0].items[1].unit_price, Some(12.0));
    }

    #[test]
    fn upsert_by_number_overwrites_whole_record() {
        let dir = TempDir::new().unwrap();
        let store = RequisitionStore::open(dir.path().join("requisitions.db")).unwrap();

        let mut req = sample_requisition(5001);
        store.save(&req).unwrap();
        req.status = RequisitionStatus::InProgress;
        req.buyer_in_charge = Some("BUYER1".to_string());
        store.save(&req).unwrap();

        assert_eq!(store.count().unwrap(), 1);
        let loaded = store.get(5001).unwrap().unwrap();
        assert_eq!(loaded.status, RequisitionStatus::InProgress);
        assert_eq!(loaded.buyer_in_charge.as_deref(), Some("BUYER1"));
    }

    #[test]
    fn corrupt_items_blob_degrades_to_empty_with_sentinel() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("requisitions.db");
        let store = RequisitionStore::open(&path).unwrap();
        store.save(&sample_requisition(5002)).unwrap();

        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "UPDATE requisitions SET items = '{not json' WHERE number = 5002",
                [],
            )
            .unwrap();
        }

        let loaded = store.get(5002).unwrap().unwrap();
        assert!(loaded.items.is_empty());
        assert!(loaded.items_corrupt);
    }

    #[test]
    fn compare_and_swap_rejects_stale_status() {
        let dir = TempDir::new().unwrap();
        let store = RequisitionStore::open(dir.path().join("requisitions.db")).unwrap();
        store.save(&sample_requisition(5003)).unwrap();

        store
            .compare_and_swap(5003, RequisitionStatus::Open, |req| {
                req.status = RequisitionStatus::InProgress;
                Ok(())
            })
            .unwrap();

        // A second actor still holding the OPEN read must be rejected.
        let err = store
            .compare_and_swap(5003, RequisitionStatus::Open, |req| {
                req.status = RequisitionStatus::InProgress;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::ConcurrentModification { number: 5003 }
        ));
    }

    #[test]
    fn compare_and_swap_never_rewrites_a_corrupt_items_blob() {
        let dir = TempDir::new().unwrap();
        let store = RequisitionStore::open(dir.path().join("requisitions.db")).unwrap();
        store.save(&sample_requisition(5007)).unwrap();

        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "UPDATE requisitions SET items = '{not json' WHERE number = 5007",
                [],
            )
            .unwrap();
        }

        let err = store
            .compare_and_swap(5007, RequisitionStatus::Open, |req| {
                req.status = RequisitionStatus::InProgress;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::Persistence(_)));

        // The original blob must still be on disk, not the empty list.
        let conn = store.conn.lock().unwrap();
        let blob: String = conn
            .query_row(
                "SELECT items FROM requisitions WHERE number = 5007",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(blob, "{not json");
    }

    #[test]
    fn failed_apply_leaves_record_unmodified() {
        let dir = TempDir::new().unwrap();
        let store = RequisitionStore::open(dir.path().join("requisitions.db")).unwrap();
        store.save(&sample_requisition(5004)).unwrap();

        let err = store
            .compare_and_swap(5004, RequisitionStatus::Open, |req| {
                req.status = RequisitionStatus::Refused;
                Err(CoreError::Validation("refusal reason required".to_string()))
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));

        let loaded = store.get(5004).unwrap().unwrap();
        assert_eq!(loaded.status, RequisitionStatus::Open);
    }

    #[test]
    fn replace_all_swaps_contents() {
        let dir = TempDir::new().unwrap();
        let store = RequisitionStore::open(dir.path().join("requisitions.db")).unwrap();
        store.save(&sample_requisition(5005)).unwrap();
        store.save(&sample_requisition(5006)).unwrap();

        let replacement = vec![sample_requisition(6000)];
        store.replace_all(&replacement).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].number, 6000);
        assert_eq!(store.max_number().unwrap(), Some(6000));
    }
}
