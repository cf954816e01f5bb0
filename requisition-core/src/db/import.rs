//! One-time import of legacy JSON dumps
//!
//! The portal's predecessor kept its data in flat JSON files (an array of
//! spreadsheet-shaped requisition records and a name-keyed user map). The
//! import is idempotent: it refuses to run against a non-empty store, so
//! re-running it after a successful migration is a no-op instead of a
//! standing code path.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use log::info;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::auth::hash_password;
use crate::error::{CoreError, Result};
use crate::models::{LineItem, Requisition, RequisitionStatus, Role, User};
use crate::sequence::SequenceAllocator;

use super::{RequisitionStore, UserStore};

/// One record of the legacy requisition dump
#[derive(Debug, Deserialize)]
struct LegacyRequisition {
    #[serde(rename = "REQUISITION")]
    number: i64,
    #[serde(rename = "CLIENT", default)]
    client: String,
    #[serde(rename = "SELLER", default)]
    seller: String,
    #[serde(rename = "STATUS", default)]
    status: String,
    #[serde(rename = "CODE", default)]
    code: String,
    #[serde(rename = "DESCRIPTION", default)]
    description: String,
    #[serde(rename = "BRAND", default)]
    brand: String,
    #[serde(rename = "QUANTITY", default)]
    quantity: f64,
    #[serde(rename = "BUYER", default)]
    buyer: Option<String>,
    #[serde(rename = "BUYER_NOTES", default)]
    buyer_notes: Option<String>,
    #[serde(rename = "CREATED_AT", default)]
    created_at: Option<String>,
}

/// Legacy dumps carry either full RFC 3339 timestamps or bare dates
fn parse_legacy_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}

/// One entry of the legacy user map, keyed by user name
#[derive(Debug, Deserialize)]
struct LegacyUser {
    email: String,
    /// Plaintext or already-hashed; always re-hashed at write time when
    /// plaintext (the legacy length heuristic is not carried over)
    password: Option<String>,
    profile: String,
    #[serde(default = "default_true")]
    active: bool,
    #[serde(default = "default_true")]
    first_login: bool,
}

fn default_true() -> bool {
    true
}

fn looks_hashed(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}

/// Imports the legacy requisition dump into an empty store.
///
/// Returns the number of records imported; returns 0 without touching the
/// store when it already holds data ("already migrated" guard). On success
/// the sequence control value is raised to the highest imported number.
pub fn import_legacy_requisitions<P: AsRef<Path>>(
    json_path: P,
    store: &RequisitionStore,
    allocator: &SequenceAllocator,
) -> Result<usize> {
    if store.count()? > 0 {
        info!("requisition store is not empty, skipping legacy import");
        return Ok(0);
    }

    let raw = std::fs::read_to_string(json_path.as_ref())?;
    let records: Vec<LegacyRequisition> = serde_json::from_str(&raw)
        .map_err(|e| CoreError::Validation(format!("legacy requisition dump: {}", e)))?;

    let mut highest = 0i64;
    let mut requisitions = Vec::with_capacity(records.len());
    for record in records {
        highest = highest.max(record.number);

        // Legacy dumps carry exactly one line per record.
        let mut item = LineItem::new(record.description, record.quantity);
        item.internal_code = record.code;
        item.brand = record.brand;

        let mut req = Requisition::new(record.number, record.client, record.seller, vec![item]);
        req.status = RequisitionStatus::parse(&record.status);
        req.buyer_in_charge = record.buyer.filter(|b| !b.is_empty());
        req.buyer_notes = record.buyer_notes.filter(|n| !n.is_empty());
        if let Some(created) = record.created_at.as_deref().and_then(parse_legacy_timestamp) {
            req.created_at = created;
        }
        requisitions.push(req);
    }

    let imported = requisitions.len();
    store.replace_all(&requisitions)?;
    if highest > 0 {
        allocator.reconcile(highest)?;
    }

    info!("imported {} legacy requisitions", imported);
    Ok(imported)
}

/// Imports the legacy user map into an empty credential store.
///
/// Plaintext legacy passwords are hashed at write time; values that already
/// look like SHA-256 hex digests are kept as-is.
pub fn import_legacy_users<P: AsRef<Path>>(json_path: P, store: &UserStore) -> Result<usize> {
    if store.count()? > 0 {
        info!("user store is not empty, skipping legacy import");
        return Ok(0);
    }

    let raw = std::fs::read_to_string(json_path.as_ref())?;
    let records: HashMap<String, LegacyUser> = serde_json::from_str(&raw)
        .map_err(|e| CoreError::Validation(format!("legacy user dump: {}", e)))?;

    let mut imported = 0;
    for (name, legacy) in records {
        let role = Role::parse(&legacy.profile)
            .ok_or_else(|| CoreError::Validation(format!("unknown profile: {}", legacy.profile)))?;

        let mut user = User::new(&name, legacy.email, role);
        user.active = legacy.active;
        user.first_login = legacy.first_login;
        user.password_hash = legacy.password.map(|p| {
            if looks_hashed(&p) {
                p
            } else {
                hash_password(&p)
            }
        });

        store.save(&user)?;
        imported += 1;
    }

    info!("imported {} legacy users", imported);
    Ok(imported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn legacy_requisitions_import_once_and_raise_the_sequence() {
        let dir = TempDir::new().unwrap();
        let store = RequisitionStore::open(dir.path().join("requisitions.db")).unwrap();
        let allocator = SequenceAllocator::new(dir.path().join("sequence.json")).unwrap();

        let dump = r#"[
            {"REQUISITION": 5120, "CLIENT": "ACME", "SELLER": "SELLER1",
             "STATUS": "FINALIZED", "CODE": "C1", "DESCRIPTION": "VALVE",
             "BRAND": "DANFOSS", "QUANTITY": 2.0, "BUYER": "BUYER1"},
            {"REQUISITION": 5121, "CLIENT": "GLOBEX", "SELLER": "SELLER2",
             "STATUS": "OPEN", "CODE": "C2", "DESCRIPTION": "COMPRESSOR",
             "BRAND": "EMBRACO", "QUANTITY": 1.0}
        ]"#;
        let dump_path = dir.path().join("legacy.json");
        std::fs::write(&dump_path, dump).unwrap();

        let imported = import_legacy_requisitions(&dump_path, &store, &allocator).unwrap();
        assert_eq!(imported, 2);
        assert_eq!(store.count().unwrap(), 2);
        assert!(allocator.next_number(&store).unwrap() > 5121);

        // Re-running is a no-op.
        let again = import_legacy_requisitions(&dump_path, &store, &allocator).unwrap();
        assert_eq!(again, 0);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn legacy_creation_dates_survive_the_import() {
        let dir = TempDir::new().unwrap();
        let store = RequisitionStore::open(dir.path().join("requisitions.db")).unwrap();
        let allocator = SequenceAllocator::new(dir.path().join("sequence.json")).unwrap();

        let dump = r#"[
            {"REQUISITION": 5200, "CLIENT": "ACME", "SELLER": "SELLER1",
             "STATUS": "OPEN", "DESCRIPTION": "VALVE", "QUANTITY": 1.0,
             "CREATED_AT": "2023-05-10"},
            {"REQUISITION": 5201, "CLIENT": "ACME", "SELLER": "SELLER1",
             "STATUS": "OPEN", "DESCRIPTION": "FILTER", "QUANTITY": 1.0,
             "CREATED_AT": "2024-01-02T08:30:00+00:00"}
        ]"#;
        let dump_path = dir.path().join("legacy.json");
        std::fs::write(&dump_path, dump).unwrap();

        import_legacy_requisitions(&dump_path, &store, &allocator).unwrap();

        let dated = store.get(5200).unwrap().unwrap();
        assert_eq!(
            dated.created_at.date_naive(),
            NaiveDate::from_ymd_opt(2023, 5, 10).unwrap()
        );
        let stamped = store.get(5201).unwrap().unwrap();
        assert_eq!(stamped.created_at.to_rfc3339(), "2024-01-02T08:30:00+00:00");
    }

    #[test]
    fn legacy_plaintext_passwords_are_hashed_on_import() {
        let dir = TempDir::new().unwrap();
        let store = UserStore::open(dir.path().join("users.db")).unwrap();

        let dump = r#"{
            "MARIA LIMA": {"email": "maria@example.com", "password": "hunter2",
                           "profile": "buyer", "active": true, "first_login": false}
        }"#;
        let dump_path = dir.path().join("legacy_users.json");
        std::fs::write(&dump_path, dump).unwrap();

        assert_eq!(import_legacy_users(&dump_path, &store).unwrap(), 1);
        let user = store.get("MARIA LIMA").unwrap().unwrap();
        let hash = user.password_hash.unwrap();
        assert_ne!(hash, "hunter2");
        assert_eq!(hash, hash_password("hunter2"));
    }
}
