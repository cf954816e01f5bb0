//! Backup and restore of the portal's data set
//!
//! A backup is a gzip-compressed tar archive holding exactly the four data
//! files: both SQLite stores, the permission table and the sequence control
//! file. Archives are verified after writing and a failed backup leaves no
//! partial artifact behind. Restores take a preventive snapshot of the live
//! data first and roll back to it when anything goes wrong, and the sequence
//! high-water mark is reconciled so restored numbers are never reissued.

use chrono::{Duration, Local, NaiveDateTime};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::db::{RequisitionStore, UserStore};
use crate::error::{CoreError, Result};
use crate::models::{Requisition, User};
use crate::sequence::SequenceAllocator;

/// Archive member names; an archive missing any of these (or carrying
/// extras) is rejected on restore
const MEMBERS: [&str; 4] = [
    "requisitions.db",
    "users.db",
    "profiles.json",
    "sequence.json",
];

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const ARCHIVE_SUFFIX: &str = ".tar.gz";

/// Whether a backup was requested by an operator or by the scheduler.
/// Purely informational, carried in the file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupKind {
    Auto,
    Manual,
}

impl BackupKind {
    fn prefix(&self) -> &'static str {
        match self {
            BackupKind::Auto => "backup_auto_",
            BackupKind::Manual => "backup_manual_",
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    requisitions: Vec<Requisition>,
    users: Vec<User>,
    profiles: Option<String>,
    sequence: Option<String>,
}

/// Creates, prunes and restores data archives
pub struct BackupService {
    backup_dir: PathBuf,
    profiles_path: PathBuf,
    sequence_path: PathBuf,
}

impl BackupService {
    pub fn new<P: AsRef<Path>>(backup_dir: P, profiles_path: P, sequence_path: P) -> Result<Self> {
        let backup_dir = backup_dir.as_ref().to_path_buf();
        fs::create_dir_all(&backup_dir)?;
        Ok(Self {
            backup_dir,
            profiles_path: profiles_path.as_ref().to_path_buf(),
            sequence_path: sequence_path.as_ref().to_path_buf(),
        })
    }

    /// Archives the four data files into a new `.tar.gz` under the backup
    /// directory and returns its path.
    ///
    /// Both stores are integrity-checked and checkpointed first, and the
    /// finished archive is re-read to verify its member set. On any failure
    /// the partial artifact is removed.
    pub fn run_backup(
        &self,
        kind: BackupKind,
        requisitions: &RequisitionStore,
        users: &UserStore,
    ) -> Result<PathBuf> {
        if !requisitions.integrity_check()? {
            return Err(CoreError::BackupIntegrity(
                "requisition store failed integrity check".into(),
            ));
        }
        if !users.integrity_check()? {
            return Err(CoreError::BackupIntegrity(
                "user store failed integrity check".into(),
            ));
        }
        requisitions.checkpoint()?;
        users.checkpoint()?;

        let stamp = Local::now().format(TIMESTAMP_FORMAT);
        let name = format!("{}{}{}", kind.prefix(), stamp, ARCHIVE_SUFFIX);
        let archive_path = self.backup_dir.join(&name);
        let tmp_path = self.backup_dir.join(format!(".{}.tmp", name));

        let sources = [
            (requisitions.path(), MEMBERS[0]),
            (users.path(), MEMBERS[1]),
            (self.profiles_path.as_path(), MEMBERS[2]),
            (self.sequence_path.as_path(), MEMBERS[3]),
        ];

        let result = (|| {
            let file = File::create(&tmp_path)?;
            let encoder = GzEncoder::new(file, Compression::default());
            let mut builder = tar::Builder::new(encoder);
            for (source, member) in &sources {
                builder.append_path_with_name(source, member).map_err(|e| {
                    CoreError::BackupIntegrity(format!("archiving {}: {}", member, e))
                })?;
            }
            builder
                .into_inner()
                .and_then(|encoder| encoder.finish())
                .map_err(|e| CoreError::BackupIntegrity(format!("flushing archive: {}", e)))?;

            let found = Self::member_names(&tmp_path)?;
            let expected: BTreeSet<String> = MEMBERS.iter().map(|m| m.to_string()).collect();
            if found != expected {
                return Err(CoreError::BackupIntegrity(format!(
                    "archive member mismatch: {:?}",
                    found
                )));
            }

            fs::rename(&tmp_path, &archive_path)?;
            Ok(())
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }

        info!("backup written to {}", archive_path.display());
        Ok(archive_path)
    }

    fn member_names(archive_path: &Path) -> Result<BTreeSet<String>> {
        let file = File::open(archive_path)?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        let mut names = BTreeSet::new();
        for entry in archive
            .entries()
            .map_err(|e| CoreError::BackupIntegrity(format!("unreadable archive: {}", e)))?
        {
            let entry =
                entry.map_err(|e| CoreError::BackupIntegrity(format!("corrupt entry: {}", e)))?;
            let path = entry
                .path()
                .map_err(|e| CoreError::BackupIntegrity(format!("corrupt entry path: {}", e)))?;
            names.insert(path.to_string_lossy().into_owned());
        }
        Ok(names)
    }

    /// Archives present in the backup directory, newest last
    pub fn list_backups(&self) -> Result<Vec<PathBuf>> {
        let mut archives = Vec::new();
        for entry in fs::read_dir(&self.backup_dir)? {
            let path = entry?.path();
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if Self::parse_stamp(name).is_some() {
                    archives.push(path);
                }
            }
        }
        archives.sort();
        Ok(archives)
    }

    fn parse_stamp(file_name: &str) -> Option<NaiveDateTime> {
        let rest = file_name
            .strip_prefix(BackupKind::Auto.prefix())
            .or_else(|| file_name.strip_prefix(BackupKind::Manual.prefix()))?;
        let stamp = rest.strip_suffix(ARCHIVE_SUFFIX)?;
        NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()
    }

    /// Deletes archives older than `retention_days`, judged by the
    /// timestamp in the file name. Returns the number removed.
    pub fn prune(&self, retention_days: i64) -> Result<usize> {
        let cutoff = Local::now().naive_local() - Duration::days(retention_days);
        let mut removed = 0;

        for path in self.list_backups()? {
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            if let Some(stamp) = Self::parse_stamp(name) {
                if stamp < cutoff {
                    fs::remove_file(&path)?;
                    info!("pruned expired backup {}", name);
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Runs the daily scheduled backup: skipped when an automatic archive
    /// for today already exists, otherwise a backup plus a 7-day prune.
    /// Returns the new archive path, or None when skipped. Cheap enough to
    /// call from a periodic timer; one backup per calendar day results.
    pub fn run_daily(
        &self,
        requisitions: &RequisitionStore,
        users: &UserStore,
    ) -> Result<Option<PathBuf>> {
        let today = Local::now().format("%Y%m%d").to_string();
        let today_prefix = format!("{}{}", BackupKind::Auto.prefix(), today);

        for path in self.list_backups()? {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if name.starts_with(&today_prefix) {
                    return Ok(None);
                }
            }
        }

        let archive = self.run_backup(BackupKind::Auto, requisitions, users)?;
        self.prune(7)?;
        Ok(Some(archive))
    }

    fn take_snapshot(
        &self,
        requisitions: &RequisitionStore,
        users: &UserStore,
    ) -> Result<(PathBuf, Snapshot)> {
        let snapshot = Snapshot {
            requisitions: requisitions.load_all()?,
            users: users.load_all()?,
            profiles: fs::read_to_string(&self.profiles_path).ok(),
            sequence: fs::read_to_string(&self.sequence_path).ok(),
        };

        let stamp = Local::now().format(TIMESTAMP_FORMAT);
        let path = self.backup_dir.join(format!("pre_restore_{}.json", stamp));
        fs::write(&path, serde_json::to_string(&snapshot)?)?;
        Ok((path, snapshot))
    }

    fn apply_snapshot(
        &self,
        snapshot: &Snapshot,
        requisitions: &RequisitionStore,
        users: &UserStore,
    ) -> Result<()> {
        requisitions.replace_all(&snapshot.requisitions)?;
        users.replace_all(&snapshot.users)?;
        if let Some(profiles) = &snapshot.profiles {
            fs::write(&self.profiles_path, profiles)?;
        }
        if let Some(sequence) = &snapshot.sequence {
            fs::write(&self.sequence_path, sequence)?;
        }
        Ok(())
    }

    /// Replaces the live data set with the contents of an archive.
    ///
    /// The archive's member set is validated before anything is touched,
    /// a preventive snapshot is written first, and any failure while
    /// applying rolls the live data back to that snapshot. On success the
    /// sequence high-water mark is raised to cover every restored number.
    pub fn restore(
        &self,
        archive_path: &Path,
        requisitions: &RequisitionStore,
        users: &UserStore,
        allocator: &SequenceAllocator,
    ) -> Result<()> {
        let found = Self::member_names(archive_path)
            .map_err(|e| CoreError::RestoreFailure(e.to_string()))?;
        let expected: BTreeSet<String> = MEMBERS.iter().map(|m| m.to_string()).collect();
        if found != expected {
            return Err(CoreError::RestoreFailure(format!(
                "archive member mismatch: expected {:?}, found {:?}",
                expected, found
            )));
        }

        let scratch = self.backup_dir.join(format!(
            ".restore_{}",
            Local::now().format(TIMESTAMP_FORMAT)
        ));
        fs::create_dir_all(&scratch)?;

        let result = self.restore_inner(archive_path, &scratch, requisitions, users, allocator);

        let _ = fs::remove_dir_all(&scratch);
        result
    }

    fn restore_inner(
        &self,
        archive_path: &Path,
        scratch: &Path,
        requisitions: &RequisitionStore,
        users: &UserStore,
        allocator: &SequenceAllocator,
    ) -> Result<()> {
        let file = File::open(archive_path)?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        archive
            .unpack(scratch)
            .map_err(|e| CoreError::RestoreFailure(format!("extracting archive: {}", e)))?;

        // Read the restored data set through regular store handles so the
        // same parsing and corruption handling applies.
        let restored_reqs = RequisitionStore::open(scratch.join(MEMBERS[0]))
            .and_then(|s| s.load_all())
            .map_err(|e| CoreError::RestoreFailure(format!("restored requisitions: {}", e)))?;
        let restored_users = UserStore::open(scratch.join(MEMBERS[1]))
            .and_then(|s| s.load_all())
            .map_err(|e| CoreError::RestoreFailure(format!("restored users: {}", e)))?;
        let restored_profiles = fs::read_to_string(scratch.join(MEMBERS[2]))?;
        let restored_sequence = fs::read_to_string(scratch.join(MEMBERS[3]))?;

        let (snapshot_path, snapshot) = self.take_snapshot(requisitions, users)?;

        // Numbers allocated after the backup was taken must stay burned,
        // so the pre-restore mark is folded into the reconciliation.
        let live_mark = allocator.current().unwrap_or(0);

        let apply = (|| -> Result<()> {
            requisitions.replace_all(&restored_reqs)?;
            users.replace_all(&restored_users)?;
            fs::write(&self.profiles_path, &restored_profiles)?;
            fs::write(&self.sequence_path, &restored_sequence)?;

            let restored_max = restored_reqs.iter().map(|r| r.number).max().unwrap_or(0);
            allocator.reconcile(restored_max.max(live_mark))?;
            Ok(())
        })();

        if let Err(e) = apply {
            warn!("restore failed, rolling back to preventive snapshot: {}", e);
            self.apply_snapshot(&snapshot, requisitions, users).map_err(|rb| {
                CoreError::RestoreFailure(format!(
                    "restore failed ({}) and rollback also failed: {}",
                    e, rb
                ))
            })?;
            return Err(CoreError::RestoreFailure(e.to_string()));
        }

        info!(
            "restored {} requisitions and {} users from {} (snapshot at {})",
            restored_reqs.len(),
            restored_users.len(),
            archive_path.display(),
            snapshot_path.display()
        );
        Ok(())
    }
}
