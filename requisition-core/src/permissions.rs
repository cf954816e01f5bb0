//! Role permission table
//!
//! Maps each role to a typed set of feature flags, seeded with the built-in
//! defaults and persisted in a JSON control file independent of the user
//! records. The table is part of the backup member set.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{CoreError, Result};
use crate::models::{Role, Session};

/// Feature flags granted to a role
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionSet {
    pub dashboard: bool,
    pub requisitions: bool,
    pub quotes: bool,
    pub import: bool,
    pub settings: bool,
    pub edit_users: bool,
    pub delete_users: bool,
    pub edit_profiles: bool,
}

impl PermissionSet {
    /// Built-in defaults for each role
    pub fn defaults_for(role: Role) -> Self {
        match role {
            Role::Seller => Self {
                dashboard: true,
                requisitions: true,
                quotes: true,
                import: false,
                settings: false,
                edit_users: false,
                delete_users: false,
                edit_profiles: false,
            },
            Role::Buyer => Self {
                dashboard: true,
                requisitions: true,
                quotes: true,
                import: true,
                settings: false,
                edit_users: false,
                delete_users: false,
                edit_profiles: false,
            },
            Role::Admin => Self {
                dashboard: true,
                requisitions: true,
                quotes: true,
                import: true,
                settings: true,
                edit_users: true,
                delete_users: true,
                edit_profiles: true,
            },
        }
    }
}

/// Persistent role -> permission set table
pub struct PermissionTable {
    path: PathBuf,
    sets: Mutex<HashMap<Role, PermissionSet>>,
}

impl PermissionTable {
    /// Loads the table from disk, seeding the built-in defaults (and the
    /// control file) when absent or unparseable
    pub fn load_or_seed<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let sets = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<HashMap<Role, PermissionSet>>(&raw) {
                Ok(mut sets) => {
                    // A role missing from the file falls back to its default.
                    for role in [Role::Seller, Role::Buyer, Role::Admin] {
                        sets.entry(role).or_insert_with(|| PermissionSet::defaults_for(role));
                    }
                    sets
                }
                Err(e) => {
                    log::warn!("permission table unparseable, reseeding defaults: {}", e);
                    Self::default_sets()
                }
            },
            Err(_) => Self::default_sets(),
        };

        let table = Self {
            path,
            sets: Mutex::new(sets),
        };
        table.persist()?;
        Ok(table)
    }

    fn default_sets() -> HashMap<Role, PermissionSet> {
        [Role::Seller, Role::Buyer, Role::Admin]
            .into_iter()
            .map(|role| (role, PermissionSet::defaults_for(role)))
            .collect()
    }

    fn persist(&self) -> Result<()> {
        let sets = self.sets.lock().unwrap();
        let json = serde_json::to_string_pretty(&*sets)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Path to the control file (archived alongside the stores)
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Effective permission set for a role
    pub fn get(&self, role: Role) -> PermissionSet {
        let sets = self.sets.lock().unwrap();
        sets.get(&role)
            .copied()
            .unwrap_or_else(|| PermissionSet::defaults_for(role))
    }

    /// Replaces a role's permission set; requires the edit_profiles flag
    pub fn set(&self, session: &Session, role: Role, permissions: PermissionSet) -> Result<()> {
        if !self.get(session.role).edit_profiles {
            return Err(CoreError::PermissionDenied(format!(
                "{} may not edit profiles",
                session.role
            )));
        }

        {
            let mut sets = self.sets.lock().unwrap();
            sets.insert(role, permissions);
        }
        self.persist()
    }
}
