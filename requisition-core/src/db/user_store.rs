//! SQLite-backed credential store
//!
//! Users are keyed by their uppercased name. Records are never hard-deleted
//! in normal operation; deactivation flips the `active` flag instead, and
//! deleting an admin is always refused at the service layer.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::Result;
use crate::models::{Role, User};

/// Persistent store for user credentials and profile assignments
pub struct UserStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl UserStore {
    /// Opens (or creates) the store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(include_str!("users_schema.sql"))?;

        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

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

    fn row_to_user(
        name: String,
        email: String,
        password_hash: Option<String>,
        role: String,
        active: bool,
        first_login: bool,
        last_access: Option<String>,
        created_at: String,
    ) -> User {
        User {
            name,
            email,
            password_hash,
            role: Role::parse(&role).unwrap_or(Role::Seller),
            active,
            first_login,
            last_access: Self::parse_timestamp(last_access),
            created_at: Self::parse_timestamp(Some(created_at)).unwrap_or_else(Utc::now),
        }
    }

    fn upsert(conn: &Connection, user: &User) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO users
             (name, email, password_hash, role, active, first_login, last_access, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                user.name,
                user.email,
                user.password_hash,
                user.role.to_string(),
                user.active,
                user.first_login,
                user.last_access.map(|t| t.to_rfc3339()),
                user.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Writes the full record, keyed by name, as an upsert
    pub fn save(&self, user: &User) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        Self::upsert(&conn, user)
    }

    /// Fetches one user by (case-insensitive) name
    pub fn get(&self, name: &str) -> Result<Option<User>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT name, email, password_hash, role, active, first_login, last_access, created_at
                 FROM users WHERE name = ?1",
                [name.trim().to_uppercase()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, bool>(4)?,
                        row.get::<_, bool>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.map(
            |(name, email, hash, role, active, first_login, last_access, created_at)| {
                Self::row_to_user(name, email, hash, role, active, first_login, last_access, created_at)
            },
        ))
    }

    /// Loads every user, ordered by name
    pub fn load_all(&self) -> Result<Vec<User>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT name, email, password_hash, role, active, first_login, last_access, created_at
             FROM users ORDER BY name",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, bool>(4)?,
                row.get::<_, bool>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;

        let mut users = Vec::new();
        for row in rows {
            let (name, email, hash, role, active, first_login, last_access, created_at) = row?;
            users.push(Self::row_to_user(
                name, email, hash, role, active, first_login, last_access, created_at,
            ));
        }
        Ok(users)
    }

    /// Removes a user record (the service layer refuses this for admins)
    pub fn delete(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute(
            "DELETE FROM users WHERE name = ?1",
            [name.trim().to_uppercase()],
        )?;
        Ok(affected > 0)
    }

    /// Number of stored users
    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Replaces the entire store contents in one transaction (restore path)
    pub fn replace_all(&self, users: &[User]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = (|| {
            conn.execute("DELETE FROM users", [])?;
            for user in users {
                Self::upsert(&conn, user)?;
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

    /// Flushes the WAL into the main database file before a file-level copy
    pub fn checkpoint(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn save_and_get_by_name_is_case_insensitive() {
        let dir = TempDir::new().unwrap();
        let store = UserStore::open(dir.path().join("users.db")).unwrap();

        let user = User::new("Zaqueu Souza", "z@example.com".to_string(), Role::Admin);
        store.save(&user).unwrap();

        let loaded = store.get("zaqueu souza").unwrap().unwrap();
        assert_eq!(loaded.name, "ZAQUEU SOUZA");
        assert_eq!(loaded.role, Role::Admin);
        assert!(loaded.active);
    }

    #[test]
    fn delete_reports_whether_a_row_existed() {
        let dir = TempDir::new().unwrap();
        let store = UserStore::open(dir.path().join("users.db")).unwrap();
        store
            .save(&User::new("SELLER1", "s@example.com".to_string(), Role::Seller))
            .unwrap();

        assert!(store.delete("SELLER1").unwrap());
        assert!(!store.delete("SELLER1").unwrap());
        assert_eq!(store.count().unwrap(), 0);
    }
}
