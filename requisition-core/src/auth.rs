//! Credential management and login
//!
//! Passwords are stored as SHA-256 hex digests, hashed at write time; a
//! plaintext password never reaches the store. New users carry no password
//! and must set one on first login.

use chrono::Utc;
use log::info;
use sha2::{Digest, Sha256};

use crate::db::UserStore;
use crate::error::{CoreError, Result};
use crate::models::{Role, Session, User};
use crate::permissions::PermissionTable;

/// SHA-256 hex digest of a password
pub fn hash_password(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Result of a successful credential check
#[derive(Debug, Clone)]
pub enum LoginOutcome {
    /// Credentials verified; carries the session for subsequent operations
    Authenticated(Session),
    /// Account exists and is active but has no password yet; the caller
    /// must collect one and call `set_password`
    PasswordSetupRequired,
}

/// Account registration, login, and deactivation over the user store
pub struct AuthService<'a> {
    users: &'a UserStore,
    permissions: &'a PermissionTable,
}

impl<'a> AuthService<'a> {
    pub fn new(users: &'a UserStore, permissions: &'a PermissionTable) -> Self {
        Self { users, permissions }
    }

    /// Registers a new account; requires the edit_users flag
    pub fn register(&self, session: &Session, name: &str, email: &str, role: Role) -> Result<User> {
        if !self.permissions.get(session.role).edit_users {
            return Err(CoreError::PermissionDenied(format!(
                "{} may not manage users",
                session.role
            )));
        }
        if name.trim().is_empty() {
            return Err(CoreError::Validation("user name must not be empty".into()));
        }
        if !email.contains('@') {
            return Err(CoreError::Validation(format!("invalid email: {}", email)));
        }

        let user = User::new(name, email.trim().to_lowercase(), role);
        if self.users.get(&user.name)?.is_some() {
            return Err(CoreError::Validation(format!(
                "user {} already exists",
                user.name
            )));
        }

        self.users.save(&user)?;
        info!("registered user {} as {}", user.name, role);
        Ok(user)
    }

    /// Verifies credentials and records the access time.
    ///
    /// Unknown names and wrong passwords fail with the same error so the
    /// login form cannot be used to enumerate accounts.
    pub fn authenticate(&self, name: &str, password: &str) -> Result<LoginOutcome> {
        let mut user = self
            .users
            .get(name)?
            .ok_or_else(|| CoreError::PermissionDenied("invalid credentials".into()))?;

        if !user.active {
            return Err(CoreError::PermissionDenied(format!(
                "account {} is deactivated",
                user.name
            )));
        }

        let stored = match &user.password_hash {
            Some(hash) => hash.clone(),
            None => return Ok(LoginOutcome::PasswordSetupRequired),
        };

        if hash_password(password) != stored {
            return Err(CoreError::PermissionDenied("invalid credentials".into()));
        }

        user.last_access = Some(Utc::now());
        self.users.save(&user)?;
        Ok(LoginOutcome::Authenticated(Session::new(&user.name, user.role)))
    }

    /// Sets a user's password, ending the first-login state.
    ///
    /// Self-service only while the account is still in its first-login
    /// state; after that a session holding the edit_users flag is required
    /// to reset it.
    pub fn set_password(
        &self,
        session: Option<&Session>,
        name: &str,
        password: &str,
    ) -> Result<()> {
        if password.len() < 4 {
            return Err(CoreError::Validation(
                "password must be at least 4 characters".into(),
            ));
        }

        let mut user = self
            .users
            .get(name)?
            .ok_or_else(|| CoreError::Validation(format!("unknown user: {}", name)))?;

        if !user.first_login {
            let authorized = session
                .map(|s| self.permissions.get(s.role).edit_users)
                .unwrap_or(false);
            if !authorized {
                return Err(CoreError::PermissionDenied(format!(
                    "resetting the password of {} needs a user manager",
                    user.name
                )));
            }
        }

        user.password_hash = Some(hash_password(password));
        user.first_login = false;
        self.users.save(&user)?;
        info!("password set for {}", user.name);
        Ok(())
    }

    /// Deactivates an account without deleting its record; requires the
    /// edit_users flag
    pub fn deactivate(&self, session: &Session, name: &str) -> Result<()> {
        if !self.permissions.get(session.role).edit_users {
            return Err(CoreError::PermissionDenied(format!(
                "{} may not manage users",
                session.role
            )));
        }

        let mut user = self
            .users
            .get(name)?
            .ok_or_else(|| CoreError::Validation(format!("unknown user: {}", name)))?;
        user.active = false;
        self.users.save(&user)?;
        info!("deactivated user {}", user.name);
        Ok(())
    }

    /// Deletes an account; requires the delete_users flag. Admin accounts
    /// can never be deleted, only deactivated.
    pub fn delete(&self, session: &Session, name: &str) -> Result<()> {
        if !self.permissions.get(session.role).delete_users {
            return Err(CoreError::PermissionDenied(format!(
                "{} may not delete users",
                session.role
            )));
        }

        let user = self
            .users
            .get(name)?
            .ok_or_else(|| CoreError::Validation(format!("unknown user: {}", name)))?;
        if user.role == Role::Admin {
            return Err(CoreError::PermissionDenied(
                "admin accounts cannot be deleted".into(),
            ));
        }

        self.users.delete(&user.name)?;
        info!("deleted user {}", user.name);
        Ok(())
    }

    /// Lists every account; requires the edit_users flag
    pub fn list(&self, session: &Session) -> Result<Vec<User>> {
        if !self.permissions.get(session.role).edit_users {
            return Err(CoreError::PermissionDenied(format!(
                "{} may not manage users",
                session.role
            )));
        }
        self.users.load_all()
    }
}
