pub mod auth;
pub mod backup;
pub mod db;
pub mod error;
pub mod lifecycle;
pub mod models;
pub mod notify;
pub mod permissions;
pub mod sequence;

// Re-export commonly used types
pub use auth::{hash_password, AuthService, LoginOutcome};
pub use backup::{BackupKind, BackupService};
pub use db::{import_legacy_requisitions, import_legacy_users, RequisitionStore, UserStore};
pub use error::{CoreError, Result};
pub use lifecycle::{LifecycleEngine, StatusSummary};
pub use models::{LineItem, Requisition, RequisitionStatus, Role, Session, User};
pub use notify::{LogNotifier, NotificationKind, Notifier};
pub use permissions::{PermissionSet, PermissionTable};
pub use sequence::SequenceAllocator;
