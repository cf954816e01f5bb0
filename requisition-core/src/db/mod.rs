//! Persistence layer
//!
//! Two embedded SQLite stores (requisitions and users) plus the one-time
//! legacy JSON import. All mutations are short transactions behind a
//! single connection per store.

mod import;
mod requisition_store;
mod user_store;

pub use import::{import_legacy_requisitions, import_legacy_users};
pub use requisition_store::RequisitionStore;
pub use user_store::UserStore;
