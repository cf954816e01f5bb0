//! Outbound notifications for terminal lifecycle events
//!
//! Delivery is fire-and-forget: a failed notification is logged and never
//! rolls back the transition that triggered it.

use crate::error::Result;
use crate::models::Requisition;

/// Terminal event worth telling the seller about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Finalized,
    Refused,
}

/// Delivery channel for lifecycle notifications
pub trait Notifier: Send + Sync {
    fn notify(&self, requisition: &Requisition, kind: NotificationKind) -> Result<()>;
}

/// Default channel that writes the event to the log
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, requisition: &Requisition, kind: NotificationKind) -> Result<()> {
        match kind {
            NotificationKind::Finalized => log::info!(
                "requisition {} finalized for seller {}",
                requisition.number,
                requisition.seller
            ),
            NotificationKind::Refused => log::info!(
                "requisition {} refused for seller {} ({})",
                requisition.number,
                requisition.seller,
                requisition.refusal_reason.as_deref().unwrap_or("no reason")
            ),
        }
        Ok(())
    }
}
