//! Requisition lifecycle engine
//!
//! All transitions run as compare-and-swap operations against the store:
//! the record is re-read inside an exclusive transaction and the observed
//! status must still match, so two buyers cannot both take the same OPEN
//! requisition. Transitions are monotone; terminal records never move again.

use chrono::Utc;
use log::warn;

use crate::db::RequisitionStore;
use crate::error::{CoreError, Result};
use crate::models::{LineItem, Requisition, RequisitionStatus, Role, Session};
use crate::notify::{NotificationKind, Notifier};
use crate::permissions::PermissionTable;
use crate::sequence::SequenceAllocator;

/// Per-status counts for the dashboard
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusSummary {
    pub open: usize,
    pub in_progress: usize,
    pub finalized: usize,
    pub refused: usize,
}

impl StatusSummary {
    pub fn total(&self) -> usize {
        self.open + self.in_progress + self.finalized + self.refused
    }
}

/// Drives requisitions through their lifecycle
pub struct LifecycleEngine<'a> {
    store: &'a RequisitionStore,
    allocator: &'a SequenceAllocator,
    permissions: &'a PermissionTable,
    notifier: &'a dyn Notifier,
}

impl<'a> LifecycleEngine<'a> {
    pub fn new(
        store: &'a RequisitionStore,
        allocator: &'a SequenceAllocator,
        permissions: &'a PermissionTable,
        notifier: &'a dyn Notifier,
    ) -> Self {
        Self {
            store,
            allocator,
            permissions,
            notifier,
        }
    }

    fn require_flag(&self, session: &Session, granted: bool, action: &str) -> Result<()> {
        if !granted {
            return Err(CoreError::PermissionDenied(format!(
                "{} may not {}",
                session.role, action
            )));
        }
        Ok(())
    }

    fn require_responder(&self, session: &Session) -> Result<()> {
        if !session.role.may_respond() {
            return Err(CoreError::PermissionDenied(format!(
                "{} may not respond to requisitions",
                session.role
            )));
        }
        self.require_flag(
            session,
            self.permissions.get(session.role).quotes,
            "quote requisitions",
        )
    }

    // The accepting buyer owns the response; admins may step in.
    fn require_in_charge(&self, session: &Session, req: &Requisition) -> Result<()> {
        if session.role == Role::Admin {
            return Ok(());
        }
        match &req.buyer_in_charge {
            Some(buyer) if *buyer == session.user => Ok(()),
            _ => Err(CoreError::PermissionDenied(format!(
                "requisition {} is handled by another buyer",
                req.number
            ))),
        }
    }

    /// Creates a new OPEN requisition under a freshly allocated number
    pub fn create(
        &self,
        session: &Session,
        client: &str,
        items: Vec<LineItem>,
        seller_notes: &str,
    ) -> Result<Requisition> {
        if session.role == Role::Buyer {
            return Err(CoreError::PermissionDenied(
                "buyers may not raise requisitions".into(),
            ));
        }
        self.require_flag(
            session,
            self.permissions.get(session.role).requisitions,
            "raise requisitions",
        )?;

        if client.trim().is_empty() {
            return Err(CoreError::Validation("client must not be empty".into()));
        }
        if items.is_empty() {
            return Err(CoreError::Validation(
                "a requisition needs at least one item".into(),
            ));
        }
        for item in &items {
            if item.description.trim().is_empty() {
                return Err(CoreError::Validation("item description must not be empty".into()));
            }
            if item.quantity <= 0.0 {
                return Err(CoreError::Validation(format!(
                    "quantity must be positive: {}",
                    item.description
                )));
            }
        }

        let number = self.allocator.next_number(self.store)?;
        let mut req = Requisition::new(
            number,
            client.trim().to_uppercase(),
            session.user.clone(),
            items,
        );
        req.seller_notes = seller_notes.trim().to_string();
        self.store.save(&req)?;
        log::info!("requisition {} created by {}", number, session.user);
        Ok(req)
    }

    /// Takes an OPEN requisition into quoting; the caller becomes the
    /// buyer in charge
    pub fn accept(&self, session: &Session, number: i64) -> Result<Requisition> {
        self.require_responder(session)?;

        self.store
            .compare_and_swap(number, RequisitionStatus::Open, |req| {
                req.status = RequisitionStatus::InProgress;
                req.buyer_in_charge = Some(session.user.clone());
                req.accepted_at = Some(Utc::now());
                Ok(())
            })
    }

    /// Quotes one line item of an IN_PROGRESS requisition
    pub fn quote_item(
        &self,
        session: &Session,
        number: i64,
        line_no: u32,
        unit_cost: f64,
        markup_pct: f64,
        delivery_term: &str,
    ) -> Result<Requisition> {
        self.require_responder(session)?;
        if unit_cost <= 0.0 {
            return Err(CoreError::Validation("unit cost must be positive".into()));
        }
        if markup_pct < 0.0 {
            return Err(CoreError::Validation("markup must not be negative".into()));
        }

        let delivery_term = delivery_term.trim().to_string();
        self.store
            .compare_and_swap(number, RequisitionStatus::InProgress, |req| {
                self.require_in_charge(session, req)?;
                let item = req.item_mut(line_no).ok_or_else(|| {
                    CoreError::Validation(format!(
                        "requisition {} has no line {}",
                        number, line_no
                    ))
                })?;
                item.apply_quote(unit_cost, markup_pct, delivery_term.clone());
                Ok(())
            })
    }

    /// Finalizes an IN_PROGRESS requisition once every item is quoted
    pub fn finalize(&self, session: &Session, number: i64) -> Result<Requisition> {
        self.require_responder(session)?;

        let req = self
            .store
            .compare_and_swap(number, RequisitionStatus::InProgress, |req| {
                self.require_in_charge(session, req)?;
                if req.items.is_empty() || !req.all_items_quoted() {
                    return Err(CoreError::InvalidTransition(format!(
                        "requisition {} still has unquoted items",
                        number
                    )));
                }
                req.status = RequisitionStatus::Finalized;
                req.responded_at = Some(Utc::now());
                Ok(())
            })?;

        if let Err(e) = self.notifier.notify(&req, NotificationKind::Finalized) {
            warn!("notification for requisition {} failed: {}", number, e);
        }
        Ok(req)
    }

    /// Refuses a requisition with a mandatory reason.
    ///
    /// Allowed from OPEN (refused outright) and from IN_PROGRESS (refused
    /// by the buyer in charge).
    pub fn refuse(&self, session: &Session, number: i64, reason: &str) -> Result<Requisition> {
        self.require_responder(session)?;
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(CoreError::Validation("refusal reason must not be empty".into()));
        }

        let current = self
            .store
            .get(number)?
            .ok_or_else(|| CoreError::Validation(format!("requisition {} not found", number)))?;
        if current.status.is_terminal() {
            return Err(CoreError::InvalidTransition(format!(
                "requisition {} is already {}",
                number, current.status
            )));
        }

        let observed = current.status;
        let req = self
            .store
            .compare_and_swap(number, observed, |req| {
                if observed == RequisitionStatus::InProgress {
                    self.require_in_charge(session, req)?;
                }
                req.status = RequisitionStatus::Refused;
                req.refusal_reason = Some(reason.to_string());
                req.responded_at = Some(Utc::now());
                if req.buyer_in_charge.is_none() {
                    req.buyer_in_charge = Some(session.user.clone());
                }
                Ok(())
            })?;

        if let Err(e) = self.notifier.notify(&req, NotificationKind::Refused) {
            warn!("notification for requisition {} failed: {}", number, e);
        }
        Ok(req)
    }

    /// Requisitions visible to the session.
    ///
    /// Sellers see only their own. Buyers and admins see everything, with
    /// terminal records hidden unless `include_terminal` is set.
    pub fn visible_requisitions(
        &self,
        session: &Session,
        include_terminal: bool,
    ) -> Result<Vec<Requisition>> {
        let all = self.store.load_all()?;
        let visible = match session.role {
            Role::Seller => all
                .into_iter()
                .filter(|r| r.seller == session.user)
                .collect(),
            Role::Buyer | Role::Admin => all
                .into_iter()
                .filter(|r| include_terminal || !r.status.is_terminal())
                .collect(),
        };
        Ok(visible)
    }

    /// Per-status counts across the whole store
    pub fn status_summary(&self) -> Result<StatusSummary> {
        let mut summary = StatusSummary::default();
        for req in self.store.load_all()? {
            match req.status {
                RequisitionStatus::Open => summary.open += 1,
                RequisitionStatus::InProgress => summary.in_progress += 1,
                RequisitionStatus::Finalized => summary.finalized += 1,
                RequisitionStatus::Refused => summary.refused += 1,
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::LogNotifier;
    use tempfile::TempDir;

    struct Fixture {
        store: RequisitionStore,
        allocator: SequenceAllocator,
        permissions: PermissionTable,
    }

    impl Fixture {
        fn new(dir: &TempDir) -> Self {
            Self {
                store: RequisitionStore::open(dir.path().join("requisitions.db")).unwrap(),
                allocator: SequenceAllocator::new(dir.path().join("sequence.json")).unwrap(),
                permissions: PermissionTable::load_or_seed(dir.path().join("profiles.json"))
                    .unwrap(),
            }
        }

        fn engine(&self) -> LifecycleEngine<'_> {
            LifecycleEngine::new(&self.store, &self.allocator, &self.permissions, &LogNotifier)
        }
    }

    fn seller() -> Session {
        Session::new("SELLER1", Role::Seller)
    }

    fn buyer() -> Session {
        Session::new("BUYER1", Role::Buyer)
    }

    #[test]
    fn full_lifecycle_from_creation_to_finalized() {
        let dir = TempDir::new().unwrap();
        let fx = Fixture::new(&dir);
        let engine = fx.engine();

        let req = engine
            .create(
                &seller(),
                "Acme Ltd",
                vec![LineItem::new("COMPRESSOR".to_string(), 1.0)],
                "urgent",
            )
            .unwrap();
        assert_eq!(req.number, 5000);
        assert_eq!(req.status, RequisitionStatus::Open);
        assert_eq!(req.client, "ACME LTD");

        let req = engine.accept(&buyer(), 5000).unwrap();
        assert_eq!(req.status, RequisitionStatus::InProgress);
        assert_eq!(req.buyer_in_charge.as_deref(), Some("BUYER1"));
        assert!(req.accepted_at.is_some());

        let req = engine
            .quote_item(&buyer(), 5000, 1, 10.0, 20.0, "5 DAYS")
            .unwrap();
        assert_eq!(req.items[0].unit_price, Some(12.0));

        let req = engine.finalize(&buyer(), 5000).unwrap();
        assert_eq!(req.status, RequisitionStatus::Finalized);
        assert!(req.responded_at.is_some());
    }

    #[test]
    fn finalize_requires_every_item_quoted() {
        let dir = TempDir::new().unwrap();
        let fx = Fixture::new(&dir);
        let engine = fx.engine();

        let req = engine
            .create(
                &seller(),
                "ACME",
                vec![
                    LineItem::new("VALVE".to_string(), 2.0),
                    LineItem::new("FILTER".to_string(), 1.0),
                ],
                "",
            )
            .unwrap();
        engine.accept(&buyer(), req.number).unwrap();
        engine
            .quote_item(&buyer(), req.number, 1, 5.0, 10.0, "")
            .unwrap();

        let err = engine.finalize(&buyer(), req.number).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition(_)));

        engine
            .quote_item(&buyer(), req.number, 2, 3.0, 0.0, "")
            .unwrap();
        engine.finalize(&buyer(), req.number).unwrap();
    }

    #[test]
    fn only_one_buyer_can_accept_an_open_requisition() {
        let dir = TempDir::new().unwrap();
        let fx = Fixture::new(&dir);
        let engine = fx.engine();

        let req = engine
            .create(
                &seller(),
                "ACME",
                vec![LineItem::new("VALVE".to_string(), 1.0)],
                "",
            )
            .unwrap();

        engine.accept(&buyer(), req.number).unwrap();
        let err = engine
            .accept(&Session::new("BUYER2", Role::Buyer), req.number)
            .unwrap_err();
        assert!(matches!(err, CoreError::ConcurrentModification { .. }));
    }

    #[test]
    fn another_buyer_cannot_quote_a_taken_requisition() {
        let dir = TempDir::new().unwrap();
        let fx = Fixture::new(&dir);
        let engine = fx.engine();

        let req = engine
            .create(
                &seller(),
                "ACME",
                vec![LineItem::new("VALVE".to_string(), 1.0)],
                "",
            )
            .unwrap();
        engine.accept(&buyer(), req.number).unwrap();

        let intruder = Session::new("BUYER2", Role::Buyer);
        let err = engine
            .quote_item(&intruder, req.number, 1, 5.0, 10.0, "")
            .unwrap_err();
        assert!(matches!(err, CoreError::PermissionDenied(_)));

        // Admins may step in.
        let admin = Session::new("ADMIN1", Role::Admin);
        engine
            .quote_item(&admin, req.number, 1, 5.0, 10.0, "")
            .unwrap();
    }

    #[test]
    fn refusal_requires_a_reason_and_is_terminal() {
        let dir = TempDir::new().unwrap();
        let fx = Fixture::new(&dir);
        let engine = fx.engine();

        let req = engine
            .create(
                &seller(),
                "ACME",
                vec![LineItem::new("VALVE".to_string(), 1.0)],
                "",
            )
            .unwrap();

        let err = engine.refuse(&buyer(), req.number, "  ").unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));

        let refused = engine
            .refuse(&buyer(), req.number, "discontinued product")
            .unwrap();
        assert_eq!(refused.status, RequisitionStatus::Refused);
        assert_eq!(
            refused.refusal_reason.as_deref(),
            Some("discontinued product")
        );

        let err = engine.refuse(&buyer(), req.number, "again").unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition(_)));
    }

    #[test]
    fn sellers_cannot_respond_and_buyers_cannot_create() {
        let dir = TempDir::new().unwrap();
        let fx = Fixture::new(&dir);
        let engine = fx.engine();

        let req = engine
            .create(
                &seller(),
                "ACME",
                vec![LineItem::new("VALVE".to_string(), 1.0)],
                "",
            )
            .unwrap();

        let err = engine.accept(&seller(), req.number).unwrap_err();
        assert!(matches!(err, CoreError::PermissionDenied(_)));

        let err = engine
            .create(
                &buyer(),
                "ACME",
                vec![LineItem::new("VALVE".to_string(), 1.0)],
                "",
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::PermissionDenied(_)));
    }

    #[test]
    fn visibility_follows_role_and_terminal_filter() {
        let dir = TempDir::new().unwrap();
        let fx = Fixture::new(&dir);
        let engine = fx.engine();

        let item = || vec![LineItem::new("VALVE".to_string(), 1.0)];
        let mine = engine.create(&seller(), "ACME", item(), "").unwrap();
        let other_seller = Session::new("SELLER2", Role::Seller);
        let theirs = engine.create(&other_seller, "GLOBEX", item(), "").unwrap();
        engine
            .refuse(&buyer(), theirs.number, "out of scope")
            .unwrap();

        let seen = engine.visible_requisitions(&seller(), true).unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].number, mine.number);

        let active = engine.visible_requisitions(&buyer(), false).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].number, mine.number);

        let all = engine.visible_requisitions(&buyer(), true).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn summary_counts_every_status() {
        let dir = TempDir::new().unwrap();
        let fx = Fixture::new(&dir);
        let engine = fx.engine();

        let item = || vec![LineItem::new("VALVE".to_string(), 1.0)];
        engine.create(&seller(), "A", item(), "").unwrap();
        let b = engine.create(&seller(), "B", item(), "").unwrap();
        let c = engine.create(&seller(), "C", item(), "").unwrap();

        engine.accept(&buyer(), b.number).unwrap();
        engine.refuse(&buyer(), c.number, "no stock").unwrap();

        let summary = engine.status_summary().unwrap();
        assert_eq!(summary.open, 1);
        assert_eq!(summary.in_progress, 1);
        assert_eq!(summary.refused, 1);
        assert_eq!(summary.total(), 3);
    }
}
