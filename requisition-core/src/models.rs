use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The three built-in roles
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Seller,
    Buyer,
    Admin,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Seller => write!(f, "seller"),
            Role::Buyer => write!(f, "buyer"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

impl Role {
    /// Parse a role from its lowercase name
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "seller" => Some(Role::Seller),
            "buyer" => Some(Role::Buyer),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    /// Roles that may quote and respond to requisitions
    pub fn may_respond(&self) -> bool {
        matches!(self, Role::Buyer | Role::Admin)
    }
}

/// Lifecycle state of a requisition
///
/// Transitions are monotone: Open -> InProgress -> {Finalized, Refused}.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RequisitionStatus {
    Open,
    InProgress,
    Finalized,
    Refused,
}

impl RequisitionStatus {
    /// String form used in the database and in archives
    pub fn as_str(&self) -> &'static str {
        match self {
            RequisitionStatus::Open => "OPEN",
            RequisitionStatus::InProgress => "IN_PROGRESS",
            RequisitionStatus::Finalized => "FINALIZED",
            RequisitionStatus::Refused => "REFUSED",
        }
    }

    /// Parse the database string form; unknown values degrade to Open
    pub fn parse(s: &str) -> Self {
        match s {
            "IN_PROGRESS" => RequisitionStatus::InProgress,
            "FINALIZED" => RequisitionStatus::Finalized,
            "REFUSED" => RequisitionStatus::Refused,
            _ => RequisitionStatus::Open,
        }
    }

    /// Finalized and Refused accept no further events
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequisitionStatus::Finalized | RequisitionStatus::Refused
        )
    }
}

impl fmt::Display for RequisitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single product/quantity entry within a requisition, independently quotable
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineItem {
    /// 1-based position within the requisition; dense 1..N in items order
    pub line_no: u32,
    #[serde(default)]
    pub internal_code: String,
    #[serde(default)]
    pub manufacturer_code: String,
    pub description: String,
    #[serde(default)]
    pub brand: String,
    pub quantity: f64,
    /// Cost quoted by the buyer; None until quoted
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub unit_cost: Option<f64>,
    /// Markup percentage applied on top of the unit cost
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub markup_pct: Option<f64>,
    /// Derived: unit_cost * (1 + markup_pct / 100)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub unit_price: Option<f64>,
    /// Derived: unit_price * quantity
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub line_total: Option<f64>,
    #[serde(default)]
    pub delivery_term: String,
    #[serde(default)]
    pub quoted: bool,
}

impl LineItem {
    /// Creates an unquoted line item; the line number is assigned by the
    /// requisition when items are attached
    pub fn new(description: String, quantity: f64) -> Self {
        Self {
            line_no: 0,
            internal_code: String::new(),
            manufacturer_code: String::new(),
            description,
            brand: String::new(),
            quantity,
            unit_cost: None,
            markup_pct: None,
            unit_price: None,
            line_total: None,
            delivery_term: String::new(),
            quoted: false,
        }
    }

    /// Applies a quote to this item, recomputing the derived price fields
    pub fn apply_quote(&mut self, unit_cost: f64, markup_pct: f64, delivery_term: String) {
        let unit_price = unit_cost * (1.0 + markup_pct / 100.0);
        self.unit_cost = Some(unit_cost);
        self.markup_pct = Some(markup_pct);
        self.unit_price = Some(unit_price);
        self.line_total = Some(unit_price * self.quantity);
        self.delivery_term = delivery_term;
        self.quoted = true;
    }
}

/// A request for quotation raised by a seller, tracked through the
/// quoting lifecycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Requisition {
    /// Globally unique, monotonically assigned number (primary key)
    pub number: i64,
    pub client: String,
    /// References User.name
    pub seller: String,
    pub created_at: DateTime<Utc>,
    pub status: RequisitionStatus,
    pub items: Vec<LineItem>,
    #[serde(default)]
    pub seller_notes: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub buyer_in_charge: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub responded_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub refusal_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub buyer_notes: Option<String>,
    /// Set when the persisted items blob could not be parsed on load.
    /// Callers must treat such a record as corrupt, not as an empty
    /// requisition. Never persisted.
    #[serde(skip)]
    pub items_corrupt: bool,
}

impl Requisition {
    /// Creates a new OPEN requisition, renumbering items into a dense
    /// 1..N sequence matching their order
    pub fn new(number: i64, client: String, seller: String, items: Vec<LineItem>) -> Self {
        let mut req = Self {
            number,
            client,
            seller,
            created_at: Utc::now(),
            status: RequisitionStatus::Open,
            items,
            seller_notes: String::new(),
            buyer_in_charge: None,
            accepted_at: None,
            responded_at: None,
            refusal_reason: None,
            buyer_notes: None,
            items_corrupt: false,
        };
        req.renumber_items();
        req
    }

    /// Reassigns line numbers as a dense 1..N sequence in items order
    pub fn renumber_items(&mut self) {
        for (i, item) in self.items.iter_mut().enumerate() {
            item.line_no = (i + 1) as u32;
        }
    }

    /// True when every item has been quoted (finalize guard)
    pub fn all_items_quoted(&self) -> bool {
        self.items.iter().all(|item| item.quoted)
    }

    /// Looks up an item by its 1-based line number
    pub fn item_mut(&mut self, line_no: u32) -> Option<&mut LineItem> {
        self.items.iter_mut().find(|i| i.line_no == line_no)
    }
}

/// A portal user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    /// Unique key, stored uppercased
    pub name: String,
    pub email: String,
    /// None until the user completes the first login and sets a password
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub password_hash: Option<String>,
    pub role: Role,
    pub active: bool,
    pub first_login: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_access: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Creates a new active user with no password (set on first login)
    pub fn new(name: &str, email: String, role: Role) -> Self {
        Self {
            name: name.trim().to_uppercase(),
            email,
            password_hash: None,
            role,
            active: true,
            first_login: true,
            last_access: None,
            created_at: Utc::now(),
        }
    }
}

/// Identity of the actor invoking an operation.
///
/// Passed explicitly into every operation; the core holds no ambient
/// session state.
#[derive(Debug, Clone)]
pub struct Session {
    pub user: String,
    pub role: Role,
}

impl Session {
    pub fn new(user: &str, role: Role) -> Self {
        Self {
            user: user.trim().to_uppercase(),
            role,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_recomputes_derived_fields() {
        let mut item = LineItem::new("COMPRESSOR".to_string(), 2.0);
        item.apply_quote(10.0, 20.0, "5 DAYS".to_string());
        assert_eq!(item.unit_price, Some(12.0));
        assert_eq!(item.line_total, Some(24.0));
        assert!(item.quoted);
    }

    #[test]
    fn items_are_renumbered_densely() {
        let items = vec![
            LineItem::new("A".to_string(), 1.0),
            LineItem::new("B".to_string(), 1.0),
            LineItem::new("C".to_string(), 1.0),
        ];
        let req = Requisition::new(5000, "ACME".to_string(), "SELLER1".to_string(), items);
        let numbers: Vec<u32> = req.items.iter().map(|i| i.line_no).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            RequisitionStatus::Open,
            RequisitionStatus::InProgress,
            RequisitionStatus::Finalized,
            RequisitionStatus::Refused,
        ] {
            assert_eq!(RequisitionStatus::parse(status.as_str()), status);
        }
    }

    #[test]
    fn user_names_are_uppercased() {
        let user = User::new("  zaqueu souza ", "z@example.com".to_string(), Role::Admin);
        assert_eq!(user.name, "ZAQUEU SOUZA");
        assert!(user.first_login);
        assert!(user.password_hash.is_none());
    }
}
