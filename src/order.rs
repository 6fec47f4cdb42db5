//! Order domain types: identifiers, the four-state status graph, and the
//! order record itself.
//!
//! The status graph is linear and forward-only:
//!
//! ```text
//! new -> processing -> ready -> completed
//! ```
//!
//! [`OrderStatus::can_transition_to`] is the single definition of that graph;
//! the order aggregate in [`crate::lifecycle`] is the only caller allowed to
//! act on it.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[derive(Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

numeric_id!(
    /// Server-assigned order identifier. Unique and immutable.
    OrderId
);
numeric_id!(
    /// Identifier of the print shop that fulfils an order.
    ShopId
);
numeric_id!(
    /// Identifier of the customer that placed an order.
    CustomerId
);
numeric_id!(
    /// Identifier of an authenticated user (customer or shop operator).
    UserId
);
numeric_id!(
    /// Per-order message sequence number, starting at 1.
    MessageId
);

/// How the order reached the shop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    /// Files uploaded ahead of time for printing.
    Upload,
    /// The customer books a slot and brings the material in person.
    Walkin,
}

impl OrderType {
    /// Title used when the customer leaves the title blank.
    pub fn default_title(self, file_count: usize) -> String {
        match self {
            Self::Upload => format!("File Upload - {file_count} files"),
            Self::Walkin => "Walk-in Order".to_string(),
        }
    }
}

/// Lifecycle status of an order.
///
/// The derived ordering follows the transition graph, so `a < b` means `b`
/// lies ahead of `a`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[default]
    New,
    Processing,
    Ready,
    Completed,
}

impl OrderStatus {
    /// Every status, in graph order.
    pub const ALL: [OrderStatus; 4] = [
        OrderStatus::New,
        OrderStatus::Processing,
        OrderStatus::Ready,
        OrderStatus::Completed,
    ];

    /// Wire label for this status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Processing => "processing",
            Self::Ready => "ready",
            Self::Completed => "completed",
        }
    }

    /// The immediate successor, or `None` for the terminal status.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::New => Some(Self::Processing),
            Self::Processing => Some(Self::Ready),
            Self::Ready => Some(Self::Completed),
            Self::Completed => None,
        }
    }

    /// `completed` accepts no further transitions.
    pub fn is_terminal(self) -> bool {
        self.next().is_none()
    }

    /// Returns true only when `requested` is the immediate successor of `self`.
    ///
    /// Same-status requests, skip-ahead requests, and anything after
    /// `completed` are all invalid.
    pub fn can_transition_to(self, requested: OrderStatus) -> bool {
        self.next() == Some(requested)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque descriptor of an uploaded file.
///
/// Owned by the upload subsystem; this crate stores and forwards it without
/// looking at the file content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRef {
    pub original_name: String,
    pub stored_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size: u64,
}

impl FileRef {
    pub fn new(original_name: impl Into<String>, stored_name: impl Into<String>) -> Self {
        Self {
            original_name: original_name.into(),
            stored_name: stored_name.into(),
            mime_type: None,
            size: 0,
        }
    }
}

/// Customer-supplied part of an order at creation time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPayload {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_urgent: bool,
    #[serde(default)]
    pub files: Vec<FileRef>,
}

/// A print order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: OrderId,
    pub customer_id: CustomerId,
    pub shop_id: ShopId,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub title: String,
    pub description: String,
    pub status: OrderStatus,
    pub is_urgent: bool,
    pub files: Vec<FileRef>,
    /// Unix epoch milliseconds.
    pub created_at: u64,
    /// Unix epoch milliseconds of the last status change or file attachment.
    pub updated_at: u64,
}

impl Order {
    /// Build a fresh order in status `new`.
    pub fn new(
        id: OrderId,
        customer_id: CustomerId,
        shop_id: ShopId,
        order_type: OrderType,
        payload: OrderPayload,
        created_at: u64,
    ) -> Self {
        let title = match payload.title.trim() {
            "" => order_type.default_title(payload.files.len()),
            title => title.to_string(),
        };
        Self {
            id,
            customer_id,
            shop_id,
            order_type,
            title,
            description: payload.description,
            status: OrderStatus::New,
            is_urgent: payload.is_urgent,
            files: payload.files,
            created_at,
            updated_at: created_at,
        }
    }
}

/// An order as listed on a dashboard: the order, the viewer's unread count,
/// and the stream version the snapshot reflects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSummary {
    #[serde(flatten)]
    pub order: Order,
    pub unread_count: u32,
    pub version: u64,
}

/// Display ordering for boards: urgent first, then oldest first.
pub fn board_order(a: &OrderSummary, b: &OrderSummary) -> std::cmp::Ordering {
    b.order
        .is_urgent
        .cmp(&a.order.is_urgent)
        .then(a.order.created_at.cmp(&b.order.created_at))
        .then(a.order.id.cmp(&b.order.id))
}
