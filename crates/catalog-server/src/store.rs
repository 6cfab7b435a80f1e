//! Origin data source for the catalog.
//!
//! [`CatalogStore`] is the source of truth; the cache in front of it is
//! advisory. Reads return `Ok(None)` for a missing entity rather than an
//! error, so the read-through layer can tell "absent" from "failed".

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use catalog_cache::{ListParams, OriginError};

/// A catalog product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub price_cents: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Fields a client supplies when creating or updating a product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProduct {
    pub name: String,
    pub price_cents: i64,
}

impl NewProduct {
    /// Longest accepted product name, in characters.
    pub const MAX_NAME_LEN: usize = 255;

    pub fn validate(&self) -> Result<(), StoreError> {
        let len = self.name.chars().count();
        if len == 0 || len > Self::MAX_NAME_LEN {
            return Err(StoreError::invalid_input(format!(
                "name must be between 1 and {} characters",
                Self::MAX_NAME_LEN
            )));
        }
        if self.price_cents < 0 {
            return Err(StoreError::invalid_input("price_cents must be >= 0"));
        }
        Ok(())
    }
}

/// A tag that can be attached to products.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub id: Uuid,
    pub name: String,
}

impl Tag {
    /// Longest accepted tag name, in characters.
    pub const MAX_NAME_LEN: usize = 100;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u64,
    pub total: u64,
}

/// One page of a product listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductPage {
    pub products: Vec<Product>,
    pub pagination: Pagination,
}

/// A customer account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl NewUser {
    pub const MAX_NAME_LEN: usize = 255;

    pub fn validate(&self) -> Result<(), StoreError> {
        if !is_plausible_email(&self.email) {
            return Err(StoreError::invalid_input("email must be a valid address"));
        }
        if let Some(name) = &self.name {
            let len = name.chars().count();
            if len == 0 || len > Self::MAX_NAME_LEN {
                return Err(StoreError::invalid_input(format!(
                    "name must be between 1 and {} characters",
                    Self::MAX_NAME_LEN
                )));
            }
        }
        Ok(())
    }
}

// local@domain.tld, no whitespace.
fn is_plausible_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !email.chars().any(char::is_whitespace)
        && domain
            .split_once('.')
            .is_some_and(|(host, tld)| !host.is_empty() && !tld.is_empty() && !tld.ends_with('.'))
}

/// Status given to orders created without one.
pub const DEFAULT_ORDER_STATUS: &str = "pending";

/// An order header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// One line of an order, joined with the product's current name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: Uuid,
    pub product_id: Uuid,
    pub qty: u32,
    pub unit_price_cents: i64,
    pub product_name: String,
}

/// An order with its lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDetails {
    #[serde(flatten)]
    pub order: Order,
    pub items: Vec<OrderItem>,
}

/// An order in a user's order history, with line totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSummary {
    pub id: Uuid,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub item_count: u64,
    pub total_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrderItem {
    pub product_id: Uuid,
    pub qty: u32,
    /// Defaults to the product's price at order time.
    #[serde(default)]
    pub unit_price_cents: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrder {
    #[serde(default)]
    pub status: Option<String>,
    pub items: Vec<NewOrderItem>,
}

impl NewOrder {
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.items.is_empty() {
            return Err(StoreError::invalid_input("items must contain at least one line"));
        }
        if self.status.as_deref().is_some_and(|s| s.trim().is_empty()) {
            return Err(StoreError::invalid_input("status must not be empty"));
        }
        for item in &self.items {
            if item.qty == 0 {
                return Err(StoreError::invalid_input("qty must be a positive integer"));
            }
            if item.unit_price_cents.is_some_and(|p| p < 0) {
                return Err(StoreError::invalid_input("unit_price_cents must be >= 0"));
            }
        }
        Ok(())
    }

    pub fn status(&self) -> &str {
        self.status.as_deref().unwrap_or(DEFAULT_ORDER_STATUS)
    }
}

/// Errors reported by a [`CatalogStore`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The entity a mutation targets does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A uniqueness constraint was violated.
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// A referenced entity does not exist.
    #[error("Invalid reference: {message}")]
    InvalidReference { message: String },

    /// The input failed validation.
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    /// The store could not be reached.
    #[error("Store unavailable: {message}")]
    Unavailable { message: String },
}

impl StoreError {
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn invalid_reference(message: impl Into<String>) -> Self {
        Self::InvalidReference {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

impl From<StoreError> for OriginError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable { message } => OriginError::unavailable(message),
            other => OriginError::query(other.to_string()),
        }
    }
}

/// The origin behind the cache.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Cheap connectivity check for health reporting.
    async fn ping(&self) -> Result<(), StoreError>;

    async fn fetch_product(&self, id: Uuid) -> Result<Option<Product>, StoreError>;

    /// Filter by `params.name` (case-insensitive substring), sort, then page.
    async fn fetch_products(&self, params: &ListParams) -> Result<ProductPage, StoreError>;

    /// Tags attached to a product, sorted by name. Empty for unknown
    /// products.
    async fn fetch_product_tags(&self, id: Uuid) -> Result<Vec<Tag>, StoreError>;

    async fn create_product(&self, product: NewProduct) -> Result<Product, StoreError>;

    /// `Ok(None)` when the product does not exist.
    async fn update_product(
        &self,
        id: Uuid,
        product: NewProduct,
    ) -> Result<Option<Product>, StoreError>;

    /// `Ok(false)` when the product does not exist.
    async fn delete_product(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Add tags to a product, keeping existing ones. All-or-nothing.
    async fn attach_tags(&self, id: Uuid, tag_ids: &[Uuid]) -> Result<(), StoreError>;

    /// Replace a product's tags with exactly `tag_ids`. All-or-nothing.
    async fn replace_tags(&self, id: Uuid, tag_ids: &[Uuid]) -> Result<(), StoreError>;

    /// Every tag, sorted by name.
    async fn list_tags(&self) -> Result<Vec<Tag>, StoreError>;

    /// Fails with [`StoreError::Conflict`] if the name is taken.
    async fn create_tag(&self, name: &str) -> Result<Tag, StoreError>;

    /// Every user, newest first.
    async fn list_users(&self) -> Result<Vec<User>, StoreError>;

    /// Fails with [`StoreError::Conflict`] if the email is taken.
    async fn create_user(&self, user: NewUser) -> Result<User, StoreError>;

    /// A user's orders, newest first. [`StoreError::NotFound`] for an
    /// unknown user.
    async fn fetch_user_orders(&self, user_id: Uuid) -> Result<Vec<OrderSummary>, StoreError>;

    /// Create an order and its lines atomically. Lines without a unit price
    /// take the product's current price; an unknown product rejects the
    /// whole order with [`StoreError::InvalidReference`].
    async fn create_order(&self, user_id: Uuid, order: NewOrder) -> Result<Order, StoreError>;

    async fn fetch_order(&self, id: Uuid) -> Result<Option<OrderDetails>, StoreError>;
}
