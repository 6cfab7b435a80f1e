//! In-memory [`CatalogStore`].
//!
//! Used for single-node runs, demos and tests. Besides the data itself it
//! counts origin reads and can simulate latency or an outage, which is what
//! cache behavior tests need to observe.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use catalog_cache::{ListParams, SortOrder};

use crate::store::{
    CatalogStore, NewOrder, NewProduct, NewUser, Order, OrderDetails, OrderItem, OrderSummary,
    Pagination, Product, ProductPage, StoreError, Tag, User,
};

#[derive(Debug, Clone)]
struct OrderLine {
    id: Uuid,
    product_id: Uuid,
    qty: u32,
    unit_price_cents: i64,
}

#[derive(Debug, Clone)]
struct StoredOrder {
    order: Order,
    lines: Vec<OrderLine>,
}

impl StoredOrder {
    fn summary(&self) -> OrderSummary {
        OrderSummary {
            id: self.order.id,
            status: self.order.status.clone(),
            created_at: self.order.created_at,
            updated_at: self.order.updated_at,
            item_count: self.lines.len() as u64,
            total_cents: self
                .lines
                .iter()
                .map(|line| i64::from(line.qty).saturating_mul(line.unit_price_cents))
                .fold(0, i64::saturating_add),
        }
    }
}

#[derive(Debug, Default)]
struct Catalog {
    products: HashMap<Uuid, Product>,
    tags: HashMap<Uuid, Tag>,
    product_tags: HashMap<Uuid, BTreeSet<Uuid>>,
    users: HashMap<Uuid, User>,
    orders: HashMap<Uuid, StoredOrder>,
}

impl Catalog {
    fn check_tags(&self, tag_ids: &[Uuid]) -> Result<(), StoreError> {
        match tag_ids.iter().find(|id| !self.tags.contains_key(id)) {
            Some(missing) => Err(StoreError::invalid_reference(format!(
                "One or more tags not found: {missing}"
            ))),
            None => Ok(()),
        }
    }
}

/// Shared in-memory catalog. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    data: Arc<RwLock<Catalog>>,
    reads: Arc<AtomicU64>,
    latency_ms: Arc<AtomicU64>,
    offline: Arc<AtomicBool>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A catalog pre-filled with a few products and tags.
    pub async fn with_demo_data() -> Self {
        let catalog = Self::new();
        let mut data = catalog.data.write().await;
        let tags: Vec<Tag> = ["kitchen", "office", "outdoor"]
            .into_iter()
            .map(|name| Tag {
                id: Uuid::new_v4(),
                name: name.to_string(),
            })
            .collect();
        for tag in &tags {
            data.tags.insert(tag.id, tag.clone());
        }
        let products = [
            ("Oak Desk", 24_900, 1),
            ("Desk Lamp", 3_450, 1),
            ("Cast Iron Pan", 4_200, 0),
            ("Garden Chair", 7_900, 2),
        ];
        for (name, price_cents, tag) in products {
            let now = OffsetDateTime::now_utc();
            let product = Product {
                id: Uuid::new_v4(),
                name: name.to_string(),
                price_cents,
                created_at: now,
                updated_at: now,
            };
            data.product_tags
                .entry(product.id)
                .or_default()
                .insert(tags[tag].id);
            data.products.insert(product.id, product);
        }
        drop(data);
        catalog
    }

    /// Number of read operations served so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Delay every read by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make every operation fail with [`StoreError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("catalog store is offline"));
        }
        Ok(())
    }

    async fn begin_read(&self) -> Result<(), StoreError> {
        self.check_online()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        Ok(())
    }
}

fn sort_products(products: &mut [Product], sort: SortOrder) {
    match sort {
        SortOrder::CreatedAtAsc => products.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
        SortOrder::CreatedAtDesc => products.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
        SortOrder::NameAsc => products.sort_by(|a, b| a.name.cmp(&b.name)),
        SortOrder::NameDesc => products.sort_by(|a, b| b.name.cmp(&a.name)),
        SortOrder::PriceAsc => products.sort_by_key(|p| p.price_cents),
        SortOrder::PriceDesc => products.sort_by(|a, b| b.price_cents.cmp(&a.price_cents)),
    }
}

#[async_trait]
impl CatalogStore for InMemoryCatalog {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check_online()
    }

    async fn fetch_product(&self, id: Uuid) -> Result<Option<Product>, StoreError> {
        self.begin_read().await?;
        Ok(self.data.read().await.products.get(&id).cloned())
    }

    async fn fetch_products(&self, params: &ListParams) -> Result<ProductPage, StoreError> {
        self.begin_read().await?;
        let data = self.data.read().await;
        let needle = params.name.as_deref().map(str::to_lowercase);
        let mut matching: Vec<Product> = data
            .products
            .values()
            .filter(|p| match &needle {
                Some(needle) => p.name.to_lowercase().contains(needle.as_str()),
                None => true,
            })
            .cloned()
            .collect();
        drop(data);

        // Stable order for equal sort keys.
        matching.sort_by_key(|p| p.id);
        sort_products(&mut matching, params.sort);

        let total = matching.len() as u64;
        let products = matching
            .into_iter()
            .skip(usize::try_from(params.offset).unwrap_or(usize::MAX))
            .take(params.limit as usize)
            .collect();
        Ok(ProductPage {
            products,
            pagination: Pagination {
                limit: params.limit,
                offset: params.offset,
                total,
            },
        })
    }

    async fn fetch_product_tags(&self, id: Uuid) -> Result<Vec<Tag>, StoreError> {
        self.begin_read().await?;
        let data = self.data.read().await;
        let mut tags: Vec<Tag> = data
            .product_tags
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|tag_id| data.tags.get(tag_id).cloned())
            .collect();
        tags.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tags)
    }

    async fn create_product(&self, product: NewProduct) -> Result<Product, StoreError> {
        self.check_online()?;
        product.validate()?;
        let now = OffsetDateTime::now_utc();
        let created = Product {
            id: Uuid::new_v4(),
            name: product.name,
            price_cents: product.price_cents,
            created_at: now,
            updated_at: now,
        };
        self.data
            .write()
            .await
            .products
            .insert(created.id, created.clone());
        Ok(created)
    }

    async fn update_product(
        &self,
        id: Uuid,
        product: NewProduct,
    ) -> Result<Option<Product>, StoreError> {
        self.check_online()?;
        product.validate()?;
        let mut data = self.data.write().await;
        let Some(existing) = data.products.get_mut(&id) else {
            return Ok(None);
        };
        existing.name = product.name;
        existing.price_cents = product.price_cents;
        existing.updated_at = OffsetDateTime::now_utc();
        Ok(Some(existing.clone()))
    }

    async fn delete_product(&self, id: Uuid) -> Result<bool, StoreError> {
        self.check_online()?;
        let mut data = self.data.write().await;
        data.product_tags.remove(&id);
        Ok(data.products.remove(&id).is_some())
    }

    async fn attach_tags(&self, id: Uuid, tag_ids: &[Uuid]) -> Result<(), StoreError> {
        self.check_online()?;
        let mut data = self.data.write().await;
        if !data.products.contains_key(&id) {
            return Err(StoreError::not_found("Product", id));
        }
        data.check_tags(tag_ids)?;
        data.product_tags
            .entry(id)
            .or_default()
            .extend(tag_ids.iter().copied());
        Ok(())
    }

    async fn replace_tags(&self, id: Uuid, tag_ids: &[Uuid]) -> Result<(), StoreError> {
        self.check_online()?;
        let mut data = self.data.write().await;
        if !data.products.contains_key(&id) {
            return Err(StoreError::not_found("Product", id));
        }
        data.check_tags(tag_ids)?;
        data.product_tags
            .insert(id, tag_ids.iter().copied().collect());
        Ok(())
    }

    async fn list_tags(&self) -> Result<Vec<Tag>, StoreError> {
        self.begin_read().await?;
        let mut tags: Vec<Tag> = self.data.read().await.tags.values().cloned().collect();
        tags.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tags)
    }

    async fn create_tag(&self, name: &str) -> Result<Tag, StoreError> {
        self.check_online()?;
        let len = name.chars().count();
        if len == 0 || len > Tag::MAX_NAME_LEN {
            return Err(StoreError::invalid_input(format!(
                "name must be between 1 and {} characters",
                Tag::MAX_NAME_LEN
            )));
        }
        let mut data = self.data.write().await;
        if data.tags.values().any(|t| t.name == name) {
            return Err(StoreError::conflict("Tag with this name already exists"));
        }
        let tag = Tag {
            id: Uuid::new_v4(),
            name: name.to_string(),
        };
        data.tags.insert(tag.id, tag.clone());
        Ok(tag)
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        self.begin_read().await?;
        let mut users: Vec<User> = self.data.read().await.users.values().cloned().collect();
        users.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(users)
    }

    async fn create_user(&self, user: NewUser) -> Result<User, StoreError> {
        self.check_online()?;
        user.validate()?;
        let mut data = self.data.write().await;
        if data.users.values().any(|u| u.email == user.email) {
            return Err(StoreError::conflict("User with this email already exists"));
        }
        let now = OffsetDateTime::now_utc();
        let created = User {
            id: Uuid::new_v4(),
            email: user.email,
            name: user.name,
            created_at: now,
            updated_at: now,
        };
        data.users.insert(created.id, created.clone());
        Ok(created)
    }

    async fn fetch_user_orders(&self, user_id: Uuid) -> Result<Vec<OrderSummary>, StoreError> {
        self.begin_read().await?;
        let data = self.data.read().await;
        if !data.users.contains_key(&user_id) {
            return Err(StoreError::not_found("User", user_id));
        }
        let mut orders: Vec<OrderSummary> = data
            .orders
            .values()
            .filter(|stored| stored.order.user_id == user_id)
            .map(StoredOrder::summary)
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(orders)
    }

    async fn create_order(&self, user_id: Uuid, order: NewOrder) -> Result<Order, StoreError> {
        self.check_online()?;
        order.validate()?;
        let mut data = self.data.write().await;
        if !data.users.contains_key(&user_id) {
            return Err(StoreError::not_found("User", user_id));
        }

        // Resolve every line before writing anything.
        let lines = order
            .items
            .iter()
            .map(|item| {
                let product = data.products.get(&item.product_id).ok_or_else(|| {
                    StoreError::invalid_reference(format!("Product {} not found", item.product_id))
                })?;
                Ok(OrderLine {
                    id: Uuid::new_v4(),
                    product_id: item.product_id,
                    qty: item.qty,
                    unit_price_cents: item.unit_price_cents.unwrap_or(product.price_cents),
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        let now = OffsetDateTime::now_utc();
        let created = Order {
            id: Uuid::new_v4(),
            user_id,
            status: order.status().to_string(),
            created_at: now,
            updated_at: now,
        };
        data.orders.insert(
            created.id,
            StoredOrder {
                order: created.clone(),
                lines,
            },
        );
        Ok(created)
    }

    async fn fetch_order(&self, id: Uuid) -> Result<Option<OrderDetails>, StoreError> {
        self.begin_read().await?;
        let data = self.data.read().await;
        let Some(stored) = data.orders.get(&id) else {
            return Ok(None);
        };
        // Lines whose product no longer exists drop out of the join.
        let items = stored
            .lines
            .iter()
            .filter_map(|line| {
                data.products.get(&line.product_id).map(|product| OrderItem {
                    id: line.id,
                    product_id: line.product_id,
                    qty: line.qty,
                    unit_price_cents: line.unit_price_cents,
                    product_name: product.name.clone(),
                })
            })
            .collect();
        Ok(Some(OrderDetails {
            order: stored.order.clone(),
            items,
        }))
    }
}
