//! Product catalog service.
//!
//! Reads go through the [`CacheCoordinator`]; writes go to the store first
//! and invalidate the affected cache entries only after the store has
//! committed them.
//!
//! | Operation              | Cache key        | Invalidation on success  |
//! |------------------------|------------------|--------------------------|
//! | `get_product`          | item             |                          |
//! | `list_products`        | list             |                          |
//! | `product_tags`         | tags             |                          |
//! | `create_product`       |                  | lists                    |
//! | `update_product`       |                  | item, tags, lists        |
//! | `delete_product`       |                  | item, tags, lists        |
//! | `attach_tags`          |                  | item, tags               |
//! | `replace_tags`         |                  | item, tags               |
//!
//! Users and orders are read and written straight through to the store.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use catalog_cache::{
    CacheBackend, CacheCoordinator, Invalidator, KeySpace, ListParams, OriginError, ReadThrough,
};

use crate::config::CacheConfig;
use crate::store::{
    CatalogStore, NewOrder, NewProduct, NewUser, Order, OrderDetails, OrderSummary, Product,
    ProductPage, StoreError, Tag, User,
};

/// Errors surfaced by [`ProductService`].
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{entity} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("Origin unavailable: {0}")]
    Unavailable(String),

    #[error("Origin failure: {0}")]
    Origin(OriginError),
}

impl ServiceError {
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            StoreError::Conflict { message } => Self::Conflict(message),
            StoreError::InvalidReference { message } | StoreError::InvalidInput { message } => {
                Self::InvalidInput(message)
            }
            StoreError::Unavailable { message } => Self::Unavailable(message),
        }
    }
}

impl From<OriginError> for ServiceError {
    fn from(err: OriginError) -> Self {
        match err {
            OriginError::Unavailable { message } => Self::Unavailable(message),
            other => Self::Origin(other),
        }
    }
}

/// A read result and whether it was served from the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cached<T> {
    pub value: T,
    pub cached: bool,
}

impl<T> Cached<T> {
    fn from_read(read: ReadThrough<T>) -> Option<Self> {
        let cached = read.source.is_cached();
        read.value.map(|value| Self { value, cached })
    }
}

/// Connectivity of the service's dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub store: bool,
    pub cache: bool,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.store && self.cache
    }
}

#[derive(Debug, Clone, Copy)]
struct Ttls {
    item: Duration,
    list: Duration,
    tags: Duration,
}

/// Catalog operations with read-through caching.
#[derive(Clone)]
pub struct ProductService {
    store: Arc<dyn CatalogStore>,
    coordinator: CacheCoordinator,
    invalidator: Invalidator,
    keys: KeySpace,
    ttls: Ttls,
}

impl ProductService {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        backend: Arc<dyn CacheBackend>,
        cache: &CacheConfig,
    ) -> Self {
        let keys = cache.key_space();
        Self {
            store,
            coordinator: CacheCoordinator::with_options(
                Arc::clone(&backend),
                cache.coordinator_options(),
            ),
            invalidator: Invalidator::new(backend, keys.clone()),
            keys,
            ttls: Ttls {
                item: cache.item_ttl(),
                list: cache.list_ttl(),
                tags: cache.tags_ttl(),
            },
        }
    }

    pub fn coordinator(&self) -> &CacheCoordinator {
        &self.coordinator
    }

    pub fn store(&self) -> &Arc<dyn CatalogStore> {
        &self.store
    }

    pub fn cache_mode(&self) -> &'static str {
        self.coordinator.backend().mode()
    }

    pub async fn get_product(&self, id: Uuid) -> Result<Cached<Product>, ServiceError> {
        let store = Arc::clone(&self.store);
        let read = self
            .coordinator
            .read_through(&self.keys.item(&id.to_string()), self.ttls.item, move || {
                async move { store.fetch_product(id).await.map_err(OriginError::from) }
            })
            .await?;
        Cached::from_read(read).ok_or_else(|| ServiceError::not_found("Product", id))
    }

    pub async fn list_products(
        &self,
        params: ListParams,
    ) -> Result<Cached<ProductPage>, ServiceError> {
        let store = Arc::clone(&self.store);
        let key = self.keys.list(&params);
        let read = self
            .coordinator
            .read_through(&key, self.ttls.list, move || async move {
                store
                    .fetch_products(&params)
                    .await
                    .map(Some)
                    .map_err(OriginError::from)
            })
            .await?;
        Cached::from_read(read)
            .ok_or_else(|| ServiceError::Origin(OriginError::query("list query returned nothing")))
    }

    pub async fn product_tags(&self, id: Uuid) -> Result<Cached<Vec<Tag>>, ServiceError> {
        let store = Arc::clone(&self.store);
        let read = self
            .coordinator
            .read_through(&self.keys.tags(&id.to_string()), self.ttls.tags, move || {
                async move {
                    store
                        .fetch_product_tags(id)
                        .await
                        .map(Some)
                        .map_err(OriginError::from)
                }
            })
            .await?;
        Ok(Cached::from_read(read).unwrap_or(Cached {
            value: Vec::new(),
            cached: false,
        }))
    }

    pub async fn create_product(&self, product: NewProduct) -> Result<Product, ServiceError> {
        let created = self.store.create_product(product).await?;
        self.invalidator.collection_changed().await;
        tracing::info!(product_id = %created.id, "product created");
        Ok(created)
    }

    pub async fn update_product(
        &self,
        id: Uuid,
        product: NewProduct,
    ) -> Result<Product, ServiceError> {
        let updated = self
            .store
            .update_product(id, product)
            .await?
            .ok_or_else(|| ServiceError::not_found("Product", id))?;
        self.invalidator.entity_changed(&id.to_string()).await;
        tracing::info!(product_id = %id, "product updated");
        Ok(updated)
    }

    pub async fn delete_product(&self, id: Uuid) -> Result<(), ServiceError> {
        if !self.store.delete_product(id).await? {
            return Err(ServiceError::not_found("Product", id));
        }
        self.invalidator.entity_changed(&id.to_string()).await;
        tracing::info!(product_id = %id, "product deleted");
        Ok(())
    }

    pub async fn attach_tags(&self, id: Uuid, tag_ids: &[Uuid]) -> Result<(), ServiceError> {
        if tag_ids.is_empty() {
            return Err(ServiceError::InvalidInput(
                "tagIds must contain at least one tag".into(),
            ));
        }
        self.store.attach_tags(id, tag_ids).await?;
        self.invalidator.derived_changed(&id.to_string()).await;
        Ok(())
    }

    pub async fn replace_tags(&self, id: Uuid, tag_ids: &[Uuid]) -> Result<(), ServiceError> {
        self.store.replace_tags(id, tag_ids).await?;
        self.invalidator.derived_changed(&id.to_string()).await;
        Ok(())
    }

    pub async fn list_tags(&self) -> Result<Vec<Tag>, ServiceError> {
        Ok(self.store.list_tags().await?)
    }

    pub async fn create_tag(&self, name: &str) -> Result<Tag, ServiceError> {
        Ok(self.store.create_tag(name).await?)
    }

    pub async fn list_users(&self) -> Result<Vec<User>, ServiceError> {
        Ok(self.store.list_users().await?)
    }

    pub async fn create_user(&self, user: NewUser) -> Result<User, ServiceError> {
        Ok(self.store.create_user(user).await?)
    }

    pub async fn user_orders(&self, user_id: Uuid) -> Result<Vec<OrderSummary>, ServiceError> {
        Ok(self.store.fetch_user_orders(user_id).await?)
    }

    pub async fn create_order(&self, user_id: Uuid, order: NewOrder) -> Result<Order, ServiceError> {
        Ok(self.store.create_order(user_id, order).await?)
    }

    pub async fn get_order(&self, id: Uuid) -> Result<OrderDetails, ServiceError> {
        self.store
            .fetch_order(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Order", id))
    }

    pub async fn health(&self) -> HealthReport {
        let (store, cache) = tokio::join!(self.store.ping(), self.coordinator.backend().is_healthy());
        if let Err(e) = &store {
            tracing::warn!(error = %e, "store health check failed");
        }
        HealthReport {
            store: store.is_ok(),
            cache,
        }
    }

    /// Drop every cache entry.
    pub async fn clear_cache(&self) -> bool {
        let cleared = self.coordinator.backend().clear().await;
        if cleared {
            tracing::info!(mode = self.cache_mode(), "cache cleared");
        } else {
            tracing::warn!(mode = self.cache_mode(), "cache clear failed");
        }
        cleared
    }
}

impl std::fmt::Debug for ProductService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProductService")
            .field("coordinator", &self.coordinator)
            .field("keys", &self.keys)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryCatalog;
    use catalog_cache::{LocalBackend, SortOrder};

    fn service() -> (ProductService, InMemoryCatalog) {
        let store = InMemoryCatalog::new();
        let service = ProductService::new(
            Arc::new(store.clone()),
            Arc::new(LocalBackend::new()),
            &CacheConfig::default(),
        );
        (service, store)
    }

    fn desk() -> NewProduct {
        NewProduct {
            name: "Desk".into(),
            price_cents: 12_000,
        }
    }

    #[tokio::test]
    async fn second_read_is_cached() {
        let (service, store) = service();
        let created = service.create_product(desk()).await.unwrap();

        let first = service.get_product(created.id).await.unwrap();
        assert!(!first.cached);
        let second = service.get_product(created.id).await.unwrap();
        assert!(second.cached);
        assert_eq!(first.value, second.value);
        assert_eq!(store.reads(), 1);
    }

    #[tokio::test]
    async fn missing_product_is_not_found_and_not_cached() {
        let (service, store) = service();
        let id = Uuid::new_v4();
        for _ in 0..2 {
            let err = service.get_product(id).await.unwrap_err();
            assert!(matches!(err, ServiceError::NotFound { .. }));
        }
        assert_eq!(store.reads(), 2);
    }

    #[tokio::test]
    async fn update_invalidates_item_and_lists() {
        let (service, _store) = service();
        let created = service.create_product(desk()).await.unwrap();
        service.get_product(created.id).await.unwrap();
        let list = service.list_products(ListParams::default()).await.unwrap();
        assert_eq!(list.value.products[0].name, "Desk");

        service
            .update_product(
                created.id,
                NewProduct {
                    name: "Standing Desk".into(),
                    price_cents: 30_000,
                },
            )
            .await
            .unwrap();

        let item = service.get_product(created.id).await.unwrap();
        assert!(!item.cached);
        assert_eq!(item.value.name, "Standing Desk");
        let list = service.list_products(ListParams::default()).await.unwrap();
        assert!(!list.cached);
        assert_eq!(list.value.products[0].name, "Standing Desk");
    }

    #[tokio::test]
    async fn create_invalidates_every_list_variant() {
        let (service, _store) = service();
        service.create_product(desk()).await.unwrap();
        let by_price = ListParams::new(10, 0, SortOrder::PriceDesc, None).unwrap();
        service.list_products(by_price.clone()).await.unwrap();
        service.list_products(ListParams::default()).await.unwrap();

        service
            .create_product(NewProduct {
                name: "Chair".into(),
                price_cents: 5_000,
            })
            .await
            .unwrap();

        let page = service.list_products(by_price).await.unwrap();
        assert!(!page.cached);
        assert_eq!(page.value.pagination.total, 2);
        let page = service.list_products(ListParams::default()).await.unwrap();
        assert!(!page.cached);
    }

    #[tokio::test]
    async fn tag_changes_invalidate_cached_tags() {
        let (service, _store) = service();
        let product = service.create_product(desk()).await.unwrap();
        let tag = service.create_tag("office").await.unwrap();

        assert!(service.product_tags(product.id).await.unwrap().value.is_empty());
        assert!(service.product_tags(product.id).await.unwrap().cached);

        service.attach_tags(product.id, &[tag.id]).await.unwrap();
        let tags = service.product_tags(product.id).await.unwrap();
        assert!(!tags.cached);
        assert_eq!(tags.value, vec![tag]);

        service.replace_tags(product.id, &[]).await.unwrap();
        assert!(service.product_tags(product.id).await.unwrap().value.is_empty());
    }

    #[tokio::test]
    async fn store_errors_map_to_service_errors() {
        let (service, store) = service();
        service.create_tag("sale").await.unwrap();
        assert!(matches!(
            service.create_tag("sale").await,
            Err(ServiceError::Conflict(_))
        ));
        assert!(matches!(
            service.attach_tags(Uuid::new_v4(), &[]).await,
            Err(ServiceError::InvalidInput(_))
        ));

        store.set_offline(true);
        assert!(matches!(
            service.get_product(Uuid::new_v4()).await,
            Err(ServiceError::Unavailable(_))
        ));
        let health = service.health().await;
        assert!(!health.store);
        assert!(health.cache);
        assert!(!health.is_healthy());
    }

    #[tokio::test]
    async fn clear_cache_forces_refetch() {
        let (service, store) = service();
        let created = service.create_product(desk()).await.unwrap();
        service.get_product(created.id).await.unwrap();
        assert!(service.clear_cache().await);
        assert!(!service.get_product(created.id).await.unwrap().cached);
        assert_eq!(store.reads(), 2);
    }

    #[tokio::test]
    async fn orders_bypass_the_cache() {
        let (service, store) = service();
        let product = service.create_product(desk()).await.unwrap();
        let user = service
            .create_user(NewUser {
                email: "ada@example.com".into(),
                name: None,
            })
            .await
            .unwrap();
        let order = service
            .create_order(
                user.id,
                NewOrder {
                    status: None,
                    items: vec![crate::store::NewOrderItem {
                        product_id: product.id,
                        qty: 3,
                        unit_price_cents: None,
                    }],
                },
            )
            .await
            .unwrap();

        let reads = store.reads();
        let details = service.get_order(order.id).await.unwrap();
        service.get_order(order.id).await.unwrap();
        assert_eq!(store.reads(), reads + 2);
        assert_eq!(details.items[0].unit_price_cents, 12_000);
        assert_eq!(service.user_orders(user.id).await.unwrap()[0].total_cents, 36_000);

        assert!(matches!(
            service.get_order(Uuid::new_v4()).await,
            Err(ServiceError::NotFound { entity: "Order", .. })
        ));
        assert!(matches!(
            service.user_orders(Uuid::new_v4()).await,
            Err(ServiceError::NotFound { entity: "User", .. })
        ));
    }
}
