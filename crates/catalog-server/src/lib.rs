//! Product catalog HTTP service with read-through caching.
//!
//! Wires [`catalog_cache`] in front of a [`CatalogStore`] and exposes it over
//! axum. The binary in `main.rs` only parses the CLI and calls into this
//! crate.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod handlers;
pub mod memory_store;
pub mod metrics;
pub mod middleware;
pub mod observability;
pub mod server;
pub mod service;
pub mod store;

pub use bootstrap::{
    BootstrapError, SelectedBackend, connect_shared_cache, create_cache_backend, flush_shared_cache,
};
pub use config::{AppConfig, CacheConfig, LoggingConfig, RedisConfig, ServerConfig};
pub use error::ApiError;
pub use memory_store::InMemoryCatalog;
pub use observability::init_tracing;
pub use server::{AppState, CatalogServer, build_app, build_state};
pub use service::{Cached, HealthReport, ProductService, ServiceError};
pub use store::{
    CatalogStore, NewOrder, NewOrderItem, NewProduct, NewUser, Order, OrderDetails, OrderItem,
    OrderSummary, Pagination, Product, ProductPage, StoreError, Tag, User,
};
