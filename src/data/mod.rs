//! Data layer module
//!
//! Handles resource persistence:
//! - `ResourceStore` trait and query predicates
//! - In-memory and SQLite adapters
//! - ActivityStreams vocabulary helpers

pub mod model;
mod memory;
mod sqlite;
mod store;

pub use memory::MemoryResourceStore;
pub use sqlite::SqliteResourceStore;
pub use store::{Predicate, ResourceStore};

use std::sync::Arc;

use crate::config::{StoreConfig, StoreDriver};
use crate::error::AppError;

/// Open the store selected by configuration
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn ResourceStore>, AppError> {
    match config.driver {
        StoreDriver::Memory => {
            tracing::info!("Using in-memory resource store");
            Ok(Arc::new(MemoryResourceStore::new()))
        }
        StoreDriver::Sqlite => {
            let path = config.path.as_deref().ok_or_else(|| {
                AppError::Config("store.path is required when store.driver=sqlite".to_string())
            })?;
            Ok(Arc::new(SqliteResourceStore::connect(path).await?))
        }
    }
}
