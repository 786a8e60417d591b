mod bounded;
mod file;
mod memory;
mod redis;
pub mod reconstruct;

pub use bounded::BoundedSessions;
pub use file::FileSessionStore;
pub use memory::MemorySessionStore;
pub use redis::RedisSessionStore;
pub use reconstruct::{ reconstruct, Reconstruction };

use async_trait::async_trait;
use log::info;
use std::error::Error;
use std::sync::Arc;
use crate::cli::Args;
use crate::errors::StoreError;
use crate::models::chat::Turn;

/// Durable mapping from session key to the ordered turns of that session.
///
/// `get` on an unknown key is `Ok(None)`. `set` inserts or overwrites; when an
/// insert would push the store past its capacity the oldest-inserted key is
/// evicted first.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<Turn>>, StoreError>;

    async fn set(&self, key: &str, turns: Vec<Turn>) -> Result<(), StoreError>;

    async fn len(&self) -> Result<usize, StoreError>;
}

pub async fn create_session_store(
    args: &Args
) -> Result<Arc<dyn SessionStore>, Box<dyn Error + Send + Sync>> {
    let capacity = args.session_store_capacity;
    match args.session_store_type.to_lowercase().as_str() {
        "memory" => Ok(Arc::new(MemorySessionStore::new(capacity))),
        "file" => {
            let store = FileSessionStore::open(&args.session_store_path, capacity).await?;
            Ok(Arc::new(store))
        }
        "redis" => {
            let store = RedisSessionStore::new(
                &args.session_redis_url,
                &args.session_redis_prefix,
                capacity
            )?;
            Ok(Arc::new(store))
        }
        _ =>
            Err(
                Box::new(
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("Unsupported session store type: {}", args.session_store_type)
                    )
                )
            ),
    }
}

pub async fn initialize_session_store(
    args: &Args
) -> Result<Arc<dyn SessionStore>, Box<dyn Error + Send + Sync>> {
    let location = match args.session_store_type.to_lowercase().as_str() {
        "file" => args.session_store_path.clone(),
        "redis" => args.session_redis_url.clone(),
        _ => "process memory".to_string(),
    };
    info!(
        "Chat sessions will be stored in: {} at {} (capacity {})",
        args.session_store_type,
        location,
        args.session_store_capacity
    );
    let store = create_session_store(args).await?;
    info!("Session store ready with {} existing sessions", store.len().await?);
    Ok(store)
}
