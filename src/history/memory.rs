use async_trait::async_trait;
use tokio::sync::RwLock;
use crate::errors::StoreError;
use crate::history::{ BoundedSessions, SessionStore };
use crate::models::chat::Turn;

/// Process-local store; sessions are lost on restart.
pub struct MemorySessionStore {
    sessions: RwLock<BoundedSessions>,
}

impl MemorySessionStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(BoundedSessions::new(capacity)),
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<Turn>>, StoreError> {
        Ok(self.sessions.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, turns: Vec<Turn>) -> Result<(), StoreError> {
        self.sessions.write().await.insert(key, turns);
        Ok(())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.sessions.read().await.len())
    }
}
