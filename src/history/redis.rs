use async_trait::async_trait;
use log::{ debug, warn };
use redis::{ AsyncCommands, Client };
use crate::errors::StoreError;
use crate::history::SessionStore;
use crate::models::chat::Turn;

/// Session store on Redis.
///
/// Each session lives at `<prefix><key>` as a JSON array of turns. Insertion
/// order is tracked in the sorted set `<prefix>__order`, scored by the counter
/// `<prefix>__seq`, so eviction pops the lowest scores.
pub struct RedisSessionStore {
    client: Client,
    key_prefix: String,
    order_key: String,
    seq_key: String,
    capacity: usize,
}

impl RedisSessionStore {
    pub fn new(url: &str, key_prefix: &str, capacity: usize) -> Result<Self, StoreError> {
        Ok(Self {
            client: Client::open(url)?,
            key_prefix: key_prefix.to_string(),
            order_key: format!("{}__order", key_prefix),
            seq_key: format!("{}__seq", key_prefix),
            capacity: capacity.max(1),
        })
    }

    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    fn data_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

/// Number of sessions to evict once the order set holds `len` members.
fn overflow(len: usize, capacity: usize) -> Option<usize> {
    len.checked_sub(capacity).filter(|excess| *excess > 0)
}

/// `ZPOPMIN` replies with a flat `[member, score, member, score, ...]` list.
fn popped_members(reply: Vec<String>) -> Vec<String> {
    reply.into_iter().step_by(2).collect()
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<Turn>>, StoreError> {
        let mut conn = self.get_connection().await?;
        let stored: Option<String> = conn.get(self.data_key(key)).await?;
        match stored {
            None => Ok(None),
            Some(json) =>
                match serde_json::from_str::<Vec<Turn>>(&json) {
                    Ok(turns) => Ok(Some(turns)),
                    Err(e) => {
                        warn!("Unreadable session '{}', treating as absent: {}", key, e);
                        Ok(None)
                    }
                }
        }
    }

    async fn set(&self, key: &str, turns: Vec<Turn>) -> Result<(), StoreError> {
        let json = serde_json::to_string(&turns)?;
        let mut conn = self.get_connection().await?;
        let seq: i64 = conn.incr(&self.seq_key, 1).await?;

        let (_, len): ((), usize) = redis
            ::pipe()
            .atomic()
            .set(self.data_key(key), &json)
            .cmd("ZADD")
            .arg(&self.order_key)
            .arg("NX")
            .arg(seq)
            .arg(key)
            .ignore()
            .zcard(&self.order_key)
            .query_async(&mut conn).await?;

        if let Some(excess) = overflow(len, self.capacity) {
            let popped: Vec<String> = redis
                ::cmd("ZPOPMIN")
                .arg(&self.order_key)
                .arg(excess)
                .query_async(&mut conn).await?;
            let evicted: Vec<String> = popped_members(popped)
                .iter()
                .map(|member| self.data_key(member))
                .collect();
            if !evicted.is_empty() {
                let _: () = conn.del(&evicted).await?;
                debug!("Evicted {} sessions from Redis", evicted.len());
            }
        }
        Ok(())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        let mut conn = self.get_connection().await?;
        Ok(conn.zcard(&self.order_key).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_sessions_past_capacity_are_evicted() {
        assert_eq!(overflow(3, 5), None);
        assert_eq!(overflow(5, 5), None);
        assert_eq!(overflow(6, 5), Some(1));
        assert_eq!(overflow(9, 5), Some(4));
    }

    #[test]
    fn zpopmin_reply_keeps_members_only() {
        let reply = vec!["chatglm1", "1", "chatglm2", "2"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(popped_members(reply), vec!["chatglm1".to_string(), "chatglm2".to_string()]);
        assert!(popped_members(Vec::new()).is_empty());
    }

    #[test]
    fn keys_share_the_configured_prefix() {
        let store = RedisSessionStore::new("redis://127.0.0.1:6379", "chat-session:", 0).unwrap();
        assert_eq!(store.data_key("chatglm1"), "chat-session:chatglm1");
        assert_eq!(store.order_key, "chat-session:__order");
        assert_eq!(store.seq_key, "chat-session:__seq");
        assert_eq!(store.capacity, 1);
    }
}
