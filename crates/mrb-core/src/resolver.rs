//! Chat identifier resolution with a process-lifetime cache.
//!
//! Cache contract: entries are added on the first successful resolution of a
//! key and are never evicted or refreshed. A channel that is renamed or
//! migrated keeps resolving to its old target until the process restarts.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{
    domain::{ChatId, ChatIdentifier},
    messaging::{port::ChatDirectory, types::Conversation},
    Error,
};

/// A chat identifier mapped to something the messenger can address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedEntity {
    /// String form of the identifier that was resolved (`-100123`, `@name`).
    pub key: String,
    pub target: Conversation,
}

impl ResolvedEntity {
    pub fn chat_id(&self) -> ChatId {
        self.target.id
    }
}

/// Append-only map from identifier key to resolved entity.
///
/// Two tasks missing the same key at once both resolve it and the second
/// insert overwrites the first with an equivalent value.
#[derive(Default)]
pub struct EntityCache {
    entries: RwLock<HashMap<String, ResolvedEntity>>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<ResolvedEntity> {
        self.entries.read().await.get(key).cloned()
    }

    async fn insert(&self, entity: ResolvedEntity) {
        self.entries
            .write()
            .await
            .insert(entity.key.clone(), entity);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

pub struct EntityResolver {
    directory: Arc<dyn ChatDirectory>,
    cache: Arc<EntityCache>,
}

impl EntityResolver {
    pub fn new(directory: Arc<dyn ChatDirectory>, cache: Arc<EntityCache>) -> Self {
        Self { directory, cache }
    }

    pub fn cache(&self) -> &Arc<EntityCache> {
        &self.cache
    }

    /// Resolve `id` to an addressable chat.
    ///
    /// Every failure (unknown handle, chat the account is not in, rate limit,
    /// transport error) collapses to `None` after being logged; the caller
    /// skips whatever it wanted to do with the chat.
    pub async fn resolve(&self, id: &ChatIdentifier) -> Option<ResolvedEntity> {
        let key = id.key();
        if let Some(hit) = self.cache.get(&key).await {
            return Some(hit);
        }

        let found = match id {
            ChatIdentifier::Id(raw) => self.scan_conversations(*raw).await,
            ChatIdentifier::Handle(handle) => self.directory.lookup_handle(handle).await,
        };

        match found {
            Ok(Some(target)) => {
                debug!(key = %key, chat_id = target.id.0, "resolved chat");
                let entity = ResolvedEntity { key, target };
                self.cache.insert(entity.clone()).await;
                Some(entity)
            }
            Ok(None) => {
                warn!(key = %key, "chat not found (unknown handle or not a participant)");
                None
            }
            Err(Error::RateLimited { retry_after }) => {
                warn!(
                    key = %key,
                    retry_after_secs = retry_after.as_secs(),
                    "resolution rate limited; retry later"
                );
                None
            }
            Err(e) => {
                warn!(key = %key, "chat resolution failed: {e}");
                None
            }
        }
    }

    /// Scan the known conversations; on a miss, look the id up once.
    async fn scan_conversations(&self, raw: i64) -> crate::Result<Option<Conversation>> {
        let conversations = self.directory.conversations().await?;
        if let Some(hit) = conversations.into_iter().find(|c| c.id.0 == raw) {
            return Ok(Some(hit));
        }
        self.directory.lookup_id(ChatId(raw)).await
    }

    /// Every chat the directory currently knows about.
    pub async fn conversations(&self) -> crate::Result<Vec<Conversation>> {
        self.directory.conversations().await
    }

    /// Resolve a batch up front; returns how many succeeded.
    pub async fn warm(&self, ids: &[ChatIdentifier]) -> usize {
        let mut ok = 0usize;
        for id in ids {
            if self.resolve(id).await.is_some() {
                ok += 1;
            }
        }
        info!(requested = ids.len(), resolved = ok, "entity cache warmed");
        ok
    }
}
