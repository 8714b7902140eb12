//! Persistent chat store: the chat list and the active chat id, kept under
//! two keys of a small key-value storage.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::constants::{ACTIVE_CHAT_KEY, CHATS_KEY};
use crate::error::StoreError;
use crate::model::Chat;
use crate::state::AppState;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// One `<key>.json` file per key under a directory.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[derive(Clone)]
pub struct ChatStore {
    storage: Arc<dyn Storage>,
}

impl ChatStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::default()))
    }

    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(FileStorage::new(dir)))
    }

    /// Stored state, or a single fresh chat when nothing usable is stored.
    pub async fn load(&self) -> AppState {
        match self.read().await {
            Ok(Some(mut state)) => {
                let settled = state.settle_interrupted_turns();
                if settled > 0 {
                    warn!(settled, "Settled turns interrupted by the previous session");
                }
                info!(chats = state.chats.len(), "Loaded chats from storage");
                state
            }
            Ok(None) => {
                info!("No stored chats; starting a new one");
                fresh_state()
            }
            Err(e) => {
                error!("Failed to load chats from storage: {}", e);
                fresh_state()
            }
        }
    }

    async fn read(&self) -> Result<Option<AppState>, StoreError> {
        let Some(raw_chats) = self.storage.get(CHATS_KEY).await? else {
            return Ok(None);
        };
        let chats: Vec<Chat> = serde_json::from_str(&raw_chats)?;
        let Some(first) = chats.first() else {
            return Ok(None);
        };

        let stored_active = self.read_active().await;
        let active = stored_active
            .filter(|id| chats.iter().any(|c| &c.id == id))
            .unwrap_or_else(|| first.id.clone());

        Ok(Some(AppState::new(chats, Some(active))))
    }

    /// The stored active id. An unreadable pointer only loses the selection.
    async fn read_active(&self) -> Option<String> {
        let raw = match self.storage.get(ACTIVE_CHAT_KEY).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!("Failed to read the active chat id: {}", e);
                return None;
            }
        };
        serde_json::from_str::<Option<String>>(&raw)
            .inspect_err(|e| warn!("Ignoring unparsable active chat id: {}", e))
            .ok()
            .flatten()
    }

    /// Writes the chat list (when non-empty) and the active id (when set).
    pub async fn save(&self, state: &AppState) -> Result<(), StoreError> {
        if !state.chats.is_empty() {
            let chats = serde_json::to_string(&state.chats)?;
            self.storage.set(CHATS_KEY, &chats).await?;
        }
        if let Some(active) = &state.active_chat_id {
            let active = serde_json::to_string(active)?;
            self.storage.set(ACTIVE_CHAT_KEY, &active).await?;
        }
        debug!(chats = state.chats.len(), "Saved chats");
        Ok(())
    }
}

fn fresh_state() -> AppState {
    let chat = Chat::fresh();
    let id = chat.id.clone();
    AppState::new(vec![chat], Some(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Message;

    #[tokio::test]
    async fn empty_storage_yields_fresh_chat() {
        let store = ChatStore::in_memory();
        let state = store.load().await;
        assert_eq!(state.chats.len(), 1);
        assert_eq!(state.active_chat_id.as_deref(), Some(state.chats[0].id.as_str()));
        assert_eq!(state.chats[0].messages, vec![Message::seed()]);
    }

    #[tokio::test]
    async fn unknown_active_id_falls_back_to_first_chat() {
        let storage = Arc::new(MemoryStorage::default());
        let store = ChatStore::new(storage.clone());
        let state = AppState::new(vec![Chat::new("a"), Chat::new("b")], Some("b".into()));
        store.save(&state).await.unwrap();
        storage.set(ACTIVE_CHAT_KEY, "\"missing\"").await.unwrap();

        let loaded = store.load().await;
        assert_eq!(loaded.active_chat_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn corrupt_chats_fall_back_to_fresh_chat() {
        let storage = Arc::new(MemoryStorage::default());
        storage.set(CHATS_KEY, "{not json").await.unwrap();
        let loaded = ChatStore::new(storage).load().await;
        assert_eq!(loaded.chats.len(), 1);
        assert_eq!(loaded.chats[0].messages.len(), 1);
    }

    #[tokio::test]
    async fn empty_array_counts_as_nothing_stored() {
        let storage = Arc::new(MemoryStorage::default());
        storage.set(CHATS_KEY, "[]").await.unwrap();
        let loaded = ChatStore::new(storage).load().await;
        assert_eq!(loaded.chats.len(), 1);
        assert!(loaded.chats[0].id.starts_with("id-"));
    }

    #[tokio::test]
    async fn unparsable_active_id_keeps_chats() {
        let storage = Arc::new(MemoryStorage::default());
        let store = ChatStore::new(storage.clone());
        let state = AppState::new(vec![Chat::new("a"), Chat::new("b")], Some("b".into()));
        store.save(&state).await.unwrap();
        storage.set(ACTIVE_CHAT_KEY, "b").await.unwrap();

        let loaded = store.load().await;
        assert_eq!(loaded.chats, state.chats);
        assert_eq!(loaded.active_chat_id.as_deref(), Some("a"));
    }
}
