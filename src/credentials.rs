//! Where the Gemini API key comes from.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::constants::API_KEY_ENV;
use crate::error::GenerationError;

/// A host that can tell whether a key is selected and ask the user for one.
#[async_trait]
pub trait CredentialHost: Send + Sync {
    async fn has_selected_api_key(&self) -> bool;

    /// Ok means a key is available afterwards.
    async fn open_select_key(&self) -> Result<(), GenerationError>;
}

/// Shared, replaceable API key. The Gemini client reads it on every call so a
/// key supplied later (web UI, reloaded `.env`) takes effect immediately.
#[derive(Clone, Default)]
pub struct ApiKeySlot {
    key: Arc<RwLock<Option<String>>>,
}

impl ApiKeySlot {
    pub fn new(key: Option<String>) -> Self {
        Self {
            key: Arc::new(RwLock::new(key.filter(|k| !k.trim().is_empty()))),
        }
    }

    pub fn from_env() -> Self {
        Self::new(std::env::var(API_KEY_ENV).ok())
    }

    pub async fn get(&self) -> Option<String> {
        self.key.read().await.clone()
    }

    pub async fn set(&self, key: impl Into<String>) {
        let key = key.into();
        let mut slot = self.key.write().await;
        *slot = if key.trim().is_empty() { None } else { Some(key) };
    }

    pub async fn clear(&self) {
        self.key.write().await.take();
    }
}

#[async_trait]
impl CredentialHost for ApiKeySlot {
    async fn has_selected_api_key(&self) -> bool {
        self.get().await.is_some()
    }

    async fn open_select_key(&self) -> Result<(), GenerationError> {
        if self.has_selected_api_key().await {
            return Ok(());
        }
        // The key may have been added to the environment or .env since startup.
        dotenvy::dotenv().ok();
        match std::env::var(API_KEY_ENV) {
            Ok(key) if !key.trim().is_empty() => {
                info!("Picked up API key from {}", API_KEY_ENV);
                self.set(key).await;
                Ok(())
            }
            _ => {
                warn!("No API key available; set {} or supply one from the UI", API_KEY_ENV);
                Err(GenerationError::ApiKeyNotFound)
            }
        }
    }
}
