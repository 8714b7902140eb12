use thiserror::Error;

use crate::constants::API_KEY_MISSING_TEXT;

/// The remote capability a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Reply,
    Image,
    Video,
    Speech,
}

impl Capability {
    /// Text shown in the chat when this capability fails.
    pub fn failure_message(self) -> &'static str {
        match self {
            Capability::Reply => "Desculpe, não consegui processar o seu pedido. 😔",
            Capability::Image => "Desculpe, tive um problema ao criar a sua imagem realista. 😔",
            Capability::Video => "Desculpe, tive um problema ao criar o seu vídeo. 😔",
            Capability::Speech => "Desculpe, tive um problema ao gerar o áudio. 😔",
        }
    }
}

#[derive(Debug, Error)]
pub enum GenerationError {
    /// No usable API key: the host could not supply one, or the service
    /// rejected the one we sent.
    #[error("API_KEY_NOT_FOUND")]
    ApiKeyNotFound,
    #[error("{}: {detail}", .capability.failure_message())]
    Failed { capability: Capability, detail: String },
}

impl GenerationError {
    pub fn failed(capability: Capability, detail: impl Into<String>) -> Self {
        GenerationError::Failed {
            capability,
            detail: detail.into(),
        }
    }

    pub fn is_api_key_missing(&self) -> bool {
        matches!(self, GenerationError::ApiKeyNotFound)
    }

    /// What the failed turn's placeholder should say.
    pub fn user_message(&self) -> &'static str {
        match self {
            GenerationError::ApiKeyNotFound => API_KEY_MISSING_TEXT,
            GenerationError::Failed { capability, .. } => capability.failure_message(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored value is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reasons a chat operation is refused without touching state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChatError {
    #[error("nothing to send")]
    EmptyInput,
    #[error("chat {0} already has a turn in flight")]
    Busy(String),
    #[error("chat {0} does not exist")]
    NotFound(String),
    #[error("no chat is active")]
    NoActiveChat,
}
