//! Chats and messages, in the shape they are persisted and sent to the UI.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{NEW_CHAT_TITLE, SEED_GREETING, SEED_MESSAGE_ID, THINKING_TEXT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: u64,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_loading: bool,
}

impl Message {
    fn new(id: u64, role: Role, content: impl Into<String>) -> Self {
        Self {
            id,
            role,
            content: content.into(),
            image_url: None,
            user_image_url: None,
            video_url: None,
            audio_url: None,
            is_loading: false,
        }
    }

    /// The greeting every new chat starts with.
    pub fn seed() -> Self {
        Self::new(SEED_MESSAGE_ID, Role::Assistant, SEED_GREETING)
    }

    pub fn user(id: u64, content: impl Into<String>, user_image_url: Option<String>) -> Self {
        Self {
            user_image_url,
            ..Self::new(id, Role::User, content)
        }
    }

    pub fn assistant(id: u64, content: impl Into<String>) -> Self {
        Self::new(id, Role::Assistant, content)
    }

    /// Provisional assistant message shown while a turn is in flight.
    pub fn placeholder(id: u64) -> Self {
        Self {
            is_loading: true,
            ..Self::new(id, Role::Assistant, THINKING_TEXT)
        }
    }

    pub fn is_seed(&self) -> bool {
        self.id == SEED_MESSAGE_ID
    }
}

/// Fields a resolved turn writes onto its placeholder. `None` leaves the
/// placeholder's value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
    pub audio_url: Option<String>,
}

impl MessagePatch {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    /// Merges the patch and marks the message as settled.
    pub fn apply_to(self, message: &mut Message) {
        if let Some(content) = self.content {
            message.content = content;
        }
        if let Some(image_url) = self.image_url {
            message.image_url = Some(image_url);
        }
        if let Some(video_url) = self.video_url {
            message.video_url = Some(video_url);
        }
        if let Some(audio_url) = self.audio_url {
            message.audio_url = Some(audio_url);
        }
        message.is_loading = false;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
}

impl Chat {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: NEW_CHAT_TITLE.to_string(),
            messages: vec![Message::seed()],
        }
    }

    /// A fresh chat with a generated id.
    pub fn fresh() -> Self {
        Self::new(new_chat_id())
    }

    pub fn user_message_count(&self) -> usize {
        self.messages.iter().filter(|m| m.role == Role::User).count()
    }

    pub fn has_turn_in_flight(&self) -> bool {
        self.messages.iter().any(|m| m.is_loading)
    }

    pub fn message(&self, id: u64) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn message_mut(&mut self, id: u64) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    /// Id for the next user message: the clock, bumped past anything the
    /// chat already holds. The placeholder takes the id after it.
    pub fn next_message_id(&self, now_ms: u64) -> u64 {
        let highest = self.messages.iter().map(|m| m.id).max().unwrap_or(0);
        now_ms.max(highest.saturating_add(1))
    }

    /// Messages whose content contains `query`, ignoring case.
    pub fn search(&self, query: &str) -> Vec<&Message> {
        let needle = query.to_lowercase();
        if needle.trim().is_empty() {
            return self.messages.iter().collect();
        }
        self.messages
            .iter()
            .filter(|m| m.content.to_lowercase().contains(&needle))
            .collect()
    }
}

/// An image the user attached to a turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageAttachment {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl ImageAttachment {
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data,
        }
    }

    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(&self.data)
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.to_base64())
    }
}

pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// `id-<millis>-<9 random chars>`.
pub fn new_chat_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("id-{}-{}", now_millis(), &suffix[..9])
}
