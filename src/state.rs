//! Application state and the pure transitions applied to it.
//!
//! Every change to the chat collection is an [`Event`] fed through
//! [`AppState::reduce`]. Events address chats and messages by id; an event
//! whose target no longer exists leaves the state unchanged, which is what
//! keeps late title and narration results from resurrecting deleted chats.

use serde::Serialize;

use crate::constants::{FALLBACK_TITLE, GENERIC_FAILURE_TEXT};
use crate::model::{Chat, Message, MessagePatch};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppState {
    pub chats: Vec<Chat>,
    pub active_chat_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Prepend a chat and make it active.
    NewChat { chat: Chat },
    Select { chat_id: String },
    Rename { chat_id: String, title: String },
    /// `replacement` becomes the only chat if the deleted one was the last.
    Delete { chat_id: String, replacement: Chat },
    SubmitTurn {
        chat_id: String,
        user: Message,
        placeholder: Message,
    },
    Progress {
        chat_id: String,
        message_id: u64,
        text: String,
    },
    ResolveTurn {
        chat_id: String,
        message_id: u64,
        patch: MessagePatch,
    },
    FailTurn {
        chat_id: String,
        message_id: u64,
        text: String,
    },
    AttachAudio {
        chat_id: String,
        message_id: u64,
        audio_url: String,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::NewChat { .. } => "new-chat",
            Event::Select { .. } => "select",
            Event::Rename { .. } => "rename",
            Event::Delete { .. } => "delete",
            Event::SubmitTurn { .. } => "submit-turn",
            Event::Progress { .. } => "progress",
            Event::ResolveTurn { .. } => "resolve-turn",
            Event::FailTurn { .. } => "fail-turn",
            Event::AttachAudio { .. } => "attach-audio",
        }
    }
}

impl AppState {
    pub fn new(chats: Vec<Chat>, active_chat_id: Option<String>) -> Self {
        Self {
            chats,
            active_chat_id,
        }
    }

    pub fn chat(&self, id: &str) -> Option<&Chat> {
        self.chats.iter().find(|c| c.id == id)
    }

    fn chat_mut(&mut self, id: &str) -> Option<&mut Chat> {
        self.chats.iter_mut().find(|c| c.id == id)
    }

    pub fn active_chat(&self) -> Option<&Chat> {
        self.active_chat_id.as_deref().and_then(|id| self.chat(id))
    }

    fn message_mut(&mut self, chat_id: &str, message_id: u64) -> Option<&mut Message> {
        self.chat_mut(chat_id)?.message_mut(message_id)
    }

    pub fn reduce(mut self, event: Event) -> AppState {
        match event {
            Event::NewChat { chat } => {
                self.active_chat_id = Some(chat.id.clone());
                self.chats.insert(0, chat);
            }
            Event::Select { chat_id } => {
                if self.chat(&chat_id).is_some() {
                    self.active_chat_id = Some(chat_id);
                }
            }
            Event::Rename { chat_id, title } => {
                if let Some(chat) = self.chat_mut(&chat_id) {
                    let title = title.trim();
                    chat.title = if title.is_empty() {
                        FALLBACK_TITLE.to_string()
                    } else {
                        title.to_string()
                    };
                }
            }
            Event::Delete {
                chat_id,
                replacement,
            } => {
                let before = self.chats.len();
                self.chats.retain(|c| c.id != chat_id);
                if self.chats.len() == before {
                    return self;
                }
                if self.chats.is_empty() {
                    self.active_chat_id = Some(replacement.id.clone());
                    self.chats.push(replacement);
                } else if self.active_chat_id.as_deref() == Some(chat_id.as_str()) {
                    self.active_chat_id = self.chats.first().map(|c| c.id.clone());
                }
            }
            Event::SubmitTurn {
                chat_id,
                user,
                placeholder,
            } => {
                if let Some(chat) = self.chat_mut(&chat_id) {
                    chat.messages.push(user);
                    chat.messages.push(placeholder);
                }
            }
            Event::Progress {
                chat_id,
                message_id,
                text,
            } => {
                if let Some(message) = self.message_mut(&chat_id, message_id) {
                    if message.is_loading {
                        message.content = text;
                    }
                }
            }
            Event::ResolveTurn {
                chat_id,
                message_id,
                patch,
            } => {
                if let Some(message) = self.message_mut(&chat_id, message_id) {
                    patch.apply_to(message);
                }
            }
            Event::FailTurn {
                chat_id,
                message_id,
                text,
            } => {
                if let Some(message) = self.message_mut(&chat_id, message_id) {
                    message.content = text;
                    message.is_loading = false;
                }
            }
            Event::AttachAudio {
                chat_id,
                message_id,
                audio_url,
            } => {
                if let Some(message) = self.message_mut(&chat_id, message_id) {
                    message.audio_url = Some(audio_url);
                }
            }
        }
        self
    }

    /// Placeholders that outlived their session can never resolve; turn them
    /// into failures. Returns how many were settled.
    pub fn settle_interrupted_turns(&mut self) -> usize {
        let mut settled = 0;
        for message in self
            .chats
            .iter_mut()
            .flat_map(|c| c.messages.iter_mut())
            .filter(|m| m.is_loading)
        {
            message.content = GENERIC_FAILURE_TEXT.to_string();
            message.is_loading = false;
            settled += 1;
        }
        settled
    }
}
