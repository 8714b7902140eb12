//! Conversation orchestrator: owns the chat state, runs turns, persists and
//! broadcasts every change.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::command::{self, Command};
use crate::dispatcher::{Dispatched, Dispatcher, Progress};
use crate::error::ChatError;
use crate::model::{now_millis, Chat, ImageAttachment, Message};
use crate::state::{AppState, Event};
use crate::store::ChatStore;

const UPDATE_CHANNEL_CAPACITY: usize = 100;

/// What the user submitted from the input bar.
#[derive(Debug, Clone, Default)]
pub struct TurnInput {
    pub text: String,
    pub image: Option<ImageAttachment>,
    /// The input bar's image-generation toggle.
    pub image_mode: bool,
}

impl TurnInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    /// The text to dispatch and the attachment to send with it, or `None`
    /// when there is nothing to send.
    fn normalize(self) -> Option<(String, Option<ImageAttachment>)> {
        let blank = self.text.trim().is_empty();
        if self.image_mode {
            if blank {
                return None;
            }
            return Some((command::image_request(&self.text), None));
        }
        if blank && self.image.is_none() {
            return None;
        }
        Some((self.text, self.image))
    }
}

/// A change notification for subscribers (the web UI).
#[derive(Debug, Clone)]
pub struct StateUpdate {
    pub event: &'static str,
    pub state: Arc<AppState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnStatus {
    Resolved,
    Failed { message: String },
}

/// Result of a finished turn. The title and narration tasks keep running
/// after the turn; await [`TurnOutcome::settle`] to wait for them.
#[derive(Debug)]
pub struct TurnOutcome {
    pub chat_id: String,
    pub message_id: u64,
    pub status: TurnStatus,
    pub title_task: Option<JoinHandle<()>>,
    pub narration_task: Option<JoinHandle<()>>,
}

impl TurnOutcome {
    pub async fn settle(self) -> TurnStatus {
        for task in [self.title_task, self.narration_task].into_iter().flatten() {
            if let Err(e) = task.await {
                error!("Background task for chat {} failed: {:?}", self.chat_id, e);
            }
        }
        self.status
    }
}

/// A turn whose messages are already in the chat but which has not been
/// dispatched yet.
pub struct PendingTurn {
    orchestrator: Orchestrator,
    chat_id: String,
    message_id: u64,
    text: String,
    image: Option<ImageAttachment>,
    history: Vec<Message>,
    is_first_user_turn: bool,
}

impl PendingTurn {
    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    #[instrument(skip(self), fields(chat_id = %self.chat_id, message_id = self.message_id))]
    pub async fn run(self) -> TurnOutcome {
        let orchestrator = self.orchestrator;
        let progress = PlaceholderProgress {
            orchestrator: orchestrator.clone(),
            chat_id: self.chat_id.clone(),
            message_id: self.message_id,
        };
        let dispatcher = &orchestrator.inner.dispatcher;
        let result = dispatcher
            .dispatch(
                Command::parse(&self.text),
                self.image.as_ref(),
                &self.history,
                &progress,
            )
            .await;

        match result {
            Ok(Dispatched { patch, narration }) => {
                orchestrator
                    .apply(Event::ResolveTurn {
                        chat_id: self.chat_id.clone(),
                        message_id: self.message_id,
                        patch,
                    })
                    .await;
                info!("Turn resolved");

                let title_task = (self.is_first_user_turn && !self.text.trim().is_empty())
                    .then(|| orchestrator.spawn_title(self.chat_id.clone(), self.text.clone()));
                let narration_task = narration.map(|text| {
                    orchestrator.spawn_narration(self.chat_id.clone(), self.message_id, text)
                });

                TurnOutcome {
                    chat_id: self.chat_id,
                    message_id: self.message_id,
                    status: TurnStatus::Resolved,
                    title_task,
                    narration_task,
                }
            }
            Err(e) => {
                error!("Error sending message: {}", e);
                if e.is_api_key_missing() {
                    dispatcher.forget_credential();
                }
                let message = e.user_message().to_string();
                orchestrator
                    .apply(Event::FailTurn {
                        chat_id: self.chat_id.clone(),
                        message_id: self.message_id,
                        text: message.clone(),
                    })
                    .await;
                TurnOutcome {
                    chat_id: self.chat_id,
                    message_id: self.message_id,
                    status: TurnStatus::Failed { message },
                    title_task: None,
                    narration_task: None,
                }
            }
        }
    }
}

struct PlaceholderProgress {
    orchestrator: Orchestrator,
    chat_id: String,
    message_id: u64,
}

#[async_trait]
impl Progress for PlaceholderProgress {
    async fn report(&self, text: &str) {
        self.orchestrator
            .apply(Event::Progress {
                chat_id: self.chat_id.clone(),
                message_id: self.message_id,
                text: text.to_string(),
            })
            .await;
    }
}

struct Inner {
    state: Mutex<AppState>,
    store: ChatStore,
    dispatcher: Dispatcher,
    updates: broadcast::Sender<StateUpdate>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Loads stored chats and checks the credential host.
    pub async fn start(store: ChatStore, dispatcher: Dispatcher) -> Self {
        let state = store.load().await;
        dispatcher.refresh_credential().await;
        let orchestrator = Self::with_state(store, dispatcher, state);
        let snapshot = orchestrator.snapshot().await;
        orchestrator.persist(&snapshot).await;
        orchestrator
    }

    pub fn with_state(store: ChatStore, dispatcher: Dispatcher, state: AppState) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                store,
                dispatcher,
                updates,
            }),
        }
    }

    pub async fn snapshot(&self) -> AppState {
        self.inner.state.lock().await.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateUpdate> {
        self.inner.updates.subscribe()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Re-asks the credential host, e.g. after a key was supplied.
    pub async fn refresh_credential(&self) {
        self.inner.dispatcher.refresh_credential().await;
    }

    async fn persist(&self, state: &AppState) {
        if let Err(e) = self.inner.store.save(state).await {
            error!("Failed to save chats: {}", e);
        }
    }

    async fn commit(&self, mut guard: MutexGuard<'_, AppState>, event: Event) -> AppState {
        let name = event.name();
        let next = std::mem::take(&mut *guard).reduce(event);
        *guard = next;
        let snapshot = guard.clone();
        // Saved under the lock so writes land in event order.
        self.persist(&snapshot).await;
        drop(guard);

        debug!(event = name, "Applied event");
        // No subscribers is fine.
        let _ = self.inner.updates.send(StateUpdate {
            event: name,
            state: Arc::new(snapshot.clone()),
        });
        snapshot
    }

    async fn apply(&self, event: Event) -> AppState {
        let guard = self.inner.state.lock().await;
        self.commit(guard, event).await
    }

    pub async fn new_chat(&self) -> String {
        let chat = Chat::fresh();
        let id = chat.id.clone();
        self.apply(Event::NewChat { chat }).await;
        info!(chat_id = %id, "Created chat");
        id
    }

    pub async fn select_chat(&self, chat_id: &str) -> Result<(), ChatError> {
        let guard = self.inner.state.lock().await;
        if guard.chat(chat_id).is_none() {
            return Err(ChatError::NotFound(chat_id.to_string()));
        }
        self.commit(
            guard,
            Event::Select {
                chat_id: chat_id.to_string(),
            },
        )
        .await;
        Ok(())
    }

    pub async fn rename_chat(&self, chat_id: &str, title: &str) -> Result<(), ChatError> {
        let guard = self.inner.state.lock().await;
        if guard.chat(chat_id).is_none() {
            return Err(ChatError::NotFound(chat_id.to_string()));
        }
        self.commit(
            guard,
            Event::Rename {
                chat_id: chat_id.to_string(),
                title: title.to_string(),
            },
        )
        .await;
        Ok(())
    }

    pub async fn delete_chat(&self, chat_id: &str) -> Result<(), ChatError> {
        let guard = self.inner.state.lock().await;
        if guard.chat(chat_id).is_none() {
            return Err(ChatError::NotFound(chat_id.to_string()));
        }
        self.commit(
            guard,
            Event::Delete {
                chat_id: chat_id.to_string(),
                replacement: Chat::fresh(),
            },
        )
        .await;
        info!(%chat_id, "Deleted chat");
        Ok(())
    }

    /// Messages of a chat whose content contains `query`, ignoring case.
    pub async fn search(&self, chat_id: &str, query: &str) -> Result<Vec<Message>, ChatError> {
        let state = self.inner.state.lock().await;
        let chat = state
            .chat(chat_id)
            .ok_or_else(|| ChatError::NotFound(chat_id.to_string()))?;
        Ok(chat.search(query).into_iter().cloned().collect())
    }

    /// Appends the user message and its placeholder to a chat. Nothing is
    /// dispatched until [`PendingTurn::run`].
    pub async fn submit(&self, chat_id: &str, input: TurnInput) -> Result<PendingTurn, ChatError> {
        let (text, image) = input.normalize().ok_or(ChatError::EmptyInput)?;

        let guard = self.inner.state.lock().await;
        let chat = guard
            .chat(chat_id)
            .ok_or_else(|| ChatError::NotFound(chat_id.to_string()))?;
        if chat.has_turn_in_flight() {
            warn!(%chat_id, "Rejected turn: another one is still in flight");
            return Err(ChatError::Busy(chat_id.to_string()));
        }

        let history = chat.messages.clone();
        let is_first_user_turn = chat.user_message_count() == 0;
        let user_id = chat.next_message_id(now_millis());
        let message_id = user_id + 1;
        let user = Message::user(user_id, text.clone(), image.as_ref().map(|i| i.data_url()));

        self.commit(
            guard,
            Event::SubmitTurn {
                chat_id: chat_id.to_string(),
                user,
                placeholder: Message::placeholder(message_id),
            },
        )
        .await;

        Ok(PendingTurn {
            orchestrator: self.clone(),
            chat_id: chat_id.to_string(),
            message_id,
            text,
            image,
            history,
            is_first_user_turn,
        })
    }

    /// Submits to the active chat and runs the turn to completion.
    pub async fn send_message(&self, input: TurnInput) -> Result<TurnOutcome, ChatError> {
        let chat_id = self
            .snapshot()
            .await
            .active_chat_id
            .ok_or(ChatError::NoActiveChat)?;
        let pending = self.submit(&chat_id, input).await?;
        Ok(pending.run().await)
    }

    fn spawn_title(&self, chat_id: String, prompt: String) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            let title = orchestrator
                .inner
                .dispatcher
                .services()
                .title(&prompt)
                .await;
            let state = orchestrator
                .apply(Event::Rename {
                    chat_id: chat_id.clone(),
                    title: title.clone(),
                })
                .await;
            if state.chat(&chat_id).is_some() {
                info!(%chat_id, %title, "Chat titled");
            } else {
                debug!(%chat_id, "Dropped title for a deleted chat");
            }
        })
    }

    fn spawn_narration(&self, chat_id: String, message_id: u64, text: String) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            match orchestrator.inner.dispatcher.services().speech(&text).await {
                Ok(audio_url) => {
                    orchestrator
                        .apply(Event::AttachAudio {
                            chat_id,
                            message_id,
                            audio_url,
                        })
                        .await;
                }
                Err(e) => {
                    warn!("Speech generation failed, continuing without audio: {}", e);
                }
            }
        })
    }
}
