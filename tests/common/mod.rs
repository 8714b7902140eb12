#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use enhaia::credentials::CredentialHost;
use enhaia::dispatcher::Dispatcher;
use enhaia::error::{Capability, GenerationError};
use enhaia::gemini::GenerationService;
use enhaia::model::{ImageAttachment, Message};
use enhaia::orchestrator::Orchestrator;
use enhaia::store::ChatStore;

pub const FAKE_TITLE: &str = "Saudação Amigável";

/// Records every call; individual capabilities can be told to fail.
#[derive(Default)]
pub struct FakeServices {
    pub calls: Mutex<Vec<String>>,
    pub history_lens: Mutex<Vec<usize>>,
    pub fail_reply: AtomicBool,
    pub fail_speech: AtomicBool,
    pub video_key_missing: AtomicBool,
    /// Title and speech answers take a moment.
    pub slow: AtomicBool,
    /// When set, titles wait for `title_gate` to be notified.
    pub gate_titles: AtomicBool,
    pub title_gate: Notify,
}

impl FakeServices {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    async fn pause(&self) {
        if self.slow.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[async_trait]
impl GenerationService for FakeServices {
    async fn reply(
        &self,
        history: &[Message],
        prompt: &str,
        image: Option<&ImageAttachment>,
    ) -> Result<String, GenerationError> {
        self.history_lens.lock().unwrap().push(history.len());
        self.record(format!("reply:{prompt}:{}", image.is_some()));
        if self.fail_reply.load(Ordering::SeqCst) {
            return Err(GenerationError::failed(Capability::Reply, "boom"));
        }
        Ok(format!("Resposta para {prompt}"))
    }

    async fn title(&self, prompt: &str) -> String {
        self.record(format!("title:{prompt}"));
        if self.gate_titles.load(Ordering::SeqCst) {
            self.title_gate.notified().await;
        }
        self.pause().await;
        FAKE_TITLE.to_string()
    }

    async fn image(&self, prompt: &str) -> Result<String, GenerationError> {
        self.record(format!("image:{prompt}"));
        Ok("data:image/jpeg;base64,SU1H".to_string())
    }

    async fn video(&self, prompt: &str) -> Result<String, GenerationError> {
        self.record(format!("video:{prompt}"));
        if self.video_key_missing.load(Ordering::SeqCst) {
            return Err(GenerationError::ApiKeyNotFound);
        }
        Ok("https://videos.example/v.mp4?alt=media&key=k".to_string())
    }

    async fn speech(&self, prompt: &str) -> Result<String, GenerationError> {
        self.record(format!("speech:{prompt}"));
        self.pause().await;
        if self.fail_speech.load(Ordering::SeqCst) {
            return Err(GenerationError::failed(Capability::Speech, "tts down"));
        }
        Ok("data:audio/mpeg;base64,QVVE".to_string())
    }
}

/// Credential host that either grants or refuses a key.
pub struct FakeHost {
    pub selected: AtomicBool,
    pub grants: bool,
    pub prompts: AtomicUsize,
}

impl FakeHost {
    pub fn new(selected: bool, grants: bool) -> Self {
        Self {
            selected: AtomicBool::new(selected),
            grants,
            prompts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CredentialHost for FakeHost {
    async fn has_selected_api_key(&self) -> bool {
        self.selected.load(Ordering::SeqCst)
    }

    async fn open_select_key(&self) -> Result<(), GenerationError> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        if self.grants {
            self.selected.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(GenerationError::ApiKeyNotFound)
        }
    }
}

pub async fn orchestrator_with(
    services: Arc<FakeServices>,
    host: Option<Arc<FakeHost>>,
    store: ChatStore,
) -> Orchestrator {
    let host = host.map(|h| h as Arc<dyn CredentialHost>);
    let dispatcher = Dispatcher::new(services, host);
    Orchestrator::start(store, dispatcher).await
}

pub async fn orchestrator(services: Arc<FakeServices>) -> Orchestrator {
    orchestrator_with(services, None, ChatStore::in_memory()).await
}
