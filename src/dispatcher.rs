//! Runs a parsed command against the remote services.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::command::{Command, LOGO_CAPTION, LOGO_DATA_URL};
use crate::credentials::CredentialHost;
use crate::error::GenerationError;
use crate::gemini::GenerationService;
use crate::model::{ImageAttachment, Message, MessagePatch};

pub const VIDEO_READY: &str = "O seu vídeo está pronto!";
pub const IMAGE_READY: &str = "Aqui está a sua imagem realista!";

/// Receives status text while a slow command runs.
#[async_trait]
pub trait Progress: Send + Sync {
    async fn report(&self, text: &str);
}

/// What a command produced: fields for the placeholder, and text to narrate.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub patch: MessagePatch,
    pub narration: Option<String>,
}

pub struct Dispatcher {
    services: Arc<dyn GenerationService>,
    host: Option<Arc<dyn CredentialHost>>,
    credential_known: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        services: Arc<dyn GenerationService>,
        host: Option<Arc<dyn CredentialHost>>,
    ) -> Self {
        Self {
            services,
            host,
            credential_known: AtomicBool::new(false),
        }
    }

    pub fn services(&self) -> &Arc<dyn GenerationService> {
        &self.services
    }

    /// Asks the host whether a key is already selected.
    pub async fn refresh_credential(&self) {
        if let Some(host) = &self.host {
            let present = host.has_selected_api_key().await;
            debug!(present, "Checked host for a selected API key");
            self.credential_known.store(present, Ordering::SeqCst);
        }
    }

    pub fn credential_known(&self) -> bool {
        self.credential_known.load(Ordering::SeqCst)
    }

    /// Forces the next video request to ask the host for a key again.
    pub fn forget_credential(&self) {
        self.credential_known.store(false, Ordering::SeqCst);
    }

    async fn ensure_credential(&self) -> Result<(), GenerationError> {
        if self.credential_known() {
            return Ok(());
        }
        let Some(host) = &self.host else {
            warn!("No credential host available to supply an API key");
            return Err(GenerationError::ApiKeyNotFound);
        };
        info!("Requesting an API key from the host");
        host.open_select_key().await?;
        self.credential_known.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn dispatch(
        &self,
        command: Command,
        image: Option<&ImageAttachment>,
        history: &[Message],
        progress: &dyn Progress,
    ) -> Result<Dispatched, GenerationError> {
        debug!(?command, "Dispatching command");
        match command {
            Command::Logo => Ok(Dispatched {
                patch: MessagePatch {
                    image_url: Some(LOGO_DATA_URL.clone()),
                    ..MessagePatch::text(LOGO_CAPTION)
                },
                narration: Some(LOGO_CAPTION.to_string()),
            }),
            Command::GenerateVideo { ref prompt } => {
                self.ensure_credential().await?;
                report(&command, progress).await;
                let video_url = self.services.video(prompt).await?;
                Ok(Dispatched {
                    patch: MessagePatch {
                        video_url: Some(video_url),
                        ..MessagePatch::text(VIDEO_READY)
                    },
                    narration: Some(VIDEO_READY.to_string()),
                })
            }
            Command::GenerateImage { ref prompt } => {
                report(&command, progress).await;
                let image_url = self.services.image(prompt).await?;
                Ok(Dispatched {
                    patch: MessagePatch {
                        image_url: Some(image_url),
                        ..MessagePatch::text(IMAGE_READY)
                    },
                    narration: Some(IMAGE_READY.to_string()),
                })
            }
            Command::GenerateAudio { ref prompt } => {
                report(&command, progress).await;
                let audio_url = self.services.speech(prompt).await?;
                // The audio is the answer; narrating it would synthesize twice.
                Ok(Dispatched {
                    patch: MessagePatch {
                        audio_url: Some(audio_url),
                        ..Default::default()
                    },
                    narration: None,
                })
            }
            Command::Reply { prompt } => {
                let reply = self.services.reply(history, &prompt, image).await?;
                Ok(Dispatched {
                    patch: MessagePatch::text(reply.clone()),
                    narration: Some(reply).filter(|r| !r.trim().is_empty()),
                })
            }
        }
    }
}

async fn report(command: &Command, progress: &dyn Progress) {
    if let Some(text) = command.progress_text() {
        progress.report(text).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl Progress for Recorder {
        async fn report(&self, text: &str) {
            self.0.lock().unwrap().push(text.to_string());
        }
    }

    struct Canned;

    #[async_trait]
    impl GenerationService for Canned {
        async fn reply(
            &self,
            _history: &[Message],
            prompt: &str,
            _image: Option<&ImageAttachment>,
        ) -> Result<String, GenerationError> {
            Ok(format!("eco: {prompt}"))
        }
        async fn title(&self, _prompt: &str) -> String {
            "Título".into()
        }
        async fn image(&self, prompt: &str) -> Result<String, GenerationError> {
            Ok(format!("img:{prompt}"))
        }
        async fn video(&self, prompt: &str) -> Result<String, GenerationError> {
            Ok(format!("vid:{prompt}"))
        }
        async fn speech(&self, prompt: &str) -> Result<String, GenerationError> {
            Ok(format!("aud:{prompt}"))
        }
    }

    #[tokio::test]
    async fn logo_needs_no_remote_call() {
        let dispatcher = Dispatcher::new(Arc::new(Canned), None);
        let progress = Recorder::default();
        let out = dispatcher
            .dispatch(Command::Logo, None, &[], &progress)
            .await
            .unwrap();
        assert_eq!(out.patch.content.as_deref(), Some(LOGO_CAPTION));
        assert!(out.patch.image_url.is_some());
        assert_eq!(out.narration.as_deref(), Some(LOGO_CAPTION));
        assert!(progress.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn video_without_host_is_missing_key() {
        let dispatcher = Dispatcher::new(Arc::new(Canned), None);
        let err = dispatcher
            .dispatch(
                Command::parse("gerar vídeo: mar"),
                None,
                &[],
                &Recorder::default(),
            )
            .await
            .unwrap_err();
        assert!(err.is_api_key_missing());
        assert!(!dispatcher.credential_known());
    }

    #[tokio::test]
    async fn audio_is_not_narrated() {
        let dispatcher = Dispatcher::new(Arc::new(Canned), None);
        let progress = Recorder::default();
        let out = dispatcher
            .dispatch(Command::parse("gerar áudio: bom dia"), None, &[], &progress)
            .await
            .unwrap();
        assert_eq!(out.patch.audio_url.as_deref(), Some("aud:bom dia"));
        assert!(out.patch.content.is_none());
        assert!(out.narration.is_none());
        assert_eq!(progress.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reply_text_is_narrated() {
        let dispatcher = Dispatcher::new(Arc::new(Canned), None);
        let out = dispatcher
            .dispatch(Command::parse("olá"), None, &[], &Recorder::default())
            .await
            .unwrap();
        assert_eq!(out.patch.content.as_deref(), Some("eco: olá"));
        assert_eq!(out.narration.as_deref(), Some("eco: olá"));
    }
}
