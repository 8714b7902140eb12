//! Gemini REST client: chat replies, titles, images, videos and speech.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::constants::{self, FALLBACK_TITLE, SPEECH_VOICE, SYSTEM_INSTRUCTION, TITLE_INSTRUCTION};
use crate::credentials::ApiKeySlot;
use crate::error::{Capability, GenerationError};
use crate::model::{ImageAttachment, Message, Role};

const ENTITY_NOT_FOUND: &str = "Requested entity was not found.";

/// The remote capabilities a conversation can call on.
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Answer `prompt` given the prior turns.
    async fn reply(
        &self,
        history: &[Message],
        prompt: &str,
        image: Option<&ImageAttachment>,
    ) -> Result<String, GenerationError>;

    /// Short chat title. Never fails: falls back to a constant title.
    async fn title(&self, prompt: &str) -> String;

    /// Returns an image data URL.
    async fn image(&self, prompt: &str) -> Result<String, GenerationError>;

    /// Returns a download URL for the finished video.
    async fn video(&self, prompt: &str) -> Result<String, GenerationError>;

    /// Returns an audio data URL.
    async fn speech(&self, prompt: &str) -> Result<String, GenerationError>;
}

/// How long to wait on a video operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(constants::VIDEO_POLL_INTERVAL_SECS),
            max_attempts: constants::VIDEO_POLL_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Models {
    pub chat: String,
    pub image: String,
    pub video: String,
    pub speech: String,
}

impl Default for Models {
    fn default() -> Self {
        Self {
            chat: constants::CHAT_MODEL.clone(),
            image: constants::IMAGE_MODEL.clone(),
            video: constants::VIDEO_MODEL.clone(),
            speech: constants::SPEECH_MODEL.clone(),
        }
    }
}

#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    base_url: String,
    api_key: ApiKeySlot,
    models: Arc<Models>,
    poll: PollPolicy,
    cancel: CancellationToken,
}

impl GeminiClient {
    pub fn new(api_key: ApiKeySlot) -> Self {
        Self {
            client: Client::new(),
            base_url: constants::GEMINI_BASE_URL.clone(),
            api_key,
            models: Arc::new(Models::default()),
            poll: PollPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_models(mut self, models: Models) -> Self {
        self.models = Arc::new(models);
        self
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Video polls stop with a failure once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    async fn key_for(&self, capability: Capability) -> Result<String, GenerationError> {
        match self.api_key.get().await {
            Some(key) => Ok(key),
            None if capability == Capability::Video => Err(GenerationError::ApiKeyNotFound),
            None => Err(GenerationError::failed(
                capability,
                format!("{} is not set", constants::API_KEY_ENV),
            )),
        }
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        format!("{}/models/{}:{}", self.base_url, model, method)
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        capability: Capability,
        url: &str,
        key: &str,
        body: &impl Serialize,
    ) -> Result<T, GenerationError> {
        let response = self
            .client
            .post(url)
            .query(&[("key", key)])
            .json(body)
            .send()
            .await
            .map_err(|e| GenerationError::failed(capability, format!("request to {url} failed: {e}")))?;
        read_json(capability, response).await
    }

    async fn generate_content(
        &self,
        capability: Capability,
        model: &str,
        request: &GenerateContentRequest,
    ) -> Result<GenerateContentResponse, GenerationError> {
        let key = self.key_for(capability).await?;
        let url = self.model_url(model, "generateContent");
        self.post_json(capability, &url, &key, request).await
    }

    #[instrument(skip(self, history, image), fields(history_len = history.len(), has_image = image.is_some()))]
    async fn request_reply(
        &self,
        history: &[Message],
        prompt: &str,
        image: Option<&ImageAttachment>,
    ) -> Result<String, GenerationError> {
        let mut contents = history_contents(history);
        let mut parts = Vec::with_capacity(2);
        if let Some(image) = image {
            parts.push(Part::InlineData {
                inline_data: InlineData {
                    mime_type: image.mime_type.clone(),
                    data: image.to_base64(),
                },
            });
        }
        parts.push(Part::Text {
            text: prompt.to_string(),
        });
        contents.push(Content {
            role: Some("user".to_string()),
            parts,
        });

        let request = GenerateContentRequest {
            contents,
            system_instruction: Some(Content::instruction(SYSTEM_INSTRUCTION)),
            generation_config: None,
        };
        let response = self
            .generate_content(Capability::Reply, &self.models.chat, &request)
            .await?;
        let text = response.text();
        if text.is_empty() {
            return Err(GenerationError::failed(
                Capability::Reply,
                "response carried no text",
            ));
        }
        debug!(reply_len = text.len(), "Received reply");
        Ok(text)
    }

    #[instrument(skip(self))]
    async fn request_title(&self, prompt: &str) -> Result<String, GenerationError> {
        let request = GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part::Text {
                    text: prompt.to_string(),
                }],
            }],
            system_instruction: Some(Content::instruction(TITLE_INSTRUCTION)),
            generation_config: Some(GenerationConfig {
                temperature: Some(0.2),
                ..Default::default()
            }),
        };
        let response = self
            .generate_content(Capability::Reply, &self.models.chat, &request)
            .await?;
        Ok(response.text().trim().replace('"', ""))
    }

    #[instrument(skip(self))]
    async fn request_image(&self, prompt: &str) -> Result<String, GenerationError> {
        let key = self.key_for(Capability::Image).await?;
        let url = self.model_url(&self.models.image, "predict");
        let body = json!({
            "instances": [{ "prompt": prompt }],
            "parameters": {
                "sampleCount": 1,
                "outputMimeType": "image/jpeg",
                "aspectRatio": "1:1",
            }
        });
        let response: PredictResponse = self.post_json(Capability::Image, &url, &key, &body).await?;
        let bytes = response
            .predictions
            .unwrap_or_default()
            .into_iter()
            .find_map(|p| p.bytes_base64_encoded)
            .filter(|b| !b.is_empty())
            .ok_or_else(|| GenerationError::failed(Capability::Image, "no image data returned"))?;
        Ok(format!("data:image/jpeg;base64,{bytes}"))
    }

    #[instrument(skip(self))]
    async fn request_video(&self, prompt: &str) -> Result<String, GenerationError> {
        let key = self.key_for(Capability::Video).await?;
        let url = self.model_url(&self.models.video, "predictLongRunning");
        let body = json!({
            "instances": [{ "prompt": prompt }],
            "parameters": {
                "sampleCount": 1,
                "resolution": "720p",
                "aspectRatio": "16:9",
            }
        });
        let mut operation: Operation = self.post_json(Capability::Video, &url, &key, &body).await?;
        info!(operation = %operation.name, "Video generation started");

        let mut attempts = 0;
        while !operation.done {
            if attempts >= self.poll.max_attempts {
                warn!(operation = %operation.name, attempts, "Video operation did not finish in time");
                return Err(GenerationError::failed(
                    Capability::Video,
                    format!("operation still running after {attempts} polls"),
                ));
            }
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(operation = %operation.name, "Video polling cancelled");
                    return Err(GenerationError::failed(Capability::Video, "cancelled"));
                }
                _ = tokio::time::sleep(self.poll.interval) => {}
            }
            attempts += 1;
            operation = self.fetch_operation(&operation.name, &key).await?;
            debug!(attempts, done = operation.done, "Polled video operation");
        }

        if let Some(err) = operation.error {
            let message = err.message.unwrap_or_default();
            error!(%message, "Video operation finished with an error");
            if message.contains(ENTITY_NOT_FOUND) {
                return Err(GenerationError::ApiKeyNotFound);
            }
            return Err(GenerationError::failed(Capability::Video, message));
        }

        let uri = operation
            .response
            .and_then(|r| r.generate_video_response)
            .and_then(|r| r.generated_samples)
            .unwrap_or_default()
            .into_iter()
            .find_map(|s| s.video.and_then(|v| v.uri))
            .ok_or_else(|| GenerationError::failed(Capability::Video, "no download link returned"))?;

        let separator = if uri.contains('?') { '&' } else { '?' };
        Ok(format!("{uri}{separator}key={key}"))
    }

    async fn fetch_operation(&self, name: &str, key: &str) -> Result<Operation, GenerationError> {
        let url = format!("{}/{}", self.base_url, name);
        let response = self
            .client
            .get(&url)
            .query(&[("key", key)])
            .send()
            .await
            .map_err(|e| GenerationError::failed(Capability::Video, format!("poll of {name} failed: {e}")))?;
        read_json(Capability::Video, response).await
    }

    #[instrument(skip(self), fields(prompt_len = prompt.len()))]
    async fn request_speech(&self, prompt: &str) -> Result<String, GenerationError> {
        let request = GenerateContentRequest {
            contents: vec![Content {
                role: None,
                parts: vec![Part::Text {
                    text: prompt.to_string(),
                }],
            }],
            system_instruction: None,
            generation_config: Some(GenerationConfig {
                response_modalities: Some(vec!["AUDIO".to_string()]),
                speech_config: Some(SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: SPEECH_VOICE.to_string(),
                        },
                    },
                }),
                ..Default::default()
            }),
        };
        let response = self
            .generate_content(Capability::Speech, &self.models.speech, &request)
            .await?;
        let audio = response
            .first_inline_data()
            .filter(|d| !d.is_empty())
            .ok_or_else(|| GenerationError::failed(Capability::Speech, "no audio data returned"))?;
        Ok(format!("data:audio/mpeg;base64,{audio}"))
    }
}

#[async_trait]
impl GenerationService for GeminiClient {
    async fn reply(
        &self,
        history: &[Message],
        prompt: &str,
        image: Option<&ImageAttachment>,
    ) -> Result<String, GenerationError> {
        self.request_reply(history, prompt, image)
            .await
            .inspect_err(|e| error!("Error getting enhaIA's reply: {}", e))
    }

    async fn title(&self, prompt: &str) -> String {
        match self.request_title(prompt).await {
            Ok(title) if !title.is_empty() => title,
            Ok(_) => FALLBACK_TITLE.to_string(),
            Err(e) => {
                error!("Error generating chat title: {}", e);
                FALLBACK_TITLE.to_string()
            }
        }
    }

    async fn image(&self, prompt: &str) -> Result<String, GenerationError> {
        self.request_image(prompt)
            .await
            .inspect_err(|e| error!("Error generating realistic image: {}", e))
    }

    async fn video(&self, prompt: &str) -> Result<String, GenerationError> {
        self.request_video(prompt)
            .await
            .inspect_err(|e| error!("Error generating video: {}", e))
    }

    async fn speech(&self, prompt: &str) -> Result<String, GenerationError> {
        self.request_speech(prompt)
            .await
            .inspect_err(|e| error!("Error generating speech: {}", e))
    }
}

/// Prior turns as Gemini contents: the greeting and unresolved placeholders
/// are left out.
fn history_contents(history: &[Message]) -> Vec<Content> {
    history
        .iter()
        .filter(|m| !m.is_seed() && !m.is_loading)
        .map(|m| Content {
            role: Some(
                match m.role {
                    Role::User => "user",
                    Role::Assistant => "model",
                }
                .to_string(),
            ),
            parts: vec![Part::Text {
                text: m.content.clone(),
            }],
        })
        .collect()
}

async fn read_json<T: DeserializeOwned>(
    capability: Capability,
    response: reqwest::Response,
) -> Result<T, GenerationError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read Gemini error body".to_string());
        error!(%status, %body, "Gemini API request failed");
        return Err(map_http_error(capability, status, body));
    }
    response
        .json::<T>()
        .await
        .map_err(|e| GenerationError::failed(capability, format!("unreadable response: {e}")))
}

fn map_http_error(capability: Capability, status: StatusCode, body: String) -> GenerationError {
    let message = serde_json::from_str::<ErrorWrapper>(&body)
        .ok()
        .and_then(|w| w.error.message)
        .unwrap_or(body);

    if capability == Capability::Video
        && (status == StatusCode::NOT_FOUND || message.contains(ENTITY_NOT_FOUND))
    {
        return GenerationError::ApiKeyNotFound;
    }
    GenerationError::failed(capability, format!("{status}: {message}"))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<Part>,
}

impl Content {
    fn instruction(text: &str) -> Self {
        Self {
            role: None,
            parts: vec![Part::Text {
                text: text.to_string(),
            }],
        }
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum Part {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_modalities: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    speech_config: Option<SpeechConfig>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig {
    voice_name: String,
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
}

impl GenerateContentResponse {
    fn parts(&self) -> impl Iterator<Item = &PartResponse> {
        self.candidates
            .iter()
            .flatten()
            .take(1)
            .filter_map(|c| c.content.as_ref())
            .flat_map(|c| c.parts.iter().flatten())
    }

    /// All text parts of the first candidate, joined.
    fn text(&self) -> String {
        self.parts().filter_map(|p| p.text.as_deref()).collect()
    }

    fn first_inline_data(&self) -> Option<String> {
        self.parts()
            .find_map(|p| p.inline_data.as_ref().map(|d| d.data.clone()))
    }
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<ContentResponse>,
}

#[derive(Deserialize)]
struct ContentResponse {
    parts: Option<Vec<PartResponse>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartResponse {
    text: Option<String>,
    inline_data: Option<InlineDataResponse>,
}

#[derive(Deserialize)]
struct InlineDataResponse {
    data: String,
}

#[derive(Deserialize)]
struct PredictResponse {
    predictions: Option<Vec<Prediction>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Prediction {
    bytes_base64_encoded: Option<String>,
}

#[derive(Deserialize)]
struct Operation {
    name: String,
    #[serde(default)]
    done: bool,
    error: Option<ErrorBody>,
    response: Option<OperationResponse>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationResponse {
    generate_video_response: Option<GenerateVideoResponse>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateVideoResponse {
    generated_samples: Option<Vec<GeneratedSample>>,
}

#[derive(Deserialize)]
struct GeneratedSample {
    video: Option<VideoRef>,
}

#[derive(Deserialize)]
struct VideoRef {
    uri: Option<String>,
}

#[derive(Deserialize)]
struct ErrorWrapper {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_skips_seed_and_loading() {
        let mut loading = Message::placeholder(12);
        loading.content = "Pensando".into();
        let history = vec![
            Message::seed(),
            Message::user(10, "Olá", None),
            Message::assistant(11, "Oi!"),
            loading,
        ];
        let contents = history_contents(&history);
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0].role.as_deref(), Some("user"));
        assert_eq!(contents[1].role.as_deref(), Some("model"));
    }

    #[test]
    fn video_not_found_means_missing_key() {
        let err = map_http_error(
            Capability::Video,
            StatusCode::NOT_FOUND,
            r#"{"error":{"code":404,"message":"Requested entity was not found."}}"#.into(),
        );
        assert!(err.is_api_key_missing());

        let err = map_http_error(Capability::Reply, StatusCode::NOT_FOUND, "gone".into());
        assert!(!err.is_api_key_missing());
    }

    #[test]
    fn service_message_is_kept_in_detail() {
        let err = map_http_error(
            Capability::Image,
            StatusCode::BAD_REQUEST,
            r#"{"error":{"message":"prompt blocked"}}"#.into(),
        );
        match err {
            GenerationError::Failed { capability, detail } => {
                assert_eq!(capability, Capability::Image);
                assert!(detail.contains("prompt blocked"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn speech_request_shape() {
        let request = GenerateContentRequest {
            contents: vec![Content::instruction("olá")],
            system_instruction: None,
            generation_config: Some(GenerationConfig {
                response_modalities: Some(vec!["AUDIO".into()]),
                speech_config: Some(SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: SPEECH_VOICE.into(),
                        },
                    },
                }),
                ..Default::default()
            }),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Kore"
        );
        assert_eq!(json["generationConfig"]["responseModalities"][0], "AUDIO");
        assert!(json.get("systemInstruction").is_none());
        assert!(json["generationConfig"].get("temperature").is_none());
    }
}
