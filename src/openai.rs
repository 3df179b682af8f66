//! OpenAI HTTP client: chat completions, embeddings and audio transcription.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::docqa::provider::{ChatModel, Embedder, Message, ProviderError};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const TRANSCRIPTION_MODEL: &str = "whisper-1";

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("failed to read audio file '{path}': {source}")]
    Audio { path: String, source: std::io::Error },
    #[error("empty response")]
    Empty,
}

impl From<Error> for ProviderError {
    fn from(e: Error) -> Self {
        ProviderError::new("OpenAI", e.to_string())
    }
}

#[derive(Clone)]
pub struct Client {
    api_key: String,
    base_url: String,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ApiMessage<'a>>,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

impl Client {
    pub fn new(api_key: String, base_url: Option<String>) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            api_key,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    pub async fn chat(
        &self,
        model: &str,
        temperature: f32,
        messages: &[Message],
    ) -> Result<String, Error> {
        let request = ChatRequest {
            model,
            temperature,
            messages: messages
                .iter()
                .map(|m| ApiMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
        };
        debug!(model, messages = messages.len(), "chat completion");

        let response = self
            .http
            .post(self.url("chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;
        let parsed: ChatResponse = check(response).await?.json().await?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(Error::Empty)
    }

    pub async fn embed(&self, model: &str, texts: &[&str]) -> Result<Vec<Vec<f32>>, Error> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(model, batch_size = texts.len(), "embedding batch");

        let response = self
            .http
            .post(self.url("embeddings"))
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest { model, input: texts })
            .send()
            .await?;
        let parsed: EmbeddingResponse = check(response).await?.json().await?;
        Ok(ordered_embeddings(parsed))
    }

    /// Transcribe an audio file with Whisper.
    pub async fn transcribe(&self, path: &Path) -> Result<String, Error> {
        let data = tokio::fs::read(path).await.map_err(|e| Error::Audio {
            path: path.display().to_string(),
            source: e,
        })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio.mp3".to_string());
        debug!("Transcribing {} ({} bytes)", file_name, data.len());

        let part = reqwest::multipart::Part::bytes(data)
            .file_name(file_name)
            .mime_str("audio/mpeg")?;
        let form = reqwest::multipart::Form::new()
            .text("model", TRANSCRIPTION_MODEL)
            .part("file", part);

        let response = self
            .http
            .post(self.url("audio/transcriptions"))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;
        let parsed: TranscriptionResponse = check(response).await?.json().await?;

        let preview: String = parsed.text.chars().take(100).collect();
        info!("Transcribed: \"{}\"", preview);
        Ok(parsed.text)
    }
}

/// Turn a non-2xx response into `Error::Api`, preferring the API's message.
async fn check(response: reqwest::Response) -> Result<reqwest::Response, Error> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::Api {
        status: status.as_u16(),
        message: api_message(&body),
    })
}

fn api_message(body: &str) -> String {
    serde_json::from_str::<ErrorResponse>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.to_string())
}

fn ordered_embeddings(mut response: EmbeddingResponse) -> Vec<Vec<f32>> {
    response.data.sort_by_key(|d| d.index);
    response.data.into_iter().map(|d| d.embedding).collect()
}

/// A chat model bound to a model name and temperature.
#[derive(Clone)]
pub struct OpenAiChat {
    client: Client,
    model: String,
    temperature: f32,
}

impl OpenAiChat {
    pub fn new(client: Client, model: String, temperature: f32) -> Self {
        Self {
            client,
            model,
            temperature,
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiChat {
    async fn complete(&self, messages: &[Message]) -> Result<String, ProviderError> {
        Ok(self
            .client
            .chat(&self.model, self.temperature, messages)
            .await?)
    }
}

#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(client: Client, model: String) -> Self {
        Self { client, model }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(self.client.embed(&self.model, texts).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash() {
        let client = Client::new("sk-test".into(), Some("http://localhost:8080/v1/".into())).unwrap();
        assert_eq!(client.url("embeddings"), "http://localhost:8080/v1/embeddings");

        let client = Client::new("sk-test".into(), None).unwrap();
        assert_eq!(client.url("chat/completions"), "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn test_chat_request_shape() {
        let messages = [Message::system("be brief"), Message::user("hi")];
        let request = ChatRequest {
            model: "gpt-3.5-turbo",
            temperature: 0.5,
            messages: messages
                .iter()
                .map(|m| ApiMessage { role: m.role.as_str(), content: &m.content })
                .collect(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "gpt-3.5-turbo");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hi");
    }

    #[test]
    fn test_chat_response_parsing() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"Hello!"}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("Hello!"));
    }

    #[test]
    fn test_embeddings_sorted_by_index() {
        let body = r#"{"data":[{"index":1,"embedding":[2.0]},{"index":0,"embedding":[1.0]}]}"#;
        let parsed: EmbeddingResponse = serde_json::from_str(body).unwrap();
        assert_eq!(ordered_embeddings(parsed), vec![vec![1.0], vec![2.0]]);
    }

    #[test]
    fn test_api_message_extraction() {
        assert_eq!(
            api_message(r#"{"error":{"message":"Invalid API key","type":"auth"}}"#),
            "Invalid API key"
        );
        assert_eq!(api_message("gateway timeout"), "gateway timeout");
    }

    #[test]
    fn test_error_converts_to_provider_error() {
        let err: ProviderError = Error::Api { status: 429, message: "slow down".into() }.into();
        assert_eq!(err.provider, "OpenAI");
        assert!(err.message.contains("429"));
    }
}
