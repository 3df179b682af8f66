use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::docqa::chunker::{DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
use crate::docqa::document::DEFAULT_MAX_DOCUMENTS;
use crate::docqa::index::IndexScope;
use crate::docqa::qa::{DEFAULT_MAX_HISTORY_TURNS, DEFAULT_TOP_K};
use crate::docqa::session::SessionLimits;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", path.display())]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config file '{}': {source}", path.display())]
    ParseJson { path: PathBuf, source: serde_json::Error },
    #[error("invalid value '{value}' for environment variable {var}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("config validation error: {0}")]
    Validation(String),
}

/// How updates reach the bot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Polling,
    Webhook,
}

impl std::str::FromStr for RunMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "polling" => Ok(Self::Polling),
            "webhook" => Ok(Self::Webhook),
            _ => Err(()),
        }
    }
}

#[derive(Deserialize)]
#[serde(default)]
struct ConfigFile {
    telegram_bot_token: String,
    openai_api_key: String,
    openai_base_url: Option<String>,
    /// Model for plain chat replies.
    model: String,
    temperature: f32,
    /// Model for document question answering.
    qa_model: String,
    qa_temperature: f32,
    embedding_model: String,
    mode: RunMode,
    webhook_url: Option<String>,
    webhook_addr: Option<String>,
    storage_dir: String,
    /// Message log location. Defaults to `<storage_dir>/messages.db`.
    database_path: Option<String>,
    index_scope: IndexScope,
    chunk_size: usize,
    chunk_overlap: usize,
    top_k: usize,
    max_history_turns: usize,
    max_documents: usize,
    session_ttl_secs: u64,
    /// Local Whisper model (.bin). Only used with the `local-whisper` feature.
    whisper_model_path: Option<String>,
    tts_language: String,
    tts_endpoint: Option<String>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            telegram_bot_token: String::new(),
            openai_api_key: String::new(),
            openai_base_url: None,
            model: "gpt-3.5-turbo".into(),
            temperature: 0.7,
            qa_model: "gpt-3.5-turbo".into(),
            qa_temperature: 0.9,
            embedding_model: "text-embedding-ada-002".into(),
            mode: RunMode::Polling,
            webhook_url: None,
            webhook_addr: None,
            storage_dir: "./storage".into(),
            database_path: None,
            index_scope: IndexScope::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            top_k: DEFAULT_TOP_K,
            max_history_turns: DEFAULT_MAX_HISTORY_TURNS,
            max_documents: DEFAULT_MAX_DOCUMENTS,
            session_ttl_secs: 3600,
            whisper_model_path: None,
            tts_language: crate::speech::tts::DEFAULT_LANGUAGE.into(),
            tts_endpoint: None,
        }
    }
}

impl ConfigFile {
    /// Overlay environment variables on top of the file values.
    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let var = |name: &str| env(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("API_TELEGRAM") {
            self.telegram_bot_token = v;
        }
        if let Some(v) = var("OPENAI_API_KEY") {
            self.openai_api_key = v;
        }
        if let Some(v) = var("OPENAI_BASE_URL") {
            self.openai_base_url = Some(v);
        }
        if let Some(v) = var("GPT3_MODEL") {
            self.model = v;
        }
        if let Some(v) = var("GPT3_TEMPERATURE") {
            self.temperature = parse_env("GPT3_TEMPERATURE", v)?;
        }
        if let Some(v) = var("QA_MODEL") {
            self.qa_model = v;
        }
        if let Some(v) = var("QA_TEMPERATURE") {
            self.qa_temperature = parse_env("QA_TEMPERATURE", v)?;
        }
        if let Some(v) = var("EMBEDDING_MODEL") {
            self.embedding_model = v;
        }
        if let Some(v) = var("MODE") {
            self.mode = parse_env("MODE", v)?;
        }
        if let Some(v) = var("WEBHOOK_URL") {
            self.webhook_url = Some(v);
        }
        if let Some(v) = var("WEBHOOK_ADDR") {
            self.webhook_addr = Some(v);
        }
        if let Some(v) = var("STORAGE_DIR") {
            self.storage_dir = v;
        }
        if let Some(v) = var("WHISPER_MODEL_PATH") {
            self.whisper_model_path = Some(v);
        }
        if let Some(v) = var("TTS_LANGUAGE") {
            self.tts_language = v;
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { var, value })
}

pub struct Config {
    pub telegram_bot_token: String,
    pub openai_api_key: String,
    pub openai_base_url: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub qa_model: String,
    pub qa_temperature: f32,
    pub embedding_model: String,
    pub mode: RunMode,
    /// Public URL Telegram posts updates to (webhook mode).
    pub webhook_url: Option<reqwest::Url>,
    /// Local address the webhook listener binds.
    pub webhook_addr: SocketAddr,
    pub storage_dir: PathBuf,
    pub database_path: PathBuf,
    pub index_scope: IndexScope,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub limits: SessionLimits,
    pub whisper_model_path: Option<PathBuf>,
    pub tts_language: String,
    pub tts_endpoint: Option<String>,
}

impl Config {
    /// Load from the process environment (after `.env`) and the JSON file at `path`.
    pub fn from_env<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::load(path, |name| std::env::var(name).ok())
    }

    /// Load `path` (a missing file means all defaults) and overlay `env`.
    pub fn load<P: AsRef<Path>>(
        path: P,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let config_path = path.as_ref().to_path_buf();
        let mut file = match std::fs::read_to_string(&config_path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| ConfigError::ParseJson { path: config_path.clone(), source: e })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ConfigFile::default(),
            Err(e) => return Err(ConfigError::ReadFile { path: config_path, source: e }),
        };
        file.apply_env(env)?;

        if file.telegram_bot_token.is_empty() {
            return Err(ConfigError::Validation(
                "telegram_bot_token is required (or set API_TELEGRAM)".into(),
            ));
        }
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = file.telegram_bot_token.split(':').collect();
        if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
            return Err(ConfigError::Validation(
                "telegram_bot_token appears invalid (expected format: 123456789:ABCdefGHI...)".into()
            ));
        }
        if file.openai_api_key.is_empty() {
            return Err(ConfigError::Validation(
                "openai_api_key is required (or set OPENAI_API_KEY)".into(),
            ));
        }
        if file.chunk_size == 0 || file.chunk_overlap >= file.chunk_size {
            return Err(ConfigError::Validation(format!(
                "chunk_overlap ({}) must be smaller than a non-zero chunk_size ({})",
                file.chunk_overlap, file.chunk_size
            )));
        }
        if file.top_k == 0 || file.max_history_turns == 0 || file.max_documents == 0 {
            return Err(ConfigError::Validation(
                "top_k, max_history_turns and max_documents must be positive".into(),
            ));
        }

        let webhook_url = file
            .webhook_url
            .as_deref()
            .map(|u| {
                u.parse::<reqwest::Url>()
                    .map_err(|e| ConfigError::Validation(format!("webhook_url '{u}' is invalid: {e}")))
            })
            .transpose()?;
        if file.mode == RunMode::Webhook && webhook_url.is_none() {
            return Err(ConfigError::Validation(
                "webhook mode requires webhook_url (or set WEBHOOK_URL)".into(),
            ));
        }
        let webhook_addr = file
            .webhook_addr
            .as_deref()
            .unwrap_or("0.0.0.0:8443")
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::Validation(format!("webhook_addr is invalid: {e}")))?;

        let storage_dir = PathBuf::from(&file.storage_dir);
        let database_path = file
            .database_path
            .map(PathBuf::from)
            .unwrap_or_else(|| storage_dir.join("messages.db"));

        Ok(Self {
            telegram_bot_token: file.telegram_bot_token,
            openai_api_key: file.openai_api_key,
            openai_base_url: file.openai_base_url,
            model: file.model,
            temperature: file.temperature,
            qa_model: file.qa_model,
            qa_temperature: file.qa_temperature,
            embedding_model: file.embedding_model,
            mode: file.mode,
            webhook_url,
            webhook_addr,
            storage_dir,
            database_path,
            index_scope: file.index_scope,
            chunk_size: file.chunk_size,
            chunk_overlap: file.chunk_overlap,
            limits: SessionLimits {
                top_k: file.top_k,
                max_history_turns: file.max_history_turns,
                max_documents: file.max_documents,
                ttl: Duration::from_secs(file.session_ttl_secs),
            },
            whisper_model_path: file.whisper_model_path.map(PathBuf::from),
            tts_language: file.tts_language,
            tts_endpoint: file.tts_endpoint,
        })
    }

    /// Where uploaded documents are saved.
    pub fn documents_dir(&self) -> PathBuf {
        self.storage_dir.join("loaded_data")
    }

    /// Scratch space for voice transcoding.
    pub fn audio_dir(&self) -> PathBuf {
        self.storage_dir.join("audio")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.storage_dir.join("vectordb")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.storage_dir.join("logs")
    }
}
