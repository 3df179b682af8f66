//! Speech plumbing: ffmpeg transcoding, text-to-speech and local transcription.

pub mod audio;
pub mod tts;
#[cfg(feature = "local-whisper")]
pub mod whisper;

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpeechError {
    #[error("audio file error at '{}': {source}", path.display())]
    Io { path: PathBuf, source: std::io::Error },
    #[error("failed to run ffmpeg: {0}")]
    Spawn(std::io::Error),
    #[error("ffmpeg conversion failed: {0}")]
    Ffmpeg(String),
    #[error("TTS request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("TTS error {status}: {body}")]
    Tts { status: u16, body: String },
    #[error("nothing to synthesize")]
    EmptyText,
    #[error("transcription failed: {0}")]
    Transcription(String),
}

pub use audio::{ogg_to_mp3, remove_quietly, to_voice_ogg, unique_name};
pub use tts::TtsClient;
