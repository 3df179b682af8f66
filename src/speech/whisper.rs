//! Local speech-to-text with whisper-rs.
//!
//! Used instead of the OpenAI transcription endpoint when a model file is
//! configured.

use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;

use tracing::{debug, info};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use crate::speech::SpeechError;
use crate::speech::audio::{remove_quietly, unique_name};

pub struct Whisper {
    ctx: Arc<WhisperContext>,
    language: Option<String>,
}

impl Whisper {
    /// Load a ggml model. `language` of `None` lets Whisper auto-detect.
    pub fn new(model_path: &Path, language: Option<String>) -> Result<Self, SpeechError> {
        info!("Loading Whisper model from {:?}", model_path);

        if !model_path.exists() {
            return Err(SpeechError::Transcription(format!(
                "model file not found: {}",
                model_path.display()
            )));
        }
        let path = model_path
            .to_str()
            .ok_or_else(|| SpeechError::Transcription("invalid model path".into()))?;

        let ctx = WhisperContext::new_with_params(path, WhisperContextParameters::default())
            .map_err(|e| SpeechError::Transcription(format!("failed to load model: {e}")))?;

        info!("Whisper model loaded");
        Ok(Self {
            ctx: Arc::new(ctx),
            language,
        })
    }

    /// Transcribe a Telegram voice note (OGG Opus). Blocking.
    pub fn transcribe(&self, ogg: &[u8]) -> Result<String, SpeechError> {
        debug!("Transcribing {} bytes of audio", ogg.len());
        let pcm = ogg_to_pcm(ogg)?;

        let mut state = self
            .ctx
            .create_state()
            .map_err(|e| SpeechError::Transcription(format!("failed to create state: {e}")))?;

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_language(self.language.as_deref());
        params.set_translate(false);
        params.set_no_timestamps(true);
        params.set_single_segment(false);

        state
            .full(params, &pcm)
            .map_err(|e| SpeechError::Transcription(e.to_string()))?;

        let mut text = String::new();
        for segment in state.as_iter() {
            if let Ok(s) = segment.to_str() {
                text.push_str(s);
                text.push(' ');
            }
        }
        let text = text.trim().to_string();
        let preview: String = text.chars().take(100).collect();
        info!("Transcribed locally: \"{}\"", preview);
        Ok(text)
    }
}

/// 16 kHz mono f32 samples via ffmpeg. OGG needs a seekable input file.
fn ogg_to_pcm(ogg: &[u8]) -> Result<Vec<f32>, SpeechError> {
    let input_path = std::env::temp_dir().join(unique_name("ogg"));
    std::fs::write(&input_path, ogg).map_err(|e| SpeechError::Io {
        path: input_path.clone(),
        source: e,
    })?;

    let output = Command::new("ffmpeg")
        .arg("-i")
        .arg(&input_path)
        .args(["-ar", "16000", "-ac", "1", "-f", "s16le", "-acodec", "pcm_s16le", "-y", "pipe:1"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output();
    remove_quietly(&input_path);
    let output = output.map_err(SpeechError::Spawn)?;

    if !output.status.success() {
        return Err(SpeechError::Ffmpeg(
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }

    let samples = pcm_s16le_to_f32(&output.stdout);
    debug!("Converted to {} f32 samples", samples.len());
    Ok(samples)
}

fn pcm_s16le_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_conversion() {
        let bytes = [0x00, 0x00, 0x00, 0x80, 0xff, 0x7f, 0x01];
        let samples = pcm_s16le_to_f32(&bytes);
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0], 0.0);
        assert_eq!(samples[1], -1.0);
        assert!((samples[2] - 0.99997).abs() < 1e-4);
    }

    #[test]
    fn test_missing_model_rejected() {
        let err = Whisper::new(Path::new("/nonexistent/ggml-base.bin"), None).err().unwrap();
        assert!(err.to_string().contains("model file not found"));
    }
}
