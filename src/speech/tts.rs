//! Text-to-speech through the Google Translate TTS endpoint.
//!
//! The endpoint accepts at most 200 characters per request, so longer text is
//! split on word boundaries and the MP3 pieces are concatenated.

use std::time::Duration;

use tracing::{debug, info};

use crate::speech::SpeechError;
use crate::speech::audio::to_voice_ogg;

pub const DEFAULT_ENDPOINT: &str = "https://translate.google.com/translate_tts";
pub const DEFAULT_LANGUAGE: &str = "ru";
const MAX_PIECE_CHARS: usize = 200;

pub struct TtsClient {
    endpoint: String,
    client: reqwest::Client,
}

impl TtsClient {
    pub fn new(endpoint: Option<String>) -> Result<Self, SpeechError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            endpoint: endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            client,
        })
    }

    /// Synthesize `text` as MP3.
    pub async fn synthesize(&self, text: &str, language: &str) -> Result<Vec<u8>, SpeechError> {
        let pieces = split_for_tts(text, MAX_PIECE_CHARS);
        if pieces.is_empty() {
            return Err(SpeechError::EmptyText);
        }
        let preview: String = text.chars().take(50).collect();
        info!("TTS ({}): \"{}\" in {} piece(s)", language, preview, pieces.len());

        let mut mp3 = Vec::new();
        for (idx, piece) in pieces.iter().enumerate() {
            let url = self.piece_url(piece, language, idx, pieces.len());
            let response = self.client.get(url).send().await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(SpeechError::Tts {
                    status: status.as_u16(),
                    body,
                });
            }
            let bytes = response.bytes().await?;
            debug!("Piece {} -> {} bytes", idx, bytes.len());
            mp3.extend_from_slice(&bytes);
        }
        Ok(mp3)
    }

    /// Synthesize `text` as OGG Opus, ready for a Telegram voice message.
    pub async fn synthesize_voice(&self, text: &str, language: &str) -> Result<Vec<u8>, SpeechError> {
        let mp3 = self.synthesize(text, language).await?;
        tokio::task::spawn_blocking(move || to_voice_ogg(&mp3))
            .await
            .map_err(|e| SpeechError::Ffmpeg(e.to_string()))?
    }

    fn piece_url(&self, piece: &str, language: &str, idx: usize, total: usize) -> String {
        format!(
            "{}?ie=UTF-8&client=tw-ob&tl={}&q={}&total={}&idx={}&textlen={}",
            self.endpoint,
            urlencoding::encode(language),
            urlencoding::encode(piece),
            total,
            idx,
            piece.chars().count()
        )
    }
}

/// Split into pieces of at most `max` characters, breaking between words.
/// A single word longer than `max` is cut mid-word.
fn split_for_tts(text: &str, max: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for word in text.split_whitespace() {
        let mut word: Vec<char> = word.chars().collect();
        while word.len() > max {
            if current_len > 0 {
                pieces.push(std::mem::take(&mut current));
                current_len = 0;
            }
            let rest = word.split_off(max);
            pieces.push(word.into_iter().collect());
            word = rest;
        }
        if word.is_empty() {
            continue;
        }

        let needed = if current_len == 0 { word.len() } else { word.len() + 1 };
        if current_len + needed > max {
            pieces.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if current_len > 0 {
            current.push(' ');
            current_len += 1;
        }
        current.extend(word.iter());
        current_len += word.len();
    }
    if current_len > 0 {
        pieces.push(current);
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_is_one_piece() {
        assert_eq!(split_for_tts("  привет   мир ", 200), vec!["привет мир"]);
        assert!(split_for_tts("   ", 200).is_empty());
    }

    #[test]
    fn test_splits_on_word_boundaries() {
        let pieces = split_for_tts("aaa bbb ccc ddd", 7);
        assert_eq!(pieces, vec!["aaa bbb", "ccc ddd"]);

        let text = "слово ".repeat(100);
        let pieces = split_for_tts(&text, 200);
        assert!(pieces.iter().all(|p| p.chars().count() <= 200));
        assert_eq!(pieces.join(" "), text.trim());
    }

    #[test]
    fn test_long_word_is_cut() {
        let pieces = split_for_tts("ab abcdefghij cd", 4);
        assert_eq!(pieces, vec!["ab", "abcd", "efgh", "ij", "cd"]);
    }

    #[test]
    fn test_piece_url_encodes_text() {
        let client = TtsClient::new(None).unwrap();
        let url = client.piece_url("да, нет?", "ru", 0, 1);
        assert!(url.starts_with("https://translate.google.com/translate_tts?"));
        assert!(url.contains("tl=ru"));
        assert!(url.contains("q=%D0%B4%D0%B0%2C%20"));
        assert!(url.contains("textlen=8"));
    }

    #[tokio::test]
    async fn test_empty_text_rejected() {
        let client = TtsClient::new(None).unwrap();
        let err = client.synthesize(" \n", "ru").await.unwrap_err();
        assert!(matches!(err, SpeechError::EmptyText));
    }
}
