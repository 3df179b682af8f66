//! Thin Telegram client over teloxide.
//!
//! Failures are logged here and returned as strings; the handlers decide
//! whether a failed send matters.

use std::path::Path;

use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, FileId, InputFile, MessageId, ReplyParameters};
use tracing::{info, warn};

/// Telegram rejects longer messages.
pub const MAX_MESSAGE_CHARS: usize = 4096;

#[derive(Clone)]
pub struct TelegramClient {
    bot: Bot,
}

impl TelegramClient {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    /// Send plain text, split into several messages when too long.
    /// Only the first part replies to `reply_to_message_id`.
    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to_message_id: Option<i32>,
    ) -> Result<i32, String> {
        let mut first_id = None;
        for (i, part) in split_message(text, MAX_MESSAGE_CHARS).into_iter().enumerate() {
            let mut request = self.bot.send_message(ChatId(chat_id), part);
            if i == 0
                && let Some(msg_id) = reply_to_message_id
            {
                request = request.reply_parameters(ReplyParameters::new(MessageId(msg_id)));
            }

            let sent = request.await.map_err(|e| {
                let msg = format!("Failed to send: {e}");
                warn!("{}", msg);
                msg
            })?;
            first_id.get_or_insert(sent.id.0);
        }
        first_id.ok_or_else(|| "Refusing to send an empty message".to_string())
    }

    /// Reply to `msg` in its chat.
    pub async fn reply(&self, msg: &Message, text: &str) -> Result<i32, String> {
        self.send_message(msg.chat.id.0, text, Some(msg.id.0)).await
    }

    pub async fn send_typing(&self, chat_id: i64) {
        if let Err(e) = self.bot.send_chat_action(ChatId(chat_id), ChatAction::Typing).await {
            warn!("Failed to send typing action: {}", e);
        }
    }

    /// Download a file by id to `dest`. Returns the number of bytes written.
    pub async fn download_file(&self, file_id: &FileId, dest: &Path) -> Result<u64, String> {
        let file = self.bot.get_file(file_id.clone()).await.map_err(|e| {
            let msg = format!("Failed to get file info: {e}");
            warn!("{}", msg);
            msg
        })?;

        let mut data = Vec::new();
        self.bot.download_file(&file.path, &mut data).await.map_err(|e| {
            let msg = format!("Failed to download file: {e}");
            warn!("{}", msg);
            msg
        })?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("Failed to create {}: {e}", parent.display()))?;
        }
        tokio::fs::write(dest, &data)
            .await
            .map_err(|e| format!("Failed to write {}: {e}", dest.display()))?;

        info!("📥 Downloaded {} ({} bytes)", dest.display(), data.len());
        Ok(data.len() as u64)
    }

    /// Send a voice message from bytes (OGG Opus format).
    pub async fn send_voice(
        &self,
        chat_id: i64,
        voice_data: Vec<u8>,
        reply_to_message_id: Option<i32>,
    ) -> Result<i32, String> {
        info!("🔊 Sending voice to chat {} ({} bytes)", chat_id, voice_data.len());

        let input_file = InputFile::memory(voice_data).file_name("voice.ogg");
        let mut request = self.bot.send_voice(ChatId(chat_id), input_file);
        if let Some(msg_id) = reply_to_message_id {
            request = request.reply_parameters(ReplyParameters::new(MessageId(msg_id)));
        }

        request.await.map(|msg| msg.id.0).map_err(|e| {
            let msg = format!("Failed to send voice: {e}");
            warn!("{}", msg);
            msg
        })
    }
}

/// Split `text` into parts of at most `max` characters, preferring line breaks.
fn split_message(text: &str, max: usize) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.split_inclusive('\n') {
        let line_len = line.chars().count();
        if current_len + line_len > max && current_len > 0 {
            parts.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if line_len > max {
            let chars: Vec<char> = line.chars().collect();
            for piece in chars.chunks(max) {
                parts.push(piece.iter().collect());
            }
            continue;
        }
        current.push_str(line);
        current_len += line_len;
    }
    if !current.trim().is_empty() {
        parts.push(current);
    }
    parts.retain(|p| !p.trim().is_empty());
    parts
}
