//! Telegram assistant: chat completions, voice in and out, and question
//! answering over uploaded documents.

pub mod config;
pub mod docqa;
pub mod message_log;
pub mod openai;
pub mod speech;
pub mod telegram;
