use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use teloxide::prelude::*;
use teloxide::update_listeners::webhooks;
use teloxide::utils::command::BotCommands;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use smartbot::config::{Config, RunMode};
use smartbot::docqa::{
    ChatModel, ChatSession, Chunker, Embedder, IngestOutcome, Ingestor, QaError, SessionRegistry,
};
use smartbot::message_log::MessageLog;
use smartbot::openai::{self, OpenAiChat, OpenAiEmbedder};
use smartbot::speech::{self, TtsClient};
use smartbot::telegram::TelegramClient;

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Commands:")]
enum Command {
    #[command(description = "show this message")]
    Help,
    #[command(description = "read the text aloud as a voice message")]
    Read(String),
    #[command(description = "forget the conversation about the documents")]
    Clear,
    #[command(description = "drop the uploaded documents and the conversation")]
    Reset,
}

struct BotState {
    config: Config,
    telegram: TelegramClient,
    sessions: Arc<SessionRegistry>,
    ingestor: Ingestor,
    embedder: Arc<dyn Embedder>,
    /// Plain replies.
    chat: OpenAiChat,
    /// Document answers.
    qa_chat: OpenAiChat,
    openai: openai::Client,
    tts: TtsClient,
    log: MessageLog,
    #[cfg(feature = "local-whisper")]
    whisper: Option<Arc<speech::whisper::Whisper>>,
}

impl BotState {
    fn new(config: Config, bot: &Bot) -> Result<Self, String> {
        let client = openai::Client::new(config.openai_api_key.clone(), config.openai_base_url.clone())
            .map_err(|e| format!("Failed to build OpenAI client: {e}"))?;
        let embedder: Arc<dyn Embedder> =
            Arc::new(OpenAiEmbedder::new(client.clone(), config.embedding_model.clone()));
        let chunker = Chunker::new(config.chunk_size, config.chunk_overlap).map_err(|e| e.to_string())?;
        let ingestor = Ingestor::new(chunker, embedder.clone(), config.index_dir(), config.index_scope);

        let log = MessageLog::open(&config.database_path).map_err(|e| e.to_string())?;
        let tts = TtsClient::new(config.tts_endpoint.clone()).map_err(|e| e.to_string())?;

        #[cfg(feature = "local-whisper")]
        let whisper = match &config.whisper_model_path {
            Some(path) => Some(Arc::new(
                speech::whisper::Whisper::new(path, None).map_err(|e| e.to_string())?,
            )),
            None => None,
        };
        #[cfg(not(feature = "local-whisper"))]
        if config.whisper_model_path.is_some() {
            warn!("whisper_model_path is set but the local-whisper feature is off; using OpenAI");
        }

        Ok(Self {
            telegram: TelegramClient::new(bot.clone()),
            sessions: Arc::new(SessionRegistry::new(config.limits)),
            ingestor,
            embedder,
            chat: OpenAiChat::new(client.clone(), config.model.clone(), config.temperature),
            qa_chat: OpenAiChat::new(client.clone(), config.qa_model.clone(), config.qa_temperature),
            openai: client,
            tts,
            log,
            #[cfg(feature = "local-whisper")]
            whisper,
            config,
        })
    }

    /// Save to the message log. Failures never block a reply.
    async fn record(&self, username: &str, text: &str) {
        if let Err(e) = self.log.append(username.to_string(), text.to_string()).await {
            warn!("Failed to log message: {}", e);
        }
    }

    /// Reply and log the reply as the bot's.
    async fn answer(&self, msg: &Message, text: &str) {
        if self.telegram.reply(msg, text).await.is_ok() {
            self.record(BOT_NAME, text).await;
        }
    }
}

const BOT_NAME: &str = "smartbot";

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "smartbot.json".to_string());
    let config = match Config::from_env(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    // Setup logging
    let log_dir = config.logs_dir();
    std::fs::create_dir_all(&log_dir).ok();
    let log_file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("smartbot.log"))
    {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Failed to open log file in {}: {e}", log_dir.display());
            std::process::exit(1);
        }
    };
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .init();

    info!("🚀 Starting smartbot...");
    info!("Loaded config from {config_path}");
    info!(
        "Models: chat={}, qa={}, embeddings={}; index scope {:?}",
        config.model, config.qa_model, config.embedding_model, config.index_scope
    );

    for dir in [config.documents_dir(), config.audio_dir()] {
        if let Err(e) = std::fs::create_dir_all(&dir) {
            error!("Failed to create {}: {}", dir.display(), e);
            std::process::exit(1);
        }
    }

    let bot = Bot::new(&config.telegram_bot_token);
    let mode = config.mode;
    let webhook = config.webhook_url.clone().map(|url| (config.webhook_addr, url));
    let state = match BotState::new(config, &bot) {
        Ok(state) => Arc::new(state),
        Err(e) => {
            error!("Startup failed: {}", e);
            std::process::exit(1);
        }
    };

    let reap_every = state.config.limits.ttl.clamp(Duration::from_secs(1), Duration::from_secs(60));
    state.sessions.spawn_reaper(reap_every);

    let handler = Update::filter_message()
        .branch(dptree::entry().filter_command::<Command>().endpoint(handle_command))
        .branch(dptree::filter(|msg: Message| msg.document().is_some()).endpoint(handle_document))
        .branch(dptree::filter(|msg: Message| msg.voice().is_some()).endpoint(handle_voice))
        .branch(dptree::filter(|msg: Message| msg.text().is_some()).endpoint(handle_text));

    let mut dispatcher = Dispatcher::builder(bot.clone(), handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build();

    match (mode, webhook) {
        (RunMode::Webhook, Some((addr, url))) => {
            info!("Listening for webhook updates on {} ({})", addr, url);
            let listener = match webhooks::axum(bot, webhooks::Options::new(addr, url)).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!("Failed to set up webhook: {}", e);
                    std::process::exit(1);
                }
            };
            dispatcher
                .dispatch_with_listener(
                    listener,
                    LoggingErrorHandler::with_custom_text("An error from the update listener"),
                )
                .await;
        }
        _ => {
            info!("Polling for updates");
            dispatcher.dispatch().await;
        }
    }
}

async fn handle_command(msg: Message, cmd: Command, state: Arc<BotState>) -> ResponseResult<()> {
    let chat_id = msg.chat.id.0;
    match cmd {
        Command::Help => {
            let name = msg.from.as_ref().map(|u| u.first_name.as_str()).unwrap_or("there");
            state.telegram.reply(&msg, &help_text(name)).await.ok();
        }
        Command::Read(text) => {
            let text = text.trim();
            if text.is_empty() {
                state.telegram.reply(&msg, "Usage: /read <text>").await.ok();
                return Ok(());
            }
            match state.tts.synthesize_voice(text, &state.config.tts_language).await {
                Ok(voice) => {
                    state.telegram.send_voice(chat_id, voice, Some(msg.id.0)).await.ok();
                }
                Err(e) => {
                    error!("TTS failed: {}", e);
                    state.telegram.reply(&msg, "Sorry, I could not read that aloud.").await.ok();
                }
            }
        }
        Command::Clear => {
            let session = state.sessions.get_or_create(chat_id).await;
            let reply = if session.lock().await.clear_history() {
                "Conversation about the documents cleared."
            } else {
                "No documents loaded yet, nothing to clear."
            };
            state.telegram.reply(&msg, reply).await.ok();
        }
        Command::Reset => {
            let session = state.sessions.get_or_create(chat_id).await;
            session.lock().await.reset();
            if let Err(e) = state.ingestor.discard(chat_id).await {
                warn!("Failed to discard index for chat {}: {}", chat_id, e);
            }
            info!("Reset session for chat {}", chat_id);
            state.telegram.reply(&msg, "Documents and conversation dropped.").await.ok();
        }
    }
    Ok(())
}

async fn handle_document(msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(doc) = msg.document() else {
        return Ok(());
    };
    let chat_id = msg.chat.id.0;
    let caption = caption_question(msg.caption());
    if let Some(caption) = caption {
        state.record(&sender_name(&msg), caption).await;
    }
    let file_name = sanitize_file_name(doc.file_name.as_deref().unwrap_or("document"));
    let dest = state.config.documents_dir().join(&file_name);

    let size = match state.telegram.download_file(&doc.file.id, &dest).await {
        Ok(size) => size,
        Err(_) => {
            state.telegram.reply(&msg, &format!("Could not download {file_name}.")).await.ok();
            return Ok(());
        }
    };
    info!("File: {} ({}) of size {} downloaded.", file_name, doc.file.id.0, size);
    state
        .telegram
        .reply(&msg, &format!("File {file_name} uploaded for analysis. Size {size} bytes."))
        .await
        .ok();

    let session = state.sessions.get_or_create(chat_id).await;
    let mut session = session.lock().await;
    state.telegram.send_typing(chat_id).await;

    match session.ingest(&dest, &state.ingestor).await {
        Ok(IngestOutcome::NothingLoaded) => {
            let reply = if session.loader().is_empty() {
                format!("Nothing could be read from {file_name}. I understand PDF, Word and plain text files.")
            } else {
                format!("Nothing could be read from {file_name}; the earlier documents are still loaded.")
            };
            state.telegram.reply(&msg, &reply).await.ok();
        }
        Ok(IngestOutcome::Indexed { documents }) => {
            info!("Chat {}: indexed {} document(s) from {}", chat_id, documents, file_name);
            let question = caption.map(str::to_string).or_else(|| session.take_pending_question());
            match question {
                Some(question) => answer_question(&state, &mut session, &msg, &question).await,
                None => {
                    state
                        .telegram
                        .reply(&msg, "Ready. Ask about the document with #your question.")
                        .await
                        .ok();
                }
            }
        }
        Err(e) => {
            error!("Failed to ingest {}: {}", dest.display(), e);
            state.telegram.reply(&msg, &format!("Failed to process {file_name}.")).await.ok();
        }
    }
    Ok(())
}

async fn handle_text(msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let chat_id = msg.chat.id.0;
    state.record(&sender_name(&msg), text).await;

    if text.starts_with('#') {
        let session = state.sessions.get_or_create(chat_id).await;
        let mut session = session.lock().await;
        if session.is_ready() {
            answer_question(&state, &mut session, &msg, text).await;
        } else {
            session.set_pending_question(text.to_string());
            state
                .telegram
                .reply(&msg, "No document loaded yet. Send one and I will answer this question.")
                .await
                .ok();
        }
        return Ok(());
    }

    reply_with_completion(&state, &msg, text).await;
    Ok(())
}

async fn handle_voice(msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(voice) = msg.voice() else {
        return Ok(());
    };
    let audio_dir = state.config.audio_dir();
    let ogg_path = audio_dir.join(speech::unique_name("ogg"));

    if state.telegram.download_file(&voice.file.id, &ogg_path).await.is_err() {
        state.telegram.reply(&msg, "Could not download the voice message.").await.ok();
        return Ok(());
    }
    state.telegram.send_typing(msg.chat.id.0).await;

    let transcript = transcribe(&state, &ogg_path, &audio_dir).await;
    speech::remove_quietly(&ogg_path);

    let text = match transcript {
        Ok(text) if !text.trim().is_empty() => text,
        Ok(_) => {
            state.telegram.reply(&msg, "I could not hear anything in that.").await.ok();
            return Ok(());
        }
        Err(e) => {
            error!("Transcription failed: {}", e);
            state.telegram.reply(&msg, "Sorry, I could not transcribe that.").await.ok();
            return Ok(());
        }
    };

    state.record(&sender_name(&msg), &text).await;
    state.telegram.reply(&msg, &format!("Your request:\n{text}")).await.ok();
    reply_with_completion(&state, &msg, &text).await;
    Ok(())
}

/// Voice note to text. Intermediate files are removed before returning.
async fn transcribe(state: &BotState, ogg_path: &Path, audio_dir: &Path) -> Result<String, String> {
    #[cfg(feature = "local-whisper")]
    if let Some(whisper) = state.whisper.clone() {
        let ogg = tokio::fs::read(ogg_path).await.map_err(|e| e.to_string())?;
        return tokio::task::spawn_blocking(move || whisper.transcribe(&ogg))
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string());
    }

    let (ogg, dir): (PathBuf, PathBuf) = (ogg_path.to_path_buf(), audio_dir.to_path_buf());
    let mp3_path = tokio::task::spawn_blocking(move || speech::ogg_to_mp3(&ogg, &dir))
        .await
        .map_err(|e| e.to_string())?
        .map_err(|e| e.to_string())?;
    let text = state.openai.transcribe(&mp3_path).await.map_err(|e| e.to_string());
    speech::remove_quietly(&mp3_path);
    text
}

/// Answer a `#question` from the chat's documents.
async fn answer_question(state: &BotState, session: &mut ChatSession, msg: &Message, raw: &str) {
    let question = raw.trim_start_matches('#').trim();
    if question.is_empty() {
        state.telegram.reply(msg, "Write your question after the #.").await.ok();
        return;
    }
    state.telegram.send_typing(msg.chat.id.0).await;

    let embedder: &dyn Embedder = state.embedder.as_ref();
    match session.ask(question, embedder, &state.qa_chat).await {
        Ok(answer) => state.answer(msg, &answer).await,
        Err(QaError::IndexNotReady) => {
            session.set_pending_question(raw.to_string());
            state.telegram.reply(msg, "No document loaded yet.").await.ok();
        }
        Err(e) => {
            error!("Document question failed in chat {}: {}", session.chat_id(), e);
            state.telegram.reply(msg, "Sorry, I could not answer from the documents.").await.ok();
        }
    }
}

async fn reply_with_completion(state: &BotState, msg: &Message, text: &str) {
    state.telegram.send_typing(msg.chat.id.0).await;
    match state.chat.complete(&[smartbot::docqa::Message::user(text)]).await {
        Ok(answer) => state.answer(msg, &answer).await,
        Err(e) => {
            error!("Chat completion failed: {}", e);
            state.telegram.reply(msg, "Sorry, the language model is unavailable right now.").await.ok();
        }
    }
}

fn sender_name(msg: &Message) -> String {
    msg.from
        .as_ref()
        .map(|u| u.username.clone().unwrap_or_else(|| u.first_name.clone()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// A document caption, if it holds any text, is a question about that document.
fn caption_question(caption: Option<&str>) -> Option<&str> {
    caption.map(str::trim).filter(|c| !c.is_empty())
}

/// Keep only the final path component of an uploaded file name.
fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("").trim();
    match base {
        "" | "." | ".." => "document".to_string(),
        base => base.to_string(),
    }
}

fn help_text(name: &str) -> String {
    format!(
        "Hi, {name}!\n\n\
         We can talk by text or by voice messages.\n\n\
         Send me a PDF, Word or text file and ask about it with #your question. \
         A question sent before the file is answered as soon as it arrives.\n\n\
         {}",
        Command::descriptions()
    )
}
