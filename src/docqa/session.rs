//! Per-chat session state and the registry that owns it.
//!
//! Lifecycle of one chat:
//! no index -> (ingest) -> index ready, empty history -> (ask)* -> ...
//! `/clear` empties the history, `/reset` goes back to no index, and an idle
//! session is evicted after the TTL.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::docqa::document::{DocumentLoader, LoadError};
use crate::docqa::pipeline::{IngestError, Ingestor};
use crate::docqa::provider::{ChatModel, Embedder};
use crate::docqa::qa::{QaError, QaSession};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
}

/// Bounds applied to every session.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub top_k: usize,
    pub max_history_turns: usize,
    pub max_documents: usize,
    pub ttl: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            top_k: crate::docqa::qa::DEFAULT_TOP_K,
            max_history_turns: crate::docqa::qa::DEFAULT_MAX_HISTORY_TURNS,
            max_documents: crate::docqa::document::DEFAULT_MAX_DOCUMENTS,
            ttl: Duration::from_secs(3600),
        }
    }
}

/// What an ingest did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The file produced no documents (e.g. unsupported extension).
    NothingLoaded,
    /// New documents were loaded and the index is ready.
    Indexed { documents: usize },
}

pub struct ChatSession {
    chat_id: i64,
    limits: SessionLimits,
    loader: DocumentLoader,
    qa: Option<QaSession>,
    pending_question: Option<String>,
}

impl ChatSession {
    pub fn new(chat_id: i64, limits: SessionLimits) -> Self {
        Self {
            chat_id,
            limits,
            loader: DocumentLoader::with_capacity(limits.max_documents),
            qa: None,
            pending_question: None,
        }
    }

    pub fn chat_id(&self) -> i64 {
        self.chat_id
    }

    pub fn loader(&self) -> &DocumentLoader {
        &self.loader
    }

    pub fn qa(&self) -> Option<&QaSession> {
        self.qa.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.qa.is_some()
    }

    /// Load a file into the accumulator and (re)build the chat's index.
    pub async fn ingest(
        &mut self,
        path: &Path,
        ingestor: &Ingestor,
    ) -> Result<IngestOutcome, SessionError> {
        let added = self.loader.load(path)?;
        if added == 0 {
            return Ok(IngestOutcome::NothingLoaded);
        }

        let index = ingestor.build(&self.loader.documents(), self.chat_id).await?;
        match self.qa.as_mut() {
            Some(qa) => qa.replace_index(index),
            None => {
                self.qa = Some(QaSession::new(
                    index,
                    self.limits.top_k,
                    self.limits.max_history_turns,
                ));
            }
        }
        Ok(IngestOutcome::Indexed { documents: added })
    }

    /// Answer from the chat's index; fails with `IndexNotReady` before ingest.
    pub async fn ask(
        &mut self,
        query: &str,
        embedder: &dyn Embedder,
        chat: &dyn ChatModel,
    ) -> Result<String, QaError> {
        let qa = self.qa.as_mut().ok_or(QaError::IndexNotReady)?;
        qa.answer(query, embedder, chat).await
    }

    pub fn set_pending_question(&mut self, question: String) {
        self.pending_question = Some(question);
    }

    pub fn take_pending_question(&mut self) -> Option<String> {
        self.pending_question.take()
    }

    /// Empty the QA history. Returns false when there is no QA session.
    pub fn clear_history(&mut self) -> bool {
        match self.qa.as_mut() {
            Some(qa) => {
                qa.clear_history();
                true
            }
            None => false,
        }
    }

    /// Forget documents, index handle, history and pending question.
    pub fn reset(&mut self) {
        self.loader.clear();
        self.qa = None;
        self.pending_question = None;
    }
}

struct Entry {
    session: Arc<Mutex<ChatSession>>,
    last_active: Instant,
}

/// Sessions keyed by chat id.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<i64, Entry>>,
    limits: SessionLimits,
}

impl SessionRegistry {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            limits,
        }
    }

    pub fn limits(&self) -> SessionLimits {
        self.limits
    }

    /// Fetch the chat's session, creating it on first use.
    pub async fn get_or_create(&self, chat_id: i64) -> Arc<Mutex<ChatSession>> {
        let mut sessions = self.sessions.lock().await;
        let limits = self.limits;
        let entry = sessions.entry(chat_id).or_insert_with(|| {
            debug!("New session for chat {}", chat_id);
            Entry {
                session: Arc::new(Mutex::new(ChatSession::new(chat_id, limits))),
                last_active: Instant::now(),
            }
        });
        entry.last_active = Instant::now();
        entry.session.clone()
    }

    /// Drop sessions idle longer than the TTL as of `now`.
    ///
    /// Sessions still held by a handler are kept regardless of age.
    pub async fn evict_idle(&self, now: Instant) -> usize {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        let ttl = self.limits.ttl;
        sessions.retain(|_, entry| {
            Arc::strong_count(&entry.session) > 1
                || now.saturating_duration_since(entry.last_active) < ttl
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            info!("Evicted {} idle session(s)", evicted);
        }
        evicted
    }

    pub async fn remove(&self, chat_id: i64) {
        self.sessions.lock().await.remove(&chat_id);
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Periodically evict idle sessions in the background.
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                registry.evict_idle(Instant::now()).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docqa::chunker::Chunker;
    use crate::docqa::index::IndexScope;
    use crate::docqa::pipeline::fakes::LetterEmbedder;
    use crate::docqa::qa::fakes::ScriptedChat;
    use tempfile::TempDir;

    fn limits() -> SessionLimits {
        SessionLimits {
            ttl: Duration::from_secs(60),
            ..SessionLimits::default()
        }
    }

    fn ingestor(dir: &TempDir) -> Ingestor {
        Ingestor::new(
            Chunker::default(),
            Arc::new(LetterEmbedder::default()),
            dir.path().join("vectordb"),
            IndexScope::Shared,
        )
    }

    #[tokio::test]
    async fn test_ask_before_ingest_is_not_ready() {
        let mut session = ChatSession::new(1, limits());
        let err = session
            .ask("anything?", &LetterEmbedder::default(), &ScriptedChat::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QaError::IndexNotReady));
    }

    #[tokio::test]
    async fn test_ingest_then_ask() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "The meeting is on Tuesday.").unwrap();

        let mut session = ChatSession::new(1, limits());
        let outcome = session.ingest(&path, &ingestor(&dir)).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Indexed { documents: 1 });
        assert!(session.is_ready());

        let answer = session
            .ask("when is the meeting?", &LetterEmbedder::default(), &ScriptedChat::default())
            .await
            .unwrap();
        assert_eq!(answer, "reply 1");
        assert_eq!(session.qa().unwrap().history().len(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_ingest_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("slides.pptx");
        std::fs::write(&path, "binary").unwrap();

        let mut session = ChatSession::new(1, limits());
        let outcome = session.ingest(&path, &ingestor(&dir)).await.unwrap();
        assert_eq!(outcome, IngestOutcome::NothingLoaded);
        assert!(session.loader().is_empty());
        assert!(!session.is_ready());
    }

    #[tokio::test]
    async fn test_second_ingest_keeps_history() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, "alpha").unwrap();
        std::fs::write(&b, "beta").unwrap();
        let ingest = ingestor(&dir);
        let embedder = LetterEmbedder::default();
        let chat = ScriptedChat::default();

        let mut session = ChatSession::new(1, limits());
        session.ingest(&a, &ingest).await.unwrap();
        session.ask("q", &embedder, &chat).await.unwrap();
        session.ingest(&b, &ingest).await.unwrap();

        assert_eq!(session.loader().len(), 2);
        assert_eq!(session.qa().unwrap().history().len(), 1);
    }

    #[tokio::test]
    async fn test_clear_and_reset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "content").unwrap();

        let mut session = ChatSession::new(1, limits());
        assert!(!session.clear_history());

        session.ingest(&path, &ingestor(&dir)).await.unwrap();
        session
            .ask("q", &LetterEmbedder::default(), &ScriptedChat::default())
            .await
            .unwrap();
        assert!(session.clear_history());
        assert!(session.qa().unwrap().history().is_empty());

        session.set_pending_question("#later".into());
        session.reset();
        assert!(!session.is_ready());
        assert!(session.loader().is_empty());
        assert_eq!(session.take_pending_question(), None);
    }

    #[tokio::test]
    async fn test_registry_reuses_sessions() {
        let registry = SessionRegistry::new(limits());
        let a = registry.get_or_create(10).await;
        let b = registry.get_or_create(10).await;
        assert!(Arc::ptr_eq(&a, &b));
        registry.get_or_create(11).await;
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_registry_evicts_idle_only() {
        let registry = SessionRegistry::new(limits());
        drop(registry.get_or_create(1).await);
        let held = registry.get_or_create(2).await;

        assert_eq!(registry.evict_idle(Instant::now()).await, 0);

        let later = Instant::now() + Duration::from_secs(120);
        assert_eq!(registry.evict_idle(later).await, 1);
        assert_eq!(registry.len().await, 1);

        drop(held);
        assert_eq!(registry.evict_idle(later).await, 1);
        assert!(registry.is_empty().await);
    }
}
