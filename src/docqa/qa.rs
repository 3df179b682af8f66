//! Conversational retrieval QA over an ingested index.
//!
//! A follow-up question is first condensed into a standalone one using the
//! chat history, then answered from the top-K retrieved chunks.

use std::collections::VecDeque;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::docqa::index::{IndexError, ScoredChunk, VectorIndex};
use crate::docqa::provider::{ChatModel, Embedder, Message, ProviderError};

pub const DEFAULT_TOP_K: usize = 6;
pub const DEFAULT_MAX_HISTORY_TURNS: usize = 50;

const CONDENSE_PROMPT: &str = "Given the following conversation and a follow up question, \
rephrase the follow up question to be a standalone question, in its original language.";

const ANSWER_PROMPT: &str = "Use the following pieces of context to answer the user's question.\n\
If you don't know the answer, just say that you don't know, don't try to make up an answer.";

#[derive(Debug, Error)]
pub enum QaError {
    #[error("no document has been indexed for this chat yet")]
    IndexNotReady,
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("retrieval task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// One question and its answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub query: String,
    pub answer: String,
}

/// Ordered conversation turns, oldest dropped past capacity.
#[derive(Debug, Clone)]
pub struct ChatHistory {
    turns: VecDeque<Turn>,
    capacity: usize,
}

impl ChatHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, query: String, answer: String) {
        if self.turns.len() == self.capacity {
            self.turns.pop_front();
        }
        self.turns.push_back(Turn { query, answer });
    }

    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    fn transcript(&self) -> String {
        self.turns
            .iter()
            .map(|t| format!("Human: {}\nAssistant: {}", t.query, t.answer))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub struct QaSession {
    index: Arc<VectorIndex>,
    top_k: usize,
    history: ChatHistory,
}

impl QaSession {
    pub fn new(index: Arc<VectorIndex>, top_k: usize, max_history_turns: usize) -> Self {
        Self {
            index,
            top_k: top_k.max(1),
            history: ChatHistory::new(max_history_turns),
        }
    }

    /// Point the session at a rebuilt index, keeping the conversation.
    pub fn replace_index(&mut self, index: Arc<VectorIndex>) {
        self.index = index;
    }

    pub fn history(&self) -> &ChatHistory {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Answer `query` and record the turn. Nothing is recorded on failure.
    pub async fn answer(
        &mut self,
        query: &str,
        embedder: &dyn Embedder,
        chat: &dyn ChatModel,
    ) -> Result<String, QaError> {
        let standalone = if self.history.is_empty() {
            query.to_string()
        } else {
            let condensed = chat
                .complete(&[Message::user(format!(
                    "{CONDENSE_PROMPT}\n\nChat History:\n{}\nFollow Up Input: {query}\nStandalone question:",
                    self.history.transcript()
                ))])
                .await?;
            debug!("Condensed question: {}", condensed);
            condensed.trim().to_string()
        };

        let vector = embedder.embed(&standalone).await?;
        let index = self.index.clone();
        let top_k = self.top_k;
        let hits = tokio::task::spawn_blocking(move || index.search(&vector, top_k)).await??;
        info!("Retrieved {} chunk(s) for question", hits.len());

        let answer = chat
            .complete(&[
                Message::system(format!("{ANSWER_PROMPT}\n----------------\n{}", context(&hits))),
                Message::user(standalone),
            ])
            .await?;

        self.history.push(query.to_string(), answer.clone());
        Ok(answer)
    }
}

fn context(hits: &[ScoredChunk]) -> String {
    hits.iter()
        .map(|h| h.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}
