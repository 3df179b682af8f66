//! End-to-end document question answering with in-process providers.

use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use smartbot::docqa::{
    ChatModel, ChatSession, Chunker, Embedder, IndexScope, IngestOutcome, Ingestor, Message,
    ProviderError, QaError, Role, SessionLimits, SessionRegistry,
};
use tempfile::TempDir;

/// Bag-of-letters vectors: texts sharing letters score as similar.
struct LetterEmbedder;

#[async_trait]
impl Embedder for LetterEmbedder {
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0.0; 26];
                for c in text.chars().filter(|c| c.is_ascii_alphabetic()) {
                    v[(c.to_ascii_lowercase() as u8 - b'a') as usize] += 1.0;
                }
                v
            })
            .collect())
    }
}

/// Echoes the system prompt so tests can see the retrieved context.
#[derive(Default)]
struct EchoChat {
    calls: Mutex<usize>,
}

#[async_trait]
impl ChatModel for EchoChat {
    async fn complete(&self, messages: &[Message]) -> Result<String, ProviderError> {
        *self.calls.lock().unwrap() += 1;
        Ok(messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.clone())
            .unwrap_or_else(|| "standalone question".to_string()))
    }
}

fn ingestor(root: &Path, scope: IndexScope) -> Ingestor {
    Ingestor::new(Chunker::default(), Arc::new(LetterEmbedder), root.join("vectordb"), scope)
}

fn write(dir: &TempDir, name: &str, content: &[u8]) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

fn docx(paragraphs: &[&str]) -> Vec<u8> {
    let body: String = paragraphs
        .iter()
        .map(|p| format!("<w:p><w:r><w:t>{p}</w:t></w:r></w:p>"))
        .collect();
    let xml = format!("<w:document><w:body>{body}</w:body></w:document>");

    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    writer
        .start_file("word/document.xml", zip::write::SimpleFileOptions::default())
        .unwrap();
    writer.write_all(xml.as_bytes()).unwrap();
    writer.finish().unwrap().into_inner()
}

#[tokio::test]
async fn question_is_answered_from_uploaded_text() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "handbook.txt", b"Vacation requests go to the office manager.");
    let ingest = ingestor(dir.path(), IndexScope::Shared);
    let chat = EchoChat::default();

    let mut session = ChatSession::new(42, SessionLimits::default());
    let err = session.ask("who approves vacation?", &LetterEmbedder, &chat).await.unwrap_err();
    assert!(matches!(err, QaError::IndexNotReady));

    let outcome = session.ingest(&path, &ingest).await.unwrap();
    assert_eq!(outcome, IngestOutcome::Indexed { documents: 1 });

    let answer = session.ask("who approves vacation?", &LetterEmbedder, &chat).await.unwrap();
    assert!(answer.contains("Vacation requests go to the office manager."));
    assert!(answer.starts_with("Use the following pieces of context"));
    assert!(ingest.index_path(42).exists());
}

#[tokio::test]
async fn word_and_text_documents_accumulate() {
    let dir = TempDir::new().unwrap();
    let word = write(&dir, "policy.docx", &docx(&["Remote work is allowed on Fridays."]));
    let text = write(&dir, "faq.txt", b"Lunch is served at noon.");
    let ignored = write(&dir, "photo.png", b"\x89PNG");
    let ingest = ingestor(dir.path(), IndexScope::Shared);
    let chat = EchoChat::default();

    let mut session = ChatSession::new(1, SessionLimits::default());
    session.ingest(&word, &ingest).await.unwrap();
    session.ingest(&text, &ingest).await.unwrap();
    assert_eq!(session.ingest(&ignored, &ingest).await.unwrap(), IngestOutcome::NothingLoaded);
    assert_eq!(session.loader().len(), 2);

    let answer = session.ask("when is lunch?", &LetterEmbedder, &chat).await.unwrap();
    assert!(answer.contains("Lunch is served at noon."));
    assert!(answer.contains("Remote work is allowed on Fridays."));

    // The follow-up is condensed first, then answered.
    let before = *chat.calls.lock().unwrap();
    session.ask("and on weekends?", &LetterEmbedder, &chat).await.unwrap();
    assert_eq!(*chat.calls.lock().unwrap() - before, 2);
    assert_eq!(session.qa().unwrap().history().len(), 2);
}

#[tokio::test]
async fn per_chat_scope_keeps_chats_apart() {
    let dir = TempDir::new().unwrap();
    let secret = write(&dir, "a.txt", b"The launch code is kept in the blue folder.");
    let recipe = write(&dir, "b.txt", b"Pancakes need flour, eggs and milk.");
    let ingest = ingestor(dir.path(), IndexScope::PerChat);
    let chat = EchoChat::default();
    let registry = SessionRegistry::new(SessionLimits::default());

    let first = registry.get_or_create(1).await;
    let second = registry.get_or_create(2).await;
    first.lock().await.ingest(&secret, &ingest).await.unwrap();
    second.lock().await.ingest(&recipe, &ingest).await.unwrap();

    let answer = second
        .lock()
        .await
        .ask("what is in the folder?", &LetterEmbedder, &chat)
        .await
        .unwrap();
    assert!(answer.contains("Pancakes"));
    assert!(!answer.contains("launch code"));

    assert_ne!(ingest.index_path(1), ingest.index_path(2));
    ingest.discard(1).await.unwrap();
    assert!(!ingest.index_path(1).exists());
    assert!(ingest.index_path(2).exists());
}

#[tokio::test]
async fn reset_requires_a_new_upload() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "notes.txt", b"Standup is at ten.");
    let ingest = ingestor(dir.path(), IndexScope::Shared);
    let chat = EchoChat::default();

    let mut session = ChatSession::new(7, SessionLimits::default());
    session.ingest(&path, &ingest).await.unwrap();
    session.ask("when is standup?", &LetterEmbedder, &chat).await.unwrap();

    session.reset();
    let err = session.ask("when is standup?", &LetterEmbedder, &chat).await.unwrap_err();
    assert!(matches!(err, QaError::IndexNotReady));

    session.ingest(&path, &ingest).await.unwrap();
    assert!(session.qa().unwrap().history().is_empty());
}
