//! Ingestion: documents to chunks to embeddings to the on-disk index.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::docqa::chunker::{Chunk, Chunker};
use crate::docqa::document::Document;
use crate::docqa::index::{IndexEntry, IndexError, IndexScope, VectorIndex};
use crate::docqa::provider::{Embedder, ProviderError};

/// Chunks embedded per provider request.
const EMBED_BATCH_SIZE: usize = 64;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("documents contain no text to index")]
    NoText,
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("embedding count mismatch: {chunks} chunks, {vectors} vectors")]
    EmbeddingCount { chunks: usize, vectors: usize },
    #[error("index task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub struct Ingestor {
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    index_root: PathBuf,
    scope: IndexScope,
}

impl Ingestor {
    pub fn new(
        chunker: Chunker,
        embedder: Arc<dyn Embedder>,
        index_root: PathBuf,
        scope: IndexScope,
    ) -> Self {
        Self {
            chunker,
            embedder,
            index_root,
            scope,
        }
    }

    pub fn scope(&self) -> IndexScope {
        self.scope
    }

    pub fn index_path(&self, chat_id: i64) -> PathBuf {
        self.scope.index_path(&self.index_root, chat_id)
    }

    /// Chunk, embed and persist `documents`, returning the index handle.
    ///
    /// Chunks are keyed by source, document digest, page and position. Keys
    /// already stored are not embedded again, so re-ingesting a chat's
    /// accumulated documents only pays for new ones. An edited file uploaded
    /// under an old name gets a new digest and is indexed next to the old one.
    pub async fn build(
        &self,
        documents: &[Document],
        chat_id: i64,
    ) -> Result<Arc<VectorIndex>, IngestError> {
        let chunks = self.chunker.split(documents);
        if chunks.is_empty() {
            return Err(IngestError::NoText);
        }
        let total = chunks.len();

        let path = self.index_path(chat_id);
        let (index, fresh) = tokio::task::spawn_blocking(move || {
            let index = VectorIndex::open(&path)?;
            let fresh = unindexed(&index, chunks)?;
            Ok::<_, IndexError>((Arc::new(index), fresh))
        })
        .await??;

        debug!("{} of {} chunks need embedding", fresh.len(), total);

        let mut entries = Vec::with_capacity(fresh.len());
        for batch in fresh.chunks(EMBED_BATCH_SIZE) {
            let texts: Vec<&str> = batch.iter().map(|c| c.text.as_str()).collect();
            let vectors = self.embedder.embed_batch(&texts).await?;
            if vectors.len() != batch.len() {
                return Err(IngestError::EmbeddingCount {
                    chunks: batch.len(),
                    vectors: vectors.len(),
                });
            }
            entries.extend(batch.iter().zip(vectors).map(|(chunk, vector)| IndexEntry {
                vector,
                text: chunk.text.clone(),
                source: source_key(&chunk.source),
                digest: chunk.digest.clone(),
                page: chunk.page,
                chunk_index: chunk.index,
            }));
        }

        let writer = index.clone();
        let added = tokio::task::spawn_blocking(move || writer.add(&entries)).await??;

        info!(
            "Ingested {} document(s): {} chunks, {} newly embedded",
            documents.len(),
            total,
            added
        );
        Ok(index)
    }

    /// Drop a chat's private index directory. The shared index is never
    /// removed.
    pub async fn discard(&self, chat_id: i64) -> Result<(), IngestError> {
        if self.scope != IndexScope::PerChat {
            return Ok(());
        }
        let index_path = self.index_path(chat_id);
        let Some(dir) = index_path.parent().map(Path::to_path_buf) else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!("Removed chat index {:?}", dir);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(IndexError::Io { path: dir, source: e }),
        })
        .await??;
        Ok(())
    }
}

/// Chunks not yet in the index, each key once.
fn unindexed(index: &VectorIndex, chunks: Vec<Chunk>) -> Result<Vec<Chunk>, IndexError> {
    let mut seen = HashSet::new();
    let mut fresh = Vec::new();
    for chunk in chunks {
        let source = source_key(&chunk.source);
        let key = (source.clone(), chunk.digest.clone(), chunk.page, chunk.index);
        if !seen.insert(key) {
            continue;
        }
        if !index.contains(&source, &chunk.digest, chunk.page, chunk.index)? {
            fresh.push(chunk);
        }
    }
    Ok(fresh)
}

fn source_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
