//! Document loading.
//!
//! A file is mapped to a [`LoaderKind`] once, by extension, and the kind's
//! parser turns the raw bytes into [`Document`]s. Loaded documents pile up in
//! a [`DocumentLoader`] until the chat resets it.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::docqa::{pdf, word};

/// Default cap on documents held by one loader.
pub const DEFAULT_MAX_DOCUMENTS: usize = 500;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read '{}': {source}", path.display())]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to parse '{}': {message}", path.display())]
    Parse { path: PathBuf, message: String },
}

/// Parser variant for a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderKind {
    Pdf,
    Word,
    PlainText,
    Unsupported,
}

impl LoaderKind {
    /// Pick the parser for a path by its extension (case-insensitive).
    pub fn for_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("pdf") => Self::Pdf,
            Some("docx") | Some("doc") => Self::Word,
            Some("txt") => Self::PlainText,
            _ => Self::Unsupported,
        }
    }

    pub fn is_supported(self) -> bool {
        self != Self::Unsupported
    }

    /// Parse raw file bytes into documents.
    ///
    /// `Unsupported` always yields an empty list. Text that is empty after
    /// trimming produces no document.
    pub fn parse(self, bytes: &[u8], source: &Path) -> Result<Vec<Document>, LoadError> {
        let parse_err = |message: String| LoadError::Parse {
            path: source.to_path_buf(),
            message,
        };

        match self {
            Self::Pdf => {
                let pages = pdf::extract_pages(bytes).map_err(parse_err)?;
                Ok(pages
                    .into_iter()
                    .filter(|(_, text)| !text.trim().is_empty())
                    .map(|(page, text)| Document {
                        text,
                        source: source.to_path_buf(),
                        kind: self,
                        page: Some(page),
                    })
                    .collect())
            }
            Self::Word => {
                let text = word::extract_text(bytes).map_err(parse_err)?;
                Ok(single(text, source, self))
            }
            Self::PlainText => {
                let text = String::from_utf8_lossy(bytes).into_owned();
                Ok(single(text, source, self))
            }
            Self::Unsupported => Ok(Vec::new()),
        }
    }
}

fn single(text: String, source: &Path, kind: LoaderKind) -> Vec<Document> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    vec![Document {
        text,
        source: source.to_path_buf(),
        kind,
        page: None,
    }]
}

/// A unit of loaded text plus where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub text: String,
    pub source: PathBuf,
    pub kind: LoaderKind,
    /// 1-based page number, for paged formats.
    pub page: Option<u32>,
}

impl Document {
    /// SHA-256 of the text, hex encoded. Tells apart documents that were
    /// uploaded under the same file name.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.text.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Accumulates documents across loads until cleared.
#[derive(Debug)]
pub struct DocumentLoader {
    documents: VecDeque<Document>,
    capacity: usize,
}

impl DocumentLoader {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_DOCUMENTS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            documents: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Load a file and append its documents. Returns how many were added.
    ///
    /// Files with an unrecognized extension are skipped without error and
    /// without being read.
    pub fn load(&mut self, path: &Path) -> Result<usize, LoadError> {
        let kind = LoaderKind::for_path(path);
        if !kind.is_supported() {
            debug!("Skipping unsupported file {:?}", path);
            return Ok(0);
        }

        let bytes = std::fs::read(path).map_err(|e| LoadError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let docs = kind.parse(&bytes, path)?;
        let added = docs.len();
        self.extend(docs);

        info!("Loaded {} document(s) from {:?} ({:?})", added, path, kind);
        Ok(added)
    }

    /// Append documents, dropping the oldest ones past capacity.
    pub fn extend(&mut self, docs: impl IntoIterator<Item = Document>) {
        for doc in docs {
            if self.documents.len() == self.capacity {
                self.documents.pop_front();
            }
            self.documents.push_back(doc);
        }
    }

    pub fn documents(&self) -> Vec<Document> {
        self.documents.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn clear(&mut self) {
        self.documents.clear();
    }
}

impl Default for DocumentLoader {
    fn default() -> Self {
        Self::new()
    }
}
