//! Fixed-size overlapping text chunks.
//!
//! Sizes are counted in characters so multi-byte text never splits inside a
//! code point.

use std::path::PathBuf;

use thiserror::Error;

use crate::docqa::document::Document;

pub const DEFAULT_CHUNK_SIZE: usize = 1024;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("chunk size must be positive")]
    ZeroSize,
    #[error("chunk overlap ({overlap}) must be smaller than chunk size ({size})")]
    OverlapTooLarge { size: usize, overlap: usize },
}

/// A bounded slice of one document's text.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub source: PathBuf,
    pub page: Option<u32>,
    /// [`Document::digest`] of the source document.
    pub digest: String,
    /// Position of this chunk within its document.
    pub index: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    size: usize,
    overlap: usize,
}

impl Chunker {
    pub fn new(size: usize, overlap: usize) -> Result<Self, ChunkError> {
        if size == 0 {
            return Err(ChunkError::ZeroSize);
        }
        if overlap >= size {
            return Err(ChunkError::OverlapTooLarge { size, overlap });
        }
        Ok(Self { size, overlap })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Split every document into chunks, in document order.
    pub fn split(&self, documents: &[Document]) -> Vec<Chunk> {
        documents
            .iter()
            .flat_map(|doc| {
                let digest = doc.digest();
                self.split_text(&doc.text)
                    .into_iter()
                    .enumerate()
                    .map(move |(index, text)| Chunk {
                        text,
                        source: doc.source.clone(),
                        page: doc.page,
                        digest: digest.clone(),
                        index,
                    })
            })
            .collect()
    }

    /// Window the text by `size` characters, stepping by `size - overlap`.
    ///
    /// Stops as soon as a window reaches the end, so the tail is never
    /// emitted twice.
    pub fn split_text(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        // Byte offset of every char, plus the end of the string.
        let bounds: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();
        let char_len = bounds.len() - 1;
        let step = self.size - self.overlap;

        let mut chunks = Vec::new();
        let mut start = 0;
        loop {
            let end = (start + self.size).min(char_len);
            chunks.push(text[bounds[start]..bounds[end]].to_string());
            if end == char_len {
                break;
            }
            start += step;
        }
        chunks
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self {
            size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docqa::document::LoaderKind;

    fn doc(text: &str) -> Document {
        Document {
            text: text.to_string(),
            source: PathBuf::from("doc.txt"),
            kind: LoaderKind::PlainText,
            page: None,
        }
    }

    /// Text where every position is distinguishable.
    fn numbered(len: usize) -> String {
        (0..len).map(|i| char::from(b'a' + (i % 26) as u8)).collect()
    }

    fn last_chars(s: &str, n: usize) -> String {
        let count = s.chars().count();
        s.chars().skip(count - n).collect()
    }

    fn first_chars(s: &str, n: usize) -> String {
        s.chars().take(n).collect()
    }

    #[test]
    fn test_rejects_bad_params() {
        assert_eq!(Chunker::new(0, 0).unwrap_err(), ChunkError::ZeroSize);
        assert!(matches!(
            Chunker::new(100, 100),
            Err(ChunkError::OverlapTooLarge { .. })
        ));
    }

    #[test]
    fn test_short_text_is_one_chunk() {
        let chunker = Chunker::default();
        let chunks = chunker.split_text("short text");
        assert_eq!(chunks, vec!["short text"]);

        let exact = numbered(1024);
        assert_eq!(chunker.split_text(&exact).len(), 1);
    }

    #[test]
    fn test_two_chunks_share_overlap() {
        // 1024 + (1024 - 200) characters fill exactly two windows.
        let text = numbered(1848);
        let chunks = Chunker::default().split_text(&text);

        assert_eq!(chunks.len(), 2);
        assert_eq!(last_chars(&chunks[0], 200), first_chars(&chunks[1], 200));
    }

    #[test]
    fn test_2000_chars_respects_size_limit() {
        let text = numbered(2000);
        let chunks = Chunker::default().split_text(&text);

        assert_eq!(chunks.len(), 3);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 1024);
        }
        for pair in chunks.windows(2) {
            assert_eq!(last_chars(&pair[0], 200), first_chars(&pair[1], 200));
        }
        // The last window ends at the end of the text.
        assert!(text.ends_with(chunks[2].as_str()));
    }

    #[test]
    fn test_overlap_in_characters_not_bytes() {
        let text: String = "ж".repeat(30);
        let chunker = Chunker::new(10, 4).unwrap();
        let chunks = chunker.split_text(&text);

        for chunk in &chunks {
            assert!(chunk.chars().count() <= 10);
        }
        for pair in chunks.windows(2) {
            assert_eq!(last_chars(&pair[0], 4), first_chars(&pair[1], 4));
        }
    }

    #[test]
    fn test_whitespace_only_yields_nothing() {
        assert!(Chunker::default().split_text("   \n\t").is_empty());
    }

    #[test]
    fn test_split_keeps_source_and_order() {
        let chunker = Chunker::new(10, 2).unwrap();
        let mut second = doc(&numbered(15));
        second.source = PathBuf::from("other.txt");

        let chunks = chunker.split(&[doc("tiny"), second]);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].source, PathBuf::from("doc.txt"));
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[1].source, PathBuf::from("other.txt"));
        assert_eq!(chunks[1].index, 0);
        assert_eq!(chunks[2].index, 1);
        assert_eq!(chunks[1].digest, chunks[2].digest);
        assert_ne!(chunks[0].digest, chunks[1].digest);
    }
}
