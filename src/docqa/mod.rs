//! Document question answering - load, chunk, index, retrieve, answer.

pub mod chunker;
pub mod document;
pub mod index;
pub mod pdf;
pub mod pipeline;
pub mod provider;
pub mod qa;
pub mod session;
pub mod word;

pub use chunker::{Chunk, Chunker};
pub use document::{Document, DocumentLoader, LoaderKind};
pub use index::{IndexScope, VectorIndex};
pub use pipeline::Ingestor;
pub use provider::{ChatModel, Embedder, Message, ProviderError, Role};
pub use qa::{QaError, QaSession};
pub use session::{ChatSession, IngestOutcome, SessionLimits, SessionRegistry};
