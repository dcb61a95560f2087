//! Document ingestion and retrieval: PDF text extraction, chunking,
//! namespaced vector indexes and the conversational retrieval chain.

pub mod chain;
pub mod index;
pub mod indexer;
pub mod memory;
pub mod pdf;
pub mod qdrant;
pub mod splitter;

pub use chain::{ChainOutput, ConversationalRetrievalChain, DEFAULT_TOP_K};
pub use index::{cosine_similarity, ChunkRecord, Namespace, ScoredChunk, VectorIndex};
pub use indexer::{EmbeddingIndexer, DEFAULT_EMBED_BATCH_SIZE};
pub use memory::MemoryVectorIndex;
pub use pdf::{extract_text, looks_like_pdf};
pub use qdrant::QdrantVectorIndex;
pub use splitter::RecursiveCharacterSplitter;
