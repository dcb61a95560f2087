use async_trait::async_trait;
use pdfchat_error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Vector namespace of one document. Scoped by owner so two users uploading
/// identical bytes never share or delete each other's vectors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    pub owner_id: String,
    pub document_id: String,
}

impl Namespace {
    pub fn new(owner_id: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            document_id: document_id.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner_id, self.document_id)
    }
}

/// A chunk ready to be written to the index.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub chunk_index: u32,
    pub text: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk_index: u32,
    pub text: String,
    pub score: f32,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn chunk_count(&self, ns: &Namespace) -> Result<usize>;

    async fn namespace_exists(&self, ns: &Namespace) -> Result<bool> {
        Ok(self.chunk_count(ns).await? > 0)
    }

    async fn upsert(&self, ns: &Namespace, records: Vec<ChunkRecord>) -> Result<usize>;

    /// Nearest chunks to `query`, best first.
    async fn search(&self, ns: &Namespace, query: &[f32], top_k: usize)
        -> Result<Vec<ScoredChunk>>;

    /// Removes every vector of the namespace. Deleting an empty namespace succeeds.
    async fn delete_namespace(&self, ns: &Namespace) -> Result<()>;
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let mut dot_product = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;

    let len = a.len().min(b.len());
    for i in 0..len {
        dot_product += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_namespace_display() {
        assert_eq!(Namespace::new("u1", "abc").to_string(), "u1/abc");
    }
}
