use crate::index::{cosine_similarity, ChunkRecord, Namespace, ScoredChunk, VectorIndex};
use async_trait::async_trait;
use pdfchat_error::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, instrument};

#[derive(Debug, Clone)]
struct MemoryChunk {
    chunk_index: u32,
    text: String,
    embedding: Vec<f32>,
}

/// Brute-force cosine index held in process memory.
#[derive(Default, Clone)]
pub struct MemoryVectorIndex {
    namespaces: Arc<RwLock<HashMap<Namespace, Vec<MemoryChunk>>>>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn chunk_count(&self, ns: &Namespace) -> Result<usize> {
        let namespaces = self.namespaces.read().await;
        Ok(namespaces.get(ns).map(Vec::len).unwrap_or(0))
    }

    async fn upsert(&self, ns: &Namespace, records: Vec<ChunkRecord>) -> Result<usize> {
        let count = records.len();
        let mut namespaces = self.namespaces.write().await;
        let chunks = namespaces.entry(ns.clone()).or_default();
        for record in records {
            chunks.retain(|c| c.chunk_index != record.chunk_index);
            chunks.push(MemoryChunk {
                chunk_index: record.chunk_index,
                text: record.text,
                embedding: record.embedding,
            });
        }
        Ok(count)
    }

    #[instrument(skip(self, query), fields(namespace = %ns))]
    async fn search(
        &self,
        ns: &Namespace,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let namespaces = self.namespaces.read().await;
        let Some(chunks) = namespaces.get(ns) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<ScoredChunk> = chunks
            .iter()
            .map(|chunk| ScoredChunk {
                chunk_index: chunk.chunk_index,
                text: chunk.text.clone(),
                score: cosine_similarity(query, &chunk.embedding),
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk_index.cmp(&b.chunk_index))
        });
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn delete_namespace(&self, ns: &Namespace) -> Result<()> {
        let removed = self.namespaces.write().await.remove(ns);
        info!(
            namespace = %ns,
            chunks = removed.map(|c| c.len()).unwrap_or(0),
            "removed namespace"
        );
        Ok(())
    }
}
