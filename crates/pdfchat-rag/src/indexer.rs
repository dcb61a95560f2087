use crate::index::{ChunkRecord, Namespace, VectorIndex};
use crate::pdf::extract_text;
use crate::splitter::RecursiveCharacterSplitter;
use pdfchat_core::EmbeddingStatus;
use pdfchat_error::{PdfChatError, Result};
use pdfchat_llm::EmbedModel;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::Mutex;
use tracing::{info, instrument};

pub const DEFAULT_EMBED_BATCH_SIZE: usize = 64;

/// Turns documents into namespaced embeddings, at most once per namespace.
pub struct EmbeddingIndexer {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbedModel>,
    splitter: RecursiveCharacterSplitter,
    batch_size: usize,
    locks: LockMap,
}

type LockMap = StdMutex<HashMap<Namespace, Arc<Mutex<()>>>>;

/// Handle on a namespace's lock. Dropping it, including when the owning
/// future is cancelled, removes the map entry once nobody else holds it.
struct NamespaceLock<'a> {
    locks: &'a LockMap,
    ns: Namespace,
    lock: Arc<Mutex<()>>,
}

impl<'a> NamespaceLock<'a> {
    fn acquire(locks: &'a LockMap, ns: &Namespace) -> Self {
        let lock = locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(ns.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        Self {
            locks,
            ns: ns.clone(),
            lock,
        }
    }
}

impl Drop for NamespaceLock<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // map entry + ours: nobody else is waiting
        if Arc::strong_count(&self.lock) <= 2 {
            locks.remove(&self.ns);
        }
    }
}

impl EmbeddingIndexer {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbedModel>,
        splitter: RecursiveCharacterSplitter,
        batch_size: usize,
    ) -> Self {
        Self {
            index,
            embedder,
            splitter,
            batch_size: batch_size.max(1),
            locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Makes sure the namespace holds embeddings. When it already does they are
    /// reused and `load` is never called; otherwise the PDF bytes returned by
    /// `load` are extracted, split, embedded and stored. Concurrent calls for the
    /// same namespace are serialized so a document is embedded once.
    #[instrument(skip(self, load), fields(namespace = %ns))]
    pub async fn ensure_embeddings<F, Fut>(&self, ns: &Namespace, load: F) -> Result<EmbeddingStatus>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>>>,
    {
        let entry = NamespaceLock::acquire(&self.locks, ns);
        let _guard = entry.lock.lock().await;
        self.ensure_locked(ns, load).await
    }

    async fn ensure_locked<F, Fut>(&self, ns: &Namespace, load: F) -> Result<EmbeddingStatus>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>>>,
    {
        if self.index.namespace_exists(ns).await? {
            info!("embeddings already exist, reusing");
            return Ok(EmbeddingStatus::Reused);
        }
        let bytes = load().await?;
        let text = extract_text(bytes).await?;
        let chunks = self.index_text(ns, &text).await?;
        Ok(EmbeddingStatus::Created { chunks })
    }

    /// Splits and embeds `text` into the namespace. Returns the chunk count.
    pub async fn index_text(&self, ns: &Namespace, text: &str) -> Result<usize> {
        let chunks = self.splitter.split_text(text);
        if chunks.is_empty() {
            return Err(PdfChatError::InvalidRequest {
                reason: "document has no extractable text".to_string(),
            });
        }

        let mut written = 0usize;
        for (batch_no, batch) in chunks.chunks(self.batch_size).enumerate() {
            let embeddings = self.embedder.embed(batch).await?;
            if embeddings.len() != batch.len() {
                return Err(PdfChatError::EmbeddingService {
                    provider: "embedder".to_string(),
                    message: format!(
                        "expected {} embeddings, got {}",
                        batch.len(),
                        embeddings.len()
                    ),
                    retry_after: None,
                });
            }
            let offset = batch_no * self.batch_size;
            let records = batch
                .iter()
                .zip(embeddings)
                .enumerate()
                .map(|(i, (text, embedding))| ChunkRecord {
                    chunk_index: (offset + i) as u32,
                    text: text.clone(),
                    embedding,
                })
                .collect();
            written += self.index.upsert(ns, records).await?;
        }

        info!(namespace = %ns, chunks = written, "stored document embeddings");
        Ok(written)
    }

    pub async fn remove(&self, ns: &Namespace) -> Result<()> {
        self.index.delete_namespace(ns).await
    }
}
