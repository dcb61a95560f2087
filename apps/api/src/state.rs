use crate::config::{self, AppConfig};
use pdfchat_auth::{AdminCredentials, JwtService};
use pdfchat_core::PlanLimits;
use pdfchat_llm::{make_providers, ChatModel, EmbedModel};
use pdfchat_rag::{
    ConversationalRetrievalChain, EmbeddingIndexer, MemoryVectorIndex, QdrantVectorIndex,
    RecursiveCharacterSplitter, VectorIndex,
};
use pdfchat_store::{
    FsObjectStore, MemoryMetadataStore, MemoryObjectStore, MetadataStore, ObjectStore,
    PgMetadataStore,
};
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub metadata: Arc<dyn MetadataStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub indexer: Arc<EmbeddingIndexer>,
    pub chain: Arc<ConversationalRetrievalChain>,
    pub plans: PlanLimits,
    pub max_upload_bytes: u64,
    pub jwt: Arc<JwtService>,
    pub admin: AdminCredentials,
}

/// Backends and models the service runs on.
pub struct Components {
    pub metadata: Arc<dyn MetadataStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub index: Arc<dyn VectorIndex>,
    pub chat: Arc<dyn ChatModel>,
    pub embed: Arc<dyn EmbedModel>,
}

#[derive(Debug, Clone, Copy)]
pub struct Settings {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k: usize,
    pub embed_batch_size: usize,
    pub max_upload_bytes: u64,
    pub plans: PlanLimits,
}

impl AppState {
    pub fn new(
        components: Components,
        settings: Settings,
        jwt: Arc<JwtService>,
        admin: AdminCredentials,
    ) -> Self {
        let indexer = EmbeddingIndexer::new(
            components.index.clone(),
            components.embed.clone(),
            RecursiveCharacterSplitter::new(settings.chunk_size, settings.chunk_overlap),
            settings.embed_batch_size,
        );
        let chain = ConversationalRetrievalChain::new(
            components.chat,
            components.embed,
            components.index,
            settings.top_k,
        );
        Self {
            metadata: components.metadata,
            objects: components.objects,
            indexer: Arc::new(indexer),
            chain: Arc::new(chain),
            plans: settings.plans,
            max_upload_bytes: settings.max_upload_bytes,
            jwt,
            admin,
        }
    }

    pub async fn from_config(cfg: &AppConfig) -> anyhow::Result<Self> {
        let chat_cfg = config::chat_provider_config(&cfg.chat_provider)?;
        let embed_cfg = config::embed_provider_config(&cfg.embedding_provider)?;
        let providers =
            make_providers(chat_cfg, embed_cfg).map_err(|e| anyhow::anyhow!(e.to_string()))?;
        let chat: Arc<dyn ChatModel> = Arc::from(providers.chat);
        let embed: Arc<dyn EmbedModel> = Arc::from(providers.embed);

        let index: Arc<dyn VectorIndex> = match cfg.vector_store.kind.as_str() {
            "qdrant" => {
                let url = cfg
                    .vector_store
                    .url
                    .clone()
                    .unwrap_or_else(|| "http://localhost:6334".into());
                let collection = cfg
                    .vector_store
                    .collection
                    .clone()
                    .unwrap_or_else(|| "pdfchat_chunks".into());
                let dimensions = match cfg.embedding_provider.dimensions {
                    Some(d) => d,
                    None => embed
                        .embed(&["dimension probe".to_string()])
                        .await?
                        .first()
                        .map(|v| v.len())
                        .unwrap_or(1536),
                };
                info!(%url, %collection, dimensions, "using qdrant vector index");
                Arc::new(QdrantVectorIndex::connect(&url, &collection, dimensions).await?)
            }
            "memory" => {
                info!("using in-memory vector index");
                Arc::new(MemoryVectorIndex::new())
            }
            other => anyhow::bail!("unsupported vector store kind={}", other),
        };

        let metadata: Arc<dyn MetadataStore> = match cfg.metadata_store.kind.as_str() {
            "postgres" => {
                let url = config::read_env(
                    cfg.metadata_store
                        .url_env
                        .as_deref()
                        .unwrap_or("DATABASE_URL"),
                )?;
                Arc::new(PgMetadataStore::connect(&url).await?)
            }
            "memory" => Arc::new(MemoryMetadataStore::new()),
            other => anyhow::bail!("unsupported metadata store kind={}", other),
        };

        let store = &cfg.object_store;
        let objects: Arc<dyn ObjectStore> = match store.kind.as_str() {
            "fs" => {
                let root = store.root.clone().unwrap_or_else(|| "data/objects".into());
                info!(%root, "using filesystem object store");
                Arc::new(
                    FsObjectStore::new(root, store.public_base_url.clone())
                        .with_fetch_policy(store.fetch),
                )
            }
            "memory" => Arc::new(MemoryObjectStore::new(store.public_base_url.clone())),
            other => anyhow::bail!("unsupported object store kind={}", other),
        };

        let secret = config::read_env(&cfg.auth.secret_env)?;
        let jwt = Arc::new(JwtService::new(&secret, cfg.auth.issuer.clone()));

        let settings = Settings {
            chunk_size: cfg.rag.chunk_size,
            chunk_overlap: cfg.rag.chunk_overlap,
            top_k: cfg.rag.top_k,
            embed_batch_size: cfg.rag.embed_batch_size,
            max_upload_bytes: cfg.rag.max_upload_bytes,
            plans: cfg.plans,
        };

        Ok(Self::new(
            Components {
                metadata,
                objects,
                index,
                chat,
                embed,
            },
            settings,
            jwt,
            cfg.admin.credentials(),
        ))
    }
}
