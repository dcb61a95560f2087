use pdfchat_auth::AdminCredentials;
use pdfchat_core::PlanLimits;
use pdfchat_llm::{ChatProviderConfig, EmbedProviderConfig};
use pdfchat_rag::{splitter, DEFAULT_EMBED_BATCH_SIZE, DEFAULT_TOP_K};
use pdfchat_store::FetchPolicy;
use serde::Deserialize;
use tracing::info;

pub const CONFIG_ENV: &str = "PDFCHAT_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "configs/default.yaml";

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub server: ServerCfg,
    pub chat_provider: ChatCfgYaml,
    pub embedding_provider: EmbedCfgYaml,
    pub vector_store: VectorStoreCfg,
    #[serde(default)]
    pub metadata_store: MetadataStoreCfg,
    #[serde(default)]
    pub object_store: ObjectStoreCfg,
    pub auth: AuthCfg,
    #[serde(default)]
    pub rag: RagCfg,
    #[serde(default)]
    pub plans: PlanLimits,
    #[serde(default)]
    pub admin: AdminCfg,
}

#[derive(Debug, Deserialize)]
pub struct ServerCfg {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
pub struct ChatCfgYaml {
    pub kind: String,
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
    pub api_url: Option<String>,
    pub model: String,
}

#[derive(Debug, Deserialize)]
pub struct EmbedCfgYaml {
    pub kind: String,
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
    pub model: String,
    pub api_url: Option<String>,
    /// Vector size; probed from the model when absent.
    pub dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct VectorStoreCfg {
    pub kind: String,
    pub url: Option<String>,
    pub collection: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MetadataStoreCfg {
    pub kind: String,
    pub url_env: Option<String>,
}

impl Default for MetadataStoreCfg {
    fn default() -> Self {
        Self {
            kind: "memory".into(),
            url_env: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ObjectStoreCfg {
    pub kind: String,
    pub root: Option<String>,
    pub public_base_url: String,
    #[serde(default)]
    pub fetch: FetchPolicy,
}

impl Default for ObjectStoreCfg {
    fn default() -> Self {
        Self {
            kind: "memory".into(),
            root: None,
            public_base_url: "http://localhost:8080".into(),
            fetch: FetchPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AuthCfg {
    pub secret_env: String,
    pub issuer: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct RagCfg {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k: usize,
    pub embed_batch_size: usize,
    pub max_upload_bytes: u64,
}

impl Default for RagCfg {
    fn default() -> Self {
        Self {
            chunk_size: splitter::DEFAULT_CHUNK_SIZE,
            chunk_overlap: splitter::DEFAULT_CHUNK_OVERLAP,
            top_k: DEFAULT_TOP_K,
            embed_batch_size: DEFAULT_EMBED_BATCH_SIZE,
            max_upload_bytes: 20 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct AdminCfg {
    pub user_env: Option<String>,
    pub pass_env: Option<String>,
    pub bearer_env: Option<String>,
}

impl AdminCfg {
    /// Unset variables leave the matching scheme disabled.
    pub fn credentials(&self) -> AdminCredentials {
        let env = |name: &Option<String>| {
            name.as_deref()
                .and_then(|n| std::env::var(n).ok())
                .unwrap_or_default()
        };
        let bearer = env(&self.bearer_env);
        AdminCredentials {
            user: env(&self.user_env),
            pass: env(&self.pass_env),
            bearer: (!bearer.is_empty()).then_some(bearer),
        }
    }
}

pub fn load_config() -> anyhow::Result<AppConfig> {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let s = std::fs::read_to_string(&path)
        .map_err(|e| anyhow::anyhow!("cannot read config {}: {}", path, e))?;
    let cfg: AppConfig = serde_yaml::from_str(&s)?;
    info!(path = %path, "loaded config");
    Ok(cfg)
}

pub fn read_env(key: &str) -> anyhow::Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("missing env {}", key))
}

pub fn chat_provider_config(cfg: &ChatCfgYaml) -> anyhow::Result<ChatProviderConfig> {
    Ok(match cfg.kind.as_str() {
        "openai_compat" => ChatProviderConfig::OpenAiCompat {
            base_url: cfg
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".into()),
            api_key: read_env(cfg.api_key_env.as_deref().unwrap_or("OPENAI_API_KEY"))?,
            model: cfg.model.clone(),
        },
        "anthropic" => ChatProviderConfig::Anthropic {
            api_url: cfg.api_url.clone(),
            api_key: read_env(cfg.api_key_env.as_deref().unwrap_or("ANTHROPIC_API_KEY"))?,
            model: cfg.model.clone(),
        },
        other => anyhow::bail!("unsupported chat provider kind={}", other),
    })
}

pub fn embed_provider_config(cfg: &EmbedCfgYaml) -> anyhow::Result<EmbedProviderConfig> {
    Ok(match cfg.kind.as_str() {
        "openai_compat" => EmbedProviderConfig::OpenAiCompat {
            base_url: cfg
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".into()),
            api_key: read_env(cfg.api_key_env.as_deref().unwrap_or("OPENAI_API_KEY"))?,
            model: cfg.model.clone(),
        },
        "qwen" => EmbedProviderConfig::QwenDashScope {
            api_url: cfg.api_url.clone(),
            api_key: read_env(cfg.api_key_env.as_deref().unwrap_or("DASHSCOPE_API_KEY"))?,
            model: cfg.model.clone(),
        },
        "deepseek" => EmbedProviderConfig::DeepSeek {
            base_url: cfg.base_url.clone(),
            api_key: read_env(cfg.api_key_env.as_deref().unwrap_or("DEEPSEEK_API_KEY"))?,
            model: cfg.model.clone(),
        },
        other => anyhow::bail!("unsupported embedding provider kind={}", other),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
server:
  host: 0.0.0.0
  port: 8080
chat_provider:
  kind: openai_compat
  api_key_env: OPENAI_API_KEY
  model: gpt-4o
embedding_provider:
  kind: openai_compat
  model: text-embedding-3-small
  dimensions: 1536
vector_store:
  kind: memory
auth:
  secret_env: PDFCHAT_JWT_SECRET
rag:
  chunk_size: 500
plans:
  free_documents: 1
  pro_documents: 10
  free_questions: 2
  pro_questions: 50
"#;

    #[test]
    fn test_parse_with_defaults() {
        let cfg: AppConfig = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.rag.chunk_size, 500);
        assert_eq!(cfg.rag.chunk_overlap, 200);
        assert_eq!(cfg.rag.top_k, 4);
        assert_eq!(cfg.plans.free_documents, 1);
        assert_eq!(cfg.metadata_store.kind, "memory");
        assert_eq!(cfg.object_store.kind, "memory");
        assert_eq!(cfg.embedding_provider.dimensions, Some(1536));
        assert_eq!(cfg.object_store.fetch.retries, 2);
    }

    #[test]
    fn test_unknown_provider_kind() {
        let cfg = ChatCfgYaml {
            kind: "nope".into(),
            base_url: None,
            api_key_env: None,
            api_url: None,
            model: "m".into(),
        };
        assert!(chat_provider_config(&cfg).is_err());
    }

    #[test]
    fn test_admin_credentials_from_unset_env() {
        let admin = AdminCfg {
            user_env: Some("PDFCHAT_TEST_UNSET_ADMIN_USER".into()),
            pass_env: None,
            bearer_env: Some("PDFCHAT_TEST_UNSET_ADMIN_BEARER".into()),
        };
        let creds = admin.credentials();
        assert!(creds.user.is_empty());
        assert!(creds.bearer.is_none());
    }
}
