use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::instrument;

pub use pdfchat_error::{PdfChatError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

impl PromptRole {
    fn as_str(&self) -> &'static str {
        match self {
            PromptRole::System => "system",
            PromptRole::User => "user",
            PromptRole::Assistant => "assistant",
        }
    }
}

/// One role-tagged message of a chat completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::Assistant,
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(&self, messages: &[PromptMessage]) -> Result<String>;
}

#[async_trait]
pub trait EmbedModel: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

fn network_error(e: reqwest::Error) -> PdfChatError {
    PdfChatError::Network {
        operation: "http_request".to_string(),
        message: e.to_string(),
    }
}

fn retry_after_for(status: reqwest::StatusCode) -> Option<std::time::Duration> {
    if status.as_u16() == 429 || status.is_server_error() {
        Some(std::time::Duration::from_secs(30))
    } else {
        None
    }
}

// ========== OpenAI-compatible (covers OpenAI, DeepSeek, some Qwen proxies) ==========

#[derive(Clone)]
pub struct OpenAiCompatConfig {
    pub base_url: String,                // e.g. https://api.openai.com
    pub api_key: String,                 // Bearer token
    pub chat_model: String,              // e.g. gpt-3.5-turbo
    pub embedding_model: Option<String>, // e.g. text-embedding-3-small
}

#[derive(Clone)]
pub struct OpenAiCompatClient {
    http: Client,
    cfg: OpenAiCompatConfig,
}

impl OpenAiCompatClient {
    pub fn new(cfg: OpenAiCompatConfig) -> Self {
        Self {
            http: Client::new(),
            cfg,
        }
    }
}

#[derive(Serialize)]
struct OaiChatReqMsg {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct OaiChatReq {
    model: String,
    messages: Vec<OaiChatReqMsg>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct OaiChatRespChoiceMsg {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OaiChatRespChoice {
    message: OaiChatRespChoiceMsg,
}

#[derive(Deserialize)]
struct OaiChatResp {
    choices: Vec<OaiChatRespChoice>,
}

fn openai_chat_request(model: &str, messages: &[PromptMessage]) -> OaiChatReq {
    OaiChatReq {
        model: model.to_string(),
        messages: messages
            .iter()
            .map(|m| OaiChatReqMsg {
                role: m.role.as_str(),
                content: m.content.clone(),
            })
            .collect(),
        temperature: Some(0.2),
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatClient {
    #[instrument(skip(self, messages), fields(model = %self.cfg.chat_model, messages = messages.len()))]
    async fn chat(&self, messages: &[PromptMessage]) -> Result<String> {
        let url = format!(
            "{}/v1/chat/completions",
            self.cfg.base_url.trim_end_matches('/')
        );
        let body = openai_chat_request(&self.cfg.chat_model, messages);

        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await
            .map_err(network_error)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let txt = resp.text().await.unwrap_or_default();
            return Err(PdfChatError::LlmService {
                provider: "openai_compat".to_string(),
                message: format!("status={} body={}", status, txt),
                retry_after: retry_after_for(status),
            });
        }

        let data: OaiChatResp = resp.json().await.map_err(network_error)?;
        let content = data
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        Ok(content)
    }
}

#[derive(Serialize)]
struct OaiEmbedReq {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct OaiEmbedData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct OaiEmbedResp {
    data: Vec<OaiEmbedData>,
}

fn ordered_embeddings(mut data: Vec<OaiEmbedData>) -> Vec<Vec<f32>> {
    data.sort_by_key(|d| d.index);
    data.into_iter().map(|d| d.embedding).collect()
}

#[async_trait]
impl EmbedModel for OpenAiCompatClient {
    #[instrument(skip(self, texts), fields(inputs = texts.len()))]
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self
            .cfg
            .embedding_model
            .clone()
            .ok_or_else(|| PdfChatError::Configuration {
                key: "embedding_model".to_string(),
                reason: "not configured".to_string(),
            })?;
        let url = format!("{}/v1/embeddings", self.cfg.base_url.trim_end_matches('/'));
        let body = OaiEmbedReq {
            model,
            input: texts.to_vec(),
        };

        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await
            .map_err(network_error)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let txt = resp.text().await.unwrap_or_default();
            return Err(PdfChatError::EmbeddingService {
                provider: "openai_compat".to_string(),
                message: format!("status={} body={}", status, txt),
                retry_after: retry_after_for(status),
            });
        }

        let data: OaiEmbedResp = resp.json().await.map_err(network_error)?;
        Ok(ordered_embeddings(data.data))
    }
}

// ========== Anthropic (Claude) ==========

#[derive(Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub model: String,   // e.g. claude-3-5-sonnet-latest
    pub api_url: String, // default https://api.anthropic.com
}

#[derive(Clone)]
pub struct AnthropicClient {
    http: Client,
    cfg: AnthropicConfig,
}

impl AnthropicClient {
    pub fn new(cfg: AnthropicConfig) -> Self {
        Self {
            http: Client::new(),
            cfg,
        }
    }
}

#[derive(Serialize, Debug, PartialEq)]
struct AnthMessageContent {
    r#type: &'static str,
    text: String,
}

#[derive(Serialize, Debug, PartialEq)]
struct AnthMessageReqMsg {
    role: &'static str,
    content: Vec<AnthMessageContent>,
}

#[derive(Serialize)]
struct AnthMessageReq {
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthMessageReqMsg>,
    max_tokens: u32,
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct AnthMessageRespContent {
    #[allow(dead_code)]
    r#type: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthMessageResp {
    content: Vec<AnthMessageRespContent>,
}

/// Splits out system prompts and folds consecutive same-role turns, since
/// the Messages API takes `system` separately and expects alternating roles.
fn anthropic_messages(messages: &[PromptMessage]) -> (Option<String>, Vec<AnthMessageReqMsg>) {
    let mut system: Vec<&str> = Vec::new();
    let mut out: Vec<AnthMessageReqMsg> = Vec::new();
    for m in messages {
        let role = match m.role {
            PromptRole::System => {
                system.push(&m.content);
                continue;
            }
            PromptRole::User => "user",
            PromptRole::Assistant => "assistant",
        };
        match out.last_mut() {
            Some(last) if last.role == role => {
                if let Some(block) = last.content.first_mut() {
                    block.text.push_str("\n\n");
                    block.text.push_str(&m.content);
                }
            }
            _ => out.push(AnthMessageReqMsg {
                role,
                content: vec![AnthMessageContent {
                    r#type: "text",
                    text: m.content.clone(),
                }],
            }),
        }
    }
    // the first turn has to come from the user
    let leading = out.iter().take_while(|m| m.role == "assistant").count();
    out.drain(..leading);
    let system = if system.is_empty() {
        None
    } else {
        Some(system.join("\n\n"))
    };
    (system, out)
}

#[async_trait]
impl ChatModel for AnthropicClient {
    #[instrument(skip(self, messages), fields(model = %self.cfg.model, messages = messages.len()))]
    async fn chat(&self, messages: &[PromptMessage]) -> Result<String> {
        let url = format!("{}/v1/messages", self.cfg.api_url.trim_end_matches('/'));
        let (system, messages) = anthropic_messages(messages);
        let body = AnthMessageReq {
            model: self.cfg.model.clone(),
            system,
            messages,
            max_tokens: 2048,
            temperature: Some(0.2),
        };

        let resp = self
            .http
            .post(url)
            .header("x-api-key", &self.cfg.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(network_error)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let txt = resp.text().await.unwrap_or_default();
            return Err(PdfChatError::LlmService {
                provider: "anthropic".to_string(),
                message: format!("status={} body={}", status, txt),
                retry_after: retry_after_for(status),
            });
        }

        let data: AnthMessageResp = resp.json().await.map_err(network_error)?;
        let mut out = String::new();
        for c in data.content.into_iter() {
            if let Some(t) = c.text {
                out.push_str(&t);
            }
        }
        Ok(out)
    }
}

// ========== Qwen (DashScope) Embeddings ==========

#[derive(Clone)]
pub struct QwenDashScopeConfig {
    pub api_key: String,
    pub model: String,   // e.g. text-embedding-v2 / v3
    pub api_url: String, // default https://dashscope.aliyuncs.com/compatible-mode/v1/embeddings
}

#[derive(Clone)]
pub struct QwenDashScopeClient {
    http: Client,
    cfg: QwenDashScopeConfig,
}

impl QwenDashScopeClient {
    pub fn new(cfg: QwenDashScopeConfig) -> Self {
        Self {
            http: Client::new(),
            cfg,
        }
    }
}

#[async_trait]
impl EmbedModel for QwenDashScopeClient {
    #[instrument(skip(self, texts), fields(inputs = texts.len()))]
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = OaiEmbedReq {
            model: self.cfg.model.clone(),
            input: texts.to_vec(),
        };
        let resp = self
            .http
            .post(&self.cfg.api_url)
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await
            .map_err(network_error)?;
        if !resp.status().is_success() {
            let status = resp.status();
            let txt = resp.text().await.unwrap_or_default();
            return Err(PdfChatError::EmbeddingService {
                provider: "qwen".to_string(),
                message: format!("status={} body={}", status, txt),
                retry_after: retry_after_for(status),
            });
        }
        let data: OaiEmbedResp = resp.json().await.map_err(network_error)?;
        Ok(ordered_embeddings(data.data))
    }
}

// ========== DeepSeek (OpenAI-compatible) Embeddings ==========

#[derive(Clone)]
pub struct DeepSeekConfig {
    pub api_key: String,
    pub base_url: String, // https://api.deepseek.com
    pub model: String,
}

#[derive(Clone)]
pub struct DeepSeekClient(OpenAiCompatClient);

impl DeepSeekClient {
    pub fn new(cfg: DeepSeekConfig) -> Self {
        Self(OpenAiCompatClient::new(OpenAiCompatConfig {
            base_url: cfg.base_url,
            api_key: cfg.api_key,
            chat_model: "".into(),
            embedding_model: Some(cfg.model),
        }))
    }
}

#[async_trait]
impl EmbedModel for DeepSeekClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.0.embed(texts).await
    }
}

// ========== Provider Factory & Config ==========

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ChatProviderConfig {
    #[serde(rename = "openai_compat")]
    OpenAiCompat {
        base_url: String,
        api_key: String,
        model: String,
    },
    #[serde(rename = "anthropic")]
    Anthropic {
        api_url: Option<String>,
        api_key: String,
        model: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EmbedProviderConfig {
    #[serde(rename = "openai_compat")]
    OpenAiCompat {
        base_url: String,
        api_key: String,
        model: String,
    },
    #[serde(rename = "qwen")]
    QwenDashScope {
        api_url: Option<String>,
        api_key: String,
        model: String,
    },
    #[serde(rename = "deepseek")]
    DeepSeek {
        base_url: Option<String>,
        api_key: String,
        model: String,
    },
}

pub struct Providers {
    pub chat: Box<dyn ChatModel>,
    pub embed: Box<dyn EmbedModel>,
}

pub fn make_providers(chat: ChatProviderConfig, embed: EmbedProviderConfig) -> Result<Providers> {
    let chat_box: Box<dyn ChatModel> = match chat {
        ChatProviderConfig::OpenAiCompat {
            base_url,
            api_key,
            model,
        } => Box::new(OpenAiCompatClient::new(OpenAiCompatConfig {
            base_url,
            api_key,
            chat_model: model,
            embedding_model: None,
        })),
        ChatProviderConfig::Anthropic {
            api_url,
            api_key,
            model,
        } => Box::new(AnthropicClient::new(AnthropicConfig {
            api_url: api_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            api_key,
            model,
        })),
    };

    let embed_box: Box<dyn EmbedModel> = match embed {
        EmbedProviderConfig::OpenAiCompat {
            base_url,
            api_key,
            model,
        } => Box::new(OpenAiCompatClient::new(OpenAiCompatConfig {
            base_url,
            api_key,
            chat_model: "".into(),
            embedding_model: Some(model),
        })),
        EmbedProviderConfig::QwenDashScope {
            api_url,
            api_key,
            model,
        } => Box::new(QwenDashScopeClient::new(QwenDashScopeConfig {
            api_key,
            model,
            api_url: api_url.unwrap_or_else(|| {
                "https://dashscope.aliyuncs.com/compatible-mode/v1/embeddings".into()
            }),
        })),
        EmbedProviderConfig::DeepSeek {
            base_url,
            api_key,
            model,
        } => Box::new(DeepSeekClient::new(DeepSeekConfig {
            api_key,
            model,
            base_url: base_url.unwrap_or_else(|| "https://api.deepseek.com".into()),
        })),
    };

    Ok(Providers {
        chat: chat_box,
        embed: embed_box,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_request_keeps_roles_in_order() {
        let msgs = vec![
            PromptMessage::system("be brief"),
            PromptMessage::user("hi"),
            PromptMessage::assistant("hello"),
            PromptMessage::user("what is in the pdf?"),
        ];
        let req = openai_chat_request("gpt-3.5-turbo", &msgs);
        let json = serde_json::to_value(&req).unwrap();
        let roles: Vec<&str> = json["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(json["model"], "gpt-3.5-turbo");
    }

    #[test]
    fn test_anthropic_messages_fold_system_and_repeats() {
        let msgs = vec![
            PromptMessage::system("context here"),
            PromptMessage::user("question"),
            PromptMessage::user("rewrite it"),
            PromptMessage::assistant("ok"),
        ];
        let (system, out) = anthropic_messages(&msgs);
        assert_eq!(system.as_deref(), Some("context here"));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].role, "user");
        assert_eq!(out[0].content[0].text, "question\n\nrewrite it");
        assert_eq!(out[1].role, "assistant");
    }

    #[test]
    fn test_anthropic_messages_start_with_user_turn() {
        // window cut right after an unanswered question
        let msgs = vec![
            PromptMessage::system("context here"),
            PromptMessage::assistant("a1"),
            PromptMessage::user("h2"),
            PromptMessage::user("h3"),
            PromptMessage::assistant("a3"),
            PromptMessage::user("q"),
        ];
        let (system, out) = anthropic_messages(&msgs);
        assert_eq!(system.as_deref(), Some("context here"));
        let roles: Vec<&str> = out.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec!["user", "assistant", "user"]);
        assert_eq!(out[0].content[0].text, "h2\n\nh3");

        let (_, out) = anthropic_messages(&[PromptMessage::assistant("only")]);
        assert!(out.is_empty());
    }

    #[test]
    fn test_embeddings_follow_response_index() {
        let data = vec![
            OaiEmbedData {
                index: 1,
                embedding: vec![1.0],
            },
            OaiEmbedData {
                index: 0,
                embedding: vec![0.0],
            },
        ];
        assert_eq!(ordered_embeddings(data), vec![vec![0.0], vec![1.0]]);
    }

    #[test]
    fn test_provider_config_is_tagged_by_kind() {
        let cfg: EmbedProviderConfig = serde_json::from_value(serde_json::json!({
            "kind": "deepseek",
            "base_url": null,
            "api_key": "k",
            "model": "deepseek-embedding"
        }))
        .unwrap();
        assert!(matches!(cfg, EmbedProviderConfig::DeepSeek { .. }));
    }
}
