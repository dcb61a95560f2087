use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub use pdfchat_error::{PdfChatError, Result};

/// Number of most recent messages used as conversational context.
pub const CHAT_HISTORY_WINDOW: usize = 6;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    /// Subject ID issued by the identity provider.
    pub id: String,
    pub has_active_membership: bool,
    pub document_count: u32,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            has_active_membership: false,
            document_count: 0,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    /// Content hash of the uploaded bytes, see [`document_id`].
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub storage_path: String,
    pub download_url: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Human,
    Ai,
    Placeholder,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Human => "human",
            Role::Ai => "ai",
            Role::Placeholder => "placeholder",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = PdfChatError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "human" => Ok(Role::Human),
            "ai" => Ok(Role::Ai),
            "placeholder" => Ok(Role::Placeholder),
            other => Err(PdfChatError::Serialization {
                format: "role".to_string(),
                message: format!("unknown chat role: {}", other),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub id: Uuid,
    pub role: Role,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: Role, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            message: message.into(),
            created_at: Utc::now(),
        }
    }

    pub fn human(message: impl Into<String>) -> Self {
        Self::new(Role::Human, message)
    }

    pub fn ai(message: impl Into<String>) -> Self {
        Self::new(Role::Ai, message)
    }
}

/// Derives the document identifier from the raw bytes: lowercase hex SHA-256.
///
/// Identical bytes always map to the same identifier, so re-uploading a file
/// addresses the existing record, object and vector namespace.
pub fn document_id(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Object storage path of a user's document.
pub fn storage_path(user_id: &str, document_id: &str) -> String {
    format!("users/{}/files/{}", user_id, document_id)
}

/// Rejects identifiers that could escape their storage prefix.
pub fn validate_path_segment(kind: &str, value: &str) -> Result<()> {
    let ok = !value.is_empty()
        && value.len() <= 128
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(PdfChatError::InvalidRequest {
            reason: format!("invalid {}: {:?}", kind, value),
        })
    }
}

/// Per-plan usage limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanLimits {
    pub free_documents: u32,
    pub pro_documents: u32,
    pub free_questions: u32,
    pub pro_questions: u32,
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self {
            free_documents: 2,
            pro_documents: 20,
            free_questions: 3,
            pro_questions: 100,
        }
    }
}

impl PlanLimits {
    pub fn document_limit(&self, is_member: bool) -> u32 {
        if is_member {
            self.pro_documents
        } else {
            self.free_documents
        }
    }

    /// Questions a user may ask per document.
    pub fn question_limit(&self, is_member: bool) -> u32 {
        if is_member {
            self.pro_questions
        } else {
            self.free_questions
        }
    }

    /// Rejects a new document once the user holds their plan's allowance.
    pub fn check_documents(&self, user: &User) -> Result<()> {
        let limit = self.document_limit(user.has_active_membership);
        if user.document_count >= limit {
            return Err(PdfChatError::QuotaExceeded {
                resource: "documents".to_string(),
                limit: limit.to_string(),
            });
        }
        Ok(())
    }

    /// Rejects another question on a document that already has `asked` of them.
    pub fn check_questions(&self, user: &User, asked: usize) -> Result<()> {
        let limit = self.question_limit(user.has_active_membership);
        if asked >= limit as usize {
            return Err(PdfChatError::QuotaExceeded {
                resource: "questions per document".to_string(),
                limit: limit.to_string(),
            });
        }
        Ok(())
    }

    pub fn status(&self, user: &User) -> SubscriptionStatus {
        let document_limit = self.document_limit(user.has_active_membership);
        SubscriptionStatus {
            has_active_membership: user.has_active_membership,
            document_count: user.document_count,
            document_limit,
            question_limit: self.question_limit(user.has_active_membership),
            is_over_file_limit: user.document_count >= document_limit,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionStatus {
    pub has_active_membership: bool,
    pub document_count: u32,
    pub document_limit: u32,
    pub question_limit: u32,
    pub is_over_file_limit: bool,
}

// ========== API payloads ==========

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EmbeddingStatus {
    /// The namespace already held embeddings and was reused.
    Reused,
    Created { chunks: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub document: Document,
    /// False when identical bytes had been uploaded before.
    pub created: bool,
    pub embeddings: EmbeddingStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskRequest {
    pub question: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Source {
    pub chunk_index: u32,
    pub score: f32,
    pub snippet: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskResponse {
    pub answer: ChatMessage,
    /// Query actually sent to the retriever after history-aware rewriting.
    pub search_query: String,
    pub sources: Vec<Source>,
    pub latency_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeleteReport {
    pub document_id: String,
    pub metadata_deleted: bool,
    pub messages_deleted: usize,
    pub namespace_deleted: bool,
    pub object_deleted: bool,
    pub failed_steps: Vec<String>,
}

impl DeleteReport {
    pub fn is_complete(&self) -> bool {
        self.failed_steps.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatDeleteResponse {
    pub deleted: usize,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipUpdate {
    pub has_active_membership: bool,
}
