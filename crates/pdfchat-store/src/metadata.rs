use async_trait::async_trait;
use pdfchat_core::{ChatMessage, Document, PlanLimits, Role, User};
use pdfchat_error::{PdfChatError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Per-user document and chat records.
///
/// Documents are keyed by `(owner_id, document_id)`; chat messages live under
/// their document and disappear with it.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_user(&self, user_id: &str) -> Result<Option<User>>;

    /// Returns the user, creating an empty record on first sight.
    async fn ensure_user(&self, user_id: &str) -> Result<User>;

    async fn set_membership(&self, user_id: &str, active: bool) -> Result<User>;

    /// Inserts the document unless one with the same id already exists for
    /// this owner. Returns `true` when a record was created, in which case the
    /// owner's document count is incremented. A new document beyond the
    /// owner's plan allowance fails with `QuotaExceeded`; the check and the
    /// insert are atomic.
    async fn put_document(&self, document: &Document, limits: &PlanLimits) -> Result<bool>;

    async fn get_document(&self, owner_id: &str, document_id: &str) -> Result<Option<Document>>;

    /// Documents of a user, oldest first.
    async fn list_documents(&self, owner_id: &str) -> Result<Vec<Document>>;

    /// Removes the document and its chat. `None` when there was no such
    /// document, otherwise the number of chat messages removed with it.
    async fn delete_document(&self, owner_id: &str, document_id: &str) -> Result<Option<usize>>;

    async fn add_message(
        &self,
        owner_id: &str,
        document_id: &str,
        message: &ChatMessage,
    ) -> Result<()>;

    /// Appends a `human` message unless the document already holds the
    /// owner's plan allowance of questions, atomically.
    async fn add_question(
        &self,
        owner_id: &str,
        document_id: &str,
        question: &ChatMessage,
        limits: &PlanLimits,
    ) -> Result<()>;

    /// Most recent messages, newest first.
    async fn recent_messages(
        &self,
        owner_id: &str,
        document_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>>;

    /// Full chat, oldest first.
    async fn list_messages(&self, owner_id: &str, document_id: &str) -> Result<Vec<ChatMessage>>;

    async fn delete_messages(&self, owner_id: &str, document_id: &str) -> Result<usize>;
}

#[derive(Default)]
struct UserRecord {
    user: Option<User>,
    documents: HashMap<String, DocumentRecord>,
}

struct DocumentRecord {
    document: Document,
    messages: Vec<ChatMessage>,
}

/// In-memory metadata store for tests and local runs.
#[derive(Default, Clone)]
pub struct MemoryMetadataStore {
    users: Arc<RwLock<HashMap<String, UserRecord>>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn missing_document(document_id: &str) -> PdfChatError {
    PdfChatError::NotFound {
        resource: format!("document {}", document_id),
    }
}

fn user_of(record: &mut UserRecord, user_id: &str) -> User {
    record
        .user
        .get_or_insert_with(|| User::new(user_id))
        .clone()
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let users = self.users.read().await;
        Ok(users.get(user_id).and_then(|r| r.user.clone()))
    }

    async fn ensure_user(&self, user_id: &str) -> Result<User> {
        let mut users = self.users.write().await;
        let record = users.entry(user_id.to_string()).or_default();
        Ok(user_of(record, user_id))
    }

    async fn set_membership(&self, user_id: &str, active: bool) -> Result<User> {
        let mut users = self.users.write().await;
        let record = users.entry(user_id.to_string()).or_default();
        let user = record.user.get_or_insert_with(|| User::new(user_id));
        user.has_active_membership = active;
        Ok(user.clone())
    }

    async fn put_document(&self, document: &Document, limits: &PlanLimits) -> Result<bool> {
        let mut users = self.users.write().await;
        let record = users.entry(document.owner_id.clone()).or_default();
        let user = record
            .user
            .get_or_insert_with(|| User::new(document.owner_id.clone()));
        if record.documents.contains_key(&document.id) {
            return Ok(false);
        }
        limits.check_documents(user)?;
        record.documents.insert(
            document.id.clone(),
            DocumentRecord {
                document: document.clone(),
                messages: Vec::new(),
            },
        );
        user.document_count += 1;
        Ok(true)
    }

    async fn get_document(&self, owner_id: &str, document_id: &str) -> Result<Option<Document>> {
        let users = self.users.read().await;
        Ok(users
            .get(owner_id)
            .and_then(|r| r.documents.get(document_id))
            .map(|d| d.document.clone()))
    }

    async fn list_documents(&self, owner_id: &str) -> Result<Vec<Document>> {
        let users = self.users.read().await;
        let mut docs: Vec<Document> = users
            .get(owner_id)
            .map(|r| r.documents.values().map(|d| d.document.clone()).collect())
            .unwrap_or_default();
        docs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(docs)
    }

    async fn delete_document(&self, owner_id: &str, document_id: &str) -> Result<Option<usize>> {
        let mut users = self.users.write().await;
        let Some(record) = users.get_mut(owner_id) else {
            return Ok(None);
        };
        let Some(removed) = record.documents.remove(document_id) else {
            return Ok(None);
        };
        if let Some(user) = record.user.as_mut() {
            user.document_count = user.document_count.saturating_sub(1);
        }
        Ok(Some(removed.messages.len()))
    }

    async fn add_message(
        &self,
        owner_id: &str,
        document_id: &str,
        message: &ChatMessage,
    ) -> Result<()> {
        let mut users = self.users.write().await;
        let doc = users
            .get_mut(owner_id)
            .and_then(|r| r.documents.get_mut(document_id))
            .ok_or_else(|| missing_document(document_id))?;
        doc.messages.push(message.clone());
        Ok(())
    }

    async fn add_question(
        &self,
        owner_id: &str,
        document_id: &str,
        question: &ChatMessage,
        limits: &PlanLimits,
    ) -> Result<()> {
        let mut users = self.users.write().await;
        let Some(record) = users.get_mut(owner_id) else {
            return Err(missing_document(document_id));
        };
        let user = record.user.clone().unwrap_or_else(|| User::new(owner_id));
        let Some(doc) = record.documents.get_mut(document_id) else {
            return Err(missing_document(document_id));
        };
        let asked = doc.messages.iter().filter(|m| m.role == Role::Human).count();
        limits.check_questions(&user, asked)?;
        doc.messages.push(question.clone());
        Ok(())
    }

    async fn recent_messages(
        &self,
        owner_id: &str,
        document_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>> {
        let mut messages = self.list_messages(owner_id, document_id).await?;
        messages.reverse();
        messages.truncate(limit);
        Ok(messages)
    }

    async fn list_messages(&self, owner_id: &str, document_id: &str) -> Result<Vec<ChatMessage>> {
        let users = self.users.read().await;
        let mut messages = users
            .get(owner_id)
            .and_then(|r| r.documents.get(document_id))
            .map(|d| d.messages.clone())
            .unwrap_or_default();
        // stable: equal timestamps keep insertion order
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(messages)
    }

    async fn delete_messages(&self, owner_id: &str, document_id: &str) -> Result<usize> {
        let mut users = self.users.write().await;
        Ok(users
            .get_mut(owner_id)
            .and_then(|r| r.documents.get_mut(document_id))
            .map(|d| std::mem::take(&mut d.messages).len())
            .unwrap_or(0))
    }
}
