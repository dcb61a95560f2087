//! Request-level workflows: ingestion, embedding, questions, deletion and plan status.

use crate::state::AppState;
use pdfchat_core::{
    document_id, storage_path, validate_path_segment, AskResponse, ChatDeleteResponse,
    ChatMessage, DeleteReport, Document, EmbeddingStatus, Source, SubscriptionStatus,
    UploadResponse, CHAT_HISTORY_WINDOW,
};
use pdfchat_error::{ErrorMetadataBuilder, PdfChatError, Result};
use pdfchat_rag::{looks_like_pdf, Namespace};
use std::time::Instant;
use tracing::{info, instrument, warn};

pub const PDF_MIME: &str = "application/pdf";
const SNIPPET_CHARS: usize = 240;

/// A file received from the client.
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

async fn require_document(state: &AppState, user_id: &str, doc_id: &str) -> Result<Document> {
    validate_path_segment("document id", doc_id)?;
    state
        .metadata
        .get_document(user_id, doc_id)
        .await?
        .ok_or_else(|| PdfChatError::NotFound {
            resource: format!("document {}", doc_id),
        })
}

#[instrument(skip(state, upload), fields(file = %upload.file_name, size = upload.bytes.len()))]
pub async fn upload_document(
    state: &AppState,
    user_id: &str,
    upload: Upload,
) -> Result<UploadResponse> {
    if upload.bytes.is_empty() {
        return Err(PdfChatError::InvalidRequest {
            reason: "empty upload".to_string(),
        });
    }
    let size = upload.bytes.len() as u64;
    if size > state.max_upload_bytes {
        return Err(PdfChatError::PayloadTooLarge {
            size,
            limit: state.max_upload_bytes,
        });
    }
    if !looks_like_pdf(&upload.bytes) && upload.mime_type != PDF_MIME {
        return Err(PdfChatError::InvalidRequest {
            reason: "only PDF files are supported".to_string(),
        });
    }

    let id = document_id(&upload.bytes);
    let user = state.metadata.ensure_user(user_id).await?;

    let (document, created) = match state.metadata.get_document(user_id, &id).await? {
        Some(existing) => {
            info!(document_id = %id, "document already uploaded");
            (existing, false)
        }
        None => {
            // cheap early rejection; the store enforces the limit atomically
            state.plans.check_documents(&user)?;

            let path = storage_path(user_id, &id);
            let stored = state
                .objects
                .put(&path, &upload.bytes, PDF_MIME)
                .await?;
            let document = Document {
                id: id.clone(),
                owner_id: user_id.to_string(),
                name: upload.file_name,
                size,
                mime_type: PDF_MIME.to_string(),
                storage_path: stored.path,
                download_url: stored.url,
                created_at: chrono::Utc::now(),
            };
            match state.metadata.put_document(&document, &state.plans).await {
                Ok(true) => {
                    info!(document_id = %id, "stored new document");
                    (document, true)
                }
                // lost a race with an identical upload
                Ok(false) => (require_document(state, user_id, &id).await?, false),
                Err(e @ PdfChatError::QuotaExceeded { .. }) => {
                    // no record points at the object we just wrote
                    if let Err(cleanup) = state.objects.delete(&document.storage_path).await {
                        warn!(document_id = %id, error = %cleanup, "failed to remove rejected upload");
                    }
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    };

    let embeddings = embed_document(state, &document).await?;

    Ok(UploadResponse {
        document,
        created,
        embeddings,
    })
}

async fn embed_document(state: &AppState, document: &Document) -> Result<EmbeddingStatus> {
    let ns = Namespace::new(document.owner_id.clone(), document.id.clone());
    let objects = state.objects.clone();
    let url = document.download_url.clone();
    state
        .indexer
        .ensure_embeddings(&ns, move || async move { objects.fetch(&url).await })
        .await
}

#[instrument(skip(state))]
pub async fn generate_embeddings(
    state: &AppState,
    user_id: &str,
    doc_id: &str,
) -> Result<EmbeddingStatus> {
    let document = require_document(state, user_id, doc_id).await?;
    embed_document(state, &document).await
}

#[instrument(skip(state, question))]
pub async fn ask_question(
    state: &AppState,
    user_id: &str,
    doc_id: &str,
    question: &str,
) -> Result<AskResponse> {
    let started = Instant::now();
    let question = question.trim();
    if question.is_empty() {
        return Err(PdfChatError::InvalidRequest {
            reason: "question must not be empty".to_string(),
        });
    }
    let document = require_document(state, user_id, doc_id).await?;

    let mut history = state
        .metadata
        .recent_messages(user_id, doc_id, CHAT_HISTORY_WINDOW)
        .await?;
    history.reverse();

    state
        .metadata
        .add_question(user_id, doc_id, &ChatMessage::human(question), &state.plans)
        .await?;

    embed_document(state, &document).await?;

    let ns = Namespace::new(user_id, doc_id);
    let output = state.chain.run(&ns, &history, question).await?;

    let answer = ChatMessage::ai(output.answer);
    state.metadata.add_message(user_id, doc_id, &answer).await?;

    let sources = output
        .sources
        .into_iter()
        .map(|chunk| Source {
            chunk_index: chunk.chunk_index,
            score: chunk.score,
            snippet: if chunk.text.chars().count() > SNIPPET_CHARS {
                chunk.text.chars().take(SNIPPET_CHARS).collect::<String>() + "..."
            } else {
                chunk.text
            },
        })
        .collect();

    let latency_ms = started.elapsed().as_millis() as i64;
    info!(document_id = %doc_id, latency_ms, "question answered");
    Ok(AskResponse {
        answer,
        search_query: output.search_query,
        sources,
        latency_ms,
    })
}

pub async fn list_documents(state: &AppState, user_id: &str) -> Result<Vec<Document>> {
    state.metadata.list_documents(user_id).await
}

pub async fn get_document(state: &AppState, user_id: &str, doc_id: &str) -> Result<Document> {
    require_document(state, user_id, doc_id).await
}

pub async fn list_chat(state: &AppState, user_id: &str, doc_id: &str) -> Result<Vec<ChatMessage>> {
    require_document(state, user_id, doc_id).await?;
    state.metadata.list_messages(user_id, doc_id).await
}

#[instrument(skip(state))]
pub async fn delete_chat(
    state: &AppState,
    user_id: &str,
    doc_id: &str,
) -> Result<ChatDeleteResponse> {
    require_document(state, user_id, doc_id).await?;
    let deleted = state.metadata.delete_messages(user_id, doc_id).await?;
    let message = if deleted == 0 {
        "no chat conversation found".to_string()
    } else {
        format!("deleted {} messages", deleted)
    };
    Ok(ChatDeleteResponse { deleted, message })
}

/// Removes a document everywhere it lives. Every step runs even when an
/// earlier one fails; failures are logged and listed in the report.
#[instrument(skip(state))]
pub async fn delete_document(
    state: &AppState,
    user_id: &str,
    doc_id: &str,
) -> Result<DeleteReport> {
    let document = require_document(state, user_id, doc_id).await?;
    let mut report = DeleteReport {
        document_id: doc_id.to_string(),
        metadata_deleted: false,
        messages_deleted: 0,
        namespace_deleted: false,
        object_deleted: false,
        failed_steps: Vec::new(),
    };
    let log_step = |step: &str, e: &PdfChatError| {
        let metadata = ErrorMetadataBuilder::new("delete_cascade")
            .operation(step)
            .user_id(user_id)
            .document_id(doc_id)
            .build(e);
        e.log(&metadata);
    };

    match state.metadata.delete_document(user_id, doc_id).await {
        Ok(Some(messages)) => {
            report.metadata_deleted = true;
            report.messages_deleted = messages;
        }
        Ok(None) => {}
        Err(e) => {
            log_step("metadata", &e);
            report.failed_steps.push("metadata".to_string());
        }
    }

    match state
        .indexer
        .remove(&Namespace::new(user_id, doc_id))
        .await
    {
        Ok(()) => report.namespace_deleted = true,
        Err(e) => {
            log_step("vectors", &e);
            report.failed_steps.push("vectors".to_string());
        }
    }

    let object = async {
        if state.objects.exists(&document.storage_path).await? {
            state.objects.delete(&document.storage_path).await
        } else {
            Ok(false)
        }
    };
    match object.await {
        Ok(deleted) => report.object_deleted = deleted,
        Err(e) => {
            log_step("object", &e);
            report.failed_steps.push("object".to_string());
        }
    }

    info!(
        document_id = %doc_id,
        complete = report.is_complete(),
        messages = report.messages_deleted,
        "document deleted"
    );
    Ok(report)
}

pub async fn subscription_status(state: &AppState, user_id: &str) -> Result<SubscriptionStatus> {
    let user = state.metadata.ensure_user(user_id).await?;
    Ok(state.plans.status(&user))
}

#[instrument(skip(state))]
pub async fn set_membership(
    state: &AppState,
    user_id: &str,
    active: bool,
) -> Result<SubscriptionStatus> {
    validate_path_segment("user id", user_id)?;
    let user = state.metadata.set_membership(user_id, active).await?;
    info!(user_id, active, "membership updated");
    Ok(state.plans.status(&user))
}

/// Bytes of a stored file. Only the owner may read it.
pub async fn download_object(
    state: &AppState,
    caller_id: &str,
    owner_id: &str,
    doc_id: &str,
) -> Result<(Document, Vec<u8>)> {
    if caller_id != owner_id {
        return Err(PdfChatError::Unauthorized {
            operation: "read another user's file".to_string(),
        });
    }
    let document = require_document(state, owner_id, doc_id).await?;
    let bytes = state.objects.get(&document.storage_path).await?;
    Ok((document, bytes))
}
