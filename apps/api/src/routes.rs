use crate::service::{self, Upload, PDF_MIME};
use crate::state::AppState;
use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Extension, Json, Router,
};
use pdfchat_auth::{AuthUser, RequireAdmin, RequireUser};
use pdfchat_core::{
    AskRequest, AskResponse, ChatDeleteResponse, ChatMessage, DeleteReport, Document,
    EmbeddingStatus, MembershipUpdate, SubscriptionStatus, UploadResponse,
};
use pdfchat_error::{ErrorMetadataBuilder, PdfChatError};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Room for multipart framing on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

type ApiResult<T> = Result<T, PdfChatError>;

pub fn router(state: AppState) -> Router {
    let body_limit = state.max_upload_bytes as usize + MULTIPART_OVERHEAD;

    let user_routes = Router::new()
        .route("/api/v1/documents", get(list_documents).post(upload_document))
        .route(
            "/api/v1/documents/:id",
            get(get_document).delete(delete_document),
        )
        .route("/api/v1/documents/:id/embeddings", post(generate_embeddings))
        .route(
            "/api/v1/documents/:id/chat",
            get(list_chat).post(ask).delete(delete_chat),
        )
        .route("/api/v1/subscription", get(subscription))
        .route("/files/users/:uid/files/:id", get(download))
        .route_layer(RequireUser::layer(state.jwt.clone()));

    let admin_routes = Router::new()
        .route("/api/v1/admin/users/:id/membership", put(set_membership))
        .route_layer(RequireAdmin::layer(state.admin.clone()));

    Router::new()
        .route("/api/v1/health", get(health))
        .merge(user_routes)
        .merge(admin_routes)
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Logs the failure with request context before it becomes a response.
fn logged<'a>(
    operation: &'a str,
    user: &'a AuthUser,
    document_id: Option<&'a str>,
) -> impl FnOnce(PdfChatError) -> PdfChatError + 'a {
    move |e| {
        let mut builder = ErrorMetadataBuilder::new("api")
            .operation(operation)
            .user_id(&user.user_id);
        if let Some(id) = document_id {
            builder = builder.document_id(id);
        }
        e.log(&builder.build(&e));
        e
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_documents(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<Document>>> {
    service::list_documents(&state, &user.user_id)
        .await
        .map(Json)
        .map_err(logged("list_documents", &user, None))
}

fn multipart_error(e: MultipartError, body_limit: u64, max_upload: u64) -> PdfChatError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        PdfChatError::PayloadTooLarge {
            size: body_limit,
            limit: max_upload,
        }
    } else {
        PdfChatError::InvalidRequest {
            reason: e.body_text(),
        }
    }
}

async fn read_upload(state: &AppState, mut multipart: Multipart) -> ApiResult<Upload> {
    let body_limit = state.max_upload_bytes + MULTIPART_OVERHEAD as u64;
    let to_err = |e: MultipartError| multipart_error(e, body_limit, state.max_upload_bytes);
    while let Some(field) = multipart.next_field().await.map_err(to_err)? {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field
            .file_name()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or("document.pdf")
            .to_string();
        let mime_type = field.content_type().unwrap_or(PDF_MIME).to_string();
        let bytes = field.bytes().await.map_err(to_err)?.to_vec();
        return Ok(Upload {
            file_name,
            mime_type,
            bytes,
        });
    }
    Err(PdfChatError::InvalidRequest {
        reason: "missing multipart field `file`".to_string(),
    })
}

async fn upload_document(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    multipart: Multipart,
) -> ApiResult<(StatusCode, Json<UploadResponse>)> {
    let result = async {
        let upload = read_upload(&state, multipart).await?;
        service::upload_document(&state, &user.user_id, upload).await
    }
    .await
    .map_err(logged("upload_document", &user, None))?;

    let status = if result.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(result)))
}

async fn get_document(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<Document>> {
    service::get_document(&state, &user.user_id, &id)
        .await
        .map(Json)
        .map_err(logged("get_document", &user, Some(&id)))
}

async fn delete_document(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeleteReport>> {
    service::delete_document(&state, &user.user_id, &id)
        .await
        .map(Json)
        .map_err(logged("delete_document", &user, Some(&id)))
}

async fn generate_embeddings(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<EmbeddingStatus>> {
    service::generate_embeddings(&state, &user.user_id, &id)
        .await
        .map(Json)
        .map_err(logged("generate_embeddings", &user, Some(&id)))
}

async fn list_chat(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<ChatMessage>>> {
    service::list_chat(&state, &user.user_id, &id)
        .await
        .map(Json)
        .map_err(logged("list_chat", &user, Some(&id)))
}

async fn ask(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(req): Json<AskRequest>,
) -> ApiResult<Json<AskResponse>> {
    service::ask_question(&state, &user.user_id, &id, &req.question)
        .await
        .map(Json)
        .map_err(logged("ask_question", &user, Some(&id)))
}

async fn delete_chat(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<ChatDeleteResponse>> {
    service::delete_chat(&state, &user.user_id, &id)
        .await
        .map(Json)
        .map_err(logged("delete_chat", &user, Some(&id)))
}

async fn subscription(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionStatus>> {
    service::subscription_status(&state, &user.user_id)
        .await
        .map(Json)
        .map_err(logged("subscription_status", &user, None))
}

async fn set_membership(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(update): Json<MembershipUpdate>,
) -> ApiResult<Json<SubscriptionStatus>> {
    let admin = AuthUser {
        user_id: "admin".to_string(),
    };
    service::set_membership(&state, &user_id, update.has_active_membership)
        .await
        .map(Json)
        .map_err(logged("set_membership", &admin, None))
}

fn content_disposition(name: &str) -> String {
    let safe: String = name
        .chars()
        .filter(|c| c.is_ascii_graphic() || *c == ' ')
        .filter(|c| *c != '"' && *c != '\\')
        .collect();
    let safe = if safe.trim().is_empty() {
        "document.pdf".to_string()
    } else {
        safe
    };
    format!("inline; filename=\"{}\"", safe)
}

async fn download(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path((uid, id)): Path<(String, String)>,
) -> ApiResult<Response> {
    let (document, bytes) = service::download_object(&state, &user.user_id, &uid, &id)
        .await
        .map_err(logged("download", &user, Some(&id)))?;
    Ok((
        [
            (header::CONTENT_TYPE, document.mime_type.clone()),
            (header::CONTENT_DISPOSITION, content_disposition(&document.name)),
        ],
        bytes,
    )
        .into_response())
}
