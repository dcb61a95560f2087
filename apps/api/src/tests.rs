use crate::routes::router;
use crate::state::{AppState, Components, Settings};
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, Response, StatusCode},
};
use pdfchat_auth::{AdminCredentials, JwtService};
use pdfchat_core::{document_id, PlanLimits};
use pdfchat_error::{PdfChatError, Result};
use pdfchat_llm::{ChatModel, EmbedModel, PromptMessage, PromptRole};
use pdfchat_rag::{ChunkRecord, MemoryVectorIndex, Namespace, VectorIndex};
use pdfchat_store::{MemoryMetadataStore, MemoryObjectStore, MetadataStore, ObjectStore};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const BOUNDARY: &str = "pdfchat-test-boundary";
const ADMIN_TOKEN: &str = "admin-token";

/// Answers with the last user turn; rewrites follow-ups to a fixed query.
struct FakeChat {
    fail: bool,
}

#[async_trait]
impl ChatModel for FakeChat {
    async fn chat(&self, messages: &[PromptMessage]) -> Result<String> {
        if self.fail {
            return Err(PdfChatError::LlmService {
                provider: "fake".to_string(),
                message: "model unavailable".to_string(),
                retry_after: None,
            });
        }
        let last = messages
            .iter()
            .rev()
            .find(|m| m.role == PromptRole::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        if last.starts_with("Given the above conversation") {
            return Ok("rewritten query".to_string());
        }
        Ok(format!("answer to: {}", last))
    }
}

struct FakeEmbed;

#[async_trait]
impl EmbedModel for FakeEmbed {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![1.0, 0.5]).collect())
    }
}

struct Harness {
    state: AppState,
    index: MemoryVectorIndex,
}

impl Harness {
    fn new(plans: PlanLimits, failing_chat: bool) -> Self {
        let index = MemoryVectorIndex::new();
        let components = Components {
            metadata: Arc::new(MemoryMetadataStore::new()),
            objects: Arc::new(MemoryObjectStore::new("http://api.test")),
            index: Arc::new(index.clone()),
            chat: Arc::new(FakeChat {
                fail: failing_chat,
            }),
            embed: Arc::new(FakeEmbed),
        };
        let settings = Settings {
            chunk_size: 200,
            chunk_overlap: 20,
            top_k: 4,
            embed_batch_size: 8,
            max_upload_bytes: 1024,
            plans,
        };
        let state = AppState::new(
            components,
            settings,
            Arc::new(JwtService::new("test-secret", None)),
            AdminCredentials {
                user: "admin".into(),
                pass: "pass".into(),
                bearer: Some(ADMIN_TOKEN.into()),
            },
        );
        Self { state, index }
    }

    fn token(&self, user_id: &str) -> String {
        self.state
            .jwt
            .issue(user_id, chrono::Duration::hours(1))
            .unwrap()
    }

    async fn send(&self, req: Request<Body>) -> Response<Body> {
        router(self.state.clone()).oneshot(req).await.unwrap()
    }

    /// Pre-populates the namespace so uploads reuse it instead of parsing the bytes.
    async fn seed_vectors(&self, user_id: &str, bytes: &[u8]) -> String {
        let id = document_id(bytes);
        self.index
            .upsert(
                &Namespace::new(user_id, &id),
                vec![ChunkRecord {
                    chunk_index: 0,
                    text: "The warranty lasts two years.".to_string(),
                    embedding: vec![1.0, 0.5],
                }],
            )
            .await
            .unwrap();
        id
    }

    async fn upload(&self, user_id: &str, file_name: &str, bytes: &[u8]) -> Response<Body> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{f}\"\r\nContent-Type: application/pdf\r\n\r\n",
                b = BOUNDARY,
                f = file_name
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

        let req = Request::post("/api/v1/documents")
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token(user_id)))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap();
        self.send(req).await
    }

    async fn call(&self, method: &str, uri: &str, user_id: &str, body: Option<Value>) -> Response<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token(user_id)));
        let body = match body {
            Some(v) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        self.send(builder.body(body).unwrap()).await
    }

    async fn ask(&self, user_id: &str, doc_id: &str, question: &str) -> Response<Body> {
        self.call(
            "POST",
            &format!("/api/v1/documents/{}/chat", doc_id),
            user_id,
            Some(json!({ "question": question })),
        )
        .await
    }
}

fn pdf(tag: &str) -> Vec<u8> {
    format!("%PDF-1.4\n% {}\n", tag).into_bytes()
}

async fn json_body(resp: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_is_public() {
    let h = Harness::new(PlanLimits::default(), false);
    let resp = h
        .send(Request::get("/api/v1/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await, json!({"status": "ok"}));
}

#[tokio::test]
async fn test_user_routes_require_token() {
    let h = Harness::new(PlanLimits::default(), false);
    let resp = h
        .send(Request::get("/api/v1/documents").body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = h
        .send(
            Request::get("/api/v1/documents")
                .header(header::AUTHORIZATION, "Bearer not-a-jwt")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_session_cookie_authenticates() {
    let h = Harness::new(PlanLimits::default(), false);
    let resp = h
        .send(
            Request::get("/api/v1/subscription")
                .header(header::COOKIE, format!("__session={}", h.token("user_a")))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let status = json_body(resp).await;
    assert_eq!(status["document_limit"], 2);
    assert_eq!(status["has_active_membership"], false);
}

#[tokio::test]
async fn test_upload_is_idempotent_per_content() {
    let h = Harness::new(PlanLimits::default(), false);
    let bytes = pdf("manual");
    let id = h.seed_vectors("user_a", &bytes).await;

    let resp = h.upload("user_a", "manual.pdf", &bytes).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body = json_body(resp).await;
    assert_eq!(body["created"], true);
    assert_eq!(body["document"]["id"], id.as_str());
    assert_eq!(body["document"]["name"], "manual.pdf");
    assert_eq!(
        body["document"]["storage_path"],
        format!("users/user_a/files/{}", id)
    );
    assert_eq!(body["embeddings"]["status"], "reused");

    let resp = h.upload("user_a", "renamed.pdf", &bytes).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["created"], false);
    assert_eq!(body["document"]["name"], "manual.pdf");

    let status = json_body(h.call("GET", "/api/v1/subscription", "user_a", None).await).await;
    assert_eq!(status["document_count"], 1);

    let docs = json_body(h.call("GET", "/api/v1/documents", "user_a", None).await).await;
    assert_eq!(docs.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_upload_rejects_bad_input() {
    let h = Harness::new(PlanLimits::default(), false);
    assert_eq!(
        h.upload("user_a", "empty.pdf", b"").await.status(),
        StatusCode::BAD_REQUEST
    );

    // multipart part declares application/pdf, so only the size check can reject this
    let big = [b"%PDF-1.4\n".as_slice(), vec![b'x'; 2048].as_slice()].concat();
    assert_eq!(
        h.upload("user_a", "big.pdf", &big).await.status(),
        StatusCode::PAYLOAD_TOO_LARGE
    );
}

#[tokio::test]
async fn test_unreadable_pdf_is_stored_but_not_embedded() {
    let h = Harness::new(PlanLimits::default(), false);
    let resp = h.upload("user_a", "broken.pdf", &pdf("broken")).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // no rollback: the record and object remain
    let id = document_id(&pdf("broken"));
    assert!(h
        .state
        .metadata
        .get_document("user_a", &id)
        .await
        .unwrap()
        .is_some());
    assert!(h
        .state
        .objects
        .exists(&format!("users/user_a/files/{}", id))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_document_quota() {
    let h = Harness::new(PlanLimits::default(), false);
    for tag in ["one", "two"] {
        h.seed_vectors("user_a", &pdf(tag)).await;
        assert_eq!(
            h.upload("user_a", "f.pdf", &pdf(tag)).await.status(),
            StatusCode::CREATED
        );
    }
    let resp = h.upload("user_a", "f.pdf", &pdf("three")).await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

    // re-uploading a stored document is still fine
    assert_eq!(
        h.upload("user_a", "f.pdf", &pdf("one")).await.status(),
        StatusCode::OK
    );

    let status = json_body(h.call("GET", "/api/v1/subscription", "user_a", None).await).await;
    assert_eq!(status["is_over_file_limit"], true);
}

#[tokio::test]
async fn test_concurrent_uploads_at_limit() {
    let h = Harness::new(PlanLimits::default(), false);
    h.seed_vectors("user_a", &pdf("first")).await;
    h.upload("user_a", "first.pdf", &pdf("first")).await;
    let (x, y) = (pdf("second"), pdf("third"));
    h.seed_vectors("user_a", &x).await;
    h.seed_vectors("user_a", &y).await;

    let (rx, ry) = tokio::join!(
        h.upload("user_a", "second.pdf", &x),
        h.upload("user_a", "third.pdf", &y)
    );
    let mut statuses = vec![rx.status(), ry.status()];
    statuses.sort();
    assert_eq!(statuses, vec![StatusCode::CREATED, StatusCode::TOO_MANY_REQUESTS]);

    let status = json_body(h.call("GET", "/api/v1/subscription", "user_a", None).await).await;
    assert_eq!(status["document_count"], 2);

    // the rejected file leaves nothing behind in storage
    for bytes in [&x, &y] {
        let id = document_id(bytes);
        let stored = h.state.metadata.get_document("user_a", &id).await.unwrap();
        let object = h
            .state
            .objects
            .exists(&format!("users/user_a/files/{}", id))
            .await
            .unwrap();
        assert_eq!(stored.is_some(), object);
    }
}

#[tokio::test]
async fn test_conversation_flow() {
    let h = Harness::new(PlanLimits::default(), false);
    let bytes = pdf("warranty");
    let id = h.seed_vectors("user_a", &bytes).await;
    h.upload("user_a", "warranty.pdf", &bytes).await;

    let resp = h.ask("user_a", &id, "  How long is the warranty?  ").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let first = json_body(resp).await;
    assert_eq!(first["search_query"], "How long is the warranty?");
    assert_eq!(first["answer"]["role"], "ai");
    assert_eq!(
        first["answer"]["message"],
        "answer to: How long is the warranty?"
    );
    assert_eq!(
        first["sources"][0]["snippet"],
        "The warranty lasts two years."
    );

    let second = json_body(h.ask("user_a", &id, "And after that?").await).await;
    assert_eq!(second["search_query"], "rewritten query");

    let chat = json_body(
        h.call(
            "GET",
            &format!("/api/v1/documents/{}/chat", id),
            "user_a",
            None,
        )
        .await,
    )
    .await;
    let roles: Vec<&str> = chat
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["role"].as_str().unwrap())
        .collect();
    assert_eq!(roles, vec!["human", "ai", "human", "ai"]);
    assert_eq!(chat[0]["message"], "How long is the warranty?");
}

#[tokio::test]
async fn test_question_validation_and_quota() {
    let h = Harness::new(PlanLimits::default(), false);
    let bytes = pdf("quota");
    let id = h.seed_vectors("user_a", &bytes).await;
    h.upload("user_a", "q.pdf", &bytes).await;

    assert_eq!(
        h.ask("user_a", &id, "   ").await.status(),
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        h.ask("user_a", &document_id(b"missing"), "hi").await.status(),
        StatusCode::NOT_FOUND
    );

    for i in 0..3 {
        assert_eq!(
            h.ask("user_a", &id, &format!("question {}", i)).await.status(),
            StatusCode::OK
        );
    }
    let resp = h.ask("user_a", &id, "one too many").await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_model_failure_keeps_only_question() {
    let h = Harness::new(PlanLimits::default(), true);
    let bytes = pdf("failing");
    let id = h.seed_vectors("user_a", &bytes).await;
    h.upload("user_a", "f.pdf", &bytes).await;

    let resp = h.ask("user_a", &id, "anything?").await;
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let body = json_body(resp).await;
    assert!(body["message"].as_str().unwrap().starts_with("Whoops"));

    let messages = h.state.metadata.list_messages("user_a", &id).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message, "anything?");
}

#[tokio::test]
async fn test_delete_document_cascades() {
    let h = Harness::new(PlanLimits::default(), false);
    let bytes = pdf("cascade");
    let id = h.seed_vectors("user_a", &bytes).await;
    h.upload("user_a", "c.pdf", &bytes).await;
    h.ask("user_a", &id, "what?").await;

    let resp = h
        .call("DELETE", &format!("/api/v1/documents/{}", id), "user_a", None)
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let report = json_body(resp).await;
    assert_eq!(report["metadata_deleted"], true);
    assert_eq!(report["messages_deleted"], 2);
    assert_eq!(report["namespace_deleted"], true);
    assert_eq!(report["object_deleted"], true);
    assert_eq!(report["failed_steps"], json!([]));

    assert!(!h
        .index
        .namespace_exists(&Namespace::new("user_a", &id))
        .await
        .unwrap());
    assert_eq!(
        h.call("GET", &format!("/api/v1/documents/{}", id), "user_a", None)
            .await
            .status(),
        StatusCode::NOT_FOUND
    );
    let status = json_body(h.call("GET", "/api/v1/subscription", "user_a", None).await).await;
    assert_eq!(status["document_count"], 0);
}

#[tokio::test]
async fn test_same_bytes_are_isolated_between_users() {
    let h = Harness::new(PlanLimits::default(), false);
    let bytes = pdf("shared");
    let id = h.seed_vectors("user_a", &bytes).await;
    h.seed_vectors("user_b", &bytes).await;
    h.upload("user_a", "a.pdf", &bytes).await;
    h.upload("user_b", "b.pdf", &bytes).await;

    h.call("DELETE", &format!("/api/v1/documents/{}", id), "user_a", None)
        .await;

    assert!(h
        .index
        .namespace_exists(&Namespace::new("user_b", &id))
        .await
        .unwrap());
    assert_eq!(
        h.call("GET", &format!("/api/v1/documents/{}", id), "user_b", None)
            .await
            .status(),
        StatusCode::OK
    );
}

#[tokio::test]
async fn test_delete_chat() {
    let h = Harness::new(PlanLimits::default(), false);
    let bytes = pdf("chat");
    let id = h.seed_vectors("user_a", &bytes).await;
    h.upload("user_a", "c.pdf", &bytes).await;
    h.ask("user_a", &id, "hello?").await;

    let uri = format!("/api/v1/documents/{}/chat", id);
    let body = json_body(h.call("DELETE", &uri, "user_a", None).await).await;
    assert_eq!(body["deleted"], 2);

    let body = json_body(h.call("DELETE", &uri, "user_a", None).await).await;
    assert_eq!(body["deleted"], 0);
    assert_eq!(body["message"], "no chat conversation found");
}

#[tokio::test]
async fn test_download_is_owner_only() {
    let h = Harness::new(PlanLimits::default(), false);
    let bytes = pdf("download");
    let id = h.seed_vectors("user_a", &bytes).await;
    h.upload("user_a", "d.pdf", &bytes).await;

    let uri = format!("/files/users/user_a/files/{}", id);
    let resp = h.call("GET", &uri, "user_a", None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/pdf"
    );
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(body.as_ref(), bytes.as_slice());

    assert_eq!(
        h.call("GET", &uri, "user_b", None).await.status(),
        StatusCode::FORBIDDEN
    );
}

#[tokio::test]
async fn test_embeddings_endpoint_reuses_namespace() {
    let h = Harness::new(PlanLimits::default(), false);
    let bytes = pdf("embed");
    let id = h.seed_vectors("user_a", &bytes).await;
    h.upload("user_a", "e.pdf", &bytes).await;

    let resp = h
        .call(
            "POST",
            &format!("/api/v1/documents/{}/embeddings", id),
            "user_a",
            None,
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await, json!({"status": "reused"}));
}

#[tokio::test]
async fn test_admin_sets_membership() {
    let h = Harness::new(PlanLimits::default(), false);
    let uri = "/api/v1/admin/users/user_a/membership";
    let put = |auth: Option<&str>| {
        let mut builder = Request::put(uri).header(header::CONTENT_TYPE, "application/json");
        if let Some(auth) = auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        builder
            .body(Body::from(json!({"has_active_membership": true}).to_string()))
            .unwrap()
    };

    assert_eq!(h.send(put(None)).await.status(), StatusCode::UNAUTHORIZED);
    // a user token is not an admin credential
    let user_auth = format!("Bearer {}", h.token("user_a"));
    assert_eq!(
        h.send(put(Some(user_auth.as_str()))).await.status(),
        StatusCode::UNAUTHORIZED
    );

    let resp = h.send(put(Some(format!("Bearer {}", ADMIN_TOKEN).as_str()))).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let status = json_body(resp).await;
    assert_eq!(status["has_active_membership"], true);
    assert_eq!(status["document_limit"], 20);
    assert_eq!(status["question_limit"], 100);
}
