use crate::metadata::MetadataStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pdfchat_core::{ChatMessage, Document, PlanLimits, Role, User};
use pdfchat_error::{DatabaseContext, PdfChatError, Result};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

fn db_err(table: &str, op: &str) -> impl FnOnce(sqlx::Error) -> PdfChatError {
    let table = table.to_string();
    let op = op.to_string();
    move |e| PdfChatError::Database {
        message: format!("{}: {}", op, e),
        context: Some(DatabaseContext {
            query: Some(op),
            table: Some(table),
        }),
    }
}

/// Postgres-backed metadata store.
#[derive(Clone)]
pub struct PgMetadataStore {
    pool: PgPool,
}

impl PgMetadataStore {
    /// Connects and applies pending migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(|e| PdfChatError::ServiceUnavailable {
                service: format!("postgres: {}", e),
                retry_after: None,
            })?;
        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| PdfChatError::Database {
                message: format!("migrate: {}", e),
                context: None,
            })?;
        info!("postgres metadata store ready");
        Ok(Self { pool })
    }
}

fn user_from_row(row: &PgRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        has_active_membership: row.try_get("has_active_membership")?,
        document_count: row.try_get::<i32, _>("document_count")?.max(0) as u32,
        created_at: row.try_get("created_at")?,
    })
}

fn document_from_row(row: &PgRow) -> Result<Document> {
    Ok(Document {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        name: row.try_get("name")?,
        size: row.try_get::<i64, _>("size")?.max(0) as u64,
        mime_type: row.try_get("mime_type")?,
        storage_path: row.try_get("storage_path")?,
        download_url: row.try_get("download_url")?,
        created_at: row.try_get("created_at")?,
    })
}

fn message_from_row(row: &PgRow) -> Result<ChatMessage> {
    let role: String = row.try_get("role")?;
    Ok(ChatMessage {
        id: row.try_get::<Uuid, _>("id")?,
        role: role.parse()?,
        message: row.try_get("message")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

const USER_COLUMNS: &str = "id, has_active_membership, document_count, created_at";
const DOCUMENT_COLUMNS: &str =
    "owner_id, id, name, size, mime_type, storage_path, download_url, created_at";

#[async_trait]
impl MetadataStore for PgMetadataStore {
    async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let row = sqlx::query(&format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS))
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("users", "get_user"))?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn ensure_user(&self, user_id: &str) -> Result<User> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO users (id) VALUES ($1)
            ON CONFLICT (id) DO UPDATE SET id = EXCLUDED.id
            RETURNING {}
            "#,
            USER_COLUMNS
        ))
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("users", "ensure_user"))?;
        user_from_row(&row)
    }

    async fn set_membership(&self, user_id: &str, active: bool) -> Result<User> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO users (id, has_active_membership) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET has_active_membership = EXCLUDED.has_active_membership
            RETURNING {}
            "#,
            USER_COLUMNS
        ))
        .bind(user_id)
        .bind(active)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("users", "set_membership"))?;
        user_from_row(&row)
    }

    async fn put_document(&self, document: &Document, limits: &PlanLimits) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_err("documents", "begin"))?;

        sqlx::query("INSERT INTO users (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
            .bind(&document.owner_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err("users", "put_document"))?;

        // row lock serializes uploads of the same owner
        let row = sqlx::query(&format!(
            "SELECT {} FROM users WHERE id = $1 FOR UPDATE",
            USER_COLUMNS
        ))
        .bind(&document.owner_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err("users", "lock_user"))?;
        let user = user_from_row(&row)?;

        let existing: Option<i32> =
            sqlx::query_scalar("SELECT 1 FROM documents WHERE owner_id = $1 AND id = $2")
                .bind(&document.owner_id)
                .bind(&document.id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err("documents", "put_document"))?;
        if existing.is_some() {
            tx.rollback().await.map_err(db_err("documents", "rollback"))?;
            return Ok(false);
        }
        limits.check_documents(&user)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO documents (owner_id, id, name, size, mime_type, storage_path, download_url, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (owner_id, id) DO NOTHING
            "#,
        )
        .bind(&document.owner_id)
        .bind(&document.id)
        .bind(&document.name)
        .bind(document.size as i64)
        .bind(&document.mime_type)
        .bind(&document.storage_path)
        .bind(&document.download_url)
        .bind(document.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err("documents", "put_document"))?
        .rows_affected()
            > 0;

        if inserted {
            sqlx::query("UPDATE users SET document_count = document_count + 1 WHERE id = $1")
                .bind(&document.owner_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err("users", "increment_document_count"))?;
        }

        tx.commit().await.map_err(db_err("documents", "commit"))?;
        Ok(inserted)
    }

    async fn get_document(&self, owner_id: &str, document_id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE owner_id = $1 AND id = $2",
            DOCUMENT_COLUMNS
        ))
        .bind(owner_id)
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("documents", "get_document"))?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn list_documents(&self, owner_id: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE owner_id = $1 ORDER BY created_at ASC, id ASC",
            DOCUMENT_COLUMNS
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("documents", "list_documents"))?;
        rows.iter().map(document_from_row).collect()
    }

    async fn delete_document(&self, owner_id: &str, document_id: &str) -> Result<Option<usize>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_err("documents", "begin"))?;

        let messages = sqlx::query("DELETE FROM chat_messages WHERE owner_id = $1 AND document_id = $2")
            .bind(owner_id)
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err("chat_messages", "delete_document"))?
            .rows_affected() as usize;

        let removed = sqlx::query("DELETE FROM documents WHERE owner_id = $1 AND id = $2")
            .bind(owner_id)
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err("documents", "delete_document"))?
            .rows_affected();

        if removed == 0 {
            tx.rollback().await.map_err(db_err("documents", "rollback"))?;
            return Ok(None);
        }

        sqlx::query(
            "UPDATE users SET document_count = GREATEST(document_count - 1, 0) WHERE id = $1",
        )
        .bind(owner_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err("users", "decrement_document_count"))?;

        tx.commit().await.map_err(db_err("documents", "commit"))?;
        Ok(Some(messages))
    }

    async fn add_message(
        &self,
        owner_id: &str,
        document_id: &str,
        message: &ChatMessage,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO chat_messages (id, owner_id, document_id, role, message, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(message.id)
        .bind(owner_id)
        .bind(document_id)
        .bind(message.role.as_str())
        .bind(&message.message)
        .bind(message.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_foreign_key_violation() => {
                Err(PdfChatError::NotFound {
                    resource: format!("document {}", document_id),
                })
            }
            Err(e) => Err(db_err("chat_messages", "add_message")(e)),
        }
    }

    async fn add_question(
        &self,
        owner_id: &str,
        document_id: &str,
        question: &ChatMessage,
        limits: &PlanLimits,
    ) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_err("chat_messages", "begin"))?;

        // row lock serializes questions on the same document
        let locked: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM documents WHERE owner_id = $1 AND id = $2 FOR UPDATE",
        )
        .bind(owner_id)
        .bind(document_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err("documents", "lock_document"))?;
        if locked.is_none() {
            return Err(PdfChatError::NotFound {
                resource: format!("document {}", document_id),
            });
        }

        let user = sqlx::query(&format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS))
            .bind(owner_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err("users", "get_user"))?
            .as_ref()
            .map(user_from_row)
            .transpose()?
            .unwrap_or_else(|| User::new(owner_id));

        let asked: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chat_messages WHERE owner_id = $1 AND document_id = $2 AND role = $3",
        )
        .bind(owner_id)
        .bind(document_id)
        .bind(Role::Human.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err("chat_messages", "count_questions"))?;
        limits.check_questions(&user, asked.max(0) as usize)?;

        sqlx::query(
            r#"
            INSERT INTO chat_messages (id, owner_id, document_id, role, message, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(question.id)
        .bind(owner_id)
        .bind(document_id)
        .bind(Role::Human.as_str())
        .bind(&question.message)
        .bind(question.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err("chat_messages", "add_question"))?;

        tx.commit().await.map_err(db_err("chat_messages", "commit"))?;
        Ok(())
    }

    async fn recent_messages(
        &self,
        owner_id: &str,
        document_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, role, message, created_at FROM chat_messages
            WHERE owner_id = $1 AND document_id = $2
            ORDER BY created_at DESC
            LIMIT $3
            "#,
        )
        .bind(owner_id)
        .bind(document_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("chat_messages", "recent_messages"))?;
        rows.iter().map(message_from_row).collect()
    }

    async fn list_messages(&self, owner_id: &str, document_id: &str) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, role, message, created_at FROM chat_messages
            WHERE owner_id = $1 AND document_id = $2
            ORDER BY created_at ASC
            "#,
        )
        .bind(owner_id)
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("chat_messages", "list_messages"))?;
        rows.iter().map(message_from_row).collect()
    }

    async fn delete_messages(&self, owner_id: &str, document_id: &str) -> Result<usize> {
        let result =
            sqlx::query("DELETE FROM chat_messages WHERE owner_id = $1 AND document_id = $2")
                .bind(owner_id)
                .bind(document_id)
                .execute(&self.pool)
                .await
                .map_err(db_err("chat_messages", "delete_messages"))?;
        Ok(result.rows_affected() as usize)
    }
}
