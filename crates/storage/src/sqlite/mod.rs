use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Connection, FromRow, SqliteConnection, SqlitePool};

use super::error::{
    AttachmentJsonSnafu, CreateSqliteDirectorySnafu, InvariantViolationSnafu, NotFoundSnafu,
    SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu,
    SqliteQuerySnafu, SqliteRuntimeInitSnafu, SqliteThreadSpawnSnafu, StorageError, StorageResult,
};
use super::ids::{AgentId, ChatId, MessageId, UserId};
use super::types::{
    CachedAttachment, CachedMessage, ConversationRecord, DraftKey, MessageRole, NewConversation,
    UsageDay,
};
use super::{ConversationStore, DraftStore, MessageCacheStore, UsageStore};

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        let _: String = sqlx::query_scalar("PRAGMA journal_mode = WAL;")
            .fetch_one(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-journal-mode",
                pragma: "journal_mode",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "sqlite storage ready");
        Ok(Self { pool, database_url })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn run_db_call<T, F>(&self, stage: &'static str, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: Future<Output = StorageResult<T>> + Send + 'static,
    {
        // Each call runs on its own thread with a current-thread runtime.
        let worker = std::thread::Builder::new()
            .name(format!("sqlite-store-{stage}"))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context(SqliteRuntimeInitSnafu {
                        stage: "sqlite-store-runtime-build",
                    })?;
                runtime.block_on(op)
            })
            .context(SqliteThreadSpawnSnafu {
                stage: "sqlite-store-spawn-worker",
            })?;

        match worker.join() {
            Ok(result) => result,
            Err(_) => InvariantViolationSnafu {
                stage,
                details: "sqlite storage worker thread panicked".to_string(),
            }
            .fail(),
        }
    }
}

impl DraftStore for SqliteStorage {
    fn set_draft(&self, key: &DraftKey, text: &str) -> StorageResult<()> {
        if text.is_empty() {
            return self.clear_draft(key);
        }

        let database_url = self.database_url.clone();
        let draft_key = key.storage_key();
        let content = text.to_string();
        self.run_db_call("draft-set", async move {
            let mut connection = connect_store_connection(&database_url, "draft-set-connect").await?;
            sqlx::query(
                "INSERT INTO drafts (draft_key, content, updated_at) VALUES (?, ?, ?) \
                 ON CONFLICT(draft_key) DO UPDATE SET content = excluded.content, updated_at = excluded.updated_at",
            )
            .bind(draft_key)
            .bind(content)
            .bind(unix_timestamp_millis())
            .execute(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "draft-set-upsert",
            })?;

            Ok(())
        })
    }

    fn draft(&self, key: &DraftKey) -> StorageResult<Option<String>> {
        let database_url = self.database_url.clone();
        let draft_key = key.storage_key();
        self.run_db_call("draft-get", async move {
            let mut connection = connect_store_connection(&database_url, "draft-get-connect").await?;
            sqlx::query_scalar::<_, String>("SELECT content FROM drafts WHERE draft_key = ?")
                .bind(draft_key)
                .fetch_optional(&mut connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "draft-get-query",
                })
        })
    }

    fn clear_draft(&self, key: &DraftKey) -> StorageResult<()> {
        let database_url = self.database_url.clone();
        let draft_key = key.storage_key();
        self.run_db_call("draft-clear", async move {
            let mut connection = connect_store_connection(&database_url, "draft-clear-connect").await?;
            sqlx::query("DELETE FROM drafts WHERE draft_key = ?")
                .bind(draft_key)
                .execute(&mut connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "draft-clear-delete",
                })?;

            Ok(())
        })
    }
}

impl ConversationStore for SqliteStorage {
    fn create_conversation(&self, input: NewConversation) -> StorageResult<ConversationRecord> {
        let database_url = self.database_url.clone();
        self.run_db_call("conversation-create", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-create-connect").await?;
            let mut tx = connection.begin().await.context(SqliteQuerySnafu {
                stage: "conversation-create-begin",
            })?;

            let latest = sqlx::query_scalar::<_, Option<i64>>(
                "SELECT MAX(updated_at) FROM conversations WHERE user_id = ?",
            )
            .bind(input.user_id.as_str())
            .fetch_one(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-create-latest",
            })?;

            // Recency order must stay strict even when two writes land in the same millisecond.
            let now = next_recency_stamp(unix_timestamp_millis(), latest);
            let chat_id = ChatId::new_v7();

            sqlx::query(
                "INSERT INTO conversations (id, user_id, title, model_id, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(chat_id.as_str())
            .bind(input.user_id.as_str())
            .bind(input.title.clone())
            .bind(input.model_id.clone())
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-create-insert",
            })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "conversation-create-commit",
            })?;

            let stamp = i64_to_u64(now, "conversation-create-timestamp")?;
            Ok(ConversationRecord {
                id: chat_id,
                user_id: input.user_id,
                title: input.title,
                model_id: input.model_id,
                created_at_unix_millis: stamp,
                updated_at_unix_millis: stamp,
            })
        })
    }

    fn get_conversation(&self, chat_id: &ChatId) -> StorageResult<Option<ConversationRecord>> {
        let database_url = self.database_url.clone();
        let chat_id = chat_id.clone();
        self.run_db_call("conversation-get", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-get-connect").await?;
            let row = sqlx::query_as::<_, ConversationRow>(
                "SELECT id, user_id, title, model_id, created_at, updated_at FROM conversations WHERE id = ?",
            )
            .bind(chat_id.as_str())
            .fetch_optional(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-get-query",
            })?;

            row.map(conversation_row_to_record).transpose()
        })
    }

    fn list_conversations(&self, user_id: &UserId) -> StorageResult<Vec<ConversationRecord>> {
        let database_url = self.database_url.clone();
        let user_id = user_id.clone();
        self.run_db_call("conversation-list", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-list-connect").await?;
            let rows = sqlx::query_as::<_, ConversationRow>(
                "SELECT id, user_id, title, model_id, created_at, updated_at FROM conversations WHERE user_id = ? ORDER BY updated_at DESC, id DESC",
            )
            .bind(user_id.as_str())
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-list-query",
            })?;

            rows.into_iter().map(conversation_row_to_record).collect()
        })
    }

    fn touch_conversation(&self, chat_id: &ChatId) -> StorageResult<ConversationRecord> {
        let database_url = self.database_url.clone();
        let chat_id = chat_id.clone();
        self.run_db_call("conversation-touch", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-touch-connect").await?;
            let mut tx = connection.begin().await.context(SqliteQuerySnafu {
                stage: "conversation-touch-begin",
            })?;

            let row = sqlx::query_as::<_, ConversationRow>(
                "SELECT id, user_id, title, model_id, created_at, updated_at FROM conversations WHERE id = ?",
            )
            .bind(chat_id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-touch-load",
            })?
            .context(NotFoundSnafu {
                stage: "conversation-touch-load",
                entity: "conversation",
                id: chat_id.to_string(),
            })?;

            let latest = sqlx::query_scalar::<_, Option<i64>>(
                "SELECT MAX(updated_at) FROM conversations WHERE user_id = ?",
            )
            .bind(row.user_id.as_str())
            .fetch_one(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-touch-latest",
            })?;

            let now = next_recency_stamp(unix_timestamp_millis(), latest);
            sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
                .bind(now)
                .bind(chat_id.as_str())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "conversation-touch-update",
                })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "conversation-touch-commit",
            })?;

            conversation_row_to_record(ConversationRow {
                updated_at: now,
                ..row
            })
        })
    }

    fn delete_conversation(&self, chat_id: &ChatId) -> StorageResult<bool> {
        let database_url = self.database_url.clone();
        let chat_id = chat_id.clone();
        let draft_key = DraftKey::Conversation(chat_id.clone()).storage_key();
        self.run_db_call("conversation-delete", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-delete-connect").await?;
            let mut tx = connection.begin().await.context(SqliteQuerySnafu {
                stage: "conversation-delete-begin",
            })?;

            sqlx::query("DELETE FROM cached_messages WHERE chat_id = ?")
                .bind(chat_id.as_str())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "conversation-delete-messages",
                })?;
            sqlx::query("DELETE FROM drafts WHERE draft_key = ?")
                .bind(draft_key)
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "conversation-delete-draft",
                })?;
            let deleted = sqlx::query("DELETE FROM conversations WHERE id = ?")
                .bind(chat_id.as_str())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "conversation-delete-row",
                })?
                .rows_affected();

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "conversation-delete-commit",
            })?;
            Ok(deleted > 0)
        })
    }
}

impl MessageCacheStore for SqliteStorage {
    fn cache_message(&self, message: CachedMessage) -> StorageResult<()> {
        let database_url = self.database_url.clone();
        let attachments_json =
            serde_json::to_string(&message.attachments).context(AttachmentJsonSnafu {
                stage: "message-cache-encode-attachments",
            })?;
        let created_at = u64_to_i64(message.created_at_unix_millis, "message-cache-created-at")?;

        self.run_db_call("message-cache-put", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-cache-put-connect").await?;
            sqlx::query(
                "INSERT OR REPLACE INTO cached_messages (id, chat_id, role, content, attachments_json, agent_id, created_at_ms) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(message.id.to_string())
            .bind(message.chat_id.as_str())
            .bind(role_to_sql(message.role))
            .bind(message.content)
            .bind(attachments_json)
            .bind(message.agent_id.as_ref().map(AgentId::as_str))
            .bind(created_at)
            .execute(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-cache-put-insert",
            })?;

            Ok(())
        })
    }

    fn cached_messages(&self, chat_id: &ChatId) -> StorageResult<Vec<CachedMessage>> {
        let database_url = self.database_url.clone();
        let chat_id = chat_id.clone();
        self.run_db_call("message-cache-list", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-cache-list-connect").await?;
            let rows = sqlx::query_as::<_, CachedMessageRow>(
                "SELECT id, chat_id, role, content, attachments_json, agent_id, created_at_ms FROM cached_messages WHERE chat_id = ? ORDER BY created_at_ms ASC, id ASC",
            )
            .bind(chat_id.as_str())
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-cache-list-query",
            })?;

            rows.into_iter().map(cached_message_row_to_record).collect()
        })
    }

    fn remove_cached_messages(&self, chat_id: &ChatId, ids: &[MessageId]) -> StorageResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let database_url = self.database_url.clone();
        let chat_id = chat_id.clone();
        let ids = ids.iter().map(MessageId::to_string).collect::<Vec<_>>();
        self.run_db_call("message-cache-remove", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-cache-remove-connect").await?;
            let mut tx = connection.begin().await.context(SqliteQuerySnafu {
                stage: "message-cache-remove-begin",
            })?;

            let mut removed = 0;
            for id in ids {
                removed += sqlx::query("DELETE FROM cached_messages WHERE chat_id = ? AND id = ?")
                    .bind(chat_id.as_str())
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .context(SqliteQuerySnafu {
                        stage: "message-cache-remove-delete",
                    })?
                    .rows_affected();
            }

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-cache-remove-commit",
            })?;
            usize::try_from(removed).map_err(|_| StorageError::InvariantViolation {
                stage: "message-cache-remove-count",
                details: format!("removed row count '{removed}' cannot map to usize"),
            })
        })
    }
}

impl UsageStore for SqliteStorage {
    fn usage(&self, user_id: &UserId, day: UsageDay) -> StorageResult<u64> {
        let database_url = self.database_url.clone();
        let user_id = user_id.clone();
        let day = u64_to_i64(day.0, "usage-get-day")?;
        self.run_db_call("usage-get", async move {
            let mut connection = connect_store_connection(&database_url, "usage-get-connect").await?;
            let count = sqlx::query_scalar::<_, i64>(
                "SELECT message_count FROM daily_usage WHERE user_id = ? AND day = ?",
            )
            .bind(user_id.as_str())
            .bind(day)
            .fetch_optional(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "usage-get-query",
            })?;

            i64_to_u64(count.unwrap_or(0), "usage-get-count")
        })
    }

    fn increment_usage(&self, user_id: &UserId, day: UsageDay) -> StorageResult<u64> {
        let database_url = self.database_url.clone();
        let user_id = user_id.clone();
        let day = u64_to_i64(day.0, "usage-increment-day")?;
        self.run_db_call("usage-increment", async move {
            let mut connection =
                connect_store_connection(&database_url, "usage-increment-connect").await?;
            let count = sqlx::query_scalar::<_, i64>(
                "INSERT INTO daily_usage (user_id, day, message_count) VALUES (?, ?, 1) \
                 ON CONFLICT(user_id, day) DO UPDATE SET message_count = message_count + 1 \
                 RETURNING message_count",
            )
            .bind(user_id.as_str())
            .bind(day)
            .fetch_one(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "usage-increment-upsert",
            })?;

            i64_to_u64(count, "usage-increment-count")
        })
    }
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: String,
    user_id: String,
    title: String,
    model_id: Option<String>,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, FromRow)]
struct CachedMessageRow {
    id: String,
    chat_id: String,
    role: String,
    content: String,
    attachments_json: String,
    agent_id: Option<String>,
    created_at_ms: i64,
}

fn conversation_row_to_record(row: ConversationRow) -> StorageResult<ConversationRecord> {
    Ok(ConversationRecord {
        id: ChatId::parse(&row.id)?,
        user_id: UserId::parse(&row.user_id)?,
        title: row.title,
        model_id: row.model_id,
        created_at_unix_millis: i64_to_u64(row.created_at, "conversation-row-created-at")?,
        updated_at_unix_millis: i64_to_u64(row.updated_at, "conversation-row-updated-at")?,
    })
}

fn cached_message_row_to_record(row: CachedMessageRow) -> StorageResult<CachedMessage> {
    let attachments = serde_json::from_str::<Vec<CachedAttachment>>(&row.attachments_json)
        .context(AttachmentJsonSnafu {
            stage: "cached-message-row-attachments",
        })?;

    Ok(CachedMessage {
        id: MessageId::parse(&row.id)?,
        chat_id: ChatId::parse(&row.chat_id)?,
        role: role_from_sql(&row.role)?,
        content: row.content,
        attachments,
        agent_id: row.agent_id.as_deref().map(AgentId::parse).transpose()?,
        created_at_unix_millis: i64_to_u64(row.created_at_ms, "cached-message-row-created-at")?,
    })
}

async fn connect_store_connection(
    database_url: &str,
    stage: &'static str,
) -> StorageResult<SqliteConnection> {
    let mut connection =
        SqliteConnection::connect(database_url)
            .await
            .context(SqliteConnectSnafu {
                stage,
                database_url: database_url.to_string(),
            })?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-busy-timeout",
            pragma: "busy_timeout",
        })?;

    Ok(connection)
}

fn next_recency_stamp(now: i64, latest: Option<i64>) -> i64 {
    match latest {
        Some(latest) if latest >= now => latest + 1,
        _ => now,
    }
}

fn role_to_sql(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    }
}

fn role_from_sql(raw: &str) -> StorageResult<MessageRole> {
    match raw {
        "system" => Ok(MessageRole::System),
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        _ => InvariantViolationSnafu {
            stage: "message-role-from-sql",
            details: format!("unknown message role '{raw}'"),
        }
        .fail(),
    }
}

fn unix_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_millis() as i64)
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("u64 '{value}' cannot map to sqlite i64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
