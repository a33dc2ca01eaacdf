use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tokio::sync::RwLock;

use crate::config::{RuntimeConfig, display_db_url};
use crate::error::HistoryStoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    User,
    Assistant,
}

/// A conversation message as seen by the agents.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    pub metadata: Option<Value>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            metadata: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Human,
    Ai,
}

/// The JSON document persisted for each message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl MessagePayload {
    pub fn human(content: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Human,
            content: content.into(),
            data: None,
        }
    }

    pub fn ai(content: impl Into<String>, data: Value) -> Self {
        Self {
            kind: MessageKind::Ai,
            content: content.into(),
            data: Some(data),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: i64,
    pub session_id: String,
    pub payload: MessagePayload,
    pub created_at: DateTime<Utc>,
}

impl From<&StoredMessage> for Message {
    fn from(stored: &StoredMessage) -> Self {
        Self {
            role: match stored.payload.kind {
                MessageKind::Human => MessageRole::User,
                MessageKind::Ai => MessageRole::Assistant,
            },
            content: stored.payload.content.clone(),
            metadata: stored.payload.data.clone(),
        }
    }
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn append(
        &self,
        session_id: &str,
        payload: MessagePayload,
    ) -> Result<StoredMessage, HistoryStoreError>;

    /// The `limit` most recent messages of a session, oldest first.
    async fn recent(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, HistoryStoreError>;
}

#[derive(Default)]
pub struct InMemoryHistoryStore {
    rows: RwLock<Vec<StoredMessage>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn append(
        &self,
        session_id: &str,
        payload: MessagePayload,
    ) -> Result<StoredMessage, HistoryStoreError> {
        let mut rows = self.rows.write().await;
        let stored = StoredMessage {
            id: rows.len() as i64 + 1,
            session_id: session_id.to_string(),
            payload,
            created_at: Utc::now(),
        };
        rows.push(stored.clone());
        Ok(stored)
    }

    async fn recent(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, HistoryStoreError> {
        let rows = self.rows.read().await;
        let mut selected = rows
            .iter()
            .rev()
            .filter(|row| row.session_id == session_id)
            .take(limit)
            .cloned()
            .collect::<Vec<StoredMessage>>();
        selected.reverse();
        Ok(selected)
    }
}

pub struct SqliteHistoryStore {
    pool: SqlitePool,
}

impl SqliteHistoryStore {
    pub async fn open(db_url: &str) -> Result<Self> {
        let pool = open_sqlite_pool(db_url).await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .context("failed to create sqlite messages table")?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_session_created
             ON messages (session_id, created_at)",
        )
        .execute(&pool)
        .await
        .context("failed to create sqlite messages index")?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn append(
        &self,
        session_id: &str,
        payload: MessagePayload,
    ) -> Result<StoredMessage, HistoryStoreError> {
        let store_err = |reason: String| HistoryStoreError::Store {
            session_id: session_id.to_string(),
            reason,
        };
        let document = serde_json::to_string(&payload).map_err(|err| store_err(err.to_string()))?;
        let created_at = Utc::now();

        let result = sqlx::query(
            "INSERT INTO messages (session_id, message, created_at) VALUES (?1, ?2, ?3)",
        )
        .bind(session_id)
        .bind(&document)
        .bind(created_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .execute(&self.pool)
        .await
        .map_err(|err| store_err(err.to_string()))?;

        Ok(StoredMessage {
            id: result.last_insert_rowid(),
            session_id: session_id.to_string(),
            payload,
            created_at,
        })
    }

    async fn recent(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, HistoryStoreError> {
        let fetch_err = |reason: String| HistoryStoreError::Fetch {
            session_id: session_id.to_string(),
            reason,
        };

        let rows = sqlx::query_as::<_, (i64, String, String, String)>(
            "SELECT id, session_id, message, created_at FROM messages
             WHERE session_id = ?1
             ORDER BY created_at DESC, id DESC
             LIMIT ?2",
        )
        .bind(session_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|err| fetch_err(err.to_string()))?;

        let mut messages = rows
            .into_iter()
            .map(|(id, session_id, document, created_at)| {
                let payload = serde_json::from_str::<MessagePayload>(&document)
                    .map_err(|err| fetch_err(format!("message {id} is malformed: {err}")))?;
                let created_at = DateTime::parse_from_rfc3339(&created_at)
                    .map_err(|err| fetch_err(format!("message {id} has bad timestamp: {err}")))?
                    .with_timezone(&Utc);
                Ok(StoredMessage {
                    id,
                    session_id,
                    payload,
                    created_at,
                })
            })
            .collect::<Result<Vec<StoredMessage>, HistoryStoreError>>()?;
        messages.reverse();
        Ok(messages)
    }
}

pub async fn build_history_store(cfg: &RuntimeConfig) -> Result<Arc<dyn HistoryStore>> {
    let store = SqliteHistoryStore::open(&cfg.history_db_url)
        .await
        .with_context(|| {
            format!(
                "failed to open history store at {}",
                display_db_url(cfg, &cfg.history_db_url)
            )
        })?;
    Ok(Arc::new(store))
}

pub async fn open_sqlite_pool(db_url: &str) -> Result<SqlitePool> {
    ensure_parent_dir_for_sqlite_url(db_url)?;
    let options = SqliteConnectOptions::from_str(db_url)
        .context("invalid sqlite database url")?
        .create_if_missing(true);

    // Every in-memory connection is its own database, so keep exactly one alive.
    let pool_options = if db_url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(4)
    };

    pool_options
        .connect_with(options)
        .await
        .context("failed to open sqlite database")
}

pub fn ensure_parent_dir_for_sqlite_url(db_url: &str) -> Result<()> {
    let Some(db_path) = sqlite_path_from_url(db_url) else {
        return Ok(());
    };

    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).with_context(|| {
            format!(
                "failed to create directory for sqlite database: {}",
                parent.display()
            )
        })?;
    }
    Ok(())
}

pub fn sqlite_path_from_url(db_url: &str) -> Option<PathBuf> {
    let path = db_url.strip_prefix("sqlite://")?;
    let path = path.split_once('?').map_or(path, |(path, _)| path);
    if path.is_empty() || path == ":memory:" {
        return None;
    }
    Some(Path::new(path).to_path_buf())
}

pub async fn run_sessions_show(
    cfg: &RuntimeConfig,
    session_id_override: Option<String>,
    recent: usize,
) -> Result<()> {
    let session_id = session_id_override.unwrap_or_else(|| cfg.session_id.clone());
    let store = build_history_store(cfg).await?;
    let messages = store.recent(&session_id, recent.max(1)).await?;

    println!(
        "Session '{}' ({} message(s), store={}):",
        session_id,
        messages.len(),
        display_db_url(cfg, &cfg.history_db_url)
    );
    if messages.is_empty() {
        println!("No messages in this session.");
        return Ok(());
    }

    for message in &messages {
        print_stored_message(message);
    }
    Ok(())
}

fn print_stored_message(message: &StoredMessage) {
    let kind = match message.payload.kind {
        MessageKind::Human => "human",
        MessageKind::Ai => "ai",
    };
    println!("[{}] {kind}", message.created_at.to_rfc3339());
    println!("{}", message.payload.content);
    if let Some(data) = &message.payload.data {
        println!("data: {data}");
    }
    println!();
}
