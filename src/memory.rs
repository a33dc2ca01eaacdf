use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use sqlx::sqlite::SqlitePool;
use tokio::sync::RwLock;

use crate::cli::{MemoryBackend, MemoryFailurePolicy};
use crate::config::{RuntimeConfig, display_db_url};
use crate::error::MemoryStoreError;
use crate::history::{MessageRole, open_sqlite_pool};

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRecord {
    pub id: i64,
    pub memory: String,
    pub score: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryMessage {
    pub role: MessageRole,
    pub content: String,
}

impl MemoryMessage {
    fn role_label(&self) -> &'static str {
        match self.role {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// Long-term, per-user memory keyed by relevance to a query.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn search(
        &self,
        query: &str,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>, MemoryStoreError>;

    async fn add(
        &self,
        messages: &[MemoryMessage],
        user_id: &str,
    ) -> Result<(), MemoryStoreError>;
}

pub struct DisabledMemoryStore;

#[async_trait]
impl MemoryStore for DisabledMemoryStore {
    fn backend_name(&self) -> &'static str {
        "disabled"
    }

    async fn search(
        &self,
        _query: &str,
        _user_id: &str,
        _limit: usize,
    ) -> Result<Vec<MemoryRecord>, MemoryStoreError> {
        Ok(Vec::new())
    }

    async fn add(
        &self,
        _messages: &[MemoryMessage],
        _user_id: &str,
    ) -> Result<(), MemoryStoreError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct MemoryRow {
    id: i64,
    user_id: String,
    content: String,
}

#[derive(Default)]
pub struct InMemoryMemoryStore {
    rows: RwLock<Vec<MemoryRow>>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn search(
        &self,
        query: &str,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>, MemoryStoreError> {
        let rows = self.rows.read().await;
        let candidates = rows
            .iter()
            .rev()
            .filter(|row| row.user_id == user_id)
            .map(|row| (row.id, row.content.as_str()));
        Ok(rank_memories(query, candidates, limit))
    }

    async fn add(
        &self,
        messages: &[MemoryMessage],
        user_id: &str,
    ) -> Result<(), MemoryStoreError> {
        let mut rows = self.rows.write().await;
        for message in messages.iter().filter(|m| !m.content.trim().is_empty()) {
            let id = rows.len() as i64 + 1;
            rows.push(MemoryRow {
                id,
                user_id: user_id.to_string(),
                content: message.content.trim().to_string(),
            });
        }
        Ok(())
    }
}

pub struct SqliteMemoryStore {
    pool: SqlitePool,
}

impl SqliteMemoryStore {
    pub async fn open(db_url: &str) -> Result<Self> {
        let pool = open_sqlite_pool(db_url).await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS memories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .context("failed to create sqlite memories table")?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_memories_user ON memories (user_id)")
            .execute(&pool)
            .await
            .context("failed to create sqlite memories index")?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn search(
        &self,
        query: &str,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>, MemoryStoreError> {
        let rows = sqlx::query_as::<_, (i64, String)>(
            "SELECT id, content FROM memories WHERE user_id = ?1 ORDER BY id DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| MemoryStoreError::Search(err.to_string()))?;

        let candidates = rows.iter().map(|(id, content)| (*id, content.as_str()));
        Ok(rank_memories(query, candidates, limit))
    }

    async fn add(
        &self,
        messages: &[MemoryMessage],
        user_id: &str,
    ) -> Result<(), MemoryStoreError> {
        let commit_err = |err: sqlx::Error| MemoryStoreError::Commit(err.to_string());
        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);

        let mut tx = self.pool.begin().await.map_err(commit_err)?;
        for message in messages.iter().filter(|m| !m.content.trim().is_empty()) {
            sqlx::query(
                "INSERT INTO memories (user_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(user_id)
            .bind(message.role_label())
            .bind(message.content.trim())
            .bind(&created_at)
            .execute(&mut *tx)
            .await
            .map_err(commit_err)?;
        }
        tx.commit().await.map_err(commit_err)
    }
}

const STOPWORDS: &[&str] = &[
    "about", "and", "are", "but", "can", "did", "does", "for", "from", "has", "have", "how",
    "its", "not", "our", "should", "that", "the", "their", "this", "was", "what", "when", "where",
    "which", "who", "why", "will", "with", "you", "your",
];

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
}

/// Distinct lowercase words worth matching: longer than two characters and
/// not a stopword.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut terms = Vec::new();
    for token in tokens(query) {
        if token.chars().count() > 2
            && !STOPWORDS.contains(&token.as_str())
            && !terms.contains(&token)
        {
            terms.push(token);
        }
    }
    terms
}

/// Lexical relevance ranking over whole words. Candidates are expected newest
/// first so ties favour recent memories.
fn rank_memories<'a>(
    query: &str,
    candidates: impl Iterator<Item = (i64, &'a str)>,
    limit: usize,
) -> Vec<MemoryRecord> {
    let terms = query_terms(query);
    if terms.is_empty() || limit == 0 {
        return Vec::new();
    }

    let mut scored = candidates
        .filter_map(|(id, content)| {
            let score = tokens(content).filter(|token| terms.contains(token)).count();
            (score > 0).then(|| MemoryRecord {
                id,
                memory: content.to_string(),
                score,
            })
        })
        .collect::<Vec<MemoryRecord>>();

    scored.sort_by_key(|record| std::cmp::Reverse(record.score));
    scored.truncate(limit);
    scored
}

pub async fn build_memory_store(cfg: &RuntimeConfig) -> Result<Arc<dyn MemoryStore>> {
    match cfg.memory_backend {
        MemoryBackend::Disabled => Ok(Arc::new(DisabledMemoryStore)),
        MemoryBackend::Memory => Ok(Arc::new(InMemoryMemoryStore::new())),
        MemoryBackend::Sqlite => {
            let store = SqliteMemoryStore::open(&cfg.memory_db_url)
                .await
                .with_context(|| {
                    format!(
                        "failed to open memory store at {}",
                        display_db_url(cfg, &cfg.memory_db_url)
                    )
                })?;
            Ok(Arc::new(store))
        }
    }
}

pub async fn run_memory_search(cfg: &RuntimeConfig, query: &str, limit: usize) -> Result<()> {
    let store = build_memory_store(cfg).await?;
    let records = store.search(query, &cfg.user_id, limit.max(1)).await?;
    if records.is_empty() {
        println!(
            "No memories for user '{}' match '{}' (backend={}).",
            cfg.user_id,
            query,
            store.backend_name()
        );
        return Ok(());
    }

    println!("Memories for user '{}':", cfg.user_id);
    for record in records {
        println!("- [{}] (score {}) {}", record.id, record.score, record.memory);
    }
    Ok(())
}

pub async fn run_memory_add(cfg: &RuntimeConfig, text: &str) -> Result<()> {
    let store = build_memory_store(cfg).await?;
    store
        .add(
            &[MemoryMessage {
                role: MessageRole::User,
                content: text.to_string(),
            }],
            &cfg.user_id,
        )
        .await?;
    println!(
        "Stored memory for user '{}' (backend={}).",
        cfg.user_id,
        store.backend_name()
    );
    Ok(())
}

pub fn render_memory_context(memories: &[String]) -> Option<String> {
    if memories.is_empty() {
        return None;
    }
    let lines = memories
        .iter()
        .map(|memory| format!("- {memory}"))
        .collect::<Vec<String>>();
    Some(format!("User Memories:\n{}", lines.join("\n")))
}

/// Memory retrieval before a turn and commit after it.
#[derive(Clone)]
pub struct MemoryAugmentation {
    store: Arc<dyn MemoryStore>,
    limit: usize,
    failure_policy: MemoryFailurePolicy,
}

impl MemoryAugmentation {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        limit: usize,
        failure_policy: MemoryFailurePolicy,
    ) -> Self {
        Self {
            store,
            limit,
            failure_policy,
        }
    }

    pub fn store(&self) -> &Arc<dyn MemoryStore> {
        &self.store
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Returns at most `limit` snippets. Under the degrade policy a failing
    /// store yields no snippets instead of an error.
    pub async fn retrieve(
        &self,
        user_id: &str,
        query: &str,
    ) -> Result<Vec<String>, MemoryStoreError> {
        match self.store.search(query, user_id, self.limit).await {
            Ok(records) => Ok(records
                .into_iter()
                .take(self.limit)
                .map(|record| record.memory)
                .collect()),
            Err(err) => match self.failure_policy {
                MemoryFailurePolicy::Fail => Err(err),
                MemoryFailurePolicy::Degrade => {
                    tracing::warn!(
                        backend = self.store.backend_name(),
                        user_id,
                        error = %err,
                        "Memory retrieval failed; continuing without memories"
                    );
                    Ok(Vec::new())
                }
            },
        }
    }

    pub async fn commit(
        &self,
        user_id: &str,
        user_text: &str,
        assistant_text: &str,
    ) -> Result<(), MemoryStoreError> {
        let messages = [
            MemoryMessage {
                role: MessageRole::User,
                content: user_text.to_string(),
            },
            MemoryMessage {
                role: MessageRole::Assistant,
                content: assistant_text.to_string(),
            },
        ];
        self.store.add(&messages, user_id).await
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// A store whose every call fails.
    pub struct BrokenMemoryStore;

    #[async_trait]
    impl MemoryStore for BrokenMemoryStore {
        fn backend_name(&self) -> &'static str {
            "broken"
        }

        async fn search(
            &self,
            _query: &str,
            _user_id: &str,
            _limit: usize,
        ) -> Result<Vec<MemoryRecord>, MemoryStoreError> {
            Err(MemoryStoreError::Unavailable("connection refused".to_string()))
        }

        async fn add(
            &self,
            _messages: &[MemoryMessage],
            _user_id: &str,
        ) -> Result<(), MemoryStoreError> {
            Err(MemoryStoreError::Unavailable("connection refused".to_string()))
        }
    }

    async fn seeded_store() -> InMemoryMemoryStore {
        let store = InMemoryMemoryStore::new();
        let facts = [
            "Prefers quarterly pricing reviews",
            "Works on the Atlas product line",
            "Pricing meetings happen on Mondays",
            "Team uses Slack for updates",
            "Pricing for Atlas is usage based",
        ];
        for fact in facts {
            store
                .add(
                    &[MemoryMessage {
                        role: MessageRole::User,
                        content: fact.to_string(),
                    }],
                    "u-1",
                )
                .await
                .expect("seed");
        }
        store
    }

    #[tokio::test]
    async fn retrieve_is_capped_and_scoped_to_user() {
        let augmentation = MemoryAugmentation::new(
            Arc::new(seeded_store().await),
            2,
            MemoryFailurePolicy::Degrade,
        );
        let memories = augmentation
            .retrieve("u-1", "what is our pricing approach?")
            .await
            .expect("retrieve");
        assert_eq!(memories.len(), 2);
        assert!(memories.iter().all(|m| m.to_lowercase().contains("pricing")));

        let other = augmentation
            .retrieve("u-2", "pricing")
            .await
            .expect("retrieve");
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn failure_policy_controls_retrieval_errors() {
        let degrade =
            MemoryAugmentation::new(Arc::new(BrokenMemoryStore), 3, MemoryFailurePolicy::Degrade);
        assert!(degrade.retrieve("u", "anything").await.expect("degraded").is_empty());

        let fail =
            MemoryAugmentation::new(Arc::new(BrokenMemoryStore), 3, MemoryFailurePolicy::Fail);
        assert!(matches!(
            fail.retrieve("u", "anything").await,
            Err(MemoryStoreError::Unavailable(_))
        ));
    }

    #[test]
    fn memory_context_renders_bullets() {
        assert_eq!(render_memory_context(&[]), None);
        assert_eq!(
            render_memory_context(&["likes tea".to_string(), "lives in Oslo".to_string()]),
            Some("User Memories:\n- likes tea\n- lives in Oslo".to_string())
        );
    }

    #[test]
    fn query_terms_drop_stopwords_short_tokens_and_punctuation() {
        assert_eq!(
            query_terms("What's the Q3 plan, for Atlas? Atlas pricing"),
            vec!["plan", "atlas", "pricing"]
        );
        assert!(query_terms("what is the").is_empty());
    }

    #[test]
    fn ranking_matches_whole_words_only() {
        let candidates = [
            (3, "There is another option"),
            (2, "Pricing drives the plan"),
            (1, "Repricing later"),
        ];
        let ranked = rank_memories("pricing there", candidates.into_iter(), 5);
        let ids = ranked.iter().map(|record| record.id).collect::<Vec<i64>>();
        assert_eq!(ids, vec![3, 2]);

        assert!(rank_memories("the other", candidates.into_iter(), 5).is_empty());
    }

    #[tokio::test]
    async fn sqlite_store_persists_ranks_and_scopes_by_user() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("memories.db").display());
        let store = SqliteMemoryStore::open(&url).await.expect("open");

        let message = |role, content: &str| MemoryMessage {
            role,
            content: content.to_string(),
        };
        store
            .add(
                &[
                    message(MessageRole::User, "Atlas pricing is usage based"),
                    message(MessageRole::Assistant, "   "),
                ],
                "u-1",
            )
            .await
            .expect("add");
        store
            .add(
                &[
                    message(MessageRole::User, "Pricing review for Atlas pricing"),
                    message(MessageRole::Assistant, "Atlas launches in May"),
                ],
                "u-1",
            )
            .await
            .expect("add");
        store
            .add(&[message(MessageRole::User, "Atlas pricing is secret")], "u-2")
            .await
            .expect("add");

        let found = store.search("atlas pricing", "u-1", 10).await.expect("search");
        let memories = found.iter().map(|r| r.memory.as_str()).collect::<Vec<&str>>();
        assert_eq!(
            memories,
            vec![
                "Pricing review for Atlas pricing",
                "Atlas pricing is usage based",
                "Atlas launches in May",
            ]
        );
        assert_eq!(found[0].score, 3);

        let capped = store.search("atlas", "u-1", 1).await.expect("search");
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].memory, "Atlas launches in May");

        drop(store);
        let reopened = SqliteMemoryStore::open(&url).await.expect("reopen");
        assert_eq!(reopened.search("pricing", "u-2", 10).await.expect("search").len(), 1);
        assert!(reopened.search("pricing", "u-3", 10).await.expect("search").is_empty());
    }
}
