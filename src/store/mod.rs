//! Session storage for chat threads.
//!
//! The [`SessionStore`] trait is the capability set the rest of the service
//! depends on: threads, append-only messages, per-thread token accounting,
//! and the set of databases a thread has actually consulted. The in-memory
//! [`MemoryStore`] is the shipped implementation; a persistent backend can
//! replace it without touching callers.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Errors from session store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The referenced thread does not exist.
    #[error("thread {0} not found")]
    ThreadNotFound(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    /// The human asking questions.
    User,
    /// The pipeline's reply.
    Server,
}

impl std::fmt::Display for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Server => write!(f, "server"),
        }
    }
}

/// A chat thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    /// Stable opaque identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// A message within a thread. Appended, never edited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Message identifier, unique within the process.
    pub id: String,
    /// Owning thread.
    pub thread_id: String,
    /// Who sent it.
    pub sender: Sender,
    /// Text content.
    pub content: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Optional pipeline metadata (plan, stage traces, outcome tag).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Aggregated token usage for a thread. Counters only ever grow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Total input tokens across all LLM calls.
    pub input_tokens: u64,
    /// Total output tokens across all LLM calls.
    pub output_tokens: u64,
    /// Sum of input and output tokens.
    pub total_tokens: u64,
    /// Number of successful LLM calls recorded.
    pub call_count: u64,
}

/// Abstract session store.
///
/// Implementations must be safe for concurrent callers within one process;
/// turns in distinct threads never contend.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a new thread with the given display name.
    async fn create_thread(&self, name: &str) -> Thread;

    /// Fetch a thread by id.
    async fn get_thread(&self, thread_id: &str) -> Option<Thread>;

    /// List all threads, newest first.
    async fn list_threads(&self) -> Vec<Thread>;

    /// Append a message to a thread.
    async fn add_message(
        &self,
        thread_id: &str,
        sender: Sender,
        content: &str,
        metadata: Option<serde_json::Value>,
    ) -> StoreResult<Message>;

    /// All messages for a thread, in insertion order.
    async fn get_messages(&self, thread_id: &str) -> StoreResult<Vec<Message>>;

    /// Add one LLM call's token counts to the thread's running totals.
    async fn add_token_usage(&self, thread_id: &str, input: u64, output: u64) -> StoreResult<()>;

    /// Current token totals for a thread.
    async fn get_token_usage(&self, thread_id: &str) -> StoreResult<TokenUsage>;

    /// Union the given database ids into the thread's used-db set.
    async fn add_used_databases(&self, thread_id: &str, db_ids: &[String]) -> StoreResult<()>;

    /// The thread's used-db set, sorted.
    async fn get_used_databases(&self, thread_id: &str) -> StoreResult<Vec<String>>;
}

#[derive(Debug, Default)]
struct ThreadEntry {
    messages: Vec<Message>,
    usage: TokenUsage,
    used_databases: BTreeSet<String>,
}

/// In-memory session store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    threads: Arc<RwLock<HashMap<String, Thread>>>,
    entries: Arc<RwLock<HashMap<String, ThreadEntry>>>,
}

impl MemoryStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_thread(&self, name: &str) -> Thread {
        let thread = Thread {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        self.threads
            .write()
            .insert(thread.id.clone(), thread.clone());
        self.entries
            .write()
            .insert(thread.id.clone(), ThreadEntry::default());
        thread
    }

    async fn get_thread(&self, thread_id: &str) -> Option<Thread> {
        self.threads.read().get(thread_id).cloned()
    }

    async fn list_threads(&self) -> Vec<Thread> {
        let mut threads: Vec<Thread> = self.threads.read().values().cloned().collect();
        threads.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        threads
    }

    async fn add_message(
        &self,
        thread_id: &str,
        sender: Sender,
        content: &str,
        metadata: Option<serde_json::Value>,
    ) -> StoreResult<Message> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(thread_id)
            .ok_or_else(|| StoreError::ThreadNotFound(thread_id.to_string()))?;

        let message = Message {
            id: Uuid::new_v4().to_string(),
            thread_id: thread_id.to_string(),
            sender,
            content: content.to_string(),
            created_at: Utc::now(),
            metadata,
        };
        entry.messages.push(message.clone());
        Ok(message)
    }

    async fn get_messages(&self, thread_id: &str) -> StoreResult<Vec<Message>> {
        let entries = self.entries.read();
        let entry = entries
            .get(thread_id)
            .ok_or_else(|| StoreError::ThreadNotFound(thread_id.to_string()))?;
        Ok(entry.messages.clone())
    }

    async fn add_token_usage(&self, thread_id: &str, input: u64, output: u64) -> StoreResult<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(thread_id)
            .ok_or_else(|| StoreError::ThreadNotFound(thread_id.to_string()))?;

        entry.usage.input_tokens += input;
        entry.usage.output_tokens += output;
        entry.usage.total_tokens += input + output;
        entry.usage.call_count += 1;
        Ok(())
    }

    async fn get_token_usage(&self, thread_id: &str) -> StoreResult<TokenUsage> {
        let entries = self.entries.read();
        let entry = entries
            .get(thread_id)
            .ok_or_else(|| StoreError::ThreadNotFound(thread_id.to_string()))?;
        Ok(entry.usage)
    }

    async fn add_used_databases(&self, thread_id: &str, db_ids: &[String]) -> StoreResult<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(thread_id)
            .ok_or_else(|| StoreError::ThreadNotFound(thread_id.to_string()))?;

        for db_id in db_ids {
            entry.used_databases.insert(db_id.clone());
        }
        Ok(())
    }

    async fn get_used_databases(&self, thread_id: &str) -> StoreResult<Vec<String>> {
        let entries = self.entries.read();
        let entry = entries
            .get(thread_id)
            .ok_or_else(|| StoreError::ThreadNotFound(thread_id.to_string()))?;
        Ok(entry.used_databases.iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_get_thread() {
        let store = MemoryStore::new();
        let thread = store.create_thread("Test Thread").await;

        let fetched = store.get_thread(&thread.id).await.unwrap();
        assert_eq!(fetched.name, "Test Thread");
        assert!(store.get_thread("nonexistent").await.is_none());
    }

    #[tokio::test]
    async fn test_threads_listed_newest_first() {
        let store = MemoryStore::new();
        let first = store.create_thread("first").await;
        let second = store.create_thread("second").await;

        let listed = store.list_threads().await;
        assert_eq!(listed.len(), 2);
        // Equal timestamps are possible at this resolution; both orders must
        // still contain both threads.
        let ids: Vec<&str> = listed.iter().map(|t| t.id.as_str()).collect();
        assert!(ids.contains(&first.id.as_str()));
        assert!(ids.contains(&second.id.as_str()));
    }

    #[tokio::test]
    async fn test_messages_append_in_order() {
        let store = MemoryStore::new();
        let thread = store.create_thread("t").await;

        store
            .add_message(&thread.id, Sender::User, "hello", None)
            .await
            .unwrap();
        store
            .add_message(&thread.id, Sender::Server, "hi there", None)
            .await
            .unwrap();

        let messages = store.get_messages(&thread.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].sender, Sender::User);
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[1].sender, Sender::Server);
    }

    #[tokio::test]
    async fn test_add_message_to_unknown_thread_fails() {
        let store = MemoryStore::new();
        let err = store
            .add_message("missing", Sender::User, "x", None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ThreadNotFound(_)));
    }

    #[tokio::test]
    async fn test_token_usage_is_additive() {
        let store = MemoryStore::new();
        let thread = store.create_thread("t").await;

        store.add_token_usage(&thread.id, 100, 50).await.unwrap();
        store.add_token_usage(&thread.id, 20, 10).await.unwrap();

        let usage = store.get_token_usage(&thread.id).await.unwrap();
        assert_eq!(usage.input_tokens, 120);
        assert_eq!(usage.output_tokens, 60);
        assert_eq!(usage.total_tokens, 180);
        assert_eq!(usage.call_count, 2);
    }

    #[tokio::test]
    async fn test_used_databases_are_a_sorted_set() {
        let store = MemoryStore::new();
        let thread = store.create_thread("t").await;

        store
            .add_used_databases(&thread.id, &["customer_db".into(), "accounts_db".into()])
            .await
            .unwrap();
        // Repeats are idempotent
        store
            .add_used_databases(&thread.id, &["customer_db".into()])
            .await
            .unwrap();

        let dbs = store.get_used_databases(&thread.id).await.unwrap();
        assert_eq!(dbs, vec!["accounts_db".to_string(), "customer_db".to_string()]);
    }
}
