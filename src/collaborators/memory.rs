//! In-process memory and session-history stores.
//!
//! Neither store persists anything; both are safe to share between
//! concurrent requests. Both keep a bounded number of entries and drop the
//! oldest first.

use super::{HistoryEntry, MemoryStore, SessionHistory};
use crate::error::Result;
use crate::state::MemorySnippet;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;

fn tokens(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(str::to_lowercase)
        .collect()
}

/// Snippets kept by [`InMemoryMemoryStore::new`].
pub const DEFAULT_MEMORY_CAPACITY: usize = 1000;

/// Entries kept per session by [`InMemorySessionHistory::new`].
pub const DEFAULT_HISTORY_PER_SESSION: usize = 50;

/// Ranks stored snippets by how many words they share with the query.
#[derive(Debug)]
pub struct InMemoryMemoryStore {
    entries: RwLock<Vec<MemorySnippet>>,
    capacity: usize,
}

impl Default for InMemoryMemoryStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_CAPACITY)
    }
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `capacity` snippets (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<MemorySnippet>> {
        let wanted = tokens(query);
        let entries = self.entries.read().await;

        let mut scored: Vec<(usize, usize, &MemorySnippet)> = entries
            .iter()
            .enumerate()
            .filter_map(|(i, snippet)| {
                let overlap = tokens(&snippet.text).intersection(&wanted).count();
                (overlap > 0).then_some((overlap, i, snippet))
            })
            .collect();
        // Best overlap first, newer entries break ties.
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));

        Ok(scored.into_iter().take(k).map(|(_, _, s)| s.clone()).collect())
    }

    async fn add(&self, text: &str, metadata: Map<String, Value>) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.push(MemorySnippet {
            text: text.to_string(),
            metadata,
        });
        drop_oldest(&mut entries, self.capacity);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().await.clear();
        Ok(())
    }
}

/// Keeps each session's most recent exchanges in insertion order.
#[derive(Debug)]
pub struct InMemorySessionHistory {
    sessions: RwLock<HashMap<String, Vec<HistoryEntry>>>,
    per_session: usize,
}

impl Default for InMemorySessionHistory {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_PER_SESSION)
    }
}

impl InMemorySessionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `per_session` entries for each session (at least one).
    pub fn with_capacity(per_session: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            per_session: per_session.max(1),
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

fn drop_oldest<T>(entries: &mut Vec<T>, capacity: usize) {
    if entries.len() > capacity {
        let excess = entries.len() - capacity;
        entries.drain(..excess);
    }
}

#[async_trait]
impl SessionHistory for InMemorySessionHistory {
    async fn recent(&self, session_id: &str, limit: usize) -> Result<Vec<HistoryEntry>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(session_id)
            .map(|entries| entries.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn append(&self, session_id: &str, entry: HistoryEntry) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let entries = sessions.entry(session_id.to_string()).or_default();
        entries.push(entry);
        drop_oldest(entries, self.per_session);
        Ok(())
    }

    async fn clear(&self, session_id: &str) -> Result<()> {
        self.sessions.write().await.remove(session_id);
        Ok(())
    }
}
