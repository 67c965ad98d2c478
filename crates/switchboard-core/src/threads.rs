//! In-process conversation thread store.
//!
//! Maps a conversation id to a bounded FIFO of recent messages so a
//! follow-up question can carry its context to the LM. Entries idle past
//! the TTL are removed by a periodic sweep. Nothing here survives a process
//! restart; threads are conversational sugar, not state of record.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::debug;

use switchboard_types::messages::LmRole;

struct ThreadEntry {
    messages: VecDeque<(LmRole, String)>,
    last_touched: Instant,
}

/// Bounded per-conversation message history with TTL eviction.
pub struct ThreadStore {
    max_messages: usize,
    ttl: Duration,
    threads: RwLock<HashMap<String, ThreadEntry>>,
}

impl ThreadStore {
    pub fn new(max_messages: usize, ttl: Duration) -> Self {
        Self {
            max_messages,
            ttl,
            threads: RwLock::new(HashMap::new()),
        }
    }

    /// Recent messages for a conversation, oldest first.
    pub async fn recent(&self, conversation_id: &str) -> Vec<(LmRole, String)> {
        let threads = self.threads.read().await;
        match threads.get(conversation_id) {
            Some(entry) => entry.messages.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Append one message, creating the thread on first use and truncating
    /// the oldest entries past the bound.
    pub async fn append(&self, conversation_id: &str, role: LmRole, text: impl Into<String>) {
        let mut threads = self.threads.write().await;
        let entry = threads
            .entry(conversation_id.to_string())
            .or_insert_with(|| ThreadEntry {
                messages: VecDeque::new(),
                last_touched: Instant::now(),
            });
        entry.messages.push_back((role, text.into()));
        while entry.messages.len() > self.max_messages {
            entry.messages.pop_front();
        }
        entry.last_touched = Instant::now();
    }

    /// Remove threads idle past the TTL. Returns how many were evicted.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let ttl = self.ttl;
        let mut threads = self.threads.write().await;
        let before = threads.len();
        threads.retain(|_, entry| now.duration_since(entry.last_touched) < ttl);
        let removed = before - threads.len();
        if removed > 0 {
            debug!(removed, remaining = threads.len(), "evicted idle threads");
        }
        removed
    }

    pub async fn active_threads(&self) -> usize {
        self.threads.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(bound: usize) -> ThreadStore {
        ThreadStore::new(bound, Duration::from_secs(86_400))
    }

    #[tokio::test]
    async fn unknown_conversation_is_empty() {
        assert!(store(3).recent("nope").await.is_empty());
    }

    #[tokio::test]
    async fn round_trip_preserves_order() {
        let store = store(10);
        store.append("c1", LmRole::User, "first question").await;
        store.append("c1", LmRole::Assistant, "first answer").await;
        store.append("c1", LmRole::User, "second question").await;

        // A follow-up exchange lands on top of K prior messages.
        store.append("c1", LmRole::Assistant, "second answer").await;

        let messages = store.recent("c1").await;
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0], (LmRole::User, "first question".to_string()));
        assert_eq!(messages[3], (LmRole::Assistant, "second answer".to_string()));
    }

    #[tokio::test]
    async fn bound_truncates_oldest() {
        let store = store(3);
        for i in 0..5 {
            store.append("c1", LmRole::User, format!("m{i}")).await;
        }
        let messages = store.recent("c1").await;
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].1, "m2");
        assert_eq!(messages[2].1, "m4");
    }

    #[tokio::test]
    async fn conversations_are_isolated() {
        let store = store(3);
        store.append("c1", LmRole::User, "for c1").await;
        store.append("c2", LmRole::User, "for c2").await;
        assert_eq!(store.recent("c1").await.len(), 1);
        assert_eq!(store.recent("c2").await[0].1, "for c2");
    }

    #[tokio::test]
    async fn sweep_evicts_idle_threads_only() {
        let store = ThreadStore::new(3, Duration::from_millis(40));
        store.append("old", LmRole::User, "stale").await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        store.append("fresh", LmRole::User, "current").await;

        let removed = store.sweep().await;
        assert_eq!(removed, 1);
        assert!(store.recent("old").await.is_empty());
        assert_eq!(store.recent("fresh").await.len(), 1);
    }

    #[tokio::test]
    async fn append_refreshes_ttl() {
        let store = ThreadStore::new(3, Duration::from_millis(80));
        store.append("c1", LmRole::User, "one").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.append("c1", LmRole::Assistant, "two").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // 100ms since creation but only 50ms since last touch.
        assert_eq!(store.sweep().await, 0);
        assert_eq!(store.recent("c1").await.len(), 2);
    }
}
