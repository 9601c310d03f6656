//! Transcript state for one session.
//!
//! Items are created at most once per item id and never mutated after they
//! are marked done, except for guardrail annotation. Streaming deltas are
//! folded into a per-item running total immediately (classification reads
//! that), while the visible text is committed from a pending buffer at most
//! once per throttle window so a burst of deltas coalesces into one client
//! update.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use super::guardrail::GuardrailVerdict;
use crate::core::{SessionEvent, SessionEventSink};

/// Speaker role of a transcript item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// Lifecycle of a transcript item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    /// Text still accumulating
    Streaming,
    /// Finalized; only guardrail annotation may follow
    Done,
}

/// One transcript entry as surfaced to the client layer.
#[derive(Debug, Clone)]
pub struct TranscriptItem {
    pub item_id: String,
    pub role: Role,
    pub text: String,
    pub status: ItemStatus,
    pub guardrail: Option<GuardrailVerdict>,
}

struct Entry {
    item: TranscriptItem,
    /// Full accumulation, updated on every delta
    running: String,
    /// Deltas not yet committed to the visible text
    pending: String,
    last_flush: Option<Instant>,
    flush_scheduled: bool,
}

struct Inner {
    entries: HashMap<String, Entry>,
}

/// Shared transcript store. Cheap to clone.
#[derive(Clone)]
pub struct TranscriptStore {
    inner: Arc<Mutex<Inner>>,
    throttle: Duration,
    sink: SessionEventSink,
}

impl TranscriptStore {
    pub fn new(throttle: Duration, sink: SessionEventSink) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: HashMap::new(),
            })),
            throttle,
            sink,
        }
    }

    /// Create an item. Returns false (and changes nothing) if the id is
    /// already known.
    pub fn insert(&self, item_id: &str, role: Role, initial_text: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(item_id) {
            return false;
        }
        let item = TranscriptItem {
            item_id: item_id.to_string(),
            role,
            text: initial_text.to_string(),
            status: ItemStatus::Streaming,
            guardrail: None,
        };
        self.emit(&item);
        inner.entries.insert(
            item_id.to_string(),
            Entry {
                item,
                running: String::new(),
                pending: String::new(),
                last_flush: None,
                flush_scheduled: false,
            },
        );
        true
    }

    /// Whether the id is known.
    pub fn contains(&self, item_id: &str) -> bool {
        self.inner.lock().entries.contains_key(item_id)
    }

    /// Snapshot of one item.
    pub fn get(&self, item_id: &str) -> Option<TranscriptItem> {
        self.inner.lock().entries.get(item_id).map(|e| e.item.clone())
    }

    /// Append a streaming delta. Returns the running total including this
    /// delta; the visible text catches up at the next flush window.
    pub fn append_delta(&self, item_id: &str, delta: &str) -> String {
        let mut inner = self.inner.lock();
        let entry = inner.entries.entry(item_id.to_string()).or_insert_with(|| Entry {
            item: TranscriptItem {
                item_id: item_id.to_string(),
                role: Role::Assistant,
                text: String::new(),
                status: ItemStatus::Streaming,
                guardrail: None,
            },
            running: String::new(),
            pending: String::new(),
            last_flush: None,
            flush_scheduled: false,
        });

        if entry.item.status == ItemStatus::Done {
            // Late delta for a finalized item; the running total still
            // reflects it for classification, the visible text does not.
            entry.running.push_str(delta);
            return entry.running.clone();
        }

        entry.running.push_str(delta);
        entry.pending.push_str(delta);
        let running = entry.running.clone();

        let now = Instant::now();
        let due = match entry.last_flush {
            None => true,
            Some(last) => now.duration_since(last) >= self.throttle,
        };
        if due {
            Self::commit(entry, now);
            self.emit(&entry.item);
        } else if !entry.flush_scheduled {
            entry.flush_scheduled = true;
            let elapsed = entry.last_flush.map(|l| now.duration_since(l)).unwrap_or_default();
            let wait = self.throttle.saturating_sub(elapsed);
            let store = self.clone();
            let id = item_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                store.flush(&id);
            });
        }

        running
    }

    /// Commit any pending deltas for one item.
    pub fn flush(&self, item_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(item_id) {
            entry.flush_scheduled = false;
            if entry.pending.is_empty() {
                return;
            }
            Self::commit(entry, Instant::now());
            self.emit(&entry.item);
        }
    }

    fn commit(entry: &mut Entry, now: Instant) {
        entry.item.text.push_str(&entry.pending);
        entry.pending.clear();
        entry.last_flush = Some(now);
    }

    /// Replace the item's text wholesale and mark it done.
    pub fn finalize_text(&self, item_id: &str, text: &str) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(item_id) {
            if entry.item.status == ItemStatus::Done {
                return;
            }
            entry.pending.clear();
            entry.running = text.to_string();
            entry.item.text = text.to_string();
            entry.item.status = ItemStatus::Done;
            self.emit(&entry.item);
        }
    }

    /// Commit outstanding deltas and mark the item done.
    pub fn mark_done(&self, item_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(item_id) {
            if entry.item.status == ItemStatus::Done {
                return;
            }
            Self::commit(entry, Instant::now());
            entry.item.status = ItemStatus::Done;
            self.emit(&entry.item);
        }
    }

    /// Attach a guardrail verdict. Allowed after the item is done.
    pub fn annotate_guardrail(&self, item_id: &str, verdict: GuardrailVerdict) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(item_id) {
            entry.item.guardrail = Some(verdict);
            self.emit(&entry.item);
        }
    }

    fn emit(&self, item: &TranscriptItem) {
        let _ = self.sink.send(SessionEvent::TranscriptUpsert {
            item_id: item.item_id.clone(),
            role: item.role,
            text: item.text.clone(),
            status: item.status,
            guardrail_flagged: item.guardrail.as_ref().map(|g| g.flagged),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn store(throttle_ms: u64) -> (TranscriptStore, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TranscriptStore::new(Duration::from_millis(throttle_ms), tx), rx)
    }

    fn drain_upserts(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn test_insert_is_at_most_once() {
        let (store, _rx) = store(100);
        assert!(store.insert("item-1", Role::User, ""));
        assert!(!store.insert("item-1", Role::User, "other"));
        assert_eq!(store.get("item-1").unwrap().text, "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_deltas_coalesces_but_loses_nothing() {
        let (store, mut rx) = store(100);
        store.insert("item-1", Role::Assistant, "");
        drain_upserts(&mut rx);

        for delta in ["H", "e", "l", "l", "o", " ", "w", "o", "r", "l", "d"] {
            store.append_delta("item-1", delta);
        }

        // First delta committed immediately, the rest are pending.
        assert_eq!(store.get("item-1").unwrap().text, "H");

        // Let the scheduled flush run.
        tokio::time::sleep(Duration::from_millis(150)).await;
        tokio::task::yield_now().await;

        assert_eq!(store.get("item-1").unwrap().text, "Hello world");

        // 11 deltas, but at most two visible updates (immediate + window).
        let updates = drain_upserts(&mut rx);
        assert!(updates.len() <= 2, "got {} updates", updates.len());
    }

    #[tokio::test]
    async fn test_running_total_is_always_current() {
        let (store, _rx) = store(1000);
        store.insert("item-1", Role::Assistant, "");
        store.append_delta("item-1", "unsafe ");
        let running = store.append_delta("item-1", "content");
        assert_eq!(running, "unsafe content");
        // Visible text lags behind the running total.
        assert_ne!(store.get("item-1").unwrap().text, running);
    }

    #[tokio::test]
    async fn test_finalize_replaces_placeholder() {
        let (store, _rx) = store(100);
        store.insert("item-1", Role::User, "[Transcribing...]");
        store.finalize_text("item-1", "take me to the pier");
        let item = store.get("item-1").unwrap();
        assert_eq!(item.text, "take me to the pier");
        assert_eq!(item.status, ItemStatus::Done);

        // Finalized items are not rewritten.
        store.finalize_text("item-1", "garbage");
        assert_eq!(store.get("item-1").unwrap().text, "take me to the pier");
    }

    #[tokio::test]
    async fn test_mark_done_commits_pending() {
        let (store, _rx) = store(10_000);
        store.insert("item-1", Role::Assistant, "");
        store.append_delta("item-1", "partial");
        store.append_delta("item-1", " answer");
        store.mark_done("item-1");
        let item = store.get("item-1").unwrap();
        assert_eq!(item.text, "partial answer");
        assert_eq!(item.status, ItemStatus::Done);
    }

    #[tokio::test]
    async fn test_guardrail_annotation_after_done() {
        let (store, _rx) = store(100);
        store.insert("item-1", Role::Assistant, "");
        store.mark_done("item-1");
        store.annotate_guardrail(
            "item-1",
            GuardrailVerdict {
                flagged: true,
                category: Some("test".to_string()),
            },
        );
        assert!(store.get("item-1").unwrap().guardrail.unwrap().flagged);
    }
}
