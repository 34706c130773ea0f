// Asynchronous audit trail for model exchanges.
//
// The battle log is the source of truth; audit rows are derived from entries
// that are already committed, so the interactions table can trail the log but
// never lead it. Entries carry a pre-assigned id so the HTTP response can
// name the row before it exists.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use uuid::Uuid;

use crate::db::{Database, InteractionKind};
use crate::metrics;

/// A pending audit write.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub interaction_id: String,
    pub user_id: String,
    pub battle_id: Option<String>,
    pub kind: InteractionKind,
    pub user_input: Option<String>,
    pub llm_output: Option<String>,
    pub context: Option<Value>,
}

impl AuditEntry {
    /// An audit record for one committed turn.
    pub fn for_turn(user_id: &str, battle_id: &str, user_input: &str, llm_output: &str) -> Self {
        Self {
            interaction_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            battle_id: Some(battle_id.to_string()),
            kind: InteractionKind::Text,
            user_input: Some(user_input.to_string()),
            llm_output: Some(llm_output.to_string()),
            context: None,
        }
    }

    /// An audit record for an initial-setup interaction.
    pub fn for_initial(user_id: &str, context: Option<Value>) -> Self {
        Self {
            interaction_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            battle_id: None,
            kind: InteractionKind::Initial,
            user_input: None,
            llm_output: None,
            context,
        }
    }
}

/// Thread-safe FIFO queue of pending audit writes.
#[derive(Debug, Clone)]
pub struct AuditQueue {
    inner: Arc<Mutex<VecDeque<AuditEntry>>>,
}

impl AuditQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Add an entry to the back of the queue.
    pub fn enqueue(&self, entry: AuditEntry) {
        let mut queue = self.inner.lock().unwrap();
        queue.push_back(entry);
        metrics::AUDIT_QUEUE_DEPTH.set(queue.len() as i64);
    }

    /// Remove and return the next entry from the front of the queue.
    pub fn dequeue(&self) -> Option<AuditEntry> {
        let mut queue = self.inner.lock().unwrap();
        let result = queue.pop_front();
        metrics::AUDIT_QUEUE_DEPTH.set(queue.len() as i64);
        result
    }

    /// Get the current queue depth.
    pub fn depth(&self) -> usize {
        let queue = self.inner.lock().unwrap();
        queue.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        let queue = self.inner.lock().unwrap();
        queue.is_empty()
    }
}

impl Default for AuditQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Attempts per entry before it is dropped with an error log.
const WRITE_ATTEMPTS: usize = 3;

/// Insert one audit entry into the interactions table.
pub async fn write_audit_entry(db: &Database, entry: &AuditEntry) -> Result<(), sqlx::Error> {
    let context = entry.context.as_ref().map(|v| v.to_string());
    db.create_interaction(
        &entry.interaction_id,
        &entry.user_id,
        entry.battle_id.as_deref(),
        entry.kind,
        entry.user_input.as_deref(),
        entry.llm_output.as_deref(),
        context.as_deref(),
    )
    .await?;
    Ok(())
}

/// Spawn a background task that drains the queue and writes audit rows.
/// Best effort: a write that keeps failing is logged and dropped.
pub fn spawn_audit_worker(db: Arc<Database>, queue: AuditQueue) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;

            while let Some(entry) = queue.dequeue() {
                let mut written = false;
                for attempt in 1..=WRITE_ATTEMPTS {
                    match write_audit_entry(&db, &entry).await {
                        Ok(()) => {
                            metrics::AUDIT_WRITES_TOTAL.inc();
                            written = true;
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(
                                "Audit write {} failed (attempt {attempt}/{WRITE_ATTEMPTS}): {e}",
                                entry.interaction_id
                            );
                            tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;
                        }
                    }
                }
                if !written {
                    metrics::AUDIT_WRITE_FAILURES_TOTAL.inc();
                    tracing::error!(
                        "Dropping audit entry {} for user {} after {WRITE_ATTEMPTS} attempts",
                        entry.interaction_id,
                        entry.user_id
                    );
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_queue_enqueue_dequeue() {
        let queue = AuditQueue::new();

        assert!(queue.is_empty());
        assert_eq!(queue.depth(), 0);
        assert!(queue.dequeue().is_none());

        queue.enqueue(AuditEntry::for_turn("u1", "b1", "deploy", "advance"));
        assert!(!queue.is_empty());
        assert_eq!(queue.depth(), 1);

        queue.enqueue(AuditEntry::for_initial("u2", Some(json!({"mission": 1}))));
        assert_eq!(queue.depth(), 2);

        // FIFO: the turn entry comes out first
        let first = queue.dequeue().unwrap();
        assert_eq!(first.user_id, "u1");
        assert_eq!(first.kind, InteractionKind::Text);

        let second = queue.dequeue().unwrap();
        assert_eq!(second.user_id, "u2");
        assert_eq!(second.kind, InteractionKind::Initial);

        assert!(queue.is_empty());
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_entries_have_distinct_preassigned_ids() {
        let a = AuditEntry::for_turn("u", "b", "x", "y");
        let b = AuditEntry::for_turn("u", "b", "x", "y");
        assert_ne!(a.interaction_id, b.interaction_id);
    }

    #[tokio::test]
    async fn test_write_audit_entry_uses_preassigned_id() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let user = db.create_user("player", None, None, None).await.unwrap();

        let entry = AuditEntry::for_turn(&user.id, "battle-1", "deploy", "advance");
        write_audit_entry(&db, &entry).await.unwrap();

        let rows = db.list_interactions_for_user(&user.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, entry.interaction_id);
        assert_eq!(rows[0].kind, "text");
        assert_eq!(rows[0].battle_id.as_deref(), Some("battle-1"));
        assert_eq!(rows[0].llm_output.as_deref(), Some("advance"));
    }

    #[tokio::test]
    async fn test_write_initial_entry_stores_context() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let user = db.create_user("player", None, None, None).await.unwrap();

        let entry = AuditEntry::for_initial(&user.id, Some(json!({"mission": "purge"})));
        write_audit_entry(&db, &entry).await.unwrap();

        let rows = db.list_interactions_for_user(&user.id).await.unwrap();
        assert_eq!(rows[0].kind, "initial");
        assert_eq!(
            rows[0].context.as_deref(),
            Some("{\"mission\":\"purge\"}")
        );
    }
}
