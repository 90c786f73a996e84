//! Call-log persistence collaborator.
//!
//! Bookkeeping for outgoing calls only. Store failures are logged by the
//! session manager and never abort a call.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::types::{CallType, RoomId, UserId};

/// Opaque handle to a persisted call-log record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct CallLogId(String);

impl CallLogId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallLogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Final outcome recorded against a call-log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallLogStatus {
    Completed,
    Rejected,
    Failed,
    /// Setup timed out without an answer.
    NoAnswer,
    /// Caller hung up before the peer answered.
    Cancelled,
}

/// Record created when an outgoing call starts.
#[derive(Debug, Clone)]
pub struct NewCallLog {
    pub caller_id: UserId,
    pub receiver_id: UserId,
    pub call_type: CallType,
    pub room_id: RoomId,
}

#[async_trait]
pub trait CallLogStore: Send + Sync {
    async fn create(&self, entry: NewCallLog) -> Result<CallLogId, anyhow::Error>;

    async fn update(
        &self,
        id: &CallLogId,
        status: CallLogStatus,
        duration_secs: Option<u64>,
    ) -> Result<(), anyhow::Error>;
}

/// A stored call-log record, as kept by [`InMemoryCallLog`].
#[derive(Debug, Clone)]
pub struct CallLogRecord {
    pub id: CallLogId,
    pub entry: NewCallLog,
    pub status: Option<CallLogStatus>,
    pub duration_secs: Option<u64>,
}

/// In-memory store for tests and local experiments.
#[derive(Default)]
pub struct InMemoryCallLog {
    records: Mutex<Vec<CallLogRecord>>,
    next_id: AtomicU64,
}

impl InMemoryCallLog {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    pub async fn records(&self) -> Vec<CallLogRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl CallLogStore for InMemoryCallLog {
    async fn create(&self, entry: NewCallLog) -> Result<CallLogId, anyhow::Error> {
        let id = CallLogId::new(format!("log-{}", self.next_id.fetch_add(1, Ordering::Relaxed)));
        self.records.lock().await.push(CallLogRecord {
            id: id.clone(),
            entry,
            status: None,
            duration_secs: None,
        });
        Ok(id)
    }

    async fn update(
        &self,
        id: &CallLogId,
        status: CallLogStatus,
        duration_secs: Option<u64>,
    ) -> Result<(), anyhow::Error> {
        let mut records = self.records.lock().await;
        let record = records
            .iter_mut()
            .find(|r| &r.id == id)
            .ok_or_else(|| anyhow::anyhow!("no call log with id {id}"))?;
        record.status = Some(status);
        record.duration_secs = duration_secs;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> NewCallLog {
        NewCallLog {
            caller_id: UserId::new("alice"),
            receiver_id: UserId::new("bob"),
            call_type: CallType::Voice,
            room_id: RoomId::new("r1"),
        }
    }

    #[tokio::test]
    async fn test_create_then_update() {
        let store = InMemoryCallLog::new();
        let id = store.create(sample_entry()).await.unwrap();

        store
            .update(&id, CallLogStatus::Completed, Some(120))
            .await
            .unwrap();

        let records = store.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, Some(CallLogStatus::Completed));
        assert_eq!(records[0].duration_secs, Some(120));
    }

    #[tokio::test]
    async fn test_update_unknown_id_fails() {
        let store = InMemoryCallLog::new();
        let missing = CallLogId::new("log-404");
        assert!(
            store
                .update(&missing, CallLogStatus::Failed, None)
                .await
                .is_err()
        );
    }
}
