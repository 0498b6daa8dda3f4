//! Search audit trail

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::record::OwnerId;

/// One completed search
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchEvent {
    pub id: Uuid,
    pub caller: OwnerId,
    pub results_count: usize,
    pub searched_at: DateTime<Utc>,
}

impl SearchEvent {
    pub fn new(caller: OwnerId, results_count: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            caller,
            results_count,
            searched_at: Utc::now(),
        }
    }
}

/// Sink for search events
pub trait SearchAudit: Send + Sync {
    fn record_search(&self, event: SearchEvent) -> Result<()>;

    /// Searches recorded since `since` (all of them for `None`), if the
    /// sink keeps them
    fn count_searches(&self, _since: Option<DateTime<Utc>>) -> Option<usize> {
        None
    }
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAudit;

impl SearchAudit for NoopAudit {
    fn record_search(&self, _event: SearchEvent) -> Result<()> {
        Ok(())
    }
}

/// Keeps events in memory
#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    events: Mutex<Vec<SearchEvent>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Events recorded at or after `since`
    pub fn count_since(&self, since: DateTime<Utc>) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.searched_at >= since)
            .count()
    }

    pub fn events_for(&self, caller: &OwnerId) -> Vec<SearchEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| &e.caller == caller)
            .cloned()
            .collect()
    }
}

impl SearchAudit for InMemoryAuditLog {
    fn record_search(&self, event: SearchEvent) -> Result<()> {
        self.events.lock().push(event);
        Ok(())
    }

    fn count_searches(&self, since: Option<DateTime<Utc>>) -> Option<usize> {
        Some(match since {
            Some(since) => self.count_since(since),
            None => self.len(),
        })
    }
}
