//! Task registry - maps task ids to their delegate records
//!
//! The lock is held only around map access, never while a handler or
//! completion callback runs.

use crate::engine::TaskDelegate;
use netsession_types::TaskId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default)]
pub struct TaskRegistry {
    records: RwLock<HashMap<TaskId, Arc<TaskDelegate>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the record for a task that has not started yet
    ///
    /// # Panics
    /// If a record is already registered for the same task id.
    pub fn register(&self, record: Arc<TaskDelegate>) {
        let id = record.task_id();
        let mut records = self.records.write();
        assert!(
            !records.contains_key(&id),
            "task {} is already registered",
            id
        );
        records.insert(id, record);
        debug!("Registered task {}", id);
    }

    pub fn lookup(&self, id: TaskId) -> Option<Arc<TaskDelegate>> {
        self.records.read().get(&id).cloned()
    }

    pub fn remove(&self, id: TaskId) -> Option<Arc<TaskDelegate>> {
        let removed = self.records.write().remove(&id);
        if removed.is_some() {
            debug!("Evicted task {}", id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}
