//! In-memory task queue backed by a [`TaskStore`]
//!
//! The queue is the single writer of task records while the engine runs.
//! Every mutation is applied to a copy, persisted, and only then committed
//! to memory, so the in-memory view never runs ahead of what is on disk.

use std::collections::HashMap;
use tracing::{debug, info};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::store::SharedTaskStore;
use crate::task::{TaskRecord, TaskSpec, TaskStatus};

pub struct TaskQueue {
    tasks: HashMap<String, TaskRecord>,
    store: SharedTaskStore,
    next_seq: u64,
}

impl TaskQueue {
    /// Load every persisted record.
    pub fn open(store: SharedTaskStore) -> OrchestratorResult<Self> {
        let records = store.load_all()?;
        let next_seq = records.iter().map(|r| r.seq + 1).max().unwrap_or(0);
        let tasks = records.into_iter().map(|r| (r.id.clone(), r)).collect();
        Ok(Self {
            tasks,
            store,
            next_seq,
        })
    }

    /// Insert a new task. Re-enqueueing an existing ID is a no-op that
    /// returns `false`.
    pub fn enqueue(&mut self, spec: TaskSpec) -> OrchestratorResult<bool> {
        spec.validate()?;
        if self.tasks.contains_key(&spec.id) {
            debug!(task_id = %spec.id, "Task already queued, ignoring");
            return Ok(false);
        }

        let record = TaskRecord::new(spec, self.next_seq);
        self.store.upsert(&record)?;
        self.next_seq += 1;
        info!(
            task_id = %record.id,
            priority = record.priority,
            status = %record.status,
            "Task queued"
        );
        self.tasks.insert(record.id.clone(), record);
        Ok(true)
    }

    pub fn get(&self, id: &str) -> Option<&TaskRecord> {
        self.tasks.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Mutate one record. The closure runs on a copy; the change is kept
    /// only if it returns `Ok` and the store accepts it.
    pub fn update<R>(
        &mut self,
        id: &str,
        f: impl FnOnce(&mut TaskRecord) -> OrchestratorResult<R>,
    ) -> OrchestratorResult<R> {
        let current = self
            .tasks
            .get(id)
            .ok_or_else(|| OrchestratorError::task_not_found(id))?;
        let mut updated = current.clone();
        let result = f(&mut updated)?;
        if &updated != current {
            self.store.upsert(&updated)?;
            self.tasks.insert(id.to_string(), updated);
        }
        Ok(result)
    }

    pub fn set_prompt(&mut self, id: &str, prompt: impl Into<String>) -> OrchestratorResult<()> {
        let prompt = prompt.into();
        self.update(id, |task| task.set_prompt(prompt))
    }

    pub fn remove(&mut self, id: &str) -> OrchestratorResult<TaskRecord> {
        if !self.tasks.contains_key(id) {
            return Err(OrchestratorError::task_not_found(id));
        }
        self.store.remove(id)?;
        let removed = self
            .tasks
            .remove(id)
            .ok_or_else(|| OrchestratorError::task_not_found(id))?;
        info!(task_id = %id, "Task removed");
        Ok(removed)
    }

    /// Every task in view order: status group, then priority, then creation.
    pub fn all(&self) -> Vec<&TaskRecord> {
        let mut tasks: Vec<&TaskRecord> = self.tasks.values().collect();
        tasks.sort_by_key(|t| (t.status.sort_order(), t.sort_key()));
        tasks
    }

    /// Tasks with one status in scheduling order.
    pub fn by_status(&self, status: TaskStatus) -> Vec<&TaskRecord> {
        let mut tasks: Vec<&TaskRecord> =
            self.tasks.values().filter(|t| t.status == status).collect();
        tasks.sort_by_key(|t| t.sort_key());
        tasks
    }

    pub fn ids_with_status(&self, status: TaskStatus) -> Vec<String> {
        self.by_status(status)
            .into_iter()
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn count_running(&self) -> usize {
        self.tasks.values().filter(|t| t.status.is_active()).count()
    }

    /// Highest-priority admissible task, skipping IDs in `exclude`.
    pub fn next_ready(&self, exclude: &[String]) -> Option<&TaskRecord> {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Ready && t.has_prompt())
            .filter(|t| !exclude.contains(&t.id))
            .min_by_key(|t| t.sort_key())
    }

    /// Counts per status, in view order.
    pub fn summary(&self) -> Vec<(TaskStatus, usize)> {
        let mut counts: Vec<(TaskStatus, usize)> = TaskStatus::ALL
            .into_iter()
            .map(|s| (s, self.tasks.values().filter(|t| t.status == s).count()))
            .collect();
        counts.sort_by_key(|(s, _)| s.sort_order());
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{JsonTaskStore, MemoryTaskStore};
    use crate::task::TransitionCause;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn queue() -> TaskQueue {
        TaskQueue::open(Arc::new(MemoryTaskStore::new())).unwrap()
    }

    #[test]
    fn test_enqueue_is_idempotent() {
        let mut q = queue();
        assert!(q.enqueue(TaskSpec::new("a", "first", 5)).unwrap());
        assert!(!q.enqueue(TaskSpec::new("a", "second", 1)).unwrap());
        assert_eq!(q.len(), 1);
        assert_eq!(q.get("a").unwrap().prompt, "first");
        assert_eq!(q.get("a").unwrap().priority, 5);
    }

    #[test]
    fn test_enqueue_rejects_bad_id() {
        let mut q = queue();
        assert!(q.enqueue(TaskSpec::new("", "x", 1)).is_err());
        assert!(q.enqueue(TaskSpec::new("../etc", "x", 1)).is_err());
        assert!(q.is_empty());
    }

    #[test]
    fn test_next_ready_by_priority_then_creation() {
        let mut q = queue();
        q.enqueue(TaskSpec::new("late-high", "x", 10)).unwrap();
        q.enqueue(TaskSpec::new("low", "x", 5)).unwrap();
        q.enqueue(TaskSpec::new("tie-second", "x", 5)).unwrap();
        q.enqueue(TaskSpec::new("no-prompt", "", 1)).unwrap();

        assert_eq!(q.next_ready(&[]).unwrap().id, "low");
        assert_eq!(
            q.next_ready(&["low".to_string()]).unwrap().id,
            "tie-second"
        );
    }

    #[test]
    fn test_empty_prompt_never_next() {
        let mut q = queue();
        q.enqueue(TaskSpec::new("a", "", 1)).unwrap();
        assert!(q.next_ready(&[]).is_none());
        assert_eq!(q.get("a").unwrap().status, TaskStatus::NeedsPrompt);

        q.set_prompt("a", "now with words").unwrap();
        assert_eq!(q.next_ready(&[]).unwrap().id, "a");
    }

    #[test]
    fn test_failed_update_leaves_record_untouched() {
        let mut q = queue();
        q.enqueue(TaskSpec::new("a", "x", 1)).unwrap();
        let err = q.update("a", |t| {
            t.priority = 99;
            t.transition(TaskStatus::Done, TransitionCause::PhaseSettled)
        });
        assert!(err.is_err());
        assert_eq!(q.get("a").unwrap().priority, 1);
        assert_eq!(q.get("a").unwrap().status, TaskStatus::Ready);
    }

    #[test]
    fn test_all_sorted_by_view_order() {
        let mut q = queue();
        q.enqueue(TaskSpec::new("needs", "", 1)).unwrap();
        q.enqueue(TaskSpec::new("ready", "x", 1)).unwrap();
        q.enqueue(TaskSpec::new("running", "x", 1)).unwrap();
        q.update("running", |t| {
            t.transition(TaskStatus::Running, TransitionCause::Admitted)
        })
        .unwrap();

        let ids: Vec<&str> = q.all().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["running", "ready", "needs"]);
        assert_eq!(q.count_running(), 1);
        assert_eq!(q.ids_with_status(TaskStatus::Ready), vec!["ready".to_string()]);
    }

    #[test]
    fn test_reopen_preserves_records_and_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.json");
        {
            let mut q = TaskQueue::open(Arc::new(JsonTaskStore::new(&path))).unwrap();
            q.enqueue(TaskSpec::new("first", "x", 5)).unwrap();
            q.enqueue(TaskSpec::new("second", "x", 5)).unwrap();
        }

        let mut q = TaskQueue::open(Arc::new(JsonTaskStore::new(&path))).unwrap();
        assert_eq!(q.len(), 2);
        assert_eq!(q.next_ready(&[]).unwrap().id, "first");

        q.enqueue(TaskSpec::new("third", "x", 5)).unwrap();
        assert!(q.get("third").unwrap().seq > q.get("second").unwrap().seq);
    }

    #[test]
    fn test_remove() {
        let mut q = queue();
        q.enqueue(TaskSpec::new("a", "x", 1)).unwrap();
        assert_eq!(q.remove("a").unwrap().id, "a");
        assert!(matches!(
            q.remove("a"),
            Err(OrchestratorError::TaskNotFound { .. })
        ));
    }
}
