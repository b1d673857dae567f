//! Task registry: shared map of in-flight generation requests.
//!
//! One entry per active client id. Handlers register on entry, long-running
//! loops poll [`TaskRegistry::is_active`] on every iteration, and the
//! cancel route removes the entry and performs kind-specific teardown with
//! the returned snapshot. The lock guards map mutation only; no I/O ever
//! happens while it is held.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::text::TextBackend;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    Text { backend: TextBackend },
    Image,
}

#[derive(Debug)]
struct TaskEntry {
    kind: TaskKind,
    cancel: CancellationToken,
    /// Upstream correlation id for image tasks. Attached after the job has
    /// been queued; a cancel arriving before then only removes the entry.
    prompt_id: Option<String>,
}

/// Owned copy of a removed entry, safe to act on outside the lock.
#[derive(Debug)]
pub struct TaskSnapshot {
    pub kind: TaskKind,
    pub cancel: CancellationToken,
    pub prompt_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, TaskEntry>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a task entry, overwriting any previous entry with the same
    /// id (last writer wins), and returns its cancellation token.
    pub fn register(&self, id: &str, kind: TaskKind) -> CancellationToken {
        let token = CancellationToken::new();
        let entry = TaskEntry {
            kind,
            cancel: token.clone(),
            prompt_id: None,
        };
        let mut tasks = self.tasks.lock().expect("task registry lock poisoned");
        if tasks.insert(id.to_string(), entry).is_some() {
            debug!(id, "task registered over an existing entry");
        } else {
            debug!(id, "task registered");
        }
        token
    }

    /// Attaches the upstream correlation id to an image task. A no-op when
    /// the entry has already been removed: the upstream call can finish
    /// establishing after the client has cancelled, and that race is
    /// tolerated rather than treated as an error.
    pub fn attach_prompt_id(&self, id: &str, prompt_id: &str) {
        let mut tasks = self.tasks.lock().expect("task registry lock poisoned");
        match tasks.get_mut(id) {
            Some(entry) => entry.prompt_id = Some(prompt_id.to_string()),
            None => debug!(id, "task gone before correlation id could be attached"),
        }
    }

    /// Cooperative cancellation check, polled by stream readers and the
    /// image poller on every iteration.
    pub fn is_active(&self, id: &str) -> bool {
        self.tasks
            .lock()
            .expect("task registry lock poisoned")
            .contains_key(id)
    }

    /// The token for a live task, if any. Lets a coordinator select on
    /// cancellation while awaiting upstream I/O.
    pub fn cancellation_token(&self, id: &str) -> Option<CancellationToken> {
        self.tasks
            .lock()
            .expect("task registry lock poisoned")
            .get(id)
            .map(|entry| entry.cancel.clone())
    }

    /// Atomically removes and returns the entry. The caller cancels the
    /// token and performs any upstream teardown after the lock is released;
    /// `None` means the task already completed naturally.
    pub fn cancel(&self, id: &str) -> Option<TaskSnapshot> {
        let entry = self
            .tasks
            .lock()
            .expect("task registry lock poisoned")
            .remove(id)?;
        debug!(id, "task removed for cancellation");
        Some(TaskSnapshot {
            kind: entry.kind,
            cancel: entry.cancel,
            prompt_id: entry.prompt_id,
        })
    }

    /// Removes the entry on normal or errored completion. Safe to call on
    /// an id that is no longer present.
    pub fn complete(&self, id: &str) {
        if self
            .tasks
            .lock()
            .expect("task registry lock poisoned")
            .remove(id)
            .is_some()
        {
            debug!(id, "task completed");
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().expect("task registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_kind() -> TaskKind {
        TaskKind::Text {
            backend: TextBackend::Ollama,
        }
    }

    #[test]
    fn cancel_after_register_deactivates_and_second_cancel_misses() {
        let registry = TaskRegistry::new();
        registry.register("x", text_kind());
        assert!(registry.is_active("x"));

        let snapshot = registry.cancel("x").expect("first cancel finds the task");
        snapshot.cancel.cancel();
        assert!(!registry.is_active("x"));
        assert!(registry.cancel("x").is_none());
    }

    #[test]
    fn attach_after_cancel_is_a_tolerated_no_op() {
        let registry = TaskRegistry::new();
        registry.register("img", TaskKind::Image);
        let snapshot = registry.cancel("img").unwrap();
        assert!(snapshot.prompt_id.is_none());

        // The queue reply can land after the cancel; nothing revives the entry.
        registry.attach_prompt_id("img", "prompt-123");
        assert!(!registry.is_active("img"));
        assert!(registry.cancel("img").is_none());
    }

    #[test]
    fn attach_then_cancel_returns_the_correlation_id() {
        let registry = TaskRegistry::new();
        registry.register("img", TaskKind::Image);
        registry.attach_prompt_id("img", "prompt-123");
        let snapshot = registry.cancel("img").unwrap();
        assert_eq!(snapshot.prompt_id.as_deref(), Some("prompt-123"));
        assert_eq!(snapshot.kind, TaskKind::Image);
    }

    #[test]
    fn duplicate_register_is_last_writer_wins() {
        let registry = TaskRegistry::new();
        let first = registry.register("dup", text_kind());
        registry.register("dup", TaskKind::Image);
        assert_eq!(registry.len(), 1);
        // The first token is orphaned, not cancelled; the entry now belongs
        // to the second writer.
        assert!(!first.is_cancelled());
        assert_eq!(registry.cancel("dup").unwrap().kind, TaskKind::Image);
    }

    #[test]
    fn complete_removes_unconditionally() {
        let registry = TaskRegistry::new();
        registry.register("t", text_kind());
        registry.complete("t");
        assert!(registry.is_empty());
        // Completing an unknown id is fine.
        registry.complete("t");
    }

    #[test]
    fn concurrent_attach_and_cancel_leave_the_entry_absent() {
        use std::sync::Arc;

        let registry = Arc::new(TaskRegistry::new());
        for round in 0..64 {
            let id = format!("race-{round}");
            registry.register(&id, TaskKind::Image);

            let attach = {
                let registry = registry.clone();
                let id = id.clone();
                std::thread::spawn(move || registry.attach_prompt_id(&id, "p"))
            };
            let cancel = {
                let registry = registry.clone();
                let id = id.clone();
                std::thread::spawn(move || {
                    if let Some(snapshot) = registry.cancel(&id) {
                        snapshot.cancel.cancel();
                    }
                })
            };
            attach.join().unwrap();
            cancel.join().unwrap();
            assert!(!registry.is_active(&id));
        }
    }
}
