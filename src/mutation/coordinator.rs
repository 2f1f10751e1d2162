use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::board::BoardStore;
use crate::error::Result;

/// What a speculation did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speculation {
    /// Local state changed; the remote write goes out.
    Applied,
    /// The mutation is a no-op (e.g. a move to the task's current slot);
    /// no remote write may be issued.
    NoChange,
}

/// Speculate/commit/rollback wrapper around remote writes.
///
/// Each operation key carries a generation counter. Bumping it when a
/// mutation starts and again when it resolves invalidates every read that
/// was in flight across the boundary, so a stale fetch can never overwrite
/// speculative or freshly reconciled state.
pub struct MutationCoordinator {
    store: Arc<RwLock<BoardStore>>,
    generations: DashMap<String, u64>,
}

impl MutationCoordinator {
    pub fn new(store: Arc<RwLock<BoardStore>>) -> Self {
        Self {
            store,
            generations: DashMap::new(),
        }
    }

    pub fn store(&self) -> Arc<RwLock<BoardStore>> {
        self.store.clone()
    }

    /// Run one optimistic mutation against `project_id`'s task list.
    ///
    /// The snapshot taken before `speculate` is a full structurally
    /// independent copy, so a failed remote write restores the exact
    /// pre-mutation state. For every invocation that speculates, exactly one
    /// of reconcile or rollback happens.
    ///
    /// Returns `Ok(None)` when the speculation reported [`Speculation::NoChange`];
    /// the remote call is dropped unissued.
    pub async fn run<T, S, R, C>(
        &self,
        key: &str,
        project_id: Uuid,
        speculate: S,
        remote: R,
        reconcile: C,
    ) -> Result<Option<T>>
    where
        S: FnOnce(&mut BoardStore) -> Result<Speculation>,
        R: Future<Output = Result<T>>,
        C: FnOnce(&mut BoardStore, &T),
    {
        self.bump(key);

        let snapshot = {
            let mut store = self.store.write().await;
            let snapshot = store.snapshot(project_id);
            match speculate(&mut store) {
                Ok(Speculation::Applied) => snapshot,
                Ok(Speculation::NoChange) => return Ok(None),
                Err(err) => {
                    store.restore(project_id, snapshot);
                    return Err(err);
                }
            }
        };

        match remote.await {
            Ok(value) => {
                let mut store = self.store.write().await;
                reconcile(&mut store, &value);
                self.bump(key);
                Ok(Some(value))
            }
            Err(err) => {
                tracing::warn!("Mutation {key} failed, rolling back: {err}");
                let mut store = self.store.write().await;
                store.restore(project_id, snapshot);
                self.bump(key);
                Err(err)
            }
        }
    }

    /// Mark the start of a read for `key`; pass the returned generation to
    /// [`MutationCoordinator::commit_read`] once the data arrives.
    pub fn begin_read(&self, key: &str) -> u64 {
        self.generation(key)
    }

    /// Apply a completed read unless a mutation for the same key started or
    /// resolved while it was in flight. Returns whether the read was applied.
    pub async fn commit_read<F>(&self, key: &str, began_at: u64, apply: F) -> bool
    where
        F: FnOnce(&mut BoardStore),
    {
        let mut store = self.store.write().await;
        // Checked under the store lock so a mutation cannot slip between the
        // check and the apply.
        if self.generation(key) != began_at {
            tracing::debug!("Discarding superseded read for {key}");
            return false;
        }
        apply(&mut store);
        true
    }

    fn generation(&self, key: &str) -> u64 {
        self.generations.get(key).map(|g| *g).unwrap_or(0)
    }

    fn bump(&self, key: &str) {
        *self.generations.entry(key.to_string()).or_insert(0) += 1;
    }
}

/// Conventional operation key for a project's task collection.
pub fn tasks_key(project_id: Uuid) -> String {
    format!("tasks:{project_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{MoveOutcome, Task, TaskPriority, TaskStatus};
    use crate::error::SyncError;
    use chrono::Utc;

    fn task(project: Uuid, title: &str, position: u32) -> Task {
        Task {
            id: Uuid::new_v4(),
            project_id: project,
            title: title.to_string(),
            description: None,
            status: TaskStatus::Todo,
            position,
            priority: TaskPriority::Medium,
            assignee_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    async fn seeded() -> (MutationCoordinator, Uuid, Vec<Uuid>) {
        let project = Uuid::new_v4();
        let store = Arc::new(RwLock::new(BoardStore::new()));
        let mut ids = Vec::new();
        {
            let mut guard = store.write().await;
            for (i, name) in ["a", "b", "c"].iter().enumerate() {
                let t = task(project, name, i as u32);
                ids.push(t.id);
                guard.insert(t);
            }
        }
        (MutationCoordinator::new(store), project, ids)
    }

    #[tokio::test]
    async fn test_success_reconciles_with_authoritative_value() {
        let (coordinator, project, ids) = seeded().await;
        let key = tasks_key(project);

        // Client guesses position 2; authority lands the task at 1.
        let authoritative = {
            let store = coordinator.store();
            let guard = store.read().await;
            let mut t = guard.get(ids[0]).unwrap().clone();
            t.position = 1;
            t
        };

        let result = coordinator
            .run(
                &key,
                project,
                |store| match store.move_task(ids[0], TaskStatus::Todo, 2) {
                    MoveOutcome::Moved(_) => Ok(Speculation::Applied),
                    MoveOutcome::NoOp => Ok(Speculation::NoChange),
                    MoveOutcome::NotFound => Err(SyncError::NotFound("task".to_string())),
                },
                async { Ok(authoritative.clone()) },
                |store, value: &Task| store.upsert(value.clone()),
            )
            .await
            .unwrap();

        assert!(result.is_some());
        let store = coordinator.store();
        let guard = store.read().await;
        assert_eq!(guard.get(ids[0]).unwrap().position, 1);
    }

    #[tokio::test]
    async fn test_failure_restores_snapshot_exactly() {
        let (coordinator, project, ids) = seeded().await;
        let key = tasks_key(project);

        let before = coordinator.store().read().await.snapshot(project);

        let err = coordinator
            .run(
                &key,
                project,
                |store| match store.move_task(ids[0], TaskStatus::Done, 0) {
                    MoveOutcome::Moved(_) => Ok(Speculation::Applied),
                    _ => Ok(Speculation::NoChange),
                },
                async { Err::<Task, _>(SyncError::NotFound("deleted elsewhere".to_string())) },
                |store, value: &Task| store.upsert(value.clone()),
            )
            .await
            .unwrap_err();

        assert!(err.is_stale());
        let after = coordinator.store().read().await.snapshot(project);
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn test_noop_speculation_skips_remote_call() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let (coordinator, project, ids) = seeded().await;
        let key = tasks_key(project);
        let called = Arc::new(AtomicBool::new(false));

        let remote = {
            let called = called.clone();
            async move {
                called.store(true, Ordering::SeqCst);
                Ok(task(project, "never", 0))
            }
        };

        let result = coordinator
            .run(
                &key,
                project,
                |store| match store.move_task(ids[1], TaskStatus::Todo, 1) {
                    MoveOutcome::Moved(_) => Ok(Speculation::Applied),
                    MoveOutcome::NoOp => Ok(Speculation::NoChange),
                    MoveOutcome::NotFound => Err(SyncError::NotFound("task".to_string())),
                },
                remote,
                |_, _| {},
            )
            .await
            .unwrap();

        assert!(result.is_none());
        assert!(!called.load(Ordering::SeqCst), "remote call issued for a no-op move");
    }

    #[tokio::test]
    async fn test_superseded_read_is_discarded() {
        let (coordinator, project, ids) = seeded().await;
        let key = tasks_key(project);

        let began = coordinator.begin_read(&key);

        // A mutation starts while the read is in flight.
        coordinator
            .run(
                &key,
                project,
                |store| match store.move_task(ids[0], TaskStatus::Done, 0) {
                    MoveOutcome::Moved(_) => Ok(Speculation::Applied),
                    _ => Ok(Speculation::NoChange),
                },
                async { Ok(task(project, "a", 0)) },
                |_, _| {},
            )
            .await
            .unwrap();

        let applied = coordinator
            .commit_read(&key, began, |store| {
                store.replace_project(project, Vec::new());
            })
            .await;

        assert!(!applied);
        // The stale empty list never landed.
        assert!(!coordinator.store().read().await.list(project).is_empty());
    }

    #[tokio::test]
    async fn test_current_read_applies() {
        let (coordinator, project, _) = seeded().await;
        let key = tasks_key(project);

        let began = coordinator.begin_read(&key);
        let applied = coordinator
            .commit_read(&key, began, |store| {
                store.replace_project(project, Vec::new());
            })
            .await;

        assert!(applied);
        assert!(coordinator.store().read().await.list(project).is_empty());
    }
}
