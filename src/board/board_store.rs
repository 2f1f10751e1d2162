use std::collections::HashMap;

use uuid::Uuid;

use super::board_models::{Project, Task, TaskStatus};

/// Result of a move request against the store.
#[derive(Debug, Clone, PartialEq)]
pub enum MoveOutcome {
    /// The task was moved; carries the post-move value.
    Moved(Task),
    /// The task already sits at the requested (status, position). Callers
    /// must not issue a remote write for a no-op.
    NoOp,
    /// No task with that id is cached locally.
    NotFound,
}

/// In-memory cache of tasks and projects, ordered per (project, status)
/// column.
///
/// Invariant: within every column the positions are exactly `0..n` with no
/// gaps or duplicates. Every mutation below preserves it; authoritative
/// payloads (`upsert`, `replace_project`) are re-normalized on the way in so
/// a malformed broadcast cannot poison the cache.
///
/// The store is a plain data structure with no interior locking; the session
/// wraps it in an `RwLock` and the UI only ever sees cloned snapshots.
#[derive(Debug, Default)]
pub struct BoardStore {
    tasks: HashMap<Uuid, Vec<Task>>,
    projects: HashMap<Uuid, Project>,
    task_index: HashMap<Uuid, Uuid>,
}

impl BoardStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks cached for a project, unspecified order. Unknown projects yield
    /// an empty slice, never an error.
    pub fn list(&self, project_id: Uuid) -> &[Task] {
        self.tasks
            .get(&project_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// One column of a project, sorted by position.
    pub fn column(&self, project_id: Uuid, status: TaskStatus) -> Vec<Task> {
        let mut col: Vec<Task> = self
            .list(project_id)
            .iter()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        col.sort_by_key(|t| t.position);
        col
    }

    pub fn get(&self, task_id: Uuid) -> Option<&Task> {
        let project_id = self.task_index.get(&task_id)?;
        self.tasks
            .get(project_id)?
            .iter()
            .find(|t| t.id == task_id)
    }

    pub fn project(&self, project_id: Uuid) -> Option<&Project> {
        self.projects.get(&project_id)
    }

    pub fn put_project(&mut self, project: Project) {
        self.projects.insert(project.id, project);
    }

    /// Insert a task at `task.position` within its column, clamped to
    /// `[0, column_len]`; existing tasks at or after the slot shift up.
    /// Inserting an id that is already cached is ignored (duplicate
    /// `task_created` deliveries must not fork the column).
    pub fn insert(&mut self, mut task: Task) {
        if self.task_index.contains_key(&task.id) {
            tracing::debug!("Task {} already cached, ignoring insert", task.id);
            return;
        }
        let column = self.tasks.entry(task.project_id).or_default();
        let len = column_len(column, task.status);
        task.position = task.position.min(len);
        open_gap(column, task.status, task.position);
        self.task_index.insert(task.id, task.project_id);
        column.push(task);
    }

    /// Remove a task; later siblings in its column shift down by one.
    pub fn remove(&mut self, task_id: Uuid) -> Option<Task> {
        let project_id = self.task_index.remove(&task_id)?;
        let column = self.tasks.get_mut(&project_id)?;
        let idx = column.iter().position(|t| t.id == task_id)?;
        let removed = column.swap_remove(idx);
        close_gap(column, removed.status, removed.position);
        Some(removed)
    }

    /// Move a task to (`new_status`, `new_position`), recomputing sibling
    /// positions exactly the way the authority does so speculative and
    /// authoritative states agree.
    pub fn move_task(
        &mut self,
        task_id: Uuid,
        new_status: TaskStatus,
        new_position: u32,
    ) -> MoveOutcome {
        let Some(&project_id) = self.task_index.get(&task_id) else {
            return MoveOutcome::NotFound;
        };
        let Some(column) = self.tasks.get_mut(&project_id) else {
            return MoveOutcome::NotFound;
        };
        let Some(idx) = column.iter().position(|t| t.id == task_id) else {
            return MoveOutcome::NotFound;
        };
        let old_status = column[idx].status;
        let old_position = column[idx].position;

        let new_position = if new_status == old_status {
            // Same column: the task vacates its slot first, so the last
            // reachable index is len - 1.
            let len = column_len(column, old_status);
            new_position.min(len.saturating_sub(1))
        } else {
            // Cross column: appending past the end is allowed.
            new_position.min(column_len(column, new_status))
        };

        if new_status == old_status && new_position == old_position {
            return MoveOutcome::NoOp;
        }

        if new_status == old_status {
            shift_within_column(column, old_status, old_position, new_position);
        } else {
            close_gap(column, old_status, old_position);
            open_gap(column, new_status, new_position);
        }

        let task = &mut column[idx];
        task.status = new_status;
        task.position = new_position;
        task.updated_at = chrono::Utc::now();
        MoveOutcome::Moved(task.clone())
    }

    /// Apply an authoritative task value. A position or status that differs
    /// from the cached one is applied as a remove + insert so sibling
    /// positions stay dense; a task we have never seen is inserted.
    pub fn upsert(&mut self, task: Task) {
        let same_slot = self
            .get(task.id)
            .map(|cached| cached.status == task.status && cached.position == task.position);
        match same_slot {
            Some(true) => {
                if let Some(column) = self.tasks.get_mut(&task.project_id) {
                    if let Some(slot) = column.iter_mut().find(|t| t.id == task.id) {
                        *slot = task;
                    }
                }
            }
            Some(false) => {
                self.remove(task.id);
                self.insert(task);
            }
            None => self.insert(task),
        }
    }

    /// Wholesale replacement of a project's task list from an authoritative
    /// board snapshot. Columns are re-normalized to dense positions in the
    /// order the authority sent.
    pub fn replace_project(&mut self, project_id: Uuid, mut tasks: Vec<Task>) {
        if let Some(old) = self.tasks.remove(&project_id) {
            for task in &old {
                self.task_index.remove(&task.id);
            }
        }
        tasks.retain(|t| t.project_id == project_id);
        tasks.sort_by_key(|t| (t.status.to_string(), t.position));
        for status in TaskStatus::ALL {
            let mut next = 0;
            for task in tasks.iter_mut().filter(|t| t.status == status) {
                task.position = next;
                next += 1;
            }
        }
        for task in &tasks {
            self.task_index.insert(task.id, project_id);
        }
        self.tasks.insert(project_id, tasks);
    }

    /// Reconcile the cached member list after a membership broadcast.
    /// Unknown projects are ignored (nothing cached to correct).
    pub fn remove_project_members(&mut self, project_id: Uuid, removed: &[Uuid]) {
        if let Some(project) = self.projects.get_mut(&project_id) {
            project.members.retain(|m| !removed.contains(m));
        }
    }

    /// Drop everything cached for a project (tasks and project record).
    pub fn evict_project(&mut self, project_id: Uuid) {
        if let Some(old) = self.tasks.remove(&project_id) {
            for task in &old {
                self.task_index.remove(&task.id);
            }
        }
        self.projects.remove(&project_id);
    }

    /// Structurally independent copy of a project's task list, for exact
    /// rollback.
    pub fn snapshot(&self, project_id: Uuid) -> Vec<Task> {
        self.list(project_id).to_vec()
    }

    /// Restore a snapshot taken with [`BoardStore::snapshot`] verbatim.
    pub fn restore(&mut self, project_id: Uuid, snapshot: Vec<Task>) {
        if let Some(old) = self.tasks.remove(&project_id) {
            for task in &old {
                self.task_index.remove(&task.id);
            }
        }
        for task in &snapshot {
            self.task_index.insert(task.id, project_id);
        }
        self.tasks.insert(project_id, snapshot);
    }
}

fn column_len(tasks: &[Task], status: TaskStatus) -> u32 {
    tasks.iter().filter(|t| t.status == status).count() as u32
}

/// Close the hole left at `removed_pos`: every sibling past it moves down.
fn close_gap(tasks: &mut [Task], status: TaskStatus, removed_pos: u32) {
    for task in tasks.iter_mut().filter(|t| t.status == status) {
        if task.position > removed_pos {
            task.position -= 1;
        }
    }
}

/// Make room at `at`: every task at or past the slot moves up.
fn open_gap(tasks: &mut [Task], status: TaskStatus, at: u32) {
    for task in tasks.iter_mut().filter(|t| t.status == status) {
        if task.position >= at {
            task.position += 1;
        }
    }
}

/// Same-column reorder. Moving down pulls the crossed range back by one;
/// moving up pushes it forward by one. The moved task itself is left alone
/// (the caller assigns its final position).
fn shift_within_column(tasks: &mut [Task], status: TaskStatus, old_pos: u32, new_pos: u32) {
    for task in tasks.iter_mut().filter(|t| t.status == status) {
        if task.position == old_pos {
            continue;
        }
        if new_pos > old_pos {
            if task.position > old_pos && task.position <= new_pos {
                task.position -= 1;
            }
        } else if task.position >= new_pos && task.position < old_pos {
            task.position += 1;
        }
    }
}
