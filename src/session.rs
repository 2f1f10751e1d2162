use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::api::{ApiClient, CreateTaskRequest, MoveTaskRequest};
use crate::board::{BoardStore, MoveOutcome, Project, Task, TaskPatch, TaskStatus};
use crate::channel::{
    ChannelState, ClientEvent, LiveChannel, ReconnectPolicy, Transport, WsTransport,
};
use crate::config::EngineConfig;
use crate::dispatch::{EventDispatcher, SyncSignal};
use crate::error::{Result, SyncError};
use crate::mutation::{tasks_key, MutationCoordinator, Speculation};
use crate::presence::{PresenceTracker, RoomRegistry};

/// One user's connection to the board: store, presence, live channel and
/// mutation coordinator wired together behind a single handle.
///
/// Sessions are self-contained; any number can coexist in one process, which
/// is also how the integration tests simulate multiple collaborating
/// clients.
pub struct Session {
    local_user: Uuid,
    api: ApiClient,
    channel: LiveChannel,
    store: Arc<RwLock<BoardStore>>,
    coordinator: MutationCoordinator,
    presence: Arc<PresenceTracker>,
    dispatcher: Arc<EventDispatcher>,
    dispatcher_task: JoinHandle<()>,
}

impl Session {
    /// Build a session for `local_user` holding `credential`. No connection
    /// is attempted until [`Session::connect`].
    pub fn new(config: EngineConfig, credential: String, local_user: Uuid) -> Result<Self> {
        Self::with_transport(config, credential, local_user, Arc::new(WsTransport))
    }

    /// Same as [`Session::new`] with an injected transport, the seam the
    /// channel tests use to run without sockets.
    pub fn with_transport(
        config: EngineConfig,
        credential: String,
        local_user: Uuid,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let api = ApiClient::new(&config, credential.clone())?;
        let registry = Arc::new(RoomRegistry::new());
        let presence = Arc::new(PresenceTracker::new(local_user, registry.clone()));
        let store = Arc::new(RwLock::new(BoardStore::new()));
        let coordinator = MutationCoordinator::new(store.clone());

        let channel = LiveChannel::new(
            config.channel_url.clone(),
            credential,
            ReconnectPolicy::from_config(&config),
            registry,
            transport,
        );

        let dispatcher = Arc::new(EventDispatcher::new(store.clone(), presence.clone()));
        let dispatcher_task = dispatcher
            .clone()
            .spawn(channel.subscribe(), channel.notices());

        Ok(Self {
            local_user,
            api,
            channel,
            store,
            coordinator,
            presence,
            dispatcher,
            dispatcher_task,
        })
    }

    pub fn local_user(&self) -> Uuid {
        self.local_user
    }

    /// Open the live channel and wait for the handshake to resolve.
    pub async fn connect(&self) -> Result<()> {
        self.channel.connect();
        self.channel.wait_connected().await
    }

    pub fn disconnect(&self) {
        self.channel.disconnect();
    }

    /// Tear the session down. The presence cache dies with it; the authority
    /// forgets the room memberships when the socket closes.
    pub async fn shutdown(self) {
        self.channel.disconnect();
        drop(self.channel);
        let _ = self.dispatcher_task.await;
    }

    pub fn connection_state(&self) -> ChannelState {
        self.channel.state()
    }

    /// Engine-to-UI notification stream (connection changes, surfaced
    /// errors, evictions).
    pub fn signals(&self) -> broadcast::Receiver<SyncSignal> {
        self.dispatcher.signals()
    }

    /// The same notifications as [`Session::signals`], adapted to a
    /// `Stream` for reactive UI layers.
    pub fn signal_stream(&self) -> BroadcastStream<SyncSignal> {
        BroadcastStream::new(self.dispatcher.signals())
    }

    // ── Rooms & presence ─────────────────────────────────────────────────

    /// Join a project's room and prime the local cache: project record and
    /// task list are fetched, presence starts tracking, and the join frame
    /// goes out. If the channel happens to be down the membership is
    /// re-established automatically on the next (re)connect.
    pub async fn join_project(&self, project_id: Uuid) -> Result<()> {
        let project = self.api.get_project(project_id).await?;

        let key = tasks_key(project_id);
        let began = self.coordinator.begin_read(&key);
        let tasks = self.api.list_tasks(project_id).await?;
        self.coordinator
            .commit_read(&key, began, |store| {
                store.put_project(project);
                store.replace_project(project_id, tasks);
            })
            .await;

        self.presence.join(project_id);
        if let Err(err) = self.channel.send(ClientEvent::JoinRoom { room_id: project_id }) {
            tracing::debug!("Join frame deferred until reconnect: {err}");
        }
        Ok(())
    }

    pub fn leave_project(&self, project_id: Uuid) {
        self.presence.leave(project_id);
        if let Err(err) = self.channel.send(ClientEvent::LeaveRoom { room_id: project_id }) {
            tracing::debug!("Leave frame dropped, channel is down: {err}");
        }
    }

    pub fn presence(&self, project_id: Uuid) -> HashSet<Uuid> {
        self.presence.presence(project_id)
    }

    // ── Reads ────────────────────────────────────────────────────────────

    pub async fn tasks(&self, project_id: Uuid) -> Vec<Task> {
        self.store.read().await.snapshot(project_id)
    }

    pub async fn column(&self, project_id: Uuid, status: TaskStatus) -> Vec<Task> {
        self.store.read().await.column(project_id, status)
    }

    pub async fn project(&self, project_id: Uuid) -> Option<Project> {
        self.store.read().await.project(project_id).cloned()
    }

    /// Re-fetch a project's task list from the authority. The result is
    /// discarded if a mutation for the project starts while the fetch is in
    /// flight. Returns whether the fresh data was applied.
    pub async fn refresh_project(&self, project_id: Uuid) -> Result<bool> {
        let key = tasks_key(project_id);
        let began = self.coordinator.begin_read(&key);
        let tasks = self.api.list_tasks(project_id).await?;
        Ok(self
            .coordinator
            .commit_read(&key, began, |store| {
                store.replace_project(project_id, tasks);
            })
            .await)
    }

    // ── Mutations ────────────────────────────────────────────────────────

    /// Move a task to (`new_status`, `new_position`), optimistically.
    ///
    /// The move is applied locally first for instant feedback, then written
    /// to the authority; the authoritative task (whose position may differ
    /// under concurrent edits) replaces the speculative one. A move to the
    /// task's current slot returns `Ok(None)` without touching the network.
    pub async fn move_task(
        &self,
        task_id: Uuid,
        new_status: TaskStatus,
        new_position: u32,
    ) -> Result<Option<Task>> {
        let project_id = self.project_of(task_id).await?;
        let request = MoveTaskRequest {
            status: new_status,
            position: new_position,
        };

        self.coordinator
            .run(
                &tasks_key(project_id),
                project_id,
                |store| match store.move_task(task_id, new_status, new_position) {
                    MoveOutcome::Moved(_) => Ok(Speculation::Applied),
                    MoveOutcome::NoOp => Ok(Speculation::NoChange),
                    MoveOutcome::NotFound => {
                        Err(SyncError::NotFound(format!("task {task_id} not cached")))
                    }
                },
                self.api.move_task(task_id, &request),
                |store, task: &Task| store.upsert(task.clone()),
            )
            .await
    }

    /// Patch a task's fields, optimistically.
    pub async fn update_task(&self, task_id: Uuid, patch: TaskPatch) -> Result<Option<Task>> {
        let project_id = self.project_of(task_id).await?;
        let speculative_patch = patch.clone();

        self.coordinator
            .run(
                &tasks_key(project_id),
                project_id,
                move |store| {
                    let Some(task) = store.get(task_id) else {
                        return Err(SyncError::NotFound(format!("task {task_id} not cached")));
                    };
                    let mut updated = task.clone();
                    speculative_patch.apply_to(&mut updated);
                    store.upsert(updated);
                    Ok(Speculation::Applied)
                },
                self.api.update_task(task_id, &patch),
                |store, task: &Task| store.upsert(task.clone()),
            )
            .await
    }

    /// Create a task at the end of a column. A provisional task with a
    /// client-side id renders immediately; the authoritative one replaces it
    /// on success.
    pub async fn create_task(&self, request: CreateTaskRequest) -> Result<Option<Task>> {
        let project_id = request.project_id;
        let provisional_id = Uuid::new_v4();
        let provisional = {
            let store = self.store.read().await;
            let position = store.column(project_id, TaskStatus::Todo).len() as u32;
            let now = Utc::now();
            Task {
                id: provisional_id,
                project_id,
                title: request.title.clone(),
                description: request.description.clone(),
                status: TaskStatus::Todo,
                position,
                priority: request
                    .priority
                    .unwrap_or(crate::board::TaskPriority::Medium),
                assignee_id: request.assignee_id,
                created_at: now,
                updated_at: now,
            }
        };

        self.coordinator
            .run(
                &tasks_key(project_id),
                project_id,
                move |store| {
                    store.insert(provisional);
                    Ok(Speculation::Applied)
                },
                self.api.create_task(&request),
                move |store, task: &Task| {
                    store.remove(provisional_id);
                    store.insert(task.clone());
                },
            )
            .await
    }

    /// Delete a task, optimistically. Later siblings in its column shift
    /// down immediately; a failed remote delete restores the exact layout.
    pub async fn delete_task(&self, task_id: Uuid) -> Result<()> {
        let project_id = self.project_of(task_id).await?;

        self.coordinator
            .run(
                &tasks_key(project_id),
                project_id,
                |store| {
                    if store.remove(task_id).is_some() {
                        Ok(Speculation::Applied)
                    } else {
                        Err(SyncError::NotFound(format!("task {task_id} not cached")))
                    }
                },
                self.api.delete_task(task_id),
                |_, _: &()| {},
            )
            .await?;
        Ok(())
    }

    async fn project_of(&self, task_id: Uuid) -> Result<Uuid> {
        self.store
            .read()
            .await
            .get(task_id)
            .map(|t| t.project_id)
            .ok_or_else(|| SyncError::NotFound(format!("task {task_id} not cached")))
    }
}
