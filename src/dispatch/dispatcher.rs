use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::board::{BoardStore, MoveOutcome};
use crate::channel::channel_types::{ChannelNotice, ServerEvent};
use crate::presence::PresenceTracker;

const SIGNAL_BUFFER: usize = 64;

/// Engine-to-UI notifications. The embedding layer decides how to render
/// them (toast, banner, navigation); the engine never renders anything.
#[derive(Debug, Clone)]
pub enum SyncSignal {
    Connected { resumed: bool },
    Disconnected,
    /// Reconnection attempts are exhausted; user action is required.
    GaveUp,
    AuthRejected(String),
    /// The authority reported a channel-level fault.
    ChannelError(String),
    /// The local user was removed from a project; cached state is gone and
    /// the UI should navigate away.
    EvictedFromProject(Uuid),
}

/// Applies inbound domain events to the local caches.
///
/// Every handler is idempotent and tolerates out-of-order delivery: duplicate
/// events re-apply cleanly and events referencing unknown entities are logged
/// and dropped, never a panic.
pub struct EventDispatcher {
    store: Arc<RwLock<BoardStore>>,
    presence: Arc<PresenceTracker>,
    signals_tx: broadcast::Sender<SyncSignal>,
}

impl EventDispatcher {
    pub fn new(store: Arc<RwLock<BoardStore>>, presence: Arc<PresenceTracker>) -> Self {
        let (signals_tx, _) = broadcast::channel(SIGNAL_BUFFER);
        Self {
            store,
            presence,
            signals_tx,
        }
    }

    pub fn signals(&self) -> broadcast::Receiver<SyncSignal> {
        self.signals_tx.subscribe()
    }

    /// Consume the channel's event and notice streams until the channel
    /// driver goes away.
    pub fn spawn(
        self: Arc<Self>,
        mut events: broadcast::Receiver<ServerEvent>,
        mut notices: broadcast::Receiver<ChannelNotice>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => self.apply(event).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            // Dropped events are recovered by the next
                            // board_updated / presence_sync from the authority.
                            tracing::warn!("Event stream lagged, {missed} events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    notice = notices.recv() => match notice {
                        Ok(notice) => self.apply_notice(notice).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!("Notice stream lagged, {missed} notices dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            tracing::debug!("Event dispatcher stopped");
        })
    }

    pub async fn apply(&self, event: ServerEvent) {
        match event {
            ServerEvent::TaskCreated(p) => {
                let mut store = self.store.write().await;
                store.insert(p.task);
            }
            ServerEvent::TaskUpdated(p) => {
                let mut store = self.store.write().await;
                store.upsert(p.task);
            }
            ServerEvent::TaskMoved(p) => {
                let mut store = self.store.write().await;
                match store.move_task(p.id, p.new_status, p.new_position) {
                    MoveOutcome::NotFound => {
                        tracing::warn!(
                            "Move event for unknown task {}, waiting for a full board sync",
                            p.id
                        );
                    }
                    MoveOutcome::Moved(_) | MoveOutcome::NoOp => {}
                }
            }
            ServerEvent::TaskDeleted(p) => {
                let mut store = self.store.write().await;
                if store.remove(p.id).is_none() {
                    tracing::debug!("Delete event for already-absent task {}", p.id);
                }
            }
            ServerEvent::BoardUpdated(p) => {
                let mut store = self.store.write().await;
                store.replace_project(p.project_id, p.tasks);
            }
            ServerEvent::MembershipChanged(p) => {
                if p.removed_user_ids.contains(&self.presence.local_user()) {
                    tracing::info!("Removed from project {}, evicting cached state", p.room_id);
                    {
                        let mut store = self.store.write().await;
                        store.evict_project(p.room_id);
                    }
                    self.presence.evict_room(p.room_id);
                    let _ = self
                        .signals_tx
                        .send(SyncSignal::EvictedFromProject(p.room_id));
                } else {
                    let mut store = self.store.write().await;
                    store.remove_project_members(p.room_id, &p.removed_user_ids);
                }
            }
            ServerEvent::UserJoined(p) => {
                self.presence.apply_user_joined(p.user_id, p.room_id);
            }
            ServerEvent::UserLeft(p) => {
                self.presence.apply_user_left(p.user_id, p.room_id);
            }
            ServerEvent::PresenceSync(p) => {
                self.presence
                    .apply_presence_sync(p.room_id, p.active_user_ids);
            }
            ServerEvent::ChannelError(p) => {
                tracing::error!("Live channel error: {}", p.message);
                let _ = self.signals_tx.send(SyncSignal::ChannelError(p.message));
            }
        }
    }

    async fn apply_notice(&self, notice: ChannelNotice) {
        match notice {
            ChannelNotice::Connected { resumed } => {
                let _ = self.signals_tx.send(SyncSignal::Connected { resumed });
            }
            ChannelNotice::Disconnected => {
                // A dropped connection cannot vouch for anyone's presence.
                self.presence.clear_presence();
                let _ = self.signals_tx.send(SyncSignal::Disconnected);
            }
            ChannelNotice::GaveUp => {
                let _ = self.signals_tx.send(SyncSignal::GaveUp);
            }
            ChannelNotice::AuthRejected(message) => {
                let _ = self.signals_tx.send(SyncSignal::AuthRejected(message));
            }
        }
    }
}
