use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::board::{Task, TaskPatch, TaskStatus};

/// Client-to-authority frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinRoom { room_id: Uuid },
    LeaveRoom { room_id: Uuid },
    UpdateTask { id: Uuid, patch: TaskPatch },
    MoveTask {
        id: Uuid,
        new_status: TaskStatus,
        new_position: u32,
    },
}

/// Authority-to-client frames, broadcast to every session joined to the
/// task's room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    TaskUpdated(TaskUpdatedPayload),
    TaskCreated(TaskCreatedPayload),
    TaskMoved(TaskMovedPayload),
    TaskDeleted(TaskDeletedPayload),
    BoardUpdated(BoardUpdatedPayload),
    MembershipChanged(MembershipChangedPayload),
    UserJoined(UserJoinedPayload),
    UserLeft(UserLeftPayload),
    PresenceSync(PresenceSyncPayload),
    ChannelError(ChannelErrorPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskUpdatedPayload {
    pub task: Task,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCreatedPayload {
    pub task: Task,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMovedPayload {
    pub id: Uuid,
    pub new_status: TaskStatus,
    pub new_position: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDeletedPayload {
    pub id: Uuid,
    pub room_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardUpdatedPayload {
    pub project_id: Uuid,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipChangedPayload {
    pub removed_user_ids: Vec<Uuid>,
    pub room_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserJoinedPayload {
    pub user_id: Uuid,
    pub room_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserLeftPayload {
    pub user_id: Uuid,
    pub room_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceSyncPayload {
    pub room_id: Uuid,
    pub active_user_ids: Vec<Uuid>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelErrorPayload {
    pub message: String,
}

/// Out-of-band lifecycle notifications emitted by the channel manager for
/// the session and UI layers.
#[derive(Debug, Clone)]
pub enum ChannelNotice {
    /// The socket is up and the handshake succeeded. `resumed` is false on
    /// the first connect of a session.
    Connected { resumed: bool },
    /// The socket dropped; the reconnect machine takes over.
    Disconnected,
    /// The retry ceiling was exhausted; the channel will not try again.
    GaveUp,
    /// The handshake was rejected for credential reasons.
    AuthRejected(String),
}
