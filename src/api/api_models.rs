use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::board::{TaskPatch, TaskPriority, TaskStatus};

/// Authority response wrapper. Every request/response endpoint answers with
/// `{"success": ..., "data": ..., "error": {"code", "message"}}`; the shape
/// is fixed by the authority and must not drift.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ApiErrorBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateTaskRequest {
    pub project_id: Uuid,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<TaskPriority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee_id: Option<Uuid>,
}

/// Body of a move request: the target column and the dense position within
/// it. The authority recomputes positions itself and returns the final task.
#[derive(Debug, Clone, Serialize)]
pub struct MoveTaskRequest {
    pub status: TaskStatus,
    pub position: u32,
}

pub type UpdateTaskRequest = TaskPatch;
