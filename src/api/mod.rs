pub mod api_client;
pub mod api_models;

pub use api_client::ApiClient;
pub use api_models::{ApiEnvelope, ApiErrorBody, CreateTaskRequest, MoveTaskRequest, UpdateTaskRequest};
