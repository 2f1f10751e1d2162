pub mod board_models;
pub mod board_store;

pub use board_models::{Project, Task, TaskPatch, TaskPriority, TaskStatus};
pub use board_store::{BoardStore, MoveOutcome};
