pub mod coordinator;

pub use coordinator::{tasks_key, MutationCoordinator, Speculation};
