pub mod dispatcher;

pub use dispatcher::{EventDispatcher, SyncSignal};
