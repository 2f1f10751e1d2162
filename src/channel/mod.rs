pub mod channel_manager;
pub mod channel_state;
pub mod channel_types;
pub mod transport;

pub use channel_manager::LiveChannel;
pub use channel_state::{ChannelInput, ChannelState, ReconnectPolicy};
pub use channel_types::{ChannelNotice, ClientEvent, ServerEvent};
pub use transport::{Transport, TransportConnection, WsTransport};
