pub mod bridge;
pub mod config;
pub mod engine;
pub mod host;
pub mod loader;
pub mod logger;
pub mod message;
pub mod schema;
pub mod stdio;
pub mod watcher;

pub use bridge::{Bridge, BridgeError, BridgeHandle, BridgeState, Protocol};
pub use host::LayoutClient;
pub use loader::EngineLoader;
pub use message::{BridgeReply, ErrorKind, EventType, InboundMessage, OutboundMessage};
