#![forbid(unsafe_code)]

// Chat module - chat/signaling transport contract

pub mod protocol;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use protocol::{parse_frame, ChatEvent, ChatFrame, ChatMessage};

/// Error raised by the chat transport
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("chat connection failed: {0}")]
    Connect(String),

    #[error("chat transport closed")]
    Closed,
}

/// Chat/signaling transport. The WebSocket protocol lives behind this trait;
/// the orchestrator only sees [`ChatFrame`]s, which it projects into
/// [`ChatEvent`]s.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Connects to the chat room for a stage. Frames arrive on the returned
    /// channel until the room is left or the transport drops it.
    async fn connect(
        &self,
        token: &str,
        region: &str,
    ) -> Result<mpsc::UnboundedReceiver<ChatFrame>, ChatError>;

    /// Leaves the current chat room. Safe to call when not connected.
    async fn disconnect(&self);
}
