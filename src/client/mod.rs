//! Seam to the external WhatsApp Web client.
//!
//! The protocol client itself runs out of process (see [`sidecar`]); the rest
//! of the crate only sees [`ChatClient`] and the [`ClientEvent`] stream.

pub mod sidecar;
pub mod types;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use sidecar::{SidecarClient, SidecarOptions};

/// A chat as reported by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatInfo {
    /// Serialized chat id, e.g. `1203630...@g.us`.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "isGroup", default)]
    pub is_group: bool,
}

/// An inbound (or self-sent) chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub from_me: bool,
    pub chat: ChatInfo,
    pub body: String,
}

/// Status changes and messages pushed by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A new pairing code to be shown as a QR image.
    Qr(String),
    Ready,
    AuthFailure(String),
    Disconnected(String),
    Message(InboundMessage),
}

/// Operations the relay needs from the messaging client.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Enumerate every chat the paired account can see.
    async fn get_chats(&self) -> Result<Vec<ChatInfo>>;

    /// Send a plain text message.
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<()>;
}
