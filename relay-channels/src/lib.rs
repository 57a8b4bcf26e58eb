//! Channel adapters for shellrelay.
//!
//! Adapters are pure I/O: they convert platform messages to/from shellrelay
//! `InboundMessage` / `OutboundMessage` and deliver file attachments.

mod traits;
mod types;
mod whatsapp;

pub use traits::ChannelAdapter;
pub use types::{ChannelId, ConversationId, InboundMessage, MessageId, OutboundMessage, SenderId};
pub use whatsapp::WhatsAppCloudAdapter;
