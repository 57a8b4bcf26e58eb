use crate::types::{InboundMessage, OutboundMessage};
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use tokio::sync::mpsc;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel identifier: "whatsapp".
    fn channel_id(&self) -> &str;

    /// Start receiving messages. Push to tx for each inbound message.
    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()>;

    /// Send a text message to a conversation on this platform.
    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()>;

    /// Deliver a local file as a document attachment.
    /// Adapters without attachment support should keep the default.
    async fn send_file(&self, _recipient_id: &str, _path: &Path, _caption: &str) -> Result<()> {
        Err(anyhow::anyhow!(
            "send_file is not supported by this channel"
        ))
    }

    fn supports_attachments(&self) -> bool {
        false
    }
}
