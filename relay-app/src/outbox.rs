//! Best-effort outbound delivery over the configured channel adapters.

use relay_channels::{ChannelAdapter, ChannelId, InboundMessage, MessageId, OutboundMessage};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Where replies go. Distinct from the sender identity used for policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Conversation {
    pub channel_id: ChannelId,
    pub recipient: String,
}

impl Conversation {
    pub fn new(channel_id: impl Into<ChannelId>, recipient: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            recipient: recipient.into(),
        }
    }

    pub fn from_inbound(inbound: &InboundMessage) -> Self {
        Self::new(
            inbound.channel_id.clone(),
            inbound.conversation_id.as_str(),
        )
    }
}

#[derive(Clone, Default)]
pub struct Outbox {
    channels: Arc<HashMap<String, Arc<dyn ChannelAdapter>>>,
}

impl Outbox {
    pub fn new(channels: HashMap<String, Arc<dyn ChannelAdapter>>) -> Self {
        Self {
            channels: Arc::new(channels),
        }
    }

    pub fn channel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.channels.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn adapter(&self, to: &Conversation) -> Option<&Arc<dyn ChannelAdapter>> {
        let adapter = self.channels.get(to.channel_id.as_str());
        if adapter.is_none() {
            tracing::warn!(channel = %to.channel_id, "no adapter for outbound channel");
        }
        adapter
    }

    pub async fn send_text(&self, to: &Conversation, text: impl Into<String>) {
        self.deliver(to, OutboundMessage::text(text)).await;
    }

    pub async fn reply(&self, to: &Conversation, message_id: &MessageId, text: impl Into<String>) {
        self.deliver(to, OutboundMessage::text(text).in_reply_to(message_id.clone()))
            .await;
    }

    async fn deliver(&self, to: &Conversation, message: OutboundMessage) {
        let Some(adapter) = self.adapter(to) else {
            return;
        };
        if let Err(e) = adapter.send(&to.recipient, message).await {
            tracing::warn!(channel = %to.channel_id, error = %e, "outbound send failed");
        }
    }

    pub async fn send_file(&self, to: &Conversation, path: &Path, caption: &str) {
        let Some(adapter) = self.adapter(to) else {
            return;
        };
        if !adapter.supports_attachments() {
            tracing::warn!(
                channel = %to.channel_id,
                path = %path.display(),
                "channel cannot deliver attachments; skipping file"
            );
            return;
        }
        if let Err(e) = adapter.send_file(&to.recipient, path, caption).await {
            tracing::warn!(
                channel = %to.channel_id,
                path = %path.display(),
                error = %e,
                "outbound file delivery failed"
            );
        }
    }
}
