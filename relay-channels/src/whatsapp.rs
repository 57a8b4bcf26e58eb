use crate::traits::ChannelAdapter;
use crate::types::{InboundMessage, OutboundMessage};
use anyhow::{Result, anyhow};
use reqwest::Url;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::path::Path;
use tokio::sync::mpsc;

const GRAPH_API_BASE: &str = "https://graph.facebook.com/v20.0";
const DOCUMENT_MIME_TYPE: &str = "text/plain";

#[derive(Clone)]
pub struct WhatsAppCloudAdapter {
    http: reqwest::Client,
    access_token: String,
    phone_number_id: String,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct MediaUploadResponse {
    id: String,
}

impl WhatsAppCloudAdapter {
    pub fn new(access_token: &str, phone_number_id: &str) -> Result<Self> {
        let access_token = access_token.trim();
        if access_token.is_empty() {
            return Err(anyhow!("whatsapp access token is required"));
        }
        let phone_number_id = phone_number_id.trim();
        if phone_number_id.is_empty() {
            return Err(anyhow!("whatsapp phone number id is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            access_token: access_token.to_string(),
            phone_number_id: phone_number_id.to_string(),
            api_base: GRAPH_API_BASE.to_string(),
        })
    }

    /// Points the adapter at a different Graph API host (used by local fakes).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn endpoint_url(&self, endpoint: &str) -> Result<Url> {
        Url::parse(&format!(
            "{}/{}/{}",
            self.api_base, self.phone_number_id, endpoint
        ))
        .map_err(|e| anyhow!("invalid whatsapp graph API URL: {e}"))
    }

    async fn post_message(&self, payload: serde_json::Value) -> Result<()> {
        let url = self.endpoint_url("messages")?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.access_token)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "whatsapp send failed: status={} body={}",
                status,
                body
            ));
        }
        Ok(())
    }

    async fn upload_document(&self, file_name: &str, bytes: Vec<u8>) -> Result<String> {
        let url = self.endpoint_url("media")?;
        let part = Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(DOCUMENT_MIME_TYPE)?;
        let form = Form::new()
            .text("messaging_product", "whatsapp")
            .text("type", DOCUMENT_MIME_TYPE)
            .part("file", part);

        let response = self
            .http
            .post(url)
            .bearer_auth(&self.access_token)
            .multipart(form)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await?;
            return Err(anyhow!(
                "whatsapp media upload failed: status={} body={}",
                status,
                body
            ));
        }
        let uploaded: MediaUploadResponse = response.json().await?;
        Ok(uploaded.id)
    }
}

fn require_recipient(recipient_id: &str) -> Result<&str> {
    let to = recipient_id.trim();
    if to.is_empty() {
        return Err(anyhow!("recipient_id (E.164 phone number) is required"));
    }
    Ok(to)
}

fn text_payload(to: &str, message: &OutboundMessage) -> Result<serde_json::Value> {
    let text = message.content.trim();
    if text.is_empty() {
        return Err(anyhow!("message content is empty"));
    }
    let mut payload = serde_json::json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
        "type": "text",
        "text": {
            "preview_url": false,
            "body": text,
        }
    });
    if let Some(reply_to) = message.reply_to_message_id.as_ref() {
        payload["context"] = serde_json::json!({ "message_id": reply_to.as_str() });
    }
    Ok(payload)
}

fn document_payload(to: &str, media_id: &str, file_name: &str, caption: &str) -> serde_json::Value {
    serde_json::json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
        "type": "document",
        "document": {
            "id": media_id,
            "filename": file_name,
            "caption": caption,
        }
    })
}

#[async_trait::async_trait]
impl ChannelAdapter for WhatsAppCloudAdapter {
    fn channel_id(&self) -> &str {
        "whatsapp"
    }

    async fn start(&self, _tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        // Inbound events are delivered via webhook route wiring in relay-app.
        Ok(())
    }

    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()> {
        let to = require_recipient(recipient_id)?;
        let payload = text_payload(to, &message)?;
        self.post_message(payload).await
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn send_file(&self, recipient_id: &str, path: &Path, caption: &str) -> Result<()> {
        let to = require_recipient(recipient_id)?;
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| anyhow!("attachment path has no file name: {}", path.display()))?
            .to_string();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| anyhow!("read attachment {}: {e}", path.display()))?;
        let media_id = self.upload_document(&file_name, bytes).await?;
        tracing::debug!(%media_id, file_name = %file_name, "whatsapp document uploaded");
        self.post_message(document_payload(to, &media_id, &file_name, caption))
            .await
    }

    fn supports_attachments(&self) -> bool {
        true
    }
}
