use crate::config::{RelayConfig, WHATSAPP_JID_DOMAIN};
use crate::guard::constant_time_eq;
use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use relay_channels::{ChannelAdapter, InboundMessage, WhatsAppCloudAdapter};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

pub const WHATSAPP_CHANNEL_ID: &str = "whatsapp";
pub const WHATSAPP_WEBHOOK_PATH: &str = "/api/v1/relay/channels/whatsapp/webhook";

pub struct ChannelLoadResult {
    pub channels: HashMap<String, Arc<dyn ChannelAdapter>>,
    pub routers: Vec<Router>,
}

pub async fn load_enabled_channels(
    cfg: &RelayConfig,
    inbound_tx: mpsc::Sender<InboundMessage>,
) -> Result<ChannelLoadResult> {
    let mut channels: HashMap<String, Arc<dyn ChannelAdapter>> = HashMap::new();
    let mut routers = Vec::new();

    let whatsapp = &cfg.channels.whatsapp;
    if whatsapp.enabled {
        let adapter = Arc::new(WhatsAppCloudAdapter::new(
            &whatsapp.access_token,
            &whatsapp.phone_number_id,
        )?);
        adapter.start(inbound_tx.clone()).await?;
        routers.push(build_whatsapp_webhook_router(
            inbound_tx,
            whatsapp.webhook_verify_token.clone(),
            whatsapp.app_secret.clone(),
        ));
        if whatsapp
            .app_secret
            .as_deref()
            .is_none_or(|secret| secret.trim().is_empty())
        {
            tracing::warn!("channels.whatsapp.app_secret is not set; webhook signatures are not verified");
        }
        let adapter: Arc<dyn ChannelAdapter> = adapter;
        channels.insert(WHATSAPP_CHANNEL_ID.to_string(), adapter);
    }

    if channels.is_empty() {
        tracing::warn!("no chat channel is enabled; no commands can arrive");
    }
    Ok(ChannelLoadResult { channels, routers })
}

#[derive(Clone)]
struct WhatsAppWebhookState {
    inbound_tx: mpsc::Sender<InboundMessage>,
    verify_token: String,
    app_secret: Option<String>,
}

fn build_whatsapp_webhook_router(
    inbound_tx: mpsc::Sender<InboundMessage>,
    verify_token: String,
    app_secret: Option<String>,
) -> Router {
    let state = Arc::new(WhatsAppWebhookState {
        inbound_tx,
        verify_token: verify_token.trim().to_string(),
        app_secret: app_secret
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned),
    });
    Router::new()
        .route(
            WHATSAPP_WEBHOOK_PATH,
            get(whatsapp_webhook_verify).post(whatsapp_webhook_ingest),
        )
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct WhatsAppVerifyQuery {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

async fn whatsapp_webhook_verify(
    State(state): State<Arc<WhatsAppWebhookState>>,
    Query(query): Query<WhatsAppVerifyQuery>,
) -> impl IntoResponse {
    let mode = query.mode.as_deref().map(str::trim).unwrap_or_default();
    let token = query
        .verify_token
        .as_deref()
        .map(str::trim)
        .unwrap_or_default();
    let token_ok = !state.verify_token.is_empty() && constant_time_eq(token, &state.verify_token);
    if mode.eq_ignore_ascii_case("subscribe") && token_ok {
        tracing::info!("whatsapp webhook verified");
        return (StatusCode::OK, query.challenge.unwrap_or_default()).into_response();
    }
    tracing::warn!(mode, "whatsapp webhook verification rejected");
    (StatusCode::FORBIDDEN, "verification failed".to_string()).into_response()
}

fn error_response(status: StatusCode, error: String) -> axum::response::Response {
    (
        status,
        Json(serde_json::json!({
            "status": "error",
            "error": error,
        })),
    )
        .into_response()
}

#[tracing::instrument(level = "info", skip_all)]
async fn whatsapp_webhook_ingest(
    State(state): State<Arc<WhatsAppWebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Some(secret) = state.app_secret.as_deref() {
        if !verify_whatsapp_signature(&headers, &body, secret) {
            tracing::warn!("whatsapp webhook signature rejected");
            return error_response(
                StatusCode::UNAUTHORIZED,
                "invalid x-hub-signature-256".to_string(),
            );
        }
    }

    let payload: WhatsAppWebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(error) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("invalid whatsapp webhook payload: {error}"),
            );
        }
    };

    let mut accepted = 0usize;
    for change in payload.entry.into_iter().flat_map(|entry| entry.changes) {
        let phone_number_id = change
            .value
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.phone_number_id.as_deref())
            .unwrap_or_default()
            .to_string();
        for message in &change.value.messages {
            let Some(inbound) = convert_whatsapp_message(message, &phone_number_id) else {
                tracing::debug!(message_type = %message.message_type, "skipping non-text whatsapp message");
                continue;
            };
            if let Err(error) = state.inbound_tx.send(inbound).await {
                return error_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    format!("whatsapp inbound queue closed: {error}"),
                );
            }
            accepted += 1;
        }
    }

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "accepted": accepted,
        })),
    )
        .into_response()
}

/// Text messages only. The sender becomes a JID (`<digits>@s.whatsapp.net`);
/// replies go back to the bare number.
fn convert_whatsapp_message(
    message: &WhatsAppMessage,
    phone_number_id: &str,
) -> Option<InboundMessage> {
    let from = message.from.trim();
    if from.is_empty() || message.message_type != "text" {
        return None;
    }
    let content = message
        .text
        .as_ref()
        .map(|text| text.body.trim())
        .filter(|value| !value.is_empty())?
        .to_string();
    let message_id = match message.id.trim() {
        "" => ulid::Ulid::new().to_string(),
        id => id.to_string(),
    };

    Some(InboundMessage {
        message_id: message_id.into(),
        channel_id: WHATSAPP_CHANNEL_ID.into(),
        sender_id: format!("{from}@{WHATSAPP_JID_DOMAIN}").into(),
        conversation_id: from.into(),
        is_group: false,
        content,
        metadata: serde_json::json!({
            "provider": "whatsapp_cloud",
            "phone_number_id": phone_number_id,
            "message": message,
        }),
        received_at: Utc::now(),
    })
}

fn verify_whatsapp_signature(headers: &HeaderMap, body: &[u8], app_secret: &str) -> bool {
    let Some(signature_header) = headers
        .get("x-hub-signature-256")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
    else {
        return false;
    };
    let expected = format!("sha256={}", hmac_sha256_hex(app_secret.as_bytes(), body));
    constant_time_eq(&expected, signature_header)
}

const SHA256_BLOCK: usize = 64;

fn hmac_sha256_hex(key: &[u8], payload: &[u8]) -> String {
    let mut key_block = [0_u8; SHA256_BLOCK];
    if key.len() > SHA256_BLOCK {
        let digest = Sha256::digest(key);
        key_block[..digest.len()].copy_from_slice(&digest);
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }

    let inner_pad = key_block.map(|byte| byte ^ 0x36);
    let outer_pad = key_block.map(|byte| byte ^ 0x5c);

    let inner_digest = Sha256::new()
        .chain_update(inner_pad)
        .chain_update(payload)
        .finalize();
    let digest = Sha256::new()
        .chain_update(outer_pad)
        .chain_update(inner_digest)
        .finalize();

    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[derive(Debug, Deserialize)]
struct WhatsAppWebhookPayload {
    #[serde(default)]
    entry: Vec<WhatsAppEntry>,
}

#[derive(Debug, Deserialize)]
struct WhatsAppEntry {
    #[serde(default)]
    changes: Vec<WhatsAppChange>,
}

#[derive(Debug, Deserialize)]
struct WhatsAppChange {
    #[serde(default)]
    value: WhatsAppChangeValue,
}

#[derive(Debug, Default, Deserialize)]
struct WhatsAppChangeValue {
    #[serde(default)]
    metadata: Option<WhatsAppMetadata>,
    #[serde(default)]
    messages: Vec<WhatsAppMessage>,
}

#[derive(Debug, Clone, Deserialize)]
struct WhatsAppMetadata {
    #[serde(default)]
    phone_number_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WhatsAppMessage {
    #[serde(default)]
    id: String,
    #[serde(default)]
    from: String,
    #[serde(rename = "type", default)]
    message_type: String,
    #[serde(default)]
    text: Option<WhatsAppText>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WhatsAppText {
    #[serde(default)]
    body: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{HeaderValue, Request};
    use tower::util::ServiceExt;

    const PAYLOAD: &str = r#"{
        "entry": [{
            "changes": [{
                "value": {
                    "metadata": { "phone_number_id": "12345" },
                    "messages": [
                        { "id": "wamid.1", "from": "628123456789", "type": "text", "text": { "body": " .status " } },
                        { "id": "wamid.2", "from": "628123456789", "type": "image" }
                    ]
                }
            }]
        }]
    }"#;

    fn text_message(body: &str) -> WhatsAppMessage {
        WhatsAppMessage {
            id: "wamid.abc".to_string(),
            from: "628123456789".to_string(),
            message_type: "text".to_string(),
            text: Some(WhatsAppText {
                body: body.to_string(),
            }),
        }
    }

    fn router(app_secret: Option<&str>) -> (Router, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(8);
        let router =
            build_whatsapp_webhook_router(tx, "verify-me".to_string(), app_secret.map(str::to_string));
        (router, rx)
    }

    fn signed(body: &str, secret: &str) -> Request<Body> {
        let signature = format!("sha256={}", hmac_sha256_hex(secret.as_bytes(), body.as_bytes()));
        Request::builder()
            .method("POST")
            .uri(WHATSAPP_WEBHOOK_PATH)
            .header("x-hub-signature-256", signature)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    #[test]
    fn hmac_matches_known_sha256_vector() {
        let digest = hmac_sha256_hex(b"key", b"The quick brown fox jumps over the lazy dog");
        assert_eq!(
            digest,
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn signature_verification_accepts_valid_header() {
        let body = br#"{"hello":"world"}"#;
        let signature = format!("sha256={}", hmac_sha256_hex(b"secret", body));
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-hub-signature-256",
            HeaderValue::from_str(&signature).expect("signature header"),
        );
        assert!(verify_whatsapp_signature(&headers, body, "secret"));
        assert!(!verify_whatsapp_signature(&headers, body, "wrong"));
        assert!(!verify_whatsapp_signature(&HeaderMap::new(), body, "secret"));
    }

    #[test]
    fn text_message_becomes_jid_sender_and_number_conversation() {
        let inbound = convert_whatsapp_message(&text_message(" .help "), "12345")
            .expect("text message should convert");
        assert_eq!(inbound.channel_id.as_str(), "whatsapp");
        assert_eq!(inbound.sender_id.as_str(), "628123456789@s.whatsapp.net");
        assert_eq!(inbound.conversation_id.as_str(), "628123456789");
        assert_eq!(inbound.message_id.as_str(), "wamid.abc");
        assert_eq!(inbound.content, ".help");
    }

    #[test]
    fn non_text_and_empty_messages_are_skipped() {
        let mut image = text_message("caption");
        image.message_type = "image".to_string();
        assert!(convert_whatsapp_message(&image, "12345").is_none());
        assert!(convert_whatsapp_message(&text_message("   "), "12345").is_none());

        let mut anonymous = text_message(".help");
        anonymous.from = String::new();
        assert!(convert_whatsapp_message(&anonymous, "12345").is_none());
    }

    #[tokio::test]
    async fn verify_handshake_echoes_challenge_only_for_matching_token() {
        let (router, _rx) = router(None);
        let ok = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!(
                        "{WHATSAPP_WEBHOOK_PATH}?hub.mode=subscribe&hub.verify_token=verify-me&hub.challenge=42"
                    ))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(ok.status(), StatusCode::OK);
        let body = to_bytes(ok.into_body(), 1024).await.expect("body");
        assert_eq!(&body[..], b"42");

        let denied = router
            .oneshot(
                Request::builder()
                    .uri(format!(
                        "{WHATSAPP_WEBHOOK_PATH}?hub.mode=subscribe&hub.verify_token=nope&hub.challenge=42"
                    ))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn ingest_rejects_bad_signatures() {
        let (router, mut rx) = router(Some("app-secret"));
        let response = router
            .oneshot(signed(PAYLOAD, "other-secret"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn ingest_forwards_text_messages() {
        let (router, mut rx) = router(Some("app-secret"));
        let response = router
            .oneshot(signed(PAYLOAD, "app-secret"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), 1024).await.expect("body");
        let json: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(json["accepted"], 1);

        let inbound = rx.try_recv().expect("queued message");
        assert_eq!(inbound.content, ".status");
        assert_eq!(inbound.metadata["phone_number_id"], "12345");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn ingest_rejects_malformed_json() {
        let (router, _rx) = router(None);
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(WHATSAPP_WEBHOOK_PATH)
                    .body(Body::from("not json"))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn disabled_whatsapp_loads_no_channels() {
        let (tx, _rx) = mpsc::channel(1);
        let loaded = load_enabled_channels(&RelayConfig::default(), tx)
            .await
            .expect("load");
        assert!(loaded.channels.is_empty());
        assert!(loaded.routers.is_empty());
    }
}
