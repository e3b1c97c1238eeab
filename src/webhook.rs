//! Evolution API webhook receiver.
//!
//! Evolution posts every instance event to one URL (or to `/<event-name>`
//! when "webhook by events" is enabled). Message events are normalized,
//! their media resolved and the result stored for the instance's owner.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::evolution::normalize::{
    extract_connection_state, extract_qr_code, normalize_messages, phone_from_jid,
};
use crate::evolution::{ChatKind, Message};
use crate::media::MediaAuth;
use crate::storage::{StoredContact, StoredMessage};
use crate::web::AppState;

/// `MESSAGES_UPSERT`, `messages-upsert` and `messages.upsert` all name the same event
pub fn normalize_event_name(raw: &str) -> String {
    raw.trim()
        .trim_matches('/')
        .to_lowercase()
        .replace(['_', '-', '/'], ".")
}

/// Events we act on
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookEvent {
    MessagesUpsert(Vec<Message>),
    ConnectionUpdate(String),
    QrCodeUpdated(String),
    Ignored,
}

impl WebhookEvent {
    pub fn parse(name: &str, data: &Value) -> Self {
        match name {
            "messages.upsert" | "messages.set" => {
                // A single message arrives as the bare record
                let messages = if data.get("key").is_some() {
                    Message::from_record(data).into_iter().collect()
                } else {
                    normalize_messages(data)
                };
                Self::MessagesUpsert(messages)
            }
            "connection.update" => extract_connection_state(data)
                .map(Self::ConnectionUpdate)
                .unwrap_or(Self::Ignored),
            "qrcode.updated" => extract_qr_code(data)
                .map(Self::QrCodeUpdated)
                .unwrap_or(Self::Ignored),
            _ => Self::Ignored,
        }
    }
}

/// Apply an event to the store and shared state. Returns the number of stored messages.
pub async fn process_event(
    state: &AppState,
    instance: &str,
    event: WebhookEvent,
) -> Result<usize, GatewayError> {
    match event {
        WebhookEvent::MessagesUpsert(messages) => store_messages(state, instance, messages).await,
        WebhookEvent::ConnectionUpdate(connection) => {
            info!("Instance {} connection is now {}", instance, connection);
            state.set_connection_state(instance, &connection).await;
            Ok(0)
        }
        WebhookEvent::QrCodeUpdated(qr) => {
            debug!("New QR code for instance {}", instance);
            state.set_qr_code(instance, qr).await;
            Ok(0)
        }
        WebhookEvent::Ignored => Ok(0),
    }
}

async fn store_messages(
    state: &AppState,
    instance: &str,
    messages: Vec<Message>,
) -> Result<usize, GatewayError> {
    let user_id = state.credentials.resolve_instance(instance)?;
    // Bound to the Evolution host; CDN URLs are fetched without credentials
    let auth = state
        .credentials
        .resolve(&user_id)
        .map(|creds| MediaAuth::evolution(&creds))
        .unwrap_or_default();

    let mut stored = 0;
    for mut message in messages {
        if message.chat_id.is_empty() || ChatKind::from_jid(&message.chat_id) == ChatKind::Broadcast {
            continue;
        }

        if let Some(media) = message.media.as_mut() {
            if let Some(url) = media.url.as_deref() {
                match state
                    .resolver
                    .resolve(url, media.mime_type.as_deref(), Some(media.kind), &auth)
                    .await
                {
                    Ok(resolved) => media.resolved_url = Some(resolved.url),
                    Err(e) => warn!("Could not resolve media of {}: {}", message.id, e),
                }
            }
        }

        let row = StoredMessage::from_message(&message);
        let preview = message
            .text
            .clone()
            .or_else(|| message.media.as_ref().map(|m| format!("[{}]", m.kind)));

        state.store.upsert_contact(
            &user_id,
            &StoredContact {
                id: message.chat_id.clone(),
                name: message.push_name.clone().filter(|_| !message.from_me),
                phone: phone_from_jid(&message.chat_id),
                last_message: preview,
                last_message_time: row.timestamp,
                status: None,
                profile_pic_url: None,
            },
        )?;
        state.store.add_message(&user_id, &row)?;
        stored += 1;
    }

    info!("Stored {} webhook message(s) for user {}", stored, user_id);
    Ok(stored)
}

/// `POST /api/evolution-webhook`
pub async fn receive(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    handle(&state, None, &body).await
}

/// `POST /api/evolution-webhook/*event`
pub async fn receive_event(
    State(state): State<Arc<AppState>>,
    Path(event): Path<String>,
    body: Bytes,
) -> Response {
    handle(&state, Some(event), &body).await
}

async fn handle(state: &AppState, path_event: Option<String>, body: &[u8]) -> Response {
    let payload: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            warn!("Rejected webhook with invalid JSON: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "body must be JSON", "code": "invalid_request" })),
            )
                .into_response();
        }
    };

    let raw_name = payload
        .get("event")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or(path_event)
        .unwrap_or_default();
    let name = normalize_event_name(&raw_name);
    let instance = payload
        .get("instance")
        .and_then(|i| i.as_str().or_else(|| i.get("instanceName").and_then(Value::as_str)))
        .or_else(|| payload.get("instanceName").and_then(Value::as_str))
        .unwrap_or_default()
        .to_string();

    let data = payload.get("data").unwrap_or(&payload);
    let event = WebhookEvent::parse(&name, data);
    if event == WebhookEvent::Ignored {
        debug!("Ignoring webhook event '{}' from '{}'", name, instance);
    }

    let processed = match process_event(state, &instance, event).await {
        Ok(n) => n,
        Err(e) => {
            // Evolution retries on non-2xx, so failures are only logged
            warn!("Webhook event '{}' from '{}' failed: {}", name, instance, e);
            0
        }
    };

    Json(json!({ "received": true, "event": name, "processed": processed })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_name_normalization() {
        assert_eq!(normalize_event_name("messages-upsert"), "messages.upsert");
        assert_eq!(normalize_event_name("MESSAGES_UPSERT"), "messages.upsert");
        assert_eq!(normalize_event_name("messages.upsert"), "messages.upsert");
        assert_eq!(normalize_event_name("/connection-update"), "connection.update");
    }

    #[test]
    fn test_parse_single_message() {
        let data = json!({
            "key": {"id": "ABC", "remoteJid": "5511999999999@s.whatsapp.net", "fromMe": false},
            "pushName": "Ana",
            "message": {"conversation": "oi"},
            "messageTimestamp": 1700000000
        });
        match WebhookEvent::parse("messages.upsert", &data) {
            WebhookEvent::MessagesUpsert(messages) => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].id, "ABC");
                assert_eq!(messages[0].text.as_deref(), Some("oi"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_parse_connection_and_qr() {
        assert_eq!(
            WebhookEvent::parse("connection.update", &json!({"state": "open"})),
            WebhookEvent::ConnectionUpdate("open".to_string())
        );
        assert_eq!(
            WebhookEvent::parse(
                "qrcode.updated",
                &json!({"qrcode": {"base64": "data:image/png;base64,AAA"}})
            ),
            WebhookEvent::QrCodeUpdated("data:image/png;base64,AAA".to_string())
        );
        assert_eq!(
            WebhookEvent::parse("presence.update", &json!({})),
            WebhookEvent::Ignored
        );
    }
}
