//! Response normalization for Evolution API payloads.
//!
//! Different Evolution versions (and different endpoints of the same version)
//! wrap their records differently: bare arrays, `{ data: [...] }`,
//! `{ data: { chats: [...] } }`, `{ messages: { records: [...] } }`, or an
//! object keyed by JID. Everything here is best effort: unknown shapes
//! degrade to an empty list rather than an error.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::media::MediaKind;

/// Keys that commonly wrap the record array, in lookup order
const WRAPPER_KEYS: &[&str] = &[
    "data", "contacts", "chats", "messages", "result", "records", "response",
];

/// Keys that mark an object as a record
const RECORD_ID_KEYS: &[&str] = &["id", "jid", "remoteJid"];

const MAX_WRAPPER_DEPTH: usize = 4;

/// Extract the record array from an arbitrary payload.
pub fn normalize_records(value: &Value) -> Vec<Value> {
    normalize_at_depth(value, 0)
}

fn normalize_at_depth(value: &Value, depth: usize) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        Value::Object(map) => {
            if depth < MAX_WRAPPER_DEPTH {
                for key in WRAPPER_KEYS {
                    match map.get(*key) {
                        Some(Value::Array(items)) => return items.clone(),
                        Some(inner @ Value::Object(_)) => {
                            let nested = normalize_at_depth(inner, depth + 1);
                            if !nested.is_empty() {
                                return nested;
                            }
                        }
                        _ => {}
                    }
                }
            }

            map.values().filter(|v| is_record_like(v)).cloned().collect()
        }
        _ => Vec::new(),
    }
}

fn is_record_like(value: &Value) -> bool {
    value
        .as_object()
        .map(|obj| RECORD_ID_KEYS.iter().any(|k| obj.contains_key(*k)))
        .unwrap_or(false)
}

/// Kind of chat a JID refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Private,
    Group,
    Broadcast,
}

impl ChatKind {
    pub fn from_jid(jid: &str) -> Self {
        if jid.ends_with("@g.us") {
            ChatKind::Group
        } else if jid.ends_with("@broadcast") {
            ChatKind::Broadcast
        } else {
            ChatKind::Private
        }
    }
}

/// Loose contact shape handed to the dashboard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    /// Unix seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_pic_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unread_count: Option<i64>,
    #[serde(rename = "type")]
    pub kind: ChatKind,
}

impl Contact {
    /// Patch a raw record of any known shape into a contact.
    pub fn from_record(record: &Value) -> Option<Self> {
        let obj = record.as_object()?;

        let jid = first_str(record, &["remoteJid", "jid", "owner"]);
        let id = first_str(record, &["id"]).or_else(|| jid.clone())?;
        let jid_for_phone = jid.clone().unwrap_or_else(|| id.clone());
        let kind = ChatKind::from_jid(&jid_for_phone);

        let phone = first_str(record, &["phone", "number"]).or_else(|| {
            if kind == ChatKind::Private {
                phone_from_jid(&jid_for_phone)
            } else {
                None
            }
        });

        let name = first_str(
            record,
            &["name", "pushName", "verifiedName", "notify", "subject", "formattedName"],
        );

        let last_message = obj.get("lastMessage").and_then(|lm| match lm {
            Value::String(s) => Some(s.clone()),
            Value::Object(_) => lm
                .get("message")
                .and_then(message_text)
                .or_else(|| message_text(lm)),
            _ => None,
        });

        let timestamp = first_timestamp(
            record,
            &[
                "lastMessageTimestamp",
                "conversationTimestamp",
                "timestamp",
                "t",
                "updatedAt",
            ],
        )
        .or_else(|| {
            obj.get("lastMessage")
                .and_then(|lm| first_timestamp(lm, &["messageTimestamp"]))
        });

        let unread_count = ["unreadCount", "unreadMessages", "unread"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_i64));

        Some(Self {
            id,
            name,
            phone,
            last_message,
            timestamp,
            status: first_str(record, &["status"]),
            profile_pic_url: first_str(record, &["profilePicUrl", "profilePictureUrl", "imgUrl"]),
            unread_count,
            kind,
        })
    }

    /// Best-effort contact for a chat record
    pub fn from_chat_record(record: &Value) -> Option<Self> {
        let mut contact = Self::from_record(record)?;
        // v2 chats carry a database id; the JID is what the UI addresses
        if let Some(jid) = first_str(record, &["remoteJid"]) {
            if !contact.id.contains('@') {
                contact.id = jid;
            }
        }
        Some(contact)
    }
}

/// Media attached to a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMedia {
    pub kind: MediaKind,
    /// Original (possibly encrypted) media URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Browser-renderable URL, filled in after resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_url: Option<String>,
}

/// Loose message shape handed to the dashboard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub from_me: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    pub message_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<MessageMedia>,
}

impl Message {
    /// Patch a Baileys-style message record into a message.
    pub fn from_record(record: &Value) -> Option<Self> {
        let key = record.get("key");
        let id = key
            .and_then(|k| k.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| first_str(record, &["id"]))?;
        let chat_id = key
            .and_then(|k| k.get("remoteJid"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| first_str(record, &["remoteJid", "chatId"]))
            .unwrap_or_default();
        let from_me = key
            .and_then(|k| k.get("fromMe"))
            .and_then(Value::as_bool)
            .or_else(|| record.get("fromMe").and_then(Value::as_bool))
            .unwrap_or(false);

        let content = record.get("message").unwrap_or(&Value::Null);
        let media = message_media(content);
        let message_type = first_str(record, &["messageType"])
            .or_else(|| {
                content
                    .as_object()
                    .and_then(|obj| obj.keys().find(|k| *k != "messageContextInfo").cloned())
            })
            .unwrap_or_else(|| "unknown".to_string());

        Some(Self {
            id,
            chat_id,
            from_me,
            push_name: first_str(record, &["pushName"]),
            timestamp: first_timestamp(record, &["messageTimestamp", "timestamp"]),
            message_type,
            text: message_text(content),
            media,
        })
    }
}

/// Normalize and format contacts, dropping duplicates.
pub fn normalize_contacts(payload: &Value) -> Vec<Contact> {
    dedup_by_id(
        normalize_records(payload)
            .iter()
            .filter_map(Contact::from_record)
            .collect(),
        |c| c.id.clone(),
    )
}

/// Contacts derived from a chat list payload.
pub fn normalize_chat_contacts(payload: &Value) -> Vec<Contact> {
    dedup_by_id(
        normalize_records(payload)
            .iter()
            .filter_map(Contact::from_chat_record)
            .collect(),
        |c| c.id.clone(),
    )
}

/// Normalize and format messages, dropping duplicates.
pub fn normalize_messages(payload: &Value) -> Vec<Message> {
    dedup_by_id(
        normalize_records(payload)
            .iter()
            .filter_map(Message::from_record)
            .collect(),
        |m| m.id.clone(),
    )
}

fn dedup_by_id<T>(items: Vec<T>, id: impl Fn(&T) -> String) -> Vec<T> {
    let mut seen = HashSet::new();
    items.into_iter().filter(|item| seen.insert(id(item))).collect()
}

/// Text body of a Baileys message content object
pub fn message_text(content: &Value) -> Option<String> {
    content
        .get("conversation")
        .and_then(Value::as_str)
        .or_else(|| {
            content
                .get("extendedTextMessage")
                .and_then(|m| m.get("text"))
                .and_then(Value::as_str)
        })
        .or_else(|| {
            ["imageMessage", "videoMessage", "documentMessage"]
                .iter()
                .find_map(|k| content.get(*k).and_then(|m| m.get("caption")).and_then(Value::as_str))
        })
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}

fn message_media(content: &Value) -> Option<MessageMedia> {
    const MEDIA_KEYS: &[(&str, MediaKind)] = &[
        ("imageMessage", MediaKind::Image),
        ("stickerMessage", MediaKind::Image),
        ("videoMessage", MediaKind::Video),
        ("audioMessage", MediaKind::Audio),
        ("pttMessage", MediaKind::Audio),
        ("documentMessage", MediaKind::Document),
        ("documentWithCaptionMessage", MediaKind::Document),
    ];

    MEDIA_KEYS.iter().find_map(|(key, kind)| {
        let mut media = content.get(*key)?;
        // documentWithCaptionMessage nests the real document one level down
        if let Some(inner) = media.get("message").and_then(|m| m.get("documentMessage")) {
            media = inner;
        }
        Some(MessageMedia {
            kind: *kind,
            url: first_str(media, &["url", "mediaUrl"]),
            mime_type: first_str(media, &["mimetype", "mimeType"]),
            file_name: first_str(media, &["fileName", "title"]),
            resolved_url: None,
        })
    })
}

/// Extract a QR code from the various connect/create response shapes.
pub fn extract_qr_code(resp: &Value) -> Option<String> {
    resp.get("qrcode")
        .and_then(|q| q.get("base64"))
        .and_then(Value::as_str)
        .or_else(|| resp.get("base64").and_then(Value::as_str))
        .or_else(|| {
            resp.get("qrcode")
                .and_then(Value::as_str)
                .filter(|s| s.starts_with("data:"))
        })
        .or_else(|| resp.get("code").and_then(Value::as_str))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Extract the connection state (`open`, `close`, `connecting`).
pub fn extract_connection_state(resp: &Value) -> Option<String> {
    resp.get("instance")
        .and_then(|i| i.get("state"))
        .and_then(Value::as_str)
        .or_else(|| resp.get("state").and_then(Value::as_str))
        .map(str::to_string)
}

/// Phone number part of a JID (`5511999999999:12@s.whatsapp.net` -> `5511999999999`)
pub fn phone_from_jid(jid: &str) -> Option<String> {
    let user = jid.split('@').next()?;
    let user = user.split(':').next().unwrap_or(user);
    if !user.is_empty() && user.chars().all(|c| c.is_ascii_digit()) {
        Some(user.to_string())
    } else {
        None
    }
}

/// JID for a phone number or an existing JID
pub fn to_jid(number: &str) -> String {
    if number.contains('@') {
        return number.to_string();
    }
    let digits: String = number.chars().filter(|c| c.is_ascii_digit()).collect();
    format!("{}@s.whatsapp.net", digits)
}

fn first_str(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| {
        value
            .get(*k)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

/// Timestamps arrive as seconds, milliseconds, numeric strings, ISO strings,
/// or protobuf Long objects (`{ low, high }`).
fn first_timestamp(value: &Value, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|k| value.get(*k).and_then(parse_timestamp))
}

fn parse_timestamp(value: &Value) -> Option<i64> {
    let raw = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
        Value::String(s) => match s.trim().parse::<i64>() {
            Ok(n) => n,
            Err(_) => chrono::DateTime::parse_from_rfc3339(s.trim())
                .ok()?
                .timestamp(),
        },
        Value::Object(_) => value.get("low").and_then(Value::as_i64)?,
        _ => return None,
    };
    // Millisecond timestamps are normalized to seconds
    Some(if raw > 100_000_000_000 { raw / 1000 } else { raw })
}
