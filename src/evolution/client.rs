//! Evolution API client built on the fallback prober.

use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::Method;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::endpoints::Operation;
use super::normalize::{
    extract_connection_state, extract_qr_code, normalize_chat_contacts, normalize_contacts,
    normalize_messages, to_jid, Contact, Message,
};
use super::prober::{EndpointProber, ProbeRequest};
use crate::credentials::ServerCredentials;
use crate::error::GatewayError;

/// Decoded media returned by Evolution for an encrypted message
#[derive(Debug, Clone)]
pub struct DecodedMedia {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

/// Result of a sendText call
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SentMessage {
    pub message_id: Option<String>,
    pub remote_jid: String,
}

/// Evolution API operations for one set of credentials
#[derive(Clone, Default)]
pub struct EvolutionClient {
    prober: EndpointProber,
}

impl EvolutionClient {
    pub fn new(prober: EndpointProber) -> Self {
        Self { prober }
    }

    pub fn prober(&self) -> &EndpointProber {
        &self.prober
    }

    pub async fn fetch_contacts(
        &self,
        creds: &ServerCredentials,
    ) -> Result<Vec<Contact>, GatewayError> {
        let success = self
            .prober
            .probe(creds, &ProbeRequest::new(Operation::FetchContacts))
            .await?;
        let contacts = normalize_contacts(&success.body);
        info!("Fetched {} contacts from {}", contacts.len(), success.url);
        Ok(contacts)
    }

    /// Contacts derived from the chat list
    pub async fn fetch_chats(&self, creds: &ServerCredentials) -> Result<Vec<Contact>, GatewayError> {
        let success = self
            .prober
            .probe(creds, &ProbeRequest::new(Operation::FetchChats))
            .await?;
        Ok(normalize_chat_contacts(&success.body))
    }

    pub async fn fetch_messages(
        &self,
        creds: &ServerCredentials,
        remote_jid: &str,
        limit: usize,
    ) -> Result<Vec<Message>, GatewayError> {
        let request = ProbeRequest::new(Operation::FetchMessages)
            .with_remote_jid(remote_jid)
            .with_limit(limit);
        let success = self.prober.probe(creds, &request).await?;

        // v1 ignores the filter on some builds, so filter again here
        let mut messages: Vec<Message> = normalize_messages(&success.body)
            .into_iter()
            .filter(|m| m.chat_id.is_empty() || m.chat_id == remote_jid)
            .collect();
        messages.sort_by_key(|m| m.timestamp.unwrap_or_default());
        if messages.len() > limit {
            messages.drain(..messages.len() - limit);
        }
        Ok(messages)
    }

    pub async fn connection_state(&self, creds: &ServerCredentials) -> Result<String, GatewayError> {
        let success = self
            .prober
            .probe(creds, &ProbeRequest::new(Operation::ConnectionState))
            .await?;
        extract_connection_state(&success.body).ok_or_else(|| {
            GatewayError::MalformedResponse("connection state missing from response".to_string())
        })
    }

    /// QR code (base64 data URL or pairing code) for a disconnected instance
    pub async fn qr_code(&self, creds: &ServerCredentials) -> Result<Option<String>, GatewayError> {
        let success = self
            .prober
            .probe(creds, &ProbeRequest::new(Operation::Connect))
            .await?;
        let qr = extract_qr_code(&success.body);
        if qr.is_none() {
            debug!("Connect response carried no QR code (instance probably already open)");
        }
        Ok(qr)
    }

    /// Ask Evolution to download and decrypt the media of a stored message.
    pub async fn media_base64(
        &self,
        creds: &ServerCredentials,
        message_id: &str,
    ) -> Result<DecodedMedia, GatewayError> {
        let request = ProbeRequest::new(Operation::MediaBase64).with_message_id(message_id);
        let success = self.prober.probe(creds, &request).await?;

        let encoded = success
            .body
            .get("base64")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::MalformedResponse("base64 field missing".to_string()))?;
        // Some builds return a data URL instead of the raw payload
        let encoded = encoded
            .split_once(";base64,")
            .map(|(_, data)| data)
            .unwrap_or(encoded);
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| GatewayError::MalformedResponse(format!("invalid base64: {}", e)))?;

        Ok(DecodedMedia {
            bytes,
            mime_type: success
                .body
                .get("mimetype")
                .or_else(|| success.body.get("mimeType"))
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    /// Send a text message; accepts a phone number or a JID.
    pub async fn send_text(
        &self,
        creds: &ServerCredentials,
        number: &str,
        text: &str,
    ) -> Result<SentMessage, GatewayError> {
        if number.trim().is_empty() || text.trim().is_empty() {
            return Err(GatewayError::InvalidRequest(
                "number and text are required".to_string(),
            ));
        }

        let remote_jid = to_jid(number);
        let recipient = remote_jid
            .strip_suffix("@s.whatsapp.net")
            .unwrap_or(&remote_jid)
            .to_string();
        // v2 reads `text`, v1 reads `textMessage.text`
        let body = json!({
            "number": recipient,
            "text": text,
            "textMessage": { "text": text },
        });

        let response = self
            .prober
            .send(
                creds,
                Method::POST,
                "/message/sendText/{instance}",
                Some(&body),
                Operation::FetchMessages.timeout(),
            )
            .await?;

        let message_id = response
            .get("key")
            .and_then(|k| k.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string);
        info!("Sent text to {} (id {:?})", remote_jid, message_id);

        Ok(SentMessage {
            message_id,
            remote_jid,
        })
    }
}
