//! WhatsApp Cloud API (Meta Graph) client.

use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::MetaConfig;
use crate::error::GatewayError;
use crate::media::MediaAuth;

const GRAPH_TIMEOUT: Duration = Duration::from_secs(15);

/// Approved message template as listed by the Graph API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub name: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub components: Value,
}

/// Download location of a Cloud API media object
#[derive(Debug, Clone, Deserialize)]
pub struct MetaMedia {
    pub url: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Clone)]
pub struct MetaClient {
    client: Client,
    config: MetaConfig,
}

impl MetaClient {
    pub fn new(config: MetaConfig, client: Client) -> Self {
        Self { client, config }
    }

    /// Auth headers for lookaside media downloads
    pub fn media_auth(&self) -> MediaAuth {
        MediaAuth::meta(self.config.access_token.clone())
    }

    fn phone_number_id(&self) -> Result<&str, GatewayError> {
        self.config
            .phone_number_id
            .as_deref()
            .ok_or(GatewayError::NotConfigured("meta phone number id"))
    }

    fn business_account_id(&self) -> Result<&str, GatewayError> {
        self.config
            .business_account_id
            .as_deref()
            .ok_or(GatewayError::NotConfigured("meta business account id"))
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, GatewayError> {
        let url = format!("{}/{}", self.config.api_base_url.trim_end_matches('/'), path);
        debug!("Graph API {} {}", method, url);

        let mut request = self
            .client
            .request(method, &url)
            .bearer_auth(&self.config.access_token)
            .timeout(GRAPH_TIMEOUT);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(GatewayError::from_request)?;
        let status = response.status();
        let text = response.text().await.map_err(GatewayError::from_request)?;
        let value: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

        if status == StatusCode::UNAUTHORIZED {
            return Err(GatewayError::UpstreamAuth {
                service: "meta graph api".to_string(),
            });
        }
        if !status.is_success() {
            let message = value
                .pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| text.chars().take(200).collect());
            return Err(GatewayError::UpstreamStatus {
                status: status.as_u16(),
                message,
            });
        }
        if value.is_null() {
            return Err(GatewayError::MalformedResponse(
                "graph api returned a non-JSON body".to_string(),
            ));
        }
        Ok(value)
    }

    async fn send_message(&self, payload: Value) -> Result<String, GatewayError> {
        let path = format!("{}/messages", self.phone_number_id()?);
        let response = self.request(Method::POST, &path, Some(&payload)).await?;
        response
            .pointer("/messages/0/id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| GatewayError::MalformedResponse("message id missing".to_string()))
    }

    /// Send an approved template; returns the WhatsApp message id.
    pub async fn send_template(
        &self,
        to: &str,
        name: &str,
        language: &str,
        components: Option<Value>,
    ) -> Result<String, GatewayError> {
        let to = recipient(to)?;
        if name.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("template name is required".to_string()));
        }

        let mut template = json!({
            "name": name,
            "language": { "code": if language.is_empty() { "en_US" } else { language } },
        });
        if let Some(components) = components.filter(|c| !c.is_null()) {
            template["components"] = components;
        }

        let id = self
            .send_message(json!({
                "messaging_product": "whatsapp",
                "to": to,
                "type": "template",
                "template": template,
            }))
            .await?;
        info!("Sent template {} to {} ({})", name, to, id);
        Ok(id)
    }

    /// Free-form text; only delivered inside the 24h customer service window.
    pub async fn send_text(&self, to: &str, body: &str) -> Result<String, GatewayError> {
        let to = recipient(to)?;
        if body.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("message body is required".to_string()));
        }

        let id = self
            .send_message(json!({
                "messaging_product": "whatsapp",
                "recipient_type": "individual",
                "to": to,
                "type": "text",
                "text": { "preview_url": false, "body": body },
            }))
            .await?;
        info!("Sent text to {} ({})", to, id);
        Ok(id)
    }

    pub async fn list_templates(&self) -> Result<Vec<MessageTemplate>, GatewayError> {
        let path = format!("{}/message_templates", self.business_account_id()?);
        let response = self.request(Method::GET, &path, None).await?;
        let data = response.get("data").cloned().unwrap_or(Value::Array(vec![]));
        serde_json::from_value(data)
            .map_err(|e| GatewayError::MalformedResponse(format!("templates: {}", e)))
    }

    /// Resolve a media id to its short-lived download URL
    pub async fn media_info(&self, media_id: &str) -> Result<MetaMedia, GatewayError> {
        if media_id.is_empty() || !media_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(GatewayError::InvalidRequest(format!("invalid media id: {}", media_id)));
        }
        let response = self.request(Method::GET, media_id, None).await?;
        serde_json::from_value(response)
            .map_err(|e| GatewayError::MalformedResponse(format!("media info: {}", e)))
    }
}

/// Digits-only recipient number
fn recipient(to: &str) -> Result<String, GatewayError> {
    let number = to.split('@').next().unwrap_or_default();
    let digits: String = number.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return Err(GatewayError::InvalidRequest("recipient number is required".to_string()));
    }
    Ok(digits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> MetaClient {
        MetaClient::new(
            MetaConfig {
                access_token: "meta-token".to_string(),
                business_account_id: Some("waba1".to_string()),
                phone_number_id: Some("phone1".to_string()),
                api_base_url: server.uri(),
            },
            Client::new(),
        )
    }

    #[tokio::test]
    async fn test_send_template() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/phone1/messages"))
            .and(matchers::header("authorization", "Bearer meta-token"))
            .and(matchers::body_partial_json(json!({
                "to": "5511999999999",
                "type": "template",
                "template": {"name": "hello_world", "language": {"code": "pt_BR"}}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "messages": [{"id": "wamid.ABC"}]
            })))
            .mount(&server)
            .await;

        let id = client(&server)
            .send_template("+55 (11) 99999-9999", "hello_world", "pt_BR", None)
            .await
            .unwrap();
        assert_eq!(id, "wamid.ABC");
    }

    #[tokio::test]
    async fn test_graph_error_message_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"message": "Template name does not exist", "code": 132001}
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .send_template("5511999999999", "missing", "en_US", None)
            .await
            .unwrap_err();
        match err {
            GatewayError::UpstreamStatus { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "Template name does not exist");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(matchers::any())
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = client(&server).send_text("5511", "hi").await.unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamAuth { .. }));
    }

    #[tokio::test]
    async fn test_list_templates_and_media_info() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("GET"))
            .and(matchers::path("/waba1/message_templates"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"name": "hello_world", "language": "en_US", "status": "APPROVED", "category": "UTILITY", "components": []}]
            })))
            .mount(&server)
            .await;
        Mock::given(matchers::method("GET"))
            .and(matchers::path("/12345"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "url": "https://lookaside.fbsbx.com/whatsapp_business/attachments/?mid=12345",
                "mime_type": "image/jpeg",
                "id": "12345"
            })))
            .mount(&server)
            .await;

        let meta = client(&server);
        let templates = meta.list_templates().await.unwrap();
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].status.as_deref(), Some("APPROVED"));

        let media = meta.media_info("12345").await.unwrap();
        assert_eq!(media.mime_type.as_deref(), Some("image/jpeg"));
        assert!(media.url.contains("lookaside"));
    }

    #[tokio::test]
    async fn test_missing_phone_number_id() {
        let meta = MetaClient::new(
            MetaConfig {
                access_token: "t".to_string(),
                business_account_id: None,
                phone_number_id: None,
                api_base_url: "http://127.0.0.1:1".to_string(),
            },
            Client::new(),
        );
        assert!(matches!(
            meta.send_text("5511", "hi").await,
            Err(GatewayError::NotConfigured(_))
        ));
        assert!(matches!(
            meta.media_info("../etc").await,
            Err(GatewayError::InvalidRequest(_))
        ));
    }
}
