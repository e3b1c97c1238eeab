//! Cloudinary re-hosting for WhatsApp media.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::detect::MediaKind;
use super::fetch::{FetchedMedia, MediaAuth, MediaFetcher};
use super::resolver::MediaUploader;
use crate::config::CloudinaryConfig;
use crate::error::GatewayError;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct UploadResponse {
    secure_url: Option<String>,
    error: Option<UploadError>,
}

#[derive(Debug, Deserialize)]
struct UploadError {
    message: String,
}

/// Cloudinary resource type for a media kind
pub fn resource_type(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Image => "image",
        MediaKind::Audio | MediaKind::Video => "video",
        MediaKind::Document | MediaKind::Unknown => "raw",
    }
}

/// Incoming transformation and forced output format per kind
fn encoding_options(kind: MediaKind) -> (Option<&'static str>, Option<&'static str>) {
    match kind {
        MediaKind::Image => (Some("q_auto:good"), None),
        MediaKind::Audio => (Some("ac_mp3,br_128k"), Some("mp3")),
        MediaKind::Video => (Some("vc_h264,q_auto"), Some("mp4")),
        MediaKind::Document | MediaKind::Unknown => (None, None),
    }
}

/// SHA-256 signature over sorted `key=value` pairs followed by the secret
pub fn sign(params: &BTreeMap<&str, String>, api_secret: &str) -> String {
    let to_sign = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");
    format!("{:x}", Sha256::digest(format!("{}{}", to_sign, api_secret)))
}

pub struct CloudinaryUploader {
    config: CloudinaryConfig,
    client: Client,
    fetcher: MediaFetcher,
}

impl CloudinaryUploader {
    pub fn new(config: CloudinaryConfig, client: Client, fetcher: MediaFetcher) -> Self {
        Self {
            config,
            client,
            fetcher,
        }
    }

    fn upload_url(&self, kind: MediaKind) -> String {
        format!(
            "{}/v1_1/{}/{}/upload",
            self.config.api_base_url.trim_end_matches('/'),
            self.config.cloud_name,
            resource_type(kind)
        )
    }
}

#[async_trait]
impl MediaUploader for CloudinaryUploader {
    async fn upload(
        &self,
        url: &str,
        mime: Option<&str>,
        kind: MediaKind,
        auth: &MediaAuth,
    ) -> Result<String, GatewayError> {
        let FetchedMedia {
            bytes,
            content_type,
            kind,
            extension,
        } = self.fetcher.fetch(url, auth, mime, Some(kind)).await?;

        // Cloudinary keys the format off the file name, so the temp file
        // carries the forced extension
        let file = tempfile::Builder::new()
            .prefix("wa-media-")
            .suffix(&format!(".{}", extension))
            .tempfile()?;
        tokio::fs::write(file.path(), bytes).await?;
        let file_name = file
            .path()
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload.bin")
            .to_string();
        let bytes = tokio::fs::read(file.path()).await?;

        let mut params: BTreeMap<&str, String> = BTreeMap::new();
        params.insert("timestamp", chrono::Utc::now().timestamp().to_string());
        params.insert("public_id", format!("wa_{}", uuid::Uuid::new_v4().simple()));
        if !self.config.folder.is_empty() {
            params.insert("folder", self.config.folder.clone());
        }
        let (transformation, format) = encoding_options(kind);
        if let Some(t) = transformation {
            params.insert("transformation", t.to_string());
        }
        if let Some(f) = format {
            params.insert("format", f.to_string());
        }
        let signature = sign(&params, &self.config.api_secret);

        let part = Part::bytes(bytes)
            .file_name(file_name.clone())
            .mime_str(&content_type)
            .map_err(|e| GatewayError::InvalidRequest(format!("bad content type: {}", e)))?;
        let mut form = Form::new()
            .part("file", part)
            .text("api_key", self.config.api_key.clone())
            .text("signature", signature)
            .text("signature_algorithm", "sha256");
        for (key, value) in params {
            form = form.text(key, value);
        }

        let endpoint = self.upload_url(kind);
        debug!("Uploading {} ({}) to {}", url, file_name, endpoint);

        let response = self
            .client
            .post(&endpoint)
            .multipart(form)
            .timeout(UPLOAD_TIMEOUT)
            .send()
            .await
            .map_err(GatewayError::from_request)?;
        let status = response.status();
        let text = response.text().await.map_err(GatewayError::from_request)?;

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(GatewayError::UpstreamAuth {
                service: "cloudinary".to_string(),
            });
        }

        let parsed: UploadResponse = serde_json::from_str(&text).map_err(|e| {
            GatewayError::MalformedResponse(format!("cloudinary response: {}", e))
        })?;

        if !status.is_success() {
            return Err(GatewayError::UpstreamStatus {
                status: status.as_u16(),
                message: parsed
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "cloudinary upload failed".to_string()),
            });
        }

        let secure_url = parsed.secure_url.ok_or_else(|| {
            GatewayError::MalformedResponse("cloudinary response missing secure_url".to_string())
        })?;
        info!("Uploaded {} media to {}", kind, secure_url);
        Ok(secure_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    fn config(api_base_url: String) -> CloudinaryConfig {
        CloudinaryConfig {
            cloud_name: "demo".to_string(),
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
            folder: "whatsapp-media".to_string(),
            api_base_url,
        }
    }

    #[test]
    fn test_resource_types() {
        assert_eq!(resource_type(MediaKind::Image), "image");
        assert_eq!(resource_type(MediaKind::Audio), "video");
        assert_eq!(resource_type(MediaKind::Video), "video");
        assert_eq!(resource_type(MediaKind::Document), "raw");
        assert_eq!(resource_type(MediaKind::Unknown), "raw");
    }

    #[test]
    fn test_signature_sorts_params() {
        let mut params = BTreeMap::new();
        params.insert("timestamp", "1315060510".to_string());
        params.insert("folder", "f".to_string());
        let expected = format!(
            "{:x}",
            Sha256::digest("folder=f&timestamp=1315060510secret".as_bytes())
        );
        assert_eq!(sign(&params, "secret"), expected);
        assert_eq!(expected.len(), 64);
    }

    #[tokio::test]
    async fn test_audio_upload_is_sent_as_video_resource() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("GET"))
            .and(matchers::path("/v/t62.7117-24/9_n.enc"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 16]))
            .mount(&server)
            .await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/v1_1/demo/video/upload"))
            .and(matchers::body_string_contains("ac_mp3,br_128k"))
            .and(matchers::body_string_contains("sha256"))
            .and(matchers::body_string_contains(".ogg"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "secure_url": "https://res.cloudinary.com/demo/video/upload/v1/a.mp3"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let uploader =
            CloudinaryUploader::new(config(server.uri()), Client::new(), MediaFetcher::default());
        let url = format!("{}/v/t62.7117-24/9_n.enc", server.uri());
        let hosted = uploader
            .upload(&url, None, MediaKind::Audio, &MediaAuth::none())
            .await
            .unwrap();
        assert_eq!(hosted, "https://res.cloudinary.com/demo/video/upload/v1/a.mp3");
    }

    #[tokio::test]
    async fn test_file_name_follows_fetched_content_type() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("GET"))
            .and(matchers::path("/download"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(vec![0x89u8, b'P', b'N', b'G']),
            )
            .mount(&server)
            .await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/v1_1/demo/image/upload"))
            .and(matchers::body_string_contains(".png\""))
            .and(matchers::body_string_contains("q_auto:good"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "secure_url": "https://res.cloudinary.com/demo/image/upload/v1/p.png"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let uploader =
            CloudinaryUploader::new(config(server.uri()), Client::new(), MediaFetcher::default());
        let hosted = uploader
            .upload(
                &format!("{}/download?id=3", server.uri()),
                None,
                MediaKind::Image,
                &MediaAuth::none(),
            )
            .await
            .unwrap();
        assert_eq!(hosted, "https://res.cloudinary.com/demo/image/upload/v1/p.png");
    }

    #[tokio::test]
    async fn test_upload_error_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("GET"))
            .and(matchers::path("/photo.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 4]))
            .mount(&server)
            .await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/v1_1/demo/image/upload"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(json!({"error": {"message": "Invalid image file"}})),
            )
            .mount(&server)
            .await;

        let uploader =
            CloudinaryUploader::new(config(server.uri()), Client::new(), MediaFetcher::default());
        let err = uploader
            .upload(
                &format!("{}/photo.jpg", server.uri()),
                None,
                MediaKind::Image,
                &MediaAuth::none(),
            )
            .await
            .unwrap_err();
        match err {
            GatewayError::UpstreamStatus { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "Invalid image file");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
