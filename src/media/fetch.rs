//! Media download with WhatsApp-vendor auth headers.

use std::time::Duration;

use reqwest::{Client, StatusCode, Url};
use tracing::debug;

use super::detect::{
    content_type_for, detect_media_type, extension_for, is_encrypted_media, MediaKind,
};
use crate::credentials::ServerCredentials;
use crate::error::GatewayError;

/// Maximum media size to fetch (50MB)
const MAX_MEDIA_SIZE: usize = 50 * 1024 * 1024;

/// Request timeout
const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Redirects are followed here, not by reqwest, so auth is re-checked per hop
const MAX_REDIRECTS: usize = 5;

/// Headers to authenticate a media download, bound to the hosts that may see them
#[derive(Debug, Clone, Default)]
pub struct MediaAuth {
    apikey: Option<String>,
    bearer: Option<String>,
    scope: AuthScope,
}

#[derive(Debug, Clone, Default, PartialEq)]
enum AuthScope {
    #[default]
    Nowhere,
    /// Scheme-less origin: host plus effective port
    Origin(String, u16),
    Meta,
}

/// Graph API and the lookaside CDN that serves Cloud API media
pub fn is_meta_media_host(url: &str) -> bool {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        .is_some_and(|host| {
            host == "graph.facebook.com" || host == "fbsbx.com" || host.ends_with(".fbsbx.com")
        })
}

fn origin_of(url: &Url) -> Option<(String, u16)> {
    Some((
        url.host_str()?.to_ascii_lowercase(),
        url.port_or_known_default()?,
    ))
}

impl MediaAuth {
    pub fn none() -> Self {
        Self::default()
    }

    /// Evolution API: `apikey` header plus the same token as bearer, sent
    /// only to the Evolution server itself
    pub fn evolution(creds: &ServerCredentials) -> Self {
        let scope = Url::parse(&creds.api_url)
            .ok()
            .as_ref()
            .and_then(origin_of)
            .map(|(host, port)| AuthScope::Origin(host, port))
            .unwrap_or_default();
        Self {
            apikey: Some(creds.api_token.clone()),
            bearer: Some(creds.api_token.clone()),
            scope,
        }
    }

    /// Graph API / lookaside downloads
    pub fn meta(token: impl Into<String>) -> Self {
        Self {
            apikey: None,
            bearer: Some(token.into()),
            scope: AuthScope::Meta,
        }
    }

    /// Whether the headers may be sent to this URL
    pub fn applies_to(&self, url: &Url) -> bool {
        match &self.scope {
            AuthScope::Nowhere => false,
            AuthScope::Origin(host, port) => {
                origin_of(url).is_some_and(|(h, p)| &h == host && p == *port)
            }
            AuthScope::Meta => is_meta_media_host(url.as_str()),
        }
    }
}

/// Downloaded media bytes and what we know about them
#[derive(Debug, Clone)]
pub struct FetchedMedia {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub kind: MediaKind,
    pub extension: &'static str,
}

#[derive(Clone)]
pub struct MediaFetcher {
    client: Client,
    max_size: usize,
}

impl Default for MediaFetcher {
    fn default() -> Self {
        Self::new(Self::client_builder().build().unwrap_or_default())
    }
}

impl MediaFetcher {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            max_size: MAX_MEDIA_SIZE,
        }
    }

    /// Client settings the fetcher expects: no automatic redirects
    pub fn client_builder() -> reqwest::ClientBuilder {
        Client::builder().redirect(reqwest::redirect::Policy::none())
    }

    #[cfg(test)]
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    fn http_url(url: &str) -> Result<Url, GatewayError> {
        Url::parse(url)
            .ok()
            .filter(|u| matches!(u.scheme(), "http" | "https"))
            .ok_or_else(|| {
                GatewayError::InvalidRequest(format!(
                    "unsupported media URL: {}",
                    url.chars().take(64).collect::<String>()
                ))
            })
    }

    fn request(&self, target: &Url, auth: &MediaAuth) -> reqwest::RequestBuilder {
        let mut request = self.client.get(target.clone()).timeout(FETCH_TIMEOUT);
        if auth.applies_to(target) {
            if let Some(key) = &auth.apikey {
                request = request.header("apikey", key);
            }
            if let Some(token) = &auth.bearer {
                request = request.bearer_auth(token);
            }
        } else if auth.scope != AuthScope::Nowhere {
            debug!("Not sending credentials to {}", target.host_str().unwrap_or(""));
        }
        request
    }

    /// Download media; content type falls back to URL/MIME inference.
    pub async fn fetch(
        &self,
        url: &str,
        auth: &MediaAuth,
        mime_hint: Option<&str>,
        kind_hint: Option<MediaKind>,
    ) -> Result<FetchedMedia, GatewayError> {
        let mut target = Self::http_url(url)?;
        debug!("Fetching media from {}", url);

        let mut redirects = 0;
        let mut response = loop {
            let response = self
                .request(&target, auth)
                .send()
                .await
                .map_err(GatewayError::from_request)?;
            if !response.status().is_redirection() || redirects == MAX_REDIRECTS {
                break response;
            }
            let Some(next) = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|location| target.join(location).ok())
            else {
                break response;
            };
            target = Self::http_url(next.as_str())?;
            redirects += 1;
            debug!("Media redirected to {}", target.host_str().unwrap_or(""));
        };
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(GatewayError::UpstreamAuth {
                service: "media host".to_string(),
            });
        }
        if !status.is_success() {
            return Err(GatewayError::UpstreamStatus {
                status: status.as_u16(),
                message: format!("media download failed for {}", url),
            });
        }

        if response
            .content_length()
            .is_some_and(|len| len > self.max_size as u64)
        {
            return Err(GatewayError::InvalidRequest("media too large".to_string()));
        }

        let upstream_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        // Content-Length is absent on chunked bodies, so the cap is enforced while reading
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(GatewayError::from_request)? {
            if bytes.len() + chunk.len() > self.max_size {
                return Err(GatewayError::InvalidRequest("media too large".to_string()));
            }
            bytes.extend_from_slice(&chunk);
        }

        // Declared MIME from the caller wins; the upstream header is only
        // trusted when it is informative and the blob is not encrypted.
        let trusted_upstream = upstream_type
            .as_deref()
            .filter(|t| !is_encrypted_media(url) && MediaKind::from_mime(t).is_some());
        let mime = mime_hint.or(trusted_upstream);
        let kind = detect_media_type(url, mime, kind_hint);
        let extension = extension_for(kind, mime, url);
        let content_type = match mime {
            Some(m) if MediaKind::from_mime(m).is_some() => m.to_string(),
            _ => content_type_for(kind, extension).to_string(),
        };

        debug!(
            "Fetched {} bytes from {} as {} ({})",
            bytes.len(),
            url,
            content_type,
            kind
        );

        Ok(FetchedMedia {
            bytes,
            content_type,
            kind,
            extension,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_encrypted_audio_gets_inferred_type() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("GET"))
            .and(matchers::path("/v/t62.7117-24/123_n.enc"))
            .and(matchers::header("apikey", "tok"))
            .and(matchers::header("authorization", "Bearer tok"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/octet-stream")
                    .set_body_bytes(vec![1u8, 2, 3]),
            )
            .mount(&server)
            .await;

        let creds = ServerCredentials {
            api_url: server.uri(),
            api_token: "tok".to_string(),
            instance_id: "i".to_string(),
            api_version: None,
        };
        let url = format!("{}/v/t62.7117-24/123_n.enc?oh=1", server.uri());
        let media = MediaFetcher::default()
            .fetch(&url, &MediaAuth::evolution(&creds), None, None)
            .await
            .unwrap();

        assert_eq!(media.bytes, vec![1, 2, 3]);
        assert_eq!(media.kind, MediaKind::Audio);
        assert_eq!(media.extension, "ogg");
        assert_eq!(media.content_type, "audio/ogg");
    }

    #[tokio::test]
    async fn test_upstream_content_type_is_used() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(vec![0u8; 4]),
            )
            .mount(&server)
            .await;

        let media = MediaFetcher::default()
            .fetch(&format!("{}/download", server.uri()), &MediaAuth::none(), None, None)
            .await
            .unwrap();
        assert_eq!(media.kind, MediaKind::Image);
        assert_eq!(media.content_type, "image/png");
        assert_eq!(media.extension, "png");
    }

    #[tokio::test]
    async fn test_auth_failure() {
        let server = MockServer::start().await;
        Mock::given(matchers::any())
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = MediaFetcher::default()
            .fetch(&format!("{}/a.jpg", server.uri()), &MediaAuth::none(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamAuth { .. }));
    }

    fn creds(api_url: &str) -> ServerCredentials {
        ServerCredentials {
            api_url: api_url.to_string(),
            api_token: "EVO-SECRET".to_string(),
            instance_id: "i".to_string(),
            api_version: None,
        }
    }

    #[test]
    fn test_evolution_auth_is_bound_to_its_origin() {
        let auth = MediaAuth::evolution(&creds("https://evo.example.com/"));
        let url = |u: &str| Url::parse(u).unwrap();

        assert!(auth.applies_to(&url("https://evo.example.com/media/a.png")));
        assert!(auth.applies_to(&url("https://EVO.example.com:443/a.png")));
        assert!(!auth.applies_to(&url("http://evo.example.com:8080/a.png")));
        assert!(!auth.applies_to(&url("https://evil.example.com/a.png")));
        assert!(!auth.applies_to(&url("https://evil.test/?h=evo.example.com")));
        assert!(!MediaAuth::evolution(&creds("not a url")).applies_to(&url("https://evo.example.com/")));
        assert!(!MediaAuth::none().applies_to(&url("https://evo.example.com/")));
    }

    #[test]
    fn test_meta_auth_only_for_meta_hosts() {
        let auth = MediaAuth::meta("META-SECRET");
        let url = |u: &str| Url::parse(u).unwrap();

        assert!(auth.applies_to(&url("https://lookaside.fbsbx.com/whatsapp_business/attachments/?mid=1")));
        assert!(auth.applies_to(&url("https://graph.facebook.com/v18.0/123")));
        assert!(!auth.applies_to(&url("https://attacker.test/x.png?lookaside.fbsbx.com")));
        assert!(!auth.applies_to(&url("https://lookaside.fbsbx.com.attacker.test/x.png")));
        assert!(!auth.applies_to(&url("https://notfbsbx.com/x.png")));
    }

    #[tokio::test]
    async fn test_credentials_are_not_sent_to_other_hosts() {
        let evolution = MockServer::start().await;
        let foreign = MockServer::start().await;
        Mock::given(matchers::method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(vec![0u8; 4]),
            )
            .mount(&foreign)
            .await;

        // Same host, different port: still a different origin
        let auth = MediaAuth::evolution(&creds(&evolution.uri()));
        MediaFetcher::default()
            .fetch(&format!("{}/photo.png", foreign.uri()), &auth, None, None)
            .await
            .unwrap();

        let requests = foreign.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].headers.get("apikey").is_none());
        assert!(requests[0].headers.get("authorization").is_none());
    }

    #[tokio::test]
    async fn test_redirect_to_other_host_drops_credentials() {
        let evolution = MockServer::start().await;
        let storage = MockServer::start().await;
        Mock::given(matchers::method("GET"))
            .and(matchers::path("/media/voice.ogg"))
            .and(matchers::header("apikey", "EVO-SECRET"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("location", format!("{}/bucket/voice.ogg", storage.uri())),
            )
            .expect(1)
            .mount(&evolution)
            .await;
        Mock::given(matchers::method("GET"))
            .and(matchers::path("/bucket/voice.ogg"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "audio/ogg")
                    .set_body_bytes(vec![5u8; 3]),
            )
            .expect(1)
            .mount(&storage)
            .await;

        let auth = MediaAuth::evolution(&creds(&evolution.uri()));
        let media = MediaFetcher::default()
            .fetch(&format!("{}/media/voice.ogg", evolution.uri()), &auth, None, None)
            .await
            .unwrap();
        assert_eq!(media.bytes, vec![5, 5, 5]);
        assert_eq!(media.kind, MediaKind::Audio);

        let requests = storage.received_requests().await.unwrap();
        assert!(requests[0].headers.get("apikey").is_none());
        assert!(requests[0].headers.get("authorization").is_none());
    }

    #[tokio::test]
    async fn test_size_cap_with_content_length() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 64]))
            .mount(&server)
            .await;

        let err = MediaFetcher::default()
            .with_max_size(16)
            .fetch(&format!("{}/a.jpg", server.uri()), &MediaAuth::none(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(m) if m == "media too large"));
    }

    #[tokio::test]
    async fn test_size_cap_on_chunked_body() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Chunked transfer carries no Content-Length
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let mut response =
                b"HTTP/1.1 200 OK\r\ncontent-type: image/png\r\ntransfer-encoding: chunked\r\n\r\n"
                    .to_vec();
            for _ in 0..8 {
                response.extend_from_slice(b"10\r\n0123456789abcdef\r\n");
            }
            response.extend_from_slice(b"0\r\n\r\n");
            let _ = socket.write_all(&response).await;
        });

        let err = MediaFetcher::default()
            .with_max_size(40)
            .fetch(&format!("http://{}/stream.png", addr), &MediaAuth::none(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(m) if m == "media too large"));
    }

    #[tokio::test]
    async fn test_rejects_non_http_urls() {
        let err = MediaFetcher::default()
            .fetch("file:///etc/passwd", &MediaAuth::none(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
    }
}
