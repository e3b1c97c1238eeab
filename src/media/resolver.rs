//! Turn raw WhatsApp media URLs into URLs a browser can load.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use super::cache::MediaCache;
use super::detect::{detect_media_type, MediaKind};
use super::fetch::MediaAuth;
use crate::error::GatewayError;

const MEDIA_PROXY_PATH: &str = "/api/media-proxy";
const AUDIO_PROXY_PATH: &str = "/api/audio-proxy";

/// Where a resolved URL points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionSource {
    /// Original URL, already loadable
    Direct,
    /// This gateway's proxy endpoints
    Proxy,
    /// Re-hosted on Cloudinary
    Cloudinary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedMedia {
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub url: String,
    pub source: ResolutionSource,
}

/// Re-hosts media somewhere public and returns the new URL
#[async_trait]
pub trait MediaUploader: Send + Sync {
    async fn upload(
        &self,
        url: &str,
        mime: Option<&str>,
        kind: MediaKind,
        auth: &MediaAuth,
    ) -> Result<String, GatewayError>;
}

pub struct MediaResolver {
    cache: MediaCache,
    uploader: Option<Arc<dyn MediaUploader>>,
    proxy_base: String,
}

impl MediaResolver {
    pub fn new(
        cache: MediaCache,
        uploader: Option<Arc<dyn MediaUploader>>,
        proxy_base: &str,
    ) -> Self {
        Self {
            cache,
            uploader,
            proxy_base: proxy_base.trim_end_matches('/').to_string(),
        }
    }

    pub fn cache(&self) -> &MediaCache {
        &self.cache
    }

    /// Resolve a media URL. Cache hits never touch the network.
    pub async fn resolve(
        &self,
        url: &str,
        declared_mime: Option<&str>,
        explicit: Option<MediaKind>,
        auth: &MediaAuth,
    ) -> Result<ResolvedMedia, GatewayError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(GatewayError::InvalidRequest("media URL is empty".to_string()));
        }

        if let Some(hit) = self.cache.get(url).await {
            debug!("Media cache hit for {}", url);
            return Ok(hit);
        }

        let kind = detect_media_type(url, declared_mime, explicit);

        if self.is_passthrough(url) {
            return Ok(ResolvedMedia {
                kind,
                url: url.to_string(),
                source: ResolutionSource::Direct,
            });
        }

        if let Some(uploader) = self.uploader.as_ref().filter(|_| kind != MediaKind::Unknown) {
            match uploader.upload(url, declared_mime, kind, auth).await {
                Ok(hosted) => {
                    let resolved = ResolvedMedia {
                        kind,
                        url: hosted,
                        source: ResolutionSource::Cloudinary,
                    };
                    self.cache.insert(url.to_string(), resolved.clone()).await;
                    return Ok(resolved);
                }
                Err(e) => {
                    // Not cached, so the next request retries the upload
                    warn!("Media upload failed for {}, using proxy: {}", url, e);
                    return Ok(self.proxied(url, kind));
                }
            }
        }

        let resolved = self.proxied(url, kind);
        self.cache.insert(url.to_string(), resolved.clone()).await;
        Ok(resolved)
    }

    /// Proxy URL for the given media
    pub fn proxy_url(&self, url: &str, kind: MediaKind) -> String {
        let encoded = urlencoding::encode(url);
        match kind {
            MediaKind::Audio => format!("{}{}?url={}", self.proxy_base, AUDIO_PROXY_PATH, encoded),
            other => format!(
                "{}{}?url={}&type={}",
                self.proxy_base, MEDIA_PROXY_PATH, encoded, other
            ),
        }
    }

    fn proxied(&self, url: &str, kind: MediaKind) -> ResolvedMedia {
        ResolvedMedia {
            kind,
            url: self.proxy_url(url, kind),
            source: ResolutionSource::Proxy,
        }
    }

    fn is_passthrough(&self, url: &str) -> bool {
        if url.starts_with("data:") || url.starts_with("blob:") || url.contains("res.cloudinary.com")
        {
            return true;
        }

        let path = if self.proxy_base.is_empty() {
            url
        } else {
            match url.strip_prefix(self.proxy_base.as_str()) {
                Some(rest) => rest,
                None => return false,
            }
        };
        path.starts_with(MEDIA_PROXY_PATH) || path.starts_with(AUDIO_PROXY_PATH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingUploader {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingUploader {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl MediaUploader for CountingUploader {
        async fn upload(
            &self,
            url: &str,
            _mime: Option<&str>,
            kind: MediaKind,
            _auth: &MediaAuth,
        ) -> Result<String, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(GatewayError::UpstreamUnreachable("down".to_string()));
            }
            Ok(format!(
                "https://res.cloudinary.com/demo/{}/upload/{}",
                kind,
                url.len()
            ))
        }
    }

    fn cache() -> MediaCache {
        MediaCache::new(Duration::from_secs(60), 100)
    }

    #[tokio::test]
    async fn test_photo_jpg_becomes_media_proxy_url() {
        let resolver = MediaResolver::new(cache(), None, "");
        let resolved = resolver
            .resolve("https://example.com/photo.jpg", None, None, &MediaAuth::none())
            .await
            .unwrap();

        assert_eq!(resolved.kind, MediaKind::Image);
        assert_eq!(resolved.source, ResolutionSource::Proxy);
        assert_eq!(
            resolved.url,
            "/api/media-proxy?url=https%3A%2F%2Fexample.com%2Fphoto.jpg&type=image"
        );
    }

    #[tokio::test]
    async fn test_audio_uses_audio_proxy() {
        let resolver = MediaResolver::new(cache(), None, "https://crm.example.com/");
        let url = "https://mmg.whatsapp.net/v/t62.7117-24/1_n.enc?oh=x";
        let resolved = resolver
            .resolve(url, None, None, &MediaAuth::none())
            .await
            .unwrap();

        assert_eq!(resolved.kind, MediaKind::Audio);
        assert_eq!(
            resolved.url,
            format!(
                "https://crm.example.com/api/audio-proxy?url={}",
                urlencoding::encode(url)
            )
        );
    }

    #[tokio::test]
    async fn test_cache_hit_skips_upload() {
        let uploader = CountingUploader::new(false);
        let resolver = MediaResolver::new(cache(), Some(uploader.clone()), "");
        let auth = MediaAuth::none();

        let first = resolver
            .resolve("https://example.com/a.png", None, None, &auth)
            .await
            .unwrap();
        let second = resolver
            .resolve("https://example.com/a.png", None, None, &auth)
            .await
            .unwrap();

        assert_eq!(first.source, ResolutionSource::Cloudinary);
        assert_eq!(first.url, second.url);
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_upload_degrades_without_caching() {
        let uploader = CountingUploader::new(true);
        let resolver = MediaResolver::new(cache(), Some(uploader.clone()), "");
        let auth = MediaAuth::none();

        let resolved = resolver
            .resolve("https://example.com/clip.mp4", None, None, &auth)
            .await
            .unwrap();
        assert_eq!(resolved.source, ResolutionSource::Proxy);
        assert!(resolved.url.ends_with("&type=video"));
        assert_eq!(resolver.cache().len().await, 0);

        resolver
            .resolve("https://example.com/clip.mp4", None, None, &auth)
            .await
            .unwrap();
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_kind_is_never_uploaded() {
        let uploader = CountingUploader::new(false);
        let resolver = MediaResolver::new(cache(), Some(uploader.clone()), "");
        let resolved = resolver
            .resolve("https://example.com/download?id=7", None, None, &MediaAuth::none())
            .await
            .unwrap();
        assert_eq!(resolved.kind, MediaKind::Unknown);
        assert!(resolved.url.ends_with("&type=unknown"));
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_passthrough_urls() {
        let uploader = CountingUploader::new(false);
        let resolver = MediaResolver::new(cache(), Some(uploader.clone()), "https://crm.example.com");
        let auth = MediaAuth::none();

        for url in [
            "data:image/png;base64,AAAA",
            "blob:https://crm.example.com/1234",
            "https://res.cloudinary.com/demo/image/upload/x.jpg",
            "https://crm.example.com/api/media-proxy?url=a&type=image",
        ] {
            let resolved = resolver.resolve(url, None, None, &auth).await.unwrap();
            assert_eq!(resolved.source, ResolutionSource::Direct, "{url}");
            assert_eq!(resolved.url, url);
        }
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_declared_mime_overrides_url() {
        let resolver = MediaResolver::new(cache(), None, "");
        let resolved = resolver
            .resolve("https://example.com/file.bin", Some("video/mp4"), None, &MediaAuth::none())
            .await
            .unwrap();
        assert_eq!(resolved.kind, MediaKind::Video);
    }

    #[tokio::test]
    async fn test_empty_url_is_rejected() {
        let resolver = MediaResolver::new(cache(), None, "");
        let err = resolver
            .resolve("  ", None, None, &MediaAuth::none())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
    }
}
