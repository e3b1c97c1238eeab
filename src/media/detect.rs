//! Media type and file format inference from MIME types and URLs.
//!
//! Detection works on strings only; bytes are never sniffed.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Broad media category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
    Unknown,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Document => "document",
            MediaKind::Unknown => "unknown",
        }
    }

    /// Category implied by a MIME type, if it is informative
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_lowercase();
        if essence.is_empty() || UNINFORMATIVE_MIME.contains(&essence.as_str()) {
            return None;
        }

        match essence.split('/').next() {
            Some("image") => Some(MediaKind::Image),
            Some("video") => Some(MediaKind::Video),
            Some("audio") => Some(MediaKind::Audio),
            Some("application") | Some("text") => Some(MediaKind::Document),
            _ => None,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "image" | "photo" | "sticker" | "imagemessage" | "stickermessage" => Ok(MediaKind::Image),
            "video" | "videomessage" | "gif" => Ok(MediaKind::Video),
            "audio" | "ptt" | "voice" | "audiomessage" => Ok(MediaKind::Audio),
            "document" | "file" | "documentmessage" => Ok(MediaKind::Document),
            "unknown" => Ok(MediaKind::Unknown),
            other => Err(format!("unknown media type: {other}")),
        }
    }
}

/// MIME types that say nothing about the content
const UNINFORMATIVE_MIME: &[&str] = &["application/octet-stream", "binary/octet-stream"];

/// WhatsApp CDN path markers, one per media class
const WHATSAPP_PATH_MARKERS: &[(&str, MediaKind)] = &[
    ("/t62.7117-24/", MediaKind::Audio),
    ("/t62.7118-24/", MediaKind::Image),
    ("/t62.7161-24/", MediaKind::Video),
    ("/t62.7119-24/", MediaKind::Document),
    ("/t62.15575-24/", MediaKind::Image),
];

static IMAGE_EXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\.(jpe?g|png|gif|webp|bmp|heic|svg)$").expect("static regex"));
static VIDEO_EXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\.(mp4|mov|webm|3gp|mkv|avi|m4v)$").expect("static regex"));
static AUDIO_EXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\.(mp3|ogg|oga|opus|wav|m4a|aac|amr|weba)$").expect("static regex"));
static DOCUMENT_EXT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\.(pdf|docx?|xlsx?|pptx?|txt|csv|zip|rar|odt|ods)$").expect("static regex")
});
static DATA_URL_MIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^data:([a-z0-9.+-]+/[a-z0-9.+-]+)").expect("static regex"));

/// Detect the media category.
///
/// Precedence: informative declared MIME, then the caller's explicit type,
/// then URL patterns, then `Unknown`.
pub fn detect_media_type(
    url: &str,
    declared_mime: Option<&str>,
    explicit: Option<MediaKind>,
) -> MediaKind {
    if let Some(kind) = declared_mime.and_then(MediaKind::from_mime) {
        return kind;
    }
    if let Some(kind) = explicit.filter(|k| *k != MediaKind::Unknown) {
        return kind;
    }
    kind_from_url(url).unwrap_or(MediaKind::Unknown)
}

/// URL-only detection
pub fn kind_from_url(url: &str) -> Option<MediaKind> {
    let lower = url.trim().to_lowercase();

    if let Some(caps) = DATA_URL_MIME.captures(&lower) {
        return caps.get(1).and_then(|m| MediaKind::from_mime(m.as_str()));
    }

    let path = url_path(&lower);

    if let Some((_, kind)) = WHATSAPP_PATH_MARKERS
        .iter()
        .find(|(marker, _)| path.contains(marker))
    {
        return Some(*kind);
    }

    if IMAGE_EXT.is_match(path) {
        Some(MediaKind::Image)
    } else if VIDEO_EXT.is_match(path) {
        Some(MediaKind::Video)
    } else if AUDIO_EXT.is_match(path) {
        Some(MediaKind::Audio)
    } else if DOCUMENT_EXT.is_match(path) {
        Some(MediaKind::Document)
    } else {
        None
    }
}

/// True for WhatsApp end-to-end encrypted media blobs
pub fn is_encrypted_media(url: &str) -> bool {
    url_path(&url.to_lowercase()).ends_with(".enc")
}

/// Lowercase extension of the URL path, without the dot
pub fn url_extension(url: &str) -> Option<String> {
    let lower = url.to_lowercase();
    let path = url_path(&lower);
    let file = path.rsplit('/').next()?;
    let (_, ext) = file.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 5 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        None
    } else {
        Some(ext.to_string())
    }
}

/// Forced file extension for uploads, chosen from URL and MIME heuristics.
pub fn extension_for(kind: MediaKind, mime: Option<&str>, url: &str) -> &'static str {
    if let Some(ext) = url_extension(url) {
        if let Some(known) = KNOWN_EXTENSIONS.iter().copied().find(|e| *e == ext) {
            if kind_from_url(&format!("x.{}", known)) == Some(kind) {
                return known;
            }
        }
    }

    if let Some(ext) = mime.and_then(extension_for_mime) {
        return ext;
    }

    match kind {
        MediaKind::Image => "jpg",
        MediaKind::Video => "mp4",
        MediaKind::Audio => "ogg",
        MediaKind::Document => "pdf",
        MediaKind::Unknown => "bin",
    }
}

const KNOWN_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "bmp", "heic", "svg", "mp4", "mov", "webm", "3gp",
    "mkv", "avi", "m4v", "mp3", "ogg", "oga", "opus", "wav", "m4a", "aac", "amr", "weba", "pdf",
    "doc", "docx", "xls", "xlsx", "ppt", "pptx", "txt", "csv", "zip", "rar", "odt", "ods",
];

fn extension_for_mime(mime: &str) -> Option<&'static str> {
    let essence = mime.split(';').next()?.trim().to_lowercase();
    let ext = match essence.as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "video/mp4" => "mp4",
        "video/3gpp" => "3gp",
        "video/quicktime" => "mov",
        "video/webm" => "webm",
        "audio/ogg" | "audio/opus" => "ogg",
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/mp4" | "audio/x-m4a" => "m4a",
        "audio/aac" => "aac",
        "audio/amr" => "amr",
        "audio/wav" | "audio/x-wav" => "wav",
        "application/pdf" => "pdf",
        "application/msword" => "doc",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => "docx",
        "application/vnd.ms-excel" => "xls",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => "xlsx",
        "text/plain" => "txt",
        "text/csv" => "csv",
        "application/zip" => "zip",
        _ => return None,
    };
    Some(ext)
}

/// Response MIME type for proxied bytes
pub fn content_type_for(kind: MediaKind, ext: &str) -> &'static str {
    match ext {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "3gp" => "video/3gpp",
        "ogg" | "oga" | "opus" => "audio/ogg",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "wav" => "audio/wav",
        "aac" => "audio/aac",
        "amr" => "audio/amr",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "csv" => "text/csv",
        _ => match kind {
            MediaKind::Image => "image/jpeg",
            MediaKind::Video => "video/mp4",
            MediaKind::Audio => "audio/ogg",
            MediaKind::Document | MediaKind::Unknown => "application/octet-stream",
        },
    }
}

/// Path part of a URL (query and fragment stripped)
fn url_path(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    &url[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    const WA_AUDIO: &str =
        "https://mmg.whatsapp.net/v/t62.7117-24/29315_n.enc?ccb=11-4&oh=01_Q5AaI&oe=66A1B2C3&_nc_sid=5e03e0&mms3=true";

    #[test]
    fn test_encrypted_whatsapp_audio_without_mime() {
        assert_eq!(detect_media_type(WA_AUDIO, None, None), MediaKind::Audio);
        assert!(is_encrypted_media(WA_AUDIO));
    }

    #[test]
    fn test_plain_image_url() {
        assert_eq!(
            detect_media_type("https://example.com/photo.jpg", None, None),
            MediaKind::Image
        );
        assert_eq!(
            detect_media_type("https://example.com/photo.JPEG?size=large", None, None),
            MediaKind::Image
        );
    }

    #[test]
    fn test_precedence() {
        // Declared MIME beats everything
        assert_eq!(
            detect_media_type("https://example.com/photo.jpg", Some("video/mp4"), Some(MediaKind::Audio)),
            MediaKind::Video
        );
        // Explicit type beats URL
        assert_eq!(
            detect_media_type("https://example.com/photo.jpg", None, Some(MediaKind::Document)),
            MediaKind::Document
        );
        // Octet-stream is not informative
        assert_eq!(
            detect_media_type(
                "https://example.com/clip.mp4",
                Some("application/octet-stream"),
                None
            ),
            MediaKind::Video
        );
        assert_eq!(
            detect_media_type("https://example.com/blob", None, None),
            MediaKind::Unknown
        );
    }

    #[test]
    fn test_mime_with_parameters() {
        assert_eq!(
            MediaKind::from_mime("audio/ogg; codecs=opus"),
            Some(MediaKind::Audio)
        );
        assert_eq!(MediaKind::from_mime("application/pdf"), Some(MediaKind::Document));
        assert_eq!(MediaKind::from_mime(""), None);
    }

    #[test]
    fn test_data_url() {
        assert_eq!(
            kind_from_url("data:image/png;base64,iVBORw0KGgo="),
            Some(MediaKind::Image)
        );
    }

    #[test]
    fn test_whatsapp_markers() {
        assert_eq!(
            kind_from_url("https://mmg.whatsapp.net/v/t62.7161-24/1.enc"),
            Some(MediaKind::Video)
        );
        assert_eq!(
            kind_from_url("https://mmg.whatsapp.net/v/t62.7119-24/1.enc"),
            Some(MediaKind::Document)
        );
    }

    #[test]
    fn test_extension_choice() {
        assert_eq!(extension_for(MediaKind::Audio, None, WA_AUDIO), "ogg");
        assert_eq!(
            extension_for(MediaKind::Audio, Some("audio/mpeg"), WA_AUDIO),
            "mp3"
        );
        assert_eq!(
            extension_for(MediaKind::Image, None, "https://example.com/a.png"),
            "png"
        );
        // URL extension that contradicts the kind is ignored
        assert_eq!(
            extension_for(MediaKind::Video, None, "https://example.com/a.png"),
            "mp4"
        );
        assert_eq!(extension_for(MediaKind::Unknown, None, "https://x/y"), "bin");
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for(MediaKind::Audio, "ogg"), "audio/ogg");
        assert_eq!(content_type_for(MediaKind::Image, "bin"), "image/jpeg");
        assert_eq!(
            content_type_for(MediaKind::Unknown, "bin"),
            "application/octet-stream"
        );
    }

    #[test]
    fn test_explicit_type_parsing() {
        assert_eq!("ptt".parse::<MediaKind>().unwrap(), MediaKind::Audio);
        assert_eq!("Sticker".parse::<MediaKind>().unwrap(), MediaKind::Image);
        assert!("hologram".parse::<MediaKind>().is_err());
    }
}
