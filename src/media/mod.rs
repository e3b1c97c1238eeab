//! Media type detection, proxying and re-hosting.

pub mod cache;
pub mod cloudinary;
pub mod detect;
pub mod fetch;
pub mod resolver;

pub use cache::MediaCache;
pub use cloudinary::CloudinaryUploader;
pub use detect::MediaKind;
pub use fetch::{is_meta_media_host, FetchedMedia, MediaAuth, MediaFetcher};
pub use resolver::{MediaResolver, MediaUploader};
