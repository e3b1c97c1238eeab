//! Typed configuration sections built from the CLI arguments.
//!
//! A section is `None` when its required values are missing, which disables the feature.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::cli::Args;
use crate::evolution::ApiVersion;

/// Default Cloudinary API host.
pub const CLOUDINARY_API_BASE: &str = "https://api.cloudinary.com";

/// Complete gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub host: String,
    pub port: u16,
    /// Prefix prepended to generated proxy URLs
    pub public_base_url: String,
    pub evolution: Option<EvolutionConfig>,
    pub cloudinary: Option<CloudinaryConfig>,
    pub meta: Option<MetaConfig>,
    pub media_cache: MediaCacheConfig,
}

/// Environment-level Evolution API defaults
#[derive(Clone)]
pub struct EvolutionConfig {
    pub api_url: String,
    pub api_token: String,
    pub instance_id: String,
    pub api_version: Option<ApiVersion>,
}

#[derive(Clone)]
pub struct CloudinaryConfig {
    pub cloud_name: String,
    pub api_key: String,
    pub api_secret: String,
    pub folder: String,
    pub api_base_url: String,
}

#[derive(Clone)]
pub struct MetaConfig {
    pub access_token: String,
    pub business_account_id: Option<String>,
    pub phone_number_id: Option<String>,
    pub api_base_url: String,
}

#[derive(Debug, Clone, Copy)]
pub struct MediaCacheConfig {
    pub ttl: Duration,
    pub capacity: usize,
}

impl Default for MediaCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            capacity: 10_000,
        }
    }
}

impl Config {
    /// Build the configuration from parsed arguments
    pub fn from_args(args: &Args) -> Result<Self> {
        let data_dir = match args.data_dir.clone() {
            Some(dir) => dir,
            None => default_data_dir()?,
        };

        let evolution = match (
            non_empty(&args.evolution_api_url),
            non_empty(&args.evolution_api_token),
            non_empty(&args.evolution_instance),
        ) {
            (Some(api_url), Some(api_token), Some(instance_id)) => {
                let api_version = match non_empty(&args.evolution_api_version) {
                    Some(v) => Some(
                        v.parse::<ApiVersion>()
                            .map_err(anyhow::Error::msg)
                            .context("Invalid EVOLUTION_API_VERSION")?,
                    ),
                    None => None,
                };
                Some(EvolutionConfig {
                    api_url: api_url.trim_end_matches('/').to_string(),
                    api_token,
                    instance_id,
                    api_version,
                })
            }
            _ => None,
        };

        let cloudinary = match (
            non_empty(&args.cloudinary_cloud_name),
            non_empty(&args.cloudinary_api_key),
            non_empty(&args.cloudinary_api_secret),
        ) {
            (Some(cloud_name), Some(api_key), Some(api_secret)) => Some(CloudinaryConfig {
                cloud_name,
                api_key,
                api_secret,
                folder: args.cloudinary_folder.clone(),
                api_base_url: CLOUDINARY_API_BASE.to_string(),
            }),
            _ => None,
        };

        let meta = non_empty(&args.meta_access_token).map(|access_token| MetaConfig {
            access_token,
            business_account_id: non_empty(&args.meta_business_account_id),
            phone_number_id: non_empty(&args.meta_phone_number_id),
            api_base_url: args.meta_api_base_url.trim_end_matches('/').to_string(),
        });

        Ok(Self {
            data_dir,
            host: args.host.clone(),
            port: args.port,
            public_base_url: args.public_base_url.trim_end_matches('/').to_string(),
            evolution,
            cloudinary,
            meta,
            media_cache: MediaCacheConfig {
                ttl: Duration::from_secs(args.media_cache_ttl_secs),
                capacity: args.media_cache_capacity.max(1),
            },
        })
    }
}

/// Default data directory for the store
pub fn default_data_dir() -> Result<PathBuf> {
    let base = dirs::data_dir().context("Could not determine platform data directory")?;
    Ok(base.join("whatsapp-crm-gateway"))
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl fmt::Debug for EvolutionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvolutionConfig")
            .field("api_url", &self.api_url)
            .field("api_token", &"[REDACTED]")
            .field("instance_id", &self.instance_id)
            .field("api_version", &self.api_version)
            .finish()
    }
}

impl fmt::Debug for CloudinaryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudinaryConfig")
            .field("cloud_name", &self.cloud_name)
            .field("api_key", &self.api_key)
            .field("api_secret", &"[REDACTED]")
            .field("folder", &self.folder)
            .finish()
    }
}

impl fmt::Debug for MetaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaConfig")
            .field("access_token", &"[REDACTED]")
            .field("business_account_id", &self.business_account_id)
            .field("phone_number_id", &self.phone_number_id)
            .field("api_base_url", &self.api_base_url)
            .finish()
    }
}
