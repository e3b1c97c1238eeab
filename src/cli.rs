//! CLI argument parsing using clap.

use clap::Parser;
use std::path::PathBuf;

/// WhatsApp CRM gateway - media proxying and WhatsApp API access for the CRM dashboard
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "whatsapp-crm-gateway")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Enable verbose/debug logging
    #[arg(short, long, env = "WA_VERBOSE")]
    pub verbose: bool,

    /// Custom data directory for the SQLite store
    #[arg(long, value_name = "DIR", env = "WA_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Port for web server (default: 3000)
    #[arg(long, default_value = "3000", env = "WA_PORT")]
    pub port: u16,

    /// Host address to bind web server to (default: 0.0.0.0)
    #[arg(long, default_value = "0.0.0.0", env = "WA_HOST")]
    pub host: String,

    /// Prefix for generated proxy URLs (empty means relative URLs)
    #[arg(long, default_value = "", env = "WA_PUBLIC_BASE_URL")]
    pub public_base_url: String,

    /// Default Evolution API base URL, used when a user has no server assigned
    #[arg(long, env = "EVOLUTION_API_URL")]
    pub evolution_api_url: Option<String>,

    /// Default Evolution API key
    #[arg(long, env = "EVOLUTION_API_KEY")]
    pub evolution_api_token: Option<String>,

    /// Default Evolution instance name
    #[arg(long, env = "EVOLUTION_INSTANCE")]
    pub evolution_instance: Option<String>,

    /// Pin the Evolution API version ("v1" or "v2"); endpoints of that version are tried first
    #[arg(long, env = "EVOLUTION_API_VERSION")]
    pub evolution_api_version: Option<String>,

    /// Cloudinary cloud name (enables the upload pipeline together with key and secret)
    #[arg(long, env = "CLOUDINARY_CLOUD_NAME")]
    pub cloudinary_cloud_name: Option<String>,

    /// Cloudinary API key
    #[arg(long, env = "CLOUDINARY_API_KEY")]
    pub cloudinary_api_key: Option<String>,

    /// Cloudinary API secret
    #[arg(long, env = "CLOUDINARY_API_SECRET")]
    pub cloudinary_api_secret: Option<String>,

    /// Cloudinary folder for uploaded media
    #[arg(long, default_value = "whatsapp-media", env = "CLOUDINARY_FOLDER")]
    pub cloudinary_folder: String,

    /// Meta (WhatsApp Cloud API) access token
    #[arg(long, env = "META_ACCESS_TOKEN")]
    pub meta_access_token: Option<String>,

    /// Meta WhatsApp Business Account ID (for templates)
    #[arg(long, env = "META_BUSINESS_ACCOUNT_ID")]
    pub meta_business_account_id: Option<String>,

    /// Meta phone number ID (for sending)
    #[arg(long, env = "META_PHONE_NUMBER_ID")]
    pub meta_phone_number_id: Option<String>,

    /// Graph API base URL
    #[arg(
        long,
        default_value = "https://graph.facebook.com/v21.0",
        env = "META_API_BASE_URL"
    )]
    pub meta_api_base_url: String,

    /// How long a resolved media URL stays cached, in seconds
    #[arg(long, default_value = "86400", env = "WA_MEDIA_CACHE_TTL_SECS")]
    pub media_cache_ttl_secs: u64,

    /// Maximum number of cached media URL mappings
    #[arg(long, default_value = "10000", env = "WA_MEDIA_CACHE_CAPACITY")]
    pub media_cache_capacity: usize,
}

impl Args {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Check if the Cloudinary upload pipeline is enabled
    pub fn cloudinary_enabled(&self) -> bool {
        self.cloudinary_cloud_name.is_some()
            && self.cloudinary_api_key.is_some()
            && self.cloudinary_api_secret.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["whatsapp-crm-gateway"]).unwrap();
        assert_eq!(args.port, 3000);
        assert_eq!(args.host, "0.0.0.0");
        assert_eq!(args.cloudinary_folder, "whatsapp-media");
        assert_eq!(args.media_cache_ttl_secs, 86400);
        assert!(!args.cloudinary_enabled());
    }

    #[test]
    fn test_cloudinary_needs_all_credentials() {
        let args = Args::try_parse_from([
            "whatsapp-crm-gateway",
            "--cloudinary-cloud-name",
            "demo",
            "--cloudinary-api-key",
            "key",
        ])
        .unwrap();
        assert!(!args.cloudinary_enabled());
    }
}
