//! Per-user Evolution API credential resolution.

use std::fmt;

use tracing::debug;

use crate::config::EvolutionConfig;
use crate::error::GatewayError;
use crate::evolution::ApiVersion;
use crate::storage::CrmStore;

/// User id used when a request or webhook carries no user
pub const DEFAULT_USER: &str = "default";

/// Base URL, token and instance for one Evolution connection
#[derive(Clone, PartialEq, Eq)]
pub struct ServerCredentials {
    pub api_url: String,
    pub api_token: String,
    pub instance_id: String,
    pub api_version: Option<ApiVersion>,
}

impl fmt::Debug for ServerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCredentials")
            .field("api_url", &self.api_url)
            .field("api_token", &"[REDACTED]")
            .field("instance_id", &self.instance_id)
            .field("api_version", &self.api_version)
            .finish()
    }
}

impl From<&EvolutionConfig> for ServerCredentials {
    fn from(config: &EvolutionConfig) -> Self {
        Self {
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            instance_id: config.instance_id.clone(),
            api_version: config.api_version,
        }
    }
}

/// Looks up credentials in the store, falling back to environment defaults
#[derive(Clone)]
pub struct CredentialResolver {
    store: CrmStore,
    defaults: Option<EvolutionConfig>,
}

impl CredentialResolver {
    pub fn new(store: CrmStore, defaults: Option<EvolutionConfig>) -> Self {
        Self { store, defaults }
    }

    /// Credentials for a user's Evolution connection
    pub fn resolve(&self, user_id: &str) -> Result<ServerCredentials, GatewayError> {
        if let Some(mut creds) = self.store.credentials_for_user(user_id)? {
            debug!("Using server assignment for user {}", user_id);
            creds.api_url = creds.api_url.trim_end_matches('/').to_string();
            return Ok(creds);
        }

        match &self.defaults {
            Some(defaults) => {
                debug!("No server assignment for user {}, using defaults", user_id);
                Ok(ServerCredentials::from(defaults))
            }
            None => Err(GatewayError::NotConfigured("evolution api")),
        }
    }

    /// Owner of an instance; unassigned instances belong to the default user
    pub fn resolve_instance(&self, instance_id: &str) -> Result<String, GatewayError> {
        Ok(self
            .store
            .user_for_instance(instance_id)?
            .unwrap_or_else(|| DEFAULT_USER.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> EvolutionConfig {
        EvolutionConfig {
            api_url: "https://env.example.com/".to_string(),
            api_token: "env-token".to_string(),
            instance_id: "env-instance".to_string(),
            api_version: None,
        }
    }

    #[test]
    fn test_store_assignment_wins_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = CrmStore::new(dir.path()).unwrap();
        let server = store
            .add_server("main", "https://db.example.com", "db-token", Some(ApiVersion::V1))
            .unwrap();
        store.assign_server("u1", server, "db-instance").unwrap();

        let resolver = CredentialResolver::new(store, Some(defaults()));

        let creds = resolver.resolve("u1").unwrap();
        assert_eq!(creds.api_url, "https://db.example.com");
        assert_eq!(creds.instance_id, "db-instance");

        let fallback = resolver.resolve("u2").unwrap();
        assert_eq!(fallback.api_url, "https://env.example.com");
        assert_eq!(fallback.api_token, "env-token");
    }

    #[test]
    fn test_missing_everything_is_not_configured() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = CredentialResolver::new(CrmStore::new(dir.path()).unwrap(), None);
        assert!(matches!(
            resolver.resolve("u1"),
            Err(GatewayError::NotConfigured(_))
        ));
        assert_eq!(resolver.resolve_instance("unknown").unwrap(), DEFAULT_USER);
    }

    #[test]
    fn test_debug_redacts_token() {
        let creds = ServerCredentials::from(&defaults());
        assert!(!format!("{:?}", creds).contains("env-token"));
    }
}
