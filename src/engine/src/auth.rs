//! Credential resolution for registries and object storage.
//!
//! Resolution scans the configured registry list; the first exact URL
//! match wins. Helper-issued credentials are short-lived and fetched per
//! call, never cached. A failed helper degrades to anonymous with a
//! warning so the push can still proceed.

use oci_client::secrets::RegistryAuth;

use regmirror_core::config::{RegistryEntry, SyncConfig};
use regmirror_core::error::{Result, SyncError};

use crate::ecr;

/// A resolved credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    None,
    Basic { username: String, password: String },
    Bearer { token: String },
}

impl Credential {
    /// Convert to the distribution client's auth type.
    pub fn to_registry_auth(&self) -> RegistryAuth {
        match self {
            Credential::None => RegistryAuth::Anonymous,
            Credential::Basic { username, password } => {
                RegistryAuth::Basic(username.clone(), password.clone())
            }
            Credential::Bearer { token } => RegistryAuth::Bearer(token.clone()),
        }
    }
}

/// Resolves credentials against an immutable configuration snapshot.
#[derive(Clone)]
pub struct CredentialResolver {
    registries: Vec<RegistryEntry>,
    ecr_region: String,
}

impl CredentialResolver {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            registries: config.sync.registries.clone(),
            ecr_region: config.ecr.region.clone(),
        }
    }

    fn entry_for(&self, url: &str) -> Option<&RegistryEntry> {
        self.registries.iter().find(|r| r.url == url)
    }

    /// Resolve a credential for `registry`, creating `repository` first
    /// when an ECR helper is configured.
    ///
    /// Returns the credential and a label naming its source for logs.
    pub async fn resolve(&self, registry: &str, repository: &str) -> (Credential, &'static str) {
        let Some(entry) = self.entry_for(registry) else {
            return (Credential::None, "default");
        };

        if !entry.auth.username.is_empty() && !entry.auth.password.is_empty() {
            return (
                Credential::Basic {
                    username: entry.auth.username.clone(),
                    password: entry.auth.password.clone(),
                },
                "basic",
            );
        }

        if !entry.auth.token.is_empty() {
            return (
                Credential::Bearer {
                    token: entry.auth.token.clone(),
                },
                "token",
            );
        }

        match entry.auth.helper.as_str() {
            "" => (Credential::None, "default"),
            "ecr" => match ecr::private_token(&self.ecr_region, repository).await {
                Ok(token) => (
                    Credential::Basic {
                        username: token.username,
                        password: token.password,
                    },
                    "ecr",
                ),
                Err(e) => {
                    tracing::warn!(
                        registry,
                        error = %e,
                        "ECR helper failed, continuing anonymously"
                    );
                    (Credential::None, "default")
                }
            },
            "ecr-public" => match ecr::public_token(repository).await {
                Ok(token) => (
                    Credential::Basic {
                        username: token.username,
                        password: token.password,
                    },
                    "ecr-public",
                ),
                Err(e) => {
                    tracing::warn!(
                        registry,
                        error = %e,
                        "ECR Public helper failed, continuing anonymously"
                    );
                    (Credential::None, "default")
                }
            },
            helper => {
                tracing::warn!(helper, registry, "Unknown auth helper, continuing anonymously");
                (Credential::None, "default")
            }
        }
    }

    /// Look up object-storage keys for a `provider:locator:bucket` triplet.
    pub fn resolve_object_storage(&self, triplet: &str) -> Result<(String, String)> {
        match self.entry_for(triplet) {
            Some(entry)
                if !entry.auth.username.is_empty() && !entry.auth.password.is_empty() =>
            {
                Ok((entry.auth.username.clone(), entry.auth.password.clone()))
            }
            _ => Err(SyncError::ConfigError(format!(
                "no object storage credentials configured for {}",
                triplet
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regmirror_core::config::AuthEntry;

    fn config_with(entries: Vec<RegistryEntry>) -> SyncConfig {
        let mut config = SyncConfig::default();
        config.sync.registries = entries;
        config
    }

    fn entry(url: &str, auth: AuthEntry) -> RegistryEntry {
        RegistryEntry {
            name: url.to_string(),
            url: url.to_string(),
            auth,
        }
    }

    #[tokio::test]
    async fn test_resolve_no_match() {
        let resolver = CredentialResolver::new(&config_with(vec![]));
        let (cred, label) = resolver.resolve("ghcr.io", "org/app").await;
        assert_eq!(cred, Credential::None);
        assert_eq!(label, "default");
    }

    #[tokio::test]
    async fn test_resolve_basic() {
        let resolver = CredentialResolver::new(&config_with(vec![entry(
            "ghcr.io",
            AuthEntry {
                username: "bot".to_string(),
                password: "hunter2".to_string(),
                ..Default::default()
            },
        )]));

        let (cred, label) = resolver.resolve("ghcr.io", "org/app").await;
        assert_eq!(
            cred,
            Credential::Basic {
                username: "bot".to_string(),
                password: "hunter2".to_string(),
            }
        );
        assert_eq!(label, "basic");
    }

    #[tokio::test]
    async fn test_resolve_bearer() {
        let resolver = CredentialResolver::new(&config_with(vec![entry(
            "ghcr.io",
            AuthEntry {
                token: "t0ken".to_string(),
                ..Default::default()
            },
        )]));

        let (cred, label) = resolver.resolve("ghcr.io", "org/app").await;
        assert_eq!(
            cred,
            Credential::Bearer {
                token: "t0ken".to_string(),
            }
        );
        assert_eq!(label, "token");
    }

    #[tokio::test]
    async fn test_resolve_first_exact_match_wins() {
        let resolver = CredentialResolver::new(&config_with(vec![
            entry(
                "ghcr.io",
                AuthEntry {
                    username: "first".to_string(),
                    password: "p".to_string(),
                    ..Default::default()
                },
            ),
            entry(
                "ghcr.io",
                AuthEntry {
                    username: "second".to_string(),
                    password: "p".to_string(),
                    ..Default::default()
                },
            ),
        ]));

        let (cred, _) = resolver.resolve("ghcr.io", "org/app").await;
        assert_eq!(
            cred,
            Credential::Basic {
                username: "first".to_string(),
                password: "p".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_resolve_unknown_helper_degrades() {
        let resolver = CredentialResolver::new(&config_with(vec![entry(
            "example.com",
            AuthEntry {
                helper: "keychain".to_string(),
                ..Default::default()
            },
        )]));

        let (cred, label) = resolver.resolve("example.com", "app").await;
        assert_eq!(cred, Credential::None);
        assert_eq!(label, "default");
    }

    #[test]
    fn test_resolve_object_storage() {
        let resolver = CredentialResolver::new(&config_with(vec![entry(
            "s3:us-east-1:mybucket",
            AuthEntry {
                username: "AKIA123".to_string(),
                password: "secret".to_string(),
                ..Default::default()
            },
        )]));

        let (access, secret) = resolver
            .resolve_object_storage("s3:us-east-1:mybucket")
            .unwrap();
        assert_eq!(access, "AKIA123");
        assert_eq!(secret, "secret");
    }

    #[test]
    fn test_resolve_object_storage_missing() {
        let resolver = CredentialResolver::new(&config_with(vec![]));
        assert!(resolver
            .resolve_object_storage("r2:acct:bucket")
            .is_err());
    }

    #[test]
    fn test_to_registry_auth() {
        assert!(matches!(
            Credential::None.to_registry_auth(),
            RegistryAuth::Anonymous
        ));
        assert!(matches!(
            Credential::Basic {
                username: "u".to_string(),
                password: "p".to_string()
            }
            .to_registry_auth(),
            RegistryAuth::Basic(_, _)
        ));
        assert!(matches!(
            Credential::Bearer {
                token: "t".to_string()
            }
            .to_registry_auth(),
            RegistryAuth::Bearer(_)
        ));
    }
}
