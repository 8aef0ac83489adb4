//! OCI registry client.
//!
//! Wraps the `oci-client` distribution client for tag listing, raw
//! manifest and blob transfer. Tag deletion is not part of that crate's
//! surface, so it is done over a plain HTTP client with the registry
//! token handshake.

use oci_client::client::{ClientConfig, ClientProtocol};
use oci_client::manifest::{
    IMAGE_MANIFEST_LIST_MEDIA_TYPE, IMAGE_MANIFEST_MEDIA_TYPE, OCI_IMAGE_INDEX_MEDIA_TYPE,
    OCI_IMAGE_MEDIA_TYPE,
};
use oci_client::{Client, Reference as OciReference, RegistryOperation};

use regmirror_core::error::{Result, SyncError};

use crate::auth::Credential;

/// Manifest media types we ask registries for, multi-arch indexes included.
pub const MANIFEST_ACCEPT_TYPES: &[&str] = &[
    OCI_IMAGE_INDEX_MEDIA_TYPE,
    OCI_IMAGE_MEDIA_TYPE,
    IMAGE_MANIFEST_LIST_MEDIA_TYPE,
    IMAGE_MANIFEST_MEDIA_TYPE,
];

/// Docker schema-v1 media types. Not mirrored.
pub const SCHEMA_V1_MEDIA_TYPES: &[&str] = &[
    "application/vnd.docker.distribution.manifest.v1+json",
    "application/vnd.docker.distribution.manifest.v1+prettyjws",
];

/// Page size for tag listing.
const TAG_PAGE_SIZE: usize = 100;

/// Client for one registry interaction style across all registries.
pub struct RegistryClient {
    client: Client,
    http: reqwest::Client,
}

impl RegistryClient {
    pub fn new() -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            http: reqwest::Client::new(),
        }
    }

    fn registry_error(registry: &str, message: impl std::fmt::Display) -> SyncError {
        SyncError::RegistryError {
            registry: registry.to_string(),
            message: message.to_string(),
        }
    }

    fn parse_reference(registry: &str, repository: &str, suffix: &str) -> Result<OciReference> {
        let raw = format!("{}/{}{}", registry, repository, suffix);
        raw.parse::<OciReference>()
            .map_err(|e| SyncError::ReferenceError {
                reference: raw,
                message: e.to_string(),
            })
    }

    /// Reference for `registry/repository:tag`.
    pub fn tag_reference(registry: &str, repository: &str, tag: &str) -> Result<OciReference> {
        Self::parse_reference(registry, repository, &format!(":{}", tag))
    }

    /// Reference for `registry/repository@digest`.
    pub fn digest_reference(
        registry: &str,
        repository: &str,
        digest: &str,
    ) -> Result<OciReference> {
        Self::parse_reference(registry, repository, &format!("@{}", digest))
    }

    /// List every tag in a repository, paginating through the catalog.
    pub async fn list_tags(
        &self,
        registry: &str,
        repository: &str,
        credential: &Credential,
    ) -> Result<Vec<String>> {
        let reference = Self::parse_reference(registry, repository, "")?;
        let auth = credential.to_registry_auth();

        let mut tags: Vec<String> = Vec::new();
        let mut last: Option<String> = None;

        loop {
            let response = self
                .client
                .list_tags(&reference, &auth, Some(TAG_PAGE_SIZE), last.as_deref())
                .await
                .map_err(|e| Self::registry_error(registry, e))?;

            let page_len = response.tags.len();
            tags.extend(response.tags);

            if page_len < TAG_PAGE_SIZE {
                break;
            }
            // Registries that ignore pagination return the full list every
            // time; an unchanged cursor would loop forever.
            let next = tags.last().cloned();
            if next == last {
                break;
            }
            last = next;
        }

        tags.sort();
        tags.dedup();
        Ok(tags)
    }

    /// Pull a manifest without re-encoding; the raw bytes are the digest
    /// source and must round-trip exactly.
    pub async fn pull_manifest_raw(
        &self,
        reference: &OciReference,
        credential: &Credential,
    ) -> Result<(Vec<u8>, String)> {
        let auth = credential.to_registry_auth();
        self.client
            .pull_manifest_raw(reference, &auth, MANIFEST_ACCEPT_TYPES)
            .await
            .map_err(|e| Self::registry_error(reference.registry(), e))
    }

    /// Pull a blob into `out`.
    pub async fn pull_blob<T: tokio::io::AsyncWrite + Unpin>(
        &self,
        reference: &OciReference,
        descriptor: &oci_client::manifest::OciDescriptor,
        out: T,
    ) -> Result<()> {
        self.client
            .pull_blob(reference, descriptor, out)
            .await
            .map_err(|e| Self::registry_error(reference.registry(), e))
    }

    /// Seed the client's token store for pushes to this repository.
    /// Subsequent `push_blob`/`push_manifest_raw` calls reuse the token.
    pub async fn authenticate_push(
        &self,
        reference: &OciReference,
        credential: &Credential,
    ) -> Result<()> {
        let auth = credential.to_registry_auth();
        self.client
            .auth(reference, &auth, RegistryOperation::Push)
            .await
            .map_err(|e| Self::registry_error(reference.registry(), e))?;
        Ok(())
    }

    /// Push one blob under its digest. Call `authenticate_push` first.
    pub async fn push_blob(
        &self,
        reference: &OciReference,
        data: &[u8],
        digest: &str,
    ) -> Result<()> {
        self.client
            .push_blob(reference, data, digest)
            .await
            .map_err(|e| Self::registry_error(reference.registry(), e))?;
        Ok(())
    }

    /// Push raw manifest bytes under a tag or digest reference.
    /// Call `authenticate_push` first.
    pub async fn push_manifest_raw(
        &self,
        reference: &OciReference,
        bytes: Vec<u8>,
        media_type: &str,
    ) -> Result<()> {
        let content_type = http::HeaderValue::from_str(media_type).map_err(|e| {
            Self::registry_error(reference.registry(), format!("bad media type: {}", e))
        })?;
        self.client
            .push_manifest_raw(reference, bytes, content_type)
            .await
            .map_err(|e| Self::registry_error(reference.registry(), e))?;
        Ok(())
    }

    /// Delete a tag: resolve its digest, then DELETE the manifest.
    pub async fn delete_tag(
        &self,
        registry: &str,
        repository: &str,
        tag: &str,
        credential: &Credential,
    ) -> Result<()> {
        let base = format!("https://{}", registry_host(registry));
        let manifest_url = format!("{}/v2/{}/manifests/{}", base, repository, tag);

        let head = self
            .authed_request(
                self.http
                    .head(&manifest_url)
                    .header("Accept", MANIFEST_ACCEPT_TYPES.join(",")),
                registry,
                repository,
                credential,
            )
            .await?;
        if !head.status().is_success() {
            return Err(Self::registry_error(
                registry,
                format!("cannot resolve {}:{}: HTTP {}", repository, tag, head.status()),
            ));
        }

        let digest = head
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                Self::registry_error(registry, "missing Docker-Content-Digest header")
            })?;

        let delete_url = format!("{}/v2/{}/manifests/{}", base, repository, digest);
        let response = self
            .authed_request(self.http.delete(&delete_url), registry, repository, credential)
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::registry_error(
                registry,
                format!(
                    "delete of {}:{} ({}) failed: HTTP {}",
                    repository,
                    tag,
                    digest,
                    response.status()
                ),
            ))
        }
    }

    /// Send a request, answering a 401 challenge with a bearer token.
    async fn authed_request(
        &self,
        request: reqwest::RequestBuilder,
        registry: &str,
        repository: &str,
        credential: &Credential,
    ) -> Result<reqwest::Response> {
        let request = match credential {
            Credential::Bearer { token } => request.bearer_auth(token),
            _ => request,
        };

        let retry = request
            .try_clone()
            .ok_or_else(|| Self::registry_error(registry, "request not cloneable"))?;

        let response = request
            .send()
            .await
            .map_err(|e| Self::registry_error(registry, e))?;
        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get("www-authenticate")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Self::registry_error(registry, "missing WWW-Authenticate header"))?;

        let token = self
            .fetch_bearer_token(&challenge, registry, repository, credential)
            .await?;

        retry
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| Self::registry_error(registry, e))
    }

    /// Exchange a WWW-Authenticate challenge for a bearer token.
    async fn fetch_bearer_token(
        &self,
        challenge: &str,
        registry: &str,
        repository: &str,
        credential: &Credential,
    ) -> Result<String> {
        let fields: std::collections::HashMap<String, String> =
            parse_challenge_fields(challenge).into_iter().collect();

        let realm = fields.get("Bearer realm").or_else(|| fields.get("realm")).ok_or_else(
            || Self::registry_error(registry, "challenge without a bearer realm"),
        )?;

        let mut request = self.http.get(realm.as_str());
        if let Some(service) = fields.get("service") {
            request = request.query(&[("service", service)]);
        }
        match fields.get("scope") {
            Some(scope) => request = request.query(&[("scope", scope)]),
            // DELETE challenges from some registries omit the scope
            None => {
                request = request.query(&[(
                    "scope",
                    &format!("repository:{}:pull,push,delete", repository),
                )])
            }
        }
        if let Credential::Basic { username, password } = credential {
            request = request.basic_auth(username, Some(password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| Self::registry_error(registry, e))?;
        if !response.status().is_success() {
            return Err(Self::registry_error(
                registry,
                format!("token exchange failed: HTTP {}", response.status()),
            ));
        }

        #[derive(serde::Deserialize)]
        struct TokenResponse {
            token: Option<String>,
            access_token: Option<String>,
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| Self::registry_error(registry, e))?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| Self::registry_error(registry, "token exchange returned no token"))
    }
}

impl Default for RegistryClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Docker Hub's API lives on a different host than its reference name.
fn registry_host(registry: &str) -> &str {
    if registry == "docker.io" {
        "registry-1.docker.io"
    } else {
        registry
    }
}

/// Split a `key="value",key="value"` challenge header into pairs.
fn parse_challenge_fields(input: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut rest = input;

    while let Some((key, remaining)) = rest.split_once('=') {
        if let Some(remaining) = remaining.strip_prefix('"') {
            if let Some((value, remaining)) = remaining.split_once('"') {
                pairs.push((key.trim().to_string(), value.to_string()));
                match remaining.strip_prefix(',') {
                    None => break,
                    Some(remaining) => rest = remaining,
                }
                continue;
            }
        }
        break;
    }
    pairs
}

/// True when the manifest media type is Docker schema v1.
pub fn is_schema_v1(media_type: &str) -> bool {
    SCHEMA_V1_MEDIA_TYPES.contains(&media_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_challenge_fields() {
        let input = r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/alpine:pull""#;
        let fields = parse_challenge_fields(input);
        assert_eq!(
            fields,
            vec![
                (
                    "Bearer realm".to_string(),
                    "https://auth.docker.io/token".to_string()
                ),
                ("service".to_string(), "registry.docker.io".to_string()),
                (
                    "scope".to_string(),
                    "repository:library/alpine:pull".to_string()
                ),
            ]
        );
    }

    #[test]
    fn test_parse_challenge_fields_empty() {
        assert!(parse_challenge_fields("").is_empty());
        assert!(parse_challenge_fields("Basic").is_empty());
    }

    #[test]
    fn test_tag_reference() {
        let r = RegistryClient::tag_reference("ghcr.io", "mirror/alpine", "3.19").unwrap();
        assert_eq!(r.registry(), "ghcr.io");
        assert_eq!(r.repository(), "mirror/alpine");
        assert_eq!(r.tag(), Some("3.19"));
    }

    #[test]
    fn test_digest_reference() {
        let digest =
            "sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890";
        let r = RegistryClient::digest_reference("ghcr.io", "mirror/alpine", digest).unwrap();
        assert_eq!(r.digest(), Some(digest));
    }

    #[test]
    fn test_is_schema_v1() {
        assert!(is_schema_v1(
            "application/vnd.docker.distribution.manifest.v1+json"
        ));
        assert!(is_schema_v1(
            "application/vnd.docker.distribution.manifest.v1+prettyjws"
        ));
        assert!(!is_schema_v1(IMAGE_MANIFEST_MEDIA_TYPE));
        assert!(!is_schema_v1(OCI_IMAGE_INDEX_MEDIA_TYPE));
    }

    #[test]
    fn test_registry_host_aliases_docker_hub() {
        assert_eq!(registry_host("docker.io"), "registry-1.docker.io");
        assert_eq!(registry_host("ghcr.io"), "ghcr.io");
        assert_eq!(registry_host("localhost:5000"), "localhost:5000");
    }

    #[test]
    fn test_manifest_accept_types_cover_indexes() {
        assert!(MANIFEST_ACCEPT_TYPES.contains(&OCI_IMAGE_INDEX_MEDIA_TYPE));
        assert!(MANIFEST_ACCEPT_TYPES.contains(&IMAGE_MANIFEST_LIST_MEDIA_TYPE));
    }
}
