//! S3-compatible object storage for bucket targets.
//!
//! A bucket holds a static OCI Distribution v2 tree under
//! `v2/<repository>/`. Objects are public-read; each carries its media
//! type as `Content-Type`, an MD5 for the provider's integrity check, and
//! the SHA-256 content address as `x-calculated-digest` user metadata
//! (R2 exposes no server-side SHA-256, so HEAD-based dedup needs it).

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ObjectCannedAcl;
use base64::Engine;
use md5::Md5;
use sha2::{Digest, Sha256};

use regmirror_core::error::{Result, SyncError};

use crate::auth::CredentialResolver;
use crate::cache::{BucketInitSet, ObjectCache};
use crate::reference::{BucketProvider, Reference};

/// Per-request timeout. Some blobs are huge.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Metadata key carrying the SHA-256 content address.
const CALCULATED_DIGEST_KEY: &str = "x-calculated-digest";

/// The object body handed to `sync_object`.
pub enum ObjectBody<'a> {
    File(&'a Path),
    Bytes(&'a [u8]),
}

/// What `sync_object` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Object PUT, carrying the byte count.
    Uploaded(u64),
    /// Seen-object cache hit; nothing sent.
    SkippedCache,
    /// HEAD or hash comparison proved the object already matches.
    SkippedExists,
}

/// HEAD result: presence plus the stored content address, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
struct HeadResult {
    exists: bool,
    stored_digest: Option<String>,
}

/// A connected S3-compatible bucket scoped to one repository prefix.
pub struct BucketClient {
    client: aws_sdk_s3::Client,
    /// Endpoint label for the bootstrap set: region for S3, account
    /// endpoint for R2.
    endpoint: String,
    bucket: String,
    /// `v2/<repository>`.
    base_dir: String,
    /// Full destination string, used as the metrics label.
    destination: String,
}

impl BucketClient {
    /// Connect to the bucket named by an S3-compatible reference.
    pub async fn connect(reference: &Reference, resolver: &CredentialResolver) -> Result<Self> {
        let Reference::S3Compatible {
            provider,
            locator,
            bucket,
            repository,
            ..
        } = reference
        else {
            return Err(SyncError::ReferenceError {
                reference: reference.to_string(),
                message: "not an S3-compatible reference".to_string(),
            });
        };

        let triplet = format!("{}:{}:{}", provider.as_str(), locator, bucket);
        let (access_key, secret_key) = resolver.resolve_object_storage(&triplet)?;

        let credentials = aws_credential_types::Credentials::from_keys(
            access_key, secret_key, None,
        );
        let timeouts = aws_config::timeout::TimeoutConfig::builder()
            .operation_timeout(REQUEST_TIMEOUT)
            .build();

        let (region, endpoint) = match provider {
            BucketProvider::AwsS3 => (locator.clone(), locator.clone()),
            BucketProvider::CloudflareR2 => (
                "us-east-1".to_string(),
                format!("https://{}.r2.cloudflarestorage.com", locator),
            ),
        };

        let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region))
            .credentials_provider(credentials)
            .timeout_config(timeouts)
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared).force_path_style(true);
        if matches!(provider, BucketProvider::CloudflareR2) {
            builder = builder.endpoint_url(&endpoint);
        }

        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            endpoint,
            bucket: bucket.clone(),
            base_dir: format!("v2/{}", repository),
            destination: reference.full_reference(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// `v2/<repository>/blobs/<name>`.
    pub fn blob_key(&self, name: &str) -> String {
        format!("{}/blobs/{}", self.base_dir, name)
    }

    /// `v2/<repository>/manifests/<name>`.
    pub fn manifest_key(&self, name: &str) -> String {
        format!("{}/manifests/{}", self.base_dir, name)
    }

    fn store_error(&self, message: impl std::fmt::Display) -> SyncError {
        SyncError::ObjectStoreError {
            bucket: self.bucket.clone(),
            message: message.to_string(),
        }
    }

    /// Upload the `v2` discovery sentinel once per (endpoint, bucket).
    pub async fn ensure_v2_sentinel(
        &self,
        init_set: &BucketInitSet,
        cache: &ObjectCache,
    ) -> Result<()> {
        if init_set.contains(&self.endpoint, &self.bucket) {
            return Ok(());
        }
        self.sync_object("v2", "application/json", ObjectBody::Bytes(b"{}"), false, cache)
            .await?;
        init_set.mark(&self.endpoint, &self.bucket);
        Ok(())
    }

    /// Upload an object unless it is already present with matching bytes.
    ///
    /// `force` bypasses every skip path; tag pointers are mutable and are
    /// always written.
    pub async fn sync_object(
        &self,
        key: &str,
        content_type: &str,
        body: ObjectBody<'_>,
        force: bool,
        cache: &ObjectCache,
    ) -> Result<SyncOutcome> {
        if !force && cache.has(&self.bucket, key) {
            tracing::debug!(
                bucket = %self.bucket,
                key,
                "Object seen recently, skipping upload"
            );
            return Ok(SyncOutcome::SkippedCache);
        }

        let head = self.head_object(key).await?;

        if !force && skip_by_name(key, &head) {
            tracing::debug!(
                bucket = %self.bucket,
                key,
                "Object already exists with same digest, skipping upload"
            );
            cache.mark(&self.bucket, key);
            return Ok(SyncOutcome::SkippedExists);
        }

        // Blobs can be huge; hash through a temp file rather than memory.
        let hashed = hash_body_to_temp(body)?;

        if !force && head.stored_digest.as_deref() == Some(hashed.sha256.as_str()) {
            tracing::debug!(
                bucket = %self.bucket,
                key,
                "Object already exists with same digest, skipping upload"
            );
            cache.mark(&self.bucket, key);
            return Ok(SyncOutcome::SkippedExists);
        }

        tracing::info!(
            bucket = %self.bucket,
            key,
            content_type,
            computed_digest = %hashed.sha256,
            size = hashed.size,
            "Uploading object"
        );

        let stream = ByteStream::from_path(hashed.file.path())
            .await
            .map_err(|e| self.store_error(e))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(stream)
            .acl(ObjectCannedAcl::PublicRead)
            .content_type(content_type)
            .content_md5(&hashed.md5_base64)
            .metadata(CALCULATED_DIGEST_KEY, &hashed.sha256)
            .send()
            .await
            .map_err(|e| self.store_error(format!("failed to upload {}: {}", key, e)))?;

        cache.mark(&self.bucket, key);
        Ok(SyncOutcome::Uploaded(hashed.size))
    }

    /// HEAD an object, tolerating absence.
    async fn head_object(&self, key: &str) -> Result<HeadResult> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => {
                let stored_digest = output
                    .metadata()
                    .and_then(|m| lookup_digest_metadata(m))
                    .map(str::to_string);
                Ok(HeadResult {
                    exists: true,
                    stored_digest,
                })
            }
            Err(e) => {
                let not_found = e
                    .as_service_error()
                    .map(|se| se.is_not_found())
                    .unwrap_or(false);
                if not_found {
                    Ok(HeadResult {
                        exists: false,
                        stored_digest: None,
                    })
                } else {
                    Err(self.store_error(format!("HEAD {} failed: {}", key, e)))
                }
            }
        }
    }

    /// Delete an object and drop its cache entry.
    pub async fn delete_object(&self, key: &str, cache: &ObjectCache) -> Result<()> {
        tracing::info!(bucket = %self.bucket, key, "Deleting object");

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| self.store_error(format!("failed to delete {}: {}", key, e)))?;

        cache.invalidate(&self.bucket, key);
        Ok(())
    }

    /// List every key under a prefix, following pagination.
    pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| {
                self.store_error(format!("LIST {} failed: {}", prefix, e))
            })?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }
        }

        Ok(keys)
    }

    /// Open an object for streaming reads.
    pub async fn get_object(&self, key: &str) -> Result<ByteStream> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| self.store_error(format!("GET {} failed: {}", key, e)))?;
        Ok(output.body)
    }
}

/// The stored digest under either metadata casing.
fn lookup_digest_metadata(metadata: &HashMap<String, String>) -> Option<&str> {
    metadata
        .get(CALCULATED_DIGEST_KEY)
        .or_else(|| metadata.get("X-Calculated-Digest"))
        .map(String::as_str)
}

/// A digest-named key can skip its upload when the stored digest equals
/// the name itself.
fn skip_by_name(key: &str, head: &HeadResult) -> bool {
    if !head.exists {
        return false;
    }
    let name = object_basename(key);
    name.starts_with("sha256:") && head.stored_digest.as_deref() == Some(name)
}

/// The final path segment of an object key.
pub fn object_basename(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

struct HashedBody {
    file: tempfile::NamedTempFile,
    sha256: String,
    md5_base64: String,
    size: u64,
}

/// Stream a body into a temp file, computing SHA-256 and MD5 on the way.
fn hash_body_to_temp(body: ObjectBody<'_>) -> Result<HashedBody> {
    let mut file = tempfile::NamedTempFile::new()?;
    let mut sha256 = Sha256::new();
    let mut md5 = Md5::new();
    let mut size: u64 = 0;

    match body {
        ObjectBody::Bytes(bytes) => {
            sha256.update(bytes);
            md5.update(bytes);
            file.write_all(bytes)?;
            size = bytes.len() as u64;
        }
        ObjectBody::File(path) => {
            use std::io::Read;
            let mut reader = std::fs::File::open(path)?;
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                sha256.update(&buf[..n]);
                md5.update(&buf[..n]);
                file.write_all(&buf[..n])?;
                size += n as u64;
            }
        }
    }
    file.flush()?;

    Ok(HashedBody {
        file,
        sha256: format!("sha256:{:x}", sha256.finalize()),
        md5_base64: base64::engine::general_purpose::STANDARD.encode(md5.finalize()),
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_basename() {
        assert_eq!(
            object_basename("v2/library/alpine/blobs/sha256:abc"),
            "sha256:abc"
        );
        assert_eq!(object_basename("v2"), "v2");
        assert_eq!(object_basename("v2/library/alpine/manifests/3.19"), "3.19");
    }

    #[test]
    fn test_skip_by_name_matching_digest() {
        let head = HeadResult {
            exists: true,
            stored_digest: Some("sha256:abc".to_string()),
        };
        assert!(skip_by_name("v2/repo/blobs/sha256:abc", &head));
    }

    #[test]
    fn test_skip_by_name_digest_mismatch() {
        let head = HeadResult {
            exists: true,
            stored_digest: Some("sha256:other".to_string()),
        };
        assert!(!skip_by_name("v2/repo/blobs/sha256:abc", &head));
    }

    #[test]
    fn test_skip_by_name_tag_pointer_never_skips() {
        // Tag pointers are not digest-named, so presence alone is not
        // enough; the hash comparison decides.
        let head = HeadResult {
            exists: true,
            stored_digest: Some("sha256:abc".to_string()),
        };
        assert!(!skip_by_name("v2/repo/manifests/latest", &head));
    }

    #[test]
    fn test_skip_by_name_absent_object() {
        let head = HeadResult {
            exists: false,
            stored_digest: None,
        };
        assert!(!skip_by_name("v2/repo/blobs/sha256:abc", &head));
    }

    #[test]
    fn test_hash_body_bytes() {
        let hashed = hash_body_to_temp(ObjectBody::Bytes(b"{}")).unwrap();

        // sha256("{}")
        assert_eq!(
            hashed.sha256,
            "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
        // md5("{}") = 99914b932bd37a50b983c5e7c90ae93b
        assert_eq!(hashed.md5_base64, "mZFLkyvTelC5g8XnyQrpOw==");
        assert_eq!(hashed.size, 2);
        assert_eq!(std::fs::read(hashed.file.path()).unwrap(), b"{}".to_vec());
    }

    #[test]
    fn test_hash_body_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"layer bytes").unwrap();

        let hashed = hash_body_to_temp(ObjectBody::File(&path)).unwrap();

        let mut sha = Sha256::new();
        sha.update(b"layer bytes");
        assert_eq!(hashed.sha256, format!("sha256:{:x}", sha.finalize()));
        assert_eq!(hashed.size, 11);
        assert_eq!(
            std::fs::read(hashed.file.path()).unwrap(),
            b"layer bytes".to_vec()
        );
    }

    #[test]
    fn test_lookup_digest_metadata_casings() {
        let mut lower = HashMap::new();
        lower.insert(CALCULATED_DIGEST_KEY.to_string(), "sha256:a".to_string());
        assert_eq!(lookup_digest_metadata(&lower), Some("sha256:a"));

        let mut upper = HashMap::new();
        upper.insert("X-Calculated-Digest".to_string(), "sha256:b".to_string());
        assert_eq!(lookup_digest_metadata(&upper), Some("sha256:b"));

        let empty = HashMap::new();
        assert_eq!(lookup_digest_metadata(&empty), None);
    }
}
