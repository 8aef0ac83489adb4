//! Tag purge and orphan-blob sweep.
//!
//! Purge removes destination tags absent from source (mutable tags
//! excepted), then sweeps bucket blobs no manifest references anymore.
//! Individual failures are counted and skipped; the next run retries.
//!
//! Referenced digests are found by scanning manifest bodies for
//! `sha256:<64 hex>` substrings. That skips parsing every manifest media
//! type while still catching references inside indexes, image manifests,
//! and v1 compat manifests. Bodies are streamed, not buffered whole.

use std::collections::BTreeSet;

use futures::stream::{self, StreamExt};
use regex::Regex;

use regmirror_core::error::{Result, SyncError};

use crate::auth::CredentialResolver;
use crate::bucket::{self, BucketClient};
use crate::cache::ObjectCache;
use crate::plan;
use crate::push::Target;
use crate::registry::RegistryClient;
use crate::telemetry::Metrics;

/// A digest match can straddle stream chunks; `sha256:` + 64 hex is 71
/// bytes, so 70 carried bytes always complete a split match.
const SCAN_CARRY: usize = 70;

/// Compute the purgable tags for one target from namespaced discovery
/// results: destination minus source minus mutable, sorted and deduped.
pub fn purgable_tags(
    target: &str,
    destination_tags: &[String],
    source_tags: &[String],
    mutable_tags: &[String],
) -> Vec<String> {
    let prefix = format!("{}:", target);

    let mut out: Vec<String> = destination_tags
        .iter()
        .filter_map(|namespaced| namespaced.strip_prefix(&prefix))
        .filter(|tag| !source_tags.iter().any(|s| s == tag))
        .filter(|tag| !plan::is_mutable(tag, mutable_tags))
        .map(str::to_string)
        .collect();

    out.sort();
    out.dedup();
    out
}

/// Purge one target, then sweep orphans when it is a bucket.
#[allow(clippy::too_many_arguments)]
pub async fn purge_target(
    registry_client: &RegistryClient,
    resolver: &CredentialResolver,
    image: &str,
    target: &Target,
    source_tags: &[String],
    destination_tags: &[String],
    mutable_tags: &[String],
    max_concurrency: usize,
    cache: &ObjectCache,
    metrics: &Metrics,
) {
    let to_purge = purgable_tags(target.name(), destination_tags, source_tags, mutable_tags);

    if to_purge.is_empty() {
        tracing::debug!(
            image,
            target = target.name(),
            "No tags to purge in target, skipping"
        );
    } else {
        tracing::info!(
            image,
            target = target.name(),
            tags = ?to_purge,
            "Purging tags"
        );

        let deletions = to_purge.iter().map(|tag| async move {
            metrics.init_purge_errors(image, tag, target.name());

            let result = match target {
                Target::Oci {
                    registry,
                    repository,
                    ..
                } => {
                    let (credential, _) = resolver.resolve(registry, repository).await;
                    registry_client
                        .delete_tag(registry, repository, tag, &credential)
                        .await
                }
                Target::Bucket { client, .. } => {
                    client.delete_object(&client.manifest_key(tag), cache).await
                }
            };

            if let Err(e) = result {
                tracing::error!(
                    image,
                    tag,
                    target = target.name(),
                    error = %e,
                    "Failed to purge tag"
                );
                metrics.tag_purge_error(image, tag, target.name(), &e.to_string());
            }
        });

        stream::iter(deletions)
            .buffer_unordered(max_concurrency.max(1))
            .collect::<Vec<()>>()
            .await;
    }

    if let Target::Bucket { client, .. } = target {
        if let Err(e) = sweep_orphan_blobs(client, max_concurrency, cache).await {
            tracing::error!(
                image,
                target = target.name(),
                error = %e,
                "Failed to delete orphaned blobs"
            );
            metrics.purge_error(image, target.name(), &e.to_string());
        }
    }
}

/// Delete every blob in the repository prefix that no manifest references.
pub async fn sweep_orphan_blobs(
    client: &BucketClient,
    max_concurrency: usize,
    cache: &ObjectCache,
) -> Result<()> {
    let all_blobs = list_repository_blobs(client).await?;
    tracing::info!(
        bucket = client.bucket(),
        blobs = all_blobs.len(),
        "Retrieved all blobs in repository"
    );

    let referenced = collect_referenced_digests(client, max_concurrency).await?;
    tracing::info!(
        bucket = client.bucket(),
        referenced = referenced.len(),
        "Retrieved all referenced blobs in repository"
    );

    let orphaned: Vec<&String> = all_blobs
        .iter()
        .filter(|digest| !referenced.contains(*digest))
        .collect();

    if orphaned.is_empty() {
        tracing::info!(bucket = client.bucket(), "No orphaned blobs found");
        return Ok(());
    }

    tracing::info!(
        bucket = client.bucket(),
        orphaned = orphaned.len(),
        "Found orphaned blobs"
    );

    let deletions = orphaned.iter().map(|digest| async move {
        let key = client.blob_key(digest);
        if let Err(e) = client.delete_object(&key, cache).await {
            tracing::error!(
                bucket = client.bucket(),
                key = %key,
                error = %e,
                "Failed to delete orphaned blob"
            );
        }
    });

    stream::iter(deletions)
        .buffer_unordered(max_concurrency.max(1))
        .collect::<Vec<()>>()
        .await;

    Ok(())
}

/// The digest-named blobs currently in the repository prefix.
async fn list_repository_blobs(client: &BucketClient) -> Result<BTreeSet<String>> {
    let keys = client.list_keys(&client.blob_key("")).await?;
    Ok(keys
        .iter()
        .map(|k| bucket::object_basename(k))
        .filter(|name| name.starts_with("sha256:"))
        .map(str::to_string)
        .collect())
}

/// Scan every manifest body in the repository prefix for digest references.
async fn collect_referenced_digests(
    client: &BucketClient,
    max_concurrency: usize,
) -> Result<BTreeSet<String>> {
    let manifest_keys = client.list_keys(&client.manifest_key("")).await?;

    let scans = manifest_keys.iter().map(|key| async move {
        tracing::debug!(bucket = client.bucket(), key = %key, "Processing object");

        let mut body = client.get_object(key).await?;
        let mut scanner = DigestScanner::new();
        while let Some(chunk) = body.try_next().await.map_err(|e| {
            SyncError::ObjectStoreError {
                bucket: client.bucket().to_string(),
                message: format!("failed to read {}: {}", key, e),
            }
        })? {
            scanner.push_chunk(&chunk);
        }
        Ok::<BTreeSet<String>, SyncError>(scanner.into_found())
    });

    let results: Vec<Result<BTreeSet<String>>> = stream::iter(scans)
        .buffer_unordered(max_concurrency.max(1))
        .collect()
        .await;

    let mut referenced = BTreeSet::new();
    for result in results {
        referenced.extend(result?);
    }
    Ok(referenced)
}

/// Streaming `sha256:<hex64>` extractor with cross-chunk carry.
pub struct DigestScanner {
    re: Regex,
    carry: String,
    found: BTreeSet<String>,
}

impl DigestScanner {
    pub fn new() -> Self {
        Self {
            re: Regex::new("sha256:[a-f0-9]{64}").expect("digest regex is valid"),
            carry: String::new(),
            found: BTreeSet::new(),
        }
    }

    /// Scan one chunk, keeping a tail so split matches still land.
    pub fn push_chunk(&mut self, chunk: &[u8]) {
        let text = format!("{}{}", self.carry, String::from_utf8_lossy(chunk));
        for m in self.re.find_iter(&text) {
            self.found.insert(m.as_str().to_string());
        }

        let tail_start = text.len().saturating_sub(SCAN_CARRY);
        // Respect char boundaries; digests are ASCII so this only trims
        // unrelated multi-byte content.
        let mut start = tail_start;
        while start < text.len() && !text.is_char_boundary(start) {
            start += 1;
        }
        self.carry = text[start..].to_string();
    }

    pub fn into_found(self) -> BTreeSet<String> {
        self.found
    }
}

impl Default for DigestScanner {
    fn default() -> Self {
        Self::new()
    }
}
