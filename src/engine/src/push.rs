//! Per-(tag, target) push pipelines.
//!
//! Both pipelines replay the same staged tree. Ordering is the point:
//! blobs land before manifests, child manifests before the top manifest,
//! and the tag pointer is the last observable write, so a reader that can
//! see the tag can see everything it references.

use futures::stream::{self, StreamExt};

use regmirror_core::config::S3Settings;
use regmirror_core::error::{Result, SyncError};

use crate::auth::CredentialResolver;
use crate::bucket::{BucketClient, ObjectBody, SyncOutcome};
use crate::cache::{BucketInitSet, ObjectCache};
use crate::reference::Reference;
use crate::registry::RegistryClient;
use crate::stage::StagedImage;
use crate::telemetry::{Metrics, TransferKind};

/// A connected destination.
pub enum Target {
    Oci {
        target: String,
        registry: String,
        repository: String,
    },
    Bucket {
        target: String,
        client: BucketClient,
    },
}

impl Target {
    /// Connect a destination string. Bucket targets open their S3 session
    /// here; OCI targets are resolved lazily per push.
    pub async fn connect(target: &str, resolver: &CredentialResolver) -> Result<Self> {
        match Reference::classify(target)? {
            Reference::Oci {
                registry,
                repository,
                ..
            } => Ok(Target::Oci {
                target: target.to_string(),
                registry,
                repository,
            }),
            reference @ Reference::S3Compatible { .. } => Ok(Target::Bucket {
                target: target.to_string(),
                client: BucketClient::connect(&reference, resolver).await?,
            }),
        }
    }

    /// The raw destination string, as written in the job.
    pub fn name(&self) -> &str {
        match self {
            Target::Oci { target, .. } => target,
            Target::Bucket { target, .. } => target,
        }
    }
}

/// Push a staged tag to one destination.
#[allow(clippy::too_many_arguments)]
pub async fn push_staged(
    registry_client: &RegistryClient,
    resolver: &CredentialResolver,
    staged: &StagedImage,
    target: &Target,
    s3_settings: &S3Settings,
    cache: &ObjectCache,
    init_set: &BucketInitSet,
    metrics: &Metrics,
) -> Result<()> {
    match target {
        Target::Oci {
            target,
            registry,
            repository,
        } => {
            push_to_registry(
                registry_client,
                resolver,
                staged,
                target,
                registry,
                repository,
                s3_settings.max_concurrent_uploads,
                metrics,
            )
            .await
        }
        Target::Bucket { target, client } => {
            push_to_bucket(
                client,
                staged,
                target,
                s3_settings.max_concurrent_uploads,
                cache,
                init_set,
                metrics,
            )
            .await
        }
    }
}

/// Replay a staged tag into an OCI registry.
#[allow(clippy::too_many_arguments)]
async fn push_to_registry(
    client: &RegistryClient,
    resolver: &CredentialResolver,
    staged: &StagedImage,
    target: &str,
    registry: &str,
    repository: &str,
    max_concurrent: usize,
    metrics: &Metrics,
) -> Result<()> {
    let (credential, auth_label) = resolver.resolve(registry, repository).await;
    tracing::debug!(target = %target, auth = auth_label, "Pushing to registry");

    let tag_ref = RegistryClient::tag_reference(registry, repository, &staged.tag)?;
    client.authenticate_push(&tag_ref, &credential).await?;

    // Blobs first.
    let uploads = staged.blobs.iter().map(|blob| {
        let tag_ref = &tag_ref;
        async move {
            let data = tokio::fs::read(&blob.path).await?;
            client.push_blob(tag_ref, &data, &blob.digest).await?;
            Ok::<u64, SyncError>(blob.size)
        }
    });
    let results: Vec<Result<u64>> = stream::iter(uploads)
        .buffer_unordered(max_concurrent.max(1))
        .collect()
        .await;
    for result in results {
        let bytes = result?;
        metrics.uploaded_bytes(target, TransferKind::Oci, bytes);
    }

    // Child manifests next, by digest.
    for manifest in staged.manifests.iter().skip(1) {
        let child_ref =
            RegistryClient::digest_reference(registry, repository, &manifest.digest)?;
        let bytes = tokio::fs::read(&manifest.path).await?;
        let len = bytes.len() as u64;
        client
            .push_manifest_raw(&child_ref, bytes, &manifest.media_type)
            .await?;
        metrics.uploaded_bytes(target, TransferKind::Oci, len);
    }

    // The tag manifest is the last observable write.
    let top_bytes = tokio::fs::read(&staged.top.path).await?;
    let top_len = top_bytes.len() as u64;
    client
        .push_manifest_raw(&tag_ref, top_bytes, &staged.top.media_type)
        .await?;
    metrics.uploaded_bytes(target, TransferKind::Oci, top_len);

    Ok(())
}

/// Materialize a staged tag into a bucket's v2 tree.
async fn push_to_bucket(
    client: &BucketClient,
    staged: &StagedImage,
    target: &str,
    max_concurrent: usize,
    cache: &ObjectCache,
    init_set: &BucketInitSet,
    metrics: &Metrics,
) -> Result<()> {
    client.ensure_v2_sentinel(init_set, cache).await?;

    tracing::info!(
        bucket = client.bucket(),
        target = %target,
        tag = %staged.tag,
        blobs = staged.blobs.len(),
        manifests = staged.manifests.len(),
        "Syncing objects"
    );

    // Phase A: blobs, fanned out.
    let uploads = staged.blobs.iter().map(|blob| async move {
        client
            .sync_object(
                &client.blob_key(&blob.digest),
                &blob.media_type,
                ObjectBody::File(&blob.path),
                false,
                cache,
            )
            .await
    });
    let results: Vec<Result<SyncOutcome>> = stream::iter(uploads)
        .buffer_unordered(max_concurrent.max(1))
        .collect()
        .await;
    for result in results {
        record_outcome(metrics, target, result?);
    }

    // Phase B: digest-keyed manifests, fanned out.
    let uploads = staged.manifests.iter().map(|manifest| async move {
        client
            .sync_object(
                &client.manifest_key(&manifest.digest),
                &manifest.media_type,
                ObjectBody::File(&manifest.path),
                false,
                cache,
            )
            .await
    });
    let results: Vec<Result<SyncOutcome>> = stream::iter(uploads)
        .buffer_unordered(max_concurrent.max(1))
        .collect()
        .await;
    for result in results {
        record_outcome(metrics, target, result?);
    }

    // Phase C: the tag pointer, forced because tags are mutable.
    let outcome = client
        .sync_object(
            &client.manifest_key(&staged.tag),
            &staged.top.media_type,
            ObjectBody::File(&staged.tag_pointer),
            true,
            cache,
        )
        .await?;
    record_outcome(metrics, target, outcome);

    Ok(())
}

fn record_outcome(metrics: &Metrics, target: &str, outcome: SyncOutcome) {
    if let SyncOutcome::Uploaded(bytes) = outcome {
        metrics.uploaded_bytes(target, TransferKind::S3, bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regmirror_core::config::SyncConfig;

    #[tokio::test]
    async fn test_connect_oci_target() {
        let resolver = CredentialResolver::new(&SyncConfig::default());
        let target = Target::connect("ghcr.io/mirror/alpine", &resolver)
            .await
            .unwrap();

        match &target {
            Target::Oci {
                registry,
                repository,
                ..
            } => {
                assert_eq!(registry, "ghcr.io");
                assert_eq!(repository, "mirror/alpine");
            }
            _ => panic!("Expected Oci target"),
        }
        assert_eq!(target.name(), "ghcr.io/mirror/alpine");
    }

    #[tokio::test]
    async fn test_connect_short_form_target() {
        let resolver = CredentialResolver::new(&SyncConfig::default());
        let target = Target::connect("mirror/alpine", &resolver).await.unwrap();

        match &target {
            Target::Oci { registry, .. } => assert_eq!(registry, "docker.io"),
            _ => panic!("Expected Oci target"),
        }
    }

    #[tokio::test]
    async fn test_connect_bucket_without_credentials_fails() {
        // Bucket targets need object storage keys in the registry table.
        let resolver = CredentialResolver::new(&SyncConfig::default());
        let result = Target::connect("s3:us-east-1:mybucket:library/alpine", &resolver).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_connect_invalid_target() {
        let resolver = CredentialResolver::new(&SyncConfig::default());
        assert!(Target::connect("", &resolver).await.is_err());
        assert!(Target::connect("gs:a:b:c", &resolver).await.is_err());
    }
}
