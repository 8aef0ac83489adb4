//! Local staging of one tag as a content-addressed directory.
//!
//! One staged tree feeds both push pipelines: every blob and manifest of a
//! tag (all platforms of an index) is fetched into a scratch directory laid
//! out as `blobs/sha256:<hex>` and `manifests/sha256:<hex>`, with the top
//! manifest additionally hard-linked to `manifests/<tag>`. Raw manifest
//! bytes are never re-encoded; their digests must round-trip.
//!
//! The scratch directory is deleted when the staged image is dropped,
//! whatever the outcome of the push.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use futures::stream::{self, StreamExt};
use oci_client::manifest::{OciDescriptor, OciImageIndex, OciImageManifest};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use regmirror_core::error::{Result, SyncError};

use crate::auth::Credential;
use crate::registry::{self, RegistryClient};

/// Media types applied when a manifest omits its own.
const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
const OCI_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

/// A manifest staged on disk, keyed by digest.
#[derive(Debug, Clone)]
pub struct StagedManifest {
    pub digest: String,
    pub media_type: String,
    pub path: PathBuf,
    pub size: u64,
}

/// A blob staged on disk, keyed by digest.
#[derive(Debug, Clone)]
pub struct StagedBlob {
    pub digest: String,
    pub media_type: String,
    pub path: PathBuf,
    pub size: u64,
}

/// One tag, fully materialized.
pub struct StagedImage {
    // Held for its Drop: removes the scratch tree.
    _dir: TempDir,
    pub tag: String,
    /// The tag's top-level manifest. Also present in `manifests`.
    pub top: StagedManifest,
    /// Every manifest (top first, then children), digest-keyed.
    pub manifests: Vec<StagedManifest>,
    /// Every unique blob referenced by the manifests.
    pub blobs: Vec<StagedBlob>,
    /// Hard link of the top manifest at `manifests/<tag>`.
    pub tag_pointer: PathBuf,
}

impl StagedImage {
    /// Total staged bytes, blobs and manifests.
    pub fn total_bytes(&self) -> u64 {
        self.blobs.iter().map(|b| b.size).sum::<u64>()
            + self.manifests.iter().map(|m| m.size).sum::<u64>()
    }
}

/// Fetch `registry/repository:tag` into a fresh scratch directory.
///
/// `on_downloaded` is invoked with the byte count of each fetched object.
pub async fn stage_tag(
    client: &RegistryClient,
    registry: &str,
    repository: &str,
    tag: &str,
    credential: &Credential,
    max_concurrent: usize,
    on_downloaded: &(dyn Fn(u64) + Send + Sync),
) -> Result<StagedImage> {
    let dir = TempDir::new().map_err(SyncError::IoError)?;
    let manifests_dir = dir.path().join("manifests");
    let blobs_dir = dir.path().join("blobs");
    std::fs::create_dir_all(&manifests_dir)?;
    std::fs::create_dir_all(&blobs_dir)?;

    let source = format!("{}/{}", registry, repository);
    let tag_ref = RegistryClient::tag_reference(registry, repository, tag)?;

    let (top_bytes, top_digest) = client.pull_manifest_raw(&tag_ref, credential).await?;
    on_downloaded(top_bytes.len() as u64);

    let top_media_type = detect_media_type(&top_bytes).ok_or_else(|| {
        SyncError::RegistryError {
            registry: registry.to_string(),
            message: format!("unrecognized manifest for {}:{}", source, tag),
        }
    })?;
    if registry::is_schema_v1(&top_media_type) || schema_version(&top_bytes) == Some(1) {
        return Err(SyncError::SchemaV1 {
            reference: format!("{}:{}", source, tag),
        });
    }

    let top = write_manifest(&manifests_dir, &top_digest, &top_media_type, &top_bytes)?;

    // The tag pointer shares the top manifest's bytes.
    let tag_pointer = manifests_dir.join(tag);
    std::fs::hard_link(&top.path, &tag_pointer)?;

    let mut manifests = vec![top.clone()];
    // digest → media type, deduplicated across platforms
    let mut blob_descriptors: BTreeMap<String, String> = BTreeMap::new();

    if is_index(&top_media_type) {
        let index: OciImageIndex = serde_json::from_slice(&top_bytes)?;
        for entry in &index.manifests {
            if registry::is_schema_v1(&entry.media_type) {
                tracing::warn!(
                    image = %source,
                    tag,
                    digest = %entry.digest,
                    "Skipping schema v1 child manifest"
                );
                continue;
            }

            // Index children are indexes, image manifests, or plain blobs
            // (some artifact indexes reference layers directly).
            if !is_index(&entry.media_type) && !is_image_manifest(&entry.media_type) {
                blob_descriptors
                    .entry(entry.digest.clone())
                    .or_insert_with(|| entry.media_type.clone());
                continue;
            }

            let child_ref =
                RegistryClient::digest_reference(registry, repository, &entry.digest)?;
            let (child_bytes, child_digest) =
                client.pull_manifest_raw(&child_ref, credential).await?;
            on_downloaded(child_bytes.len() as u64);

            let child_media_type = detect_media_type(&child_bytes)
                .unwrap_or_else(|| entry.media_type.clone());
            let staged =
                write_manifest(&manifests_dir, &child_digest, &child_media_type, &child_bytes)?;
            manifests.push(staged);

            if is_index(&child_media_type) {
                // Nested indexes are rare; their children are still digests
                // inside the bytes we already staged, so the descriptors
                // below cover blob extraction for one level only.
                tracing::warn!(
                    image = %source,
                    tag,
                    digest = %child_digest,
                    "Nested image index, mirroring manifest bytes only"
                );
                continue;
            }

            let manifest: OciImageManifest = serde_json::from_slice(&child_bytes)?;
            collect_blob_descriptors(&manifest, &mut blob_descriptors);
        }
    } else {
        let manifest: OciImageManifest = serde_json::from_slice(&top_bytes)?;
        collect_blob_descriptors(&manifest, &mut blob_descriptors);
    }

    // Fan out blob fetches, bounded.
    let fetches = blob_descriptors.iter().map(|(digest, media_type)| {
        let tag_ref = &tag_ref;
        let blobs_dir = &blobs_dir;
        let digest = digest.clone();
        let media_type = media_type.clone();
        async move {
            let staged =
                fetch_blob(client, tag_ref, blobs_dir, &digest, &media_type).await?;
            on_downloaded(staged.size);
            Ok::<_, SyncError>(staged)
        }
    });

    let results: Vec<Result<StagedBlob>> = stream::iter(fetches)
        .buffer_unordered(max_concurrent.max(1))
        .collect()
        .await;

    let mut blobs = Vec::with_capacity(results.len());
    for result in results {
        blobs.push(result?);
    }
    blobs.sort_by(|a, b| a.digest.cmp(&b.digest));

    tracing::debug!(
        image = %source,
        tag,
        manifests = manifests.len(),
        blobs = blobs.len(),
        "Staged tag"
    );

    Ok(StagedImage {
        _dir: dir,
        tag: tag.to_string(),
        top,
        manifests,
        blobs,
        tag_pointer,
    })
}

/// Pull one blob to a temp file, verify its digest, and move it into the
/// content-addressed tree.
async fn fetch_blob(
    client: &RegistryClient,
    reference: &oci_client::Reference,
    blobs_dir: &Path,
    digest: &str,
    media_type: &str,
) -> Result<StagedBlob> {
    let descriptor = OciDescriptor {
        digest: digest.to_string(),
        media_type: media_type.to_string(),
        ..Default::default()
    };

    let tmp_path = blobs_dir.join(format!("{}.partial", digest.replace(':', "_")));
    let file = tokio::fs::File::create(&tmp_path).await?;
    client.pull_blob(reference, &descriptor, file).await?;

    let (computed, path) = shamove(blobs_dir, &tmp_path)?;
    if computed != digest {
        // Keep the tree clean on mismatch
        let _ = std::fs::remove_file(&path);
        return Err(SyncError::RegistryError {
            registry: reference.registry().to_string(),
            message: format!("blob digest mismatch: expected {}, got {}", digest, computed),
        });
    }

    let size = std::fs::metadata(&path)?.len();
    Ok(StagedBlob {
        digest: digest.to_string(),
        media_type: media_type.to_string(),
        path,
        size,
    })
}

/// Write manifest bytes at `manifests/<digest>`.
fn write_manifest(
    manifests_dir: &Path,
    digest: &str,
    media_type: &str,
    bytes: &[u8],
) -> Result<StagedManifest> {
    let path = manifests_dir.join(digest);
    std::fs::write(&path, bytes)?;
    Ok(StagedManifest {
        digest: digest.to_string(),
        media_type: media_type.to_string(),
        path,
        size: bytes.len() as u64,
    })
}

/// Compute a file's SHA-256 and rename it to `<dir>/sha256:<hex>`.
///
/// Returns the digest and the final path.
pub fn shamove(dir: &Path, file: &Path) -> Result<(String, PathBuf)> {
    use std::io::Read;

    let mut hasher = Sha256::new();
    let mut reader = std::fs::File::open(file)?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    let digest = format!("sha256:{:x}", hasher.finalize());
    let target = dir.join(&digest);
    std::fs::rename(file, &target)?;
    Ok((digest, target))
}

/// Record a manifest's config and layer descriptors, deduplicating by digest.
fn collect_blob_descriptors(
    manifest: &OciImageManifest,
    out: &mut BTreeMap<String, String>,
) {
    out.entry(manifest.config.digest.clone())
        .or_insert_with(|| manifest.config.media_type.clone());
    for layer in &manifest.layers {
        out.entry(layer.digest.clone())
            .or_insert_with(|| layer.media_type.clone());
    }
}

/// Determine a manifest's media type from its bytes.
///
/// Falls back on structure when `mediaType` is omitted, which OCI allows.
pub fn detect_media_type(bytes: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    if let Some(media_type) = value.get("mediaType").and_then(|v| v.as_str()) {
        return Some(media_type.to_string());
    }
    if value.get("manifests").is_some() {
        return Some(OCI_INDEX_MEDIA_TYPE.to_string());
    }
    if value.get("config").is_some() {
        return Some(OCI_MANIFEST_MEDIA_TYPE.to_string());
    }
    None
}

/// Read the `schemaVersion` field.
fn schema_version(bytes: &[u8]) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    value.get("schemaVersion").and_then(|v| v.as_u64())
}

/// True for image index media types (multi-arch).
pub fn is_index(media_type: &str) -> bool {
    media_type == OCI_INDEX_MEDIA_TYPE
        || media_type == "application/vnd.docker.distribution.manifest.list.v2+json"
}

/// True for single-platform image manifest media types.
pub fn is_image_manifest(media_type: &str) -> bool {
    media_type == OCI_MANIFEST_MEDIA_TYPE
        || media_type == "application/vnd.docker.distribution.manifest.v2+json"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shamove() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("staged.partial");
        std::fs::write(&file, b"this is a test file").unwrap();

        let (digest, path) = shamove(dir.path(), &file).unwrap();

        let mut hasher = Sha256::new();
        hasher.update(b"this is a test file");
        let expected = format!("sha256:{:x}", hasher.finalize());

        assert_eq!(digest, expected);
        assert_eq!(path, dir.path().join(&expected));
        assert!(path.is_file());
        assert!(!file.exists());
    }

    #[test]
    fn test_shamove_empty_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("empty");
        std::fs::write(&file, b"").unwrap();

        let (digest, path) = shamove(dir.path(), &file).unwrap();
        // SHA-256 of the empty string
        assert_eq!(
            digest,
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert!(path.is_file());
    }

    #[test]
    fn test_detect_media_type_explicit() {
        let bytes = br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.index.v1+json","manifests":[]}"#;
        assert_eq!(
            detect_media_type(bytes).unwrap(),
            "application/vnd.oci.image.index.v1+json"
        );
    }

    #[test]
    fn test_detect_media_type_structural_index() {
        let bytes = br#"{"schemaVersion":2,"manifests":[]}"#;
        assert_eq!(detect_media_type(bytes).unwrap(), OCI_INDEX_MEDIA_TYPE);
    }

    #[test]
    fn test_detect_media_type_structural_manifest() {
        let bytes = br#"{"schemaVersion":2,"config":{"mediaType":"application/vnd.oci.image.config.v1+json","digest":"sha256:aaa","size":2},"layers":[]}"#;
        assert_eq!(detect_media_type(bytes).unwrap(), OCI_MANIFEST_MEDIA_TYPE);
    }

    #[test]
    fn test_detect_media_type_garbage() {
        assert!(detect_media_type(b"not json").is_none());
        assert!(detect_media_type(b"{}").is_none());
    }

    #[test]
    fn test_schema_version() {
        assert_eq!(schema_version(br#"{"schemaVersion":1}"#), Some(1));
        assert_eq!(schema_version(br#"{"schemaVersion":2}"#), Some(2));
        assert_eq!(schema_version(br#"{}"#), None);
    }

    #[test]
    fn test_is_index() {
        assert!(is_index("application/vnd.oci.image.index.v1+json"));
        assert!(is_index(
            "application/vnd.docker.distribution.manifest.list.v2+json"
        ));
        assert!(!is_index("application/vnd.oci.image.manifest.v1+json"));
    }

    #[test]
    fn test_is_image_manifest() {
        assert!(is_image_manifest("application/vnd.oci.image.manifest.v1+json"));
        assert!(is_image_manifest(
            "application/vnd.docker.distribution.manifest.v2+json"
        ));
        assert!(!is_image_manifest("application/vnd.oci.image.index.v1+json"));
        assert!(!is_image_manifest(
            "application/vnd.oci.image.layer.v1.tar+gzip"
        ));
    }

    #[test]
    fn test_collect_blob_descriptors_dedup() {
        let manifest_json = serde_json::json!({
            "schemaVersion": 2,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": "sha256:cfg",
                "size": 2
            },
            "layers": [
                {
                    "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                    "digest": "sha256:layer1",
                    "size": 10
                },
                {
                    "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                    "digest": "sha256:layer1",
                    "size": 10
                },
                {
                    "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                    "digest": "sha256:layer2",
                    "size": 20
                }
            ]
        });
        let manifest: OciImageManifest =
            serde_json::from_value(manifest_json).unwrap();

        let mut out = BTreeMap::new();
        collect_blob_descriptors(&manifest, &mut out);

        assert_eq!(out.len(), 3);
        assert!(out.contains_key("sha256:cfg"));
        assert!(out.contains_key("sha256:layer1"));
        assert!(out.contains_key("sha256:layer2"));
    }

    #[test]
    fn test_write_manifest_and_hard_link() {
        let dir = TempDir::new().unwrap();
        let manifests_dir = dir.path().join("manifests");
        std::fs::create_dir_all(&manifests_dir).unwrap();

        let bytes = br#"{"schemaVersion":2,"manifests":[]}"#;
        let staged = write_manifest(
            &manifests_dir,
            "sha256:topdigest",
            OCI_INDEX_MEDIA_TYPE,
            bytes,
        )
        .unwrap();
        assert_eq!(staged.size, bytes.len() as u64);

        let tag_pointer = manifests_dir.join("latest");
        std::fs::hard_link(&staged.path, &tag_pointer).unwrap();

        assert_eq!(std::fs::read(&tag_pointer).unwrap(), bytes.to_vec());
        assert_eq!(std::fs::read(&staged.path).unwrap(), bytes.to_vec());
    }
}
