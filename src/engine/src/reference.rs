//! Source and target reference parsing.
//!
//! Classifies destination strings into OCI registry references
//! (`ghcr.io/mirror/alpine`) and S3-compatible bucket references
//! (`s3:us-east-1:mybucket:library/alpine`).

use regmirror_core::error::{Result, SyncError};

/// Default registry when a short form omits the host.
const DEFAULT_REGISTRY: &str = "docker.io";

/// S3-compatible providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketProvider {
    /// AWS S3; the locator is the region.
    AwsS3,
    /// Cloudflare R2; the locator is the account id.
    CloudflareR2,
}

impl BucketProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            BucketProvider::AwsS3 => "s3",
            BucketProvider::CloudflareR2 => "r2",
        }
    }
}

/// A classified destination (or source) reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// An OCI registry reference.
    Oci {
        registry: String,
        repository: String,
        tag: Option<String>,
    },
    /// An S3-compatible bucket laid out as a static v2 registry.
    S3Compatible {
        provider: BucketProvider,
        locator: String,
        bucket: String,
        repository: String,
        tag: Option<String>,
    },
}

impl Reference {
    /// Classify a reference string.
    ///
    /// A string splitting on `:` into exactly four fields is an
    /// S3-compatible destination (`<provider>:<locator>:<bucket>:<repo>`);
    /// everything else is an OCI reference, with docker.io short forms
    /// expanded (`nginx` → `docker.io/library/nginx`).
    pub fn classify(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(SyncError::ReferenceError {
                reference: reference.to_string(),
                message: "empty reference".to_string(),
            });
        }

        let fields: Vec<&str> = reference.split(':').collect();
        if fields.len() == 4 {
            let provider = match fields[0] {
                "s3" => BucketProvider::AwsS3,
                "r2" => BucketProvider::CloudflareR2,
                other => {
                    return Err(SyncError::ReferenceError {
                        reference: reference.to_string(),
                        message: format!("unsupported bucket provider '{}'", other),
                    })
                }
            };
            if fields[1].is_empty() || fields[2].is_empty() || fields[3].is_empty() {
                return Err(SyncError::ReferenceError {
                    reference: reference.to_string(),
                    message: "format is <provider>:<locator>:<bucket>:<repository>".to_string(),
                });
            }
            return Ok(Reference::S3Compatible {
                provider,
                locator: fields[1].to_string(),
                bucket: fields[2].to_string(),
                repository: fields[3].to_string(),
                tag: None,
            });
        }

        let registry = registry_of(reference);
        let repository = repository_of(reference);
        if repository.is_empty() {
            return Err(SyncError::ReferenceError {
                reference: reference.to_string(),
                message: "empty repository".to_string(),
            });
        }
        Ok(Reference::Oci {
            registry,
            repository,
            tag: None,
        })
    }

    /// Return a copy of this reference pointing at `tag`.
    pub fn with_tag(&self, tag: &str) -> Self {
        let mut cloned = self.clone();
        match &mut cloned {
            Reference::Oci { tag: t, .. } => *t = Some(tag.to_string()),
            Reference::S3Compatible { tag: t, .. } => *t = Some(tag.to_string()),
        }
        cloned
    }

    /// The repository component.
    pub fn repository(&self) -> &str {
        match self {
            Reference::Oci { repository, .. } => repository,
            Reference::S3Compatible { repository, .. } => repository,
        }
    }

    /// The full `registry/repository[:tag]` form for OCI references,
    /// or the `provider:locator:bucket:repository` form for buckets.
    pub fn full_reference(&self) -> String {
        match self {
            Reference::Oci {
                registry,
                repository,
                tag,
            } => {
                let mut s = format!("{}/{}", registry, repository);
                if let Some(tag) = tag {
                    s.push(':');
                    s.push_str(tag);
                }
                s
            }
            Reference::S3Compatible {
                provider,
                locator,
                bucket,
                repository,
                ..
            } => format!(
                "{}:{}:{}:{}",
                provider.as_str(),
                locator,
                bucket,
                repository
            ),
        }
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

/// Extract the registry component of a raw reference string.
///
/// `public.ecr.aws` registries span two path segments; short forms
/// (`nginx`, `org/name`) belong to docker.io.
pub fn registry_of(reference: &str) -> String {
    if let Some(rest) = reference.strip_prefix("public.ecr.aws/") {
        let first = rest.split('/').next().unwrap_or("");
        return format!("public.ecr.aws/{}", first);
    }

    let fields: Vec<&str> = reference.split('/').collect();
    if fields.len() <= 2 && !looks_like_host(fields[0]) {
        return DEFAULT_REGISTRY.to_string();
    }
    if fields.len() == 1 {
        return DEFAULT_REGISTRY.to_string();
    }
    fields[0].to_string()
}

/// Extract the repository component of a raw reference string.
///
/// Bucket destinations yield their fourth `:` field; OCI short forms are
/// expanded (`nginx` → `library/nginx`).
pub fn repository_of(reference: &str) -> String {
    if reference.starts_with("s3:") || reference.starts_with("r2:") {
        let fields: Vec<&str> = reference.split(':').collect();
        if fields.len() > 3 {
            return fields[3..].join(":");
        }
    }

    if let Some(rest) = reference.strip_prefix("public.ecr.aws/") {
        let fields: Vec<&str> = rest.split('/').collect();
        if fields.len() > 1 {
            return fields[1..].join("/");
        }
    }

    let fields: Vec<&str> = reference.split('/').collect();
    match fields.len() {
        1 => format!("library/{}", reference),
        2 if !looks_like_host(fields[0]) => reference.to_string(),
        _ => fields[1..].join("/"),
    }
}

/// A first path segment with a dot, a port, or "localhost" is a host.
fn looks_like_host(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}
