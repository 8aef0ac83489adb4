//! Tag discovery on sources and destinations.
//!
//! Source tag lists are expanded from the job's `tags` entries: literals
//! pass through, `*` patterns glob against one shared listing, and the
//! `@semver` sentinel keeps SemVer-parseable tags. Destination tags are
//! namespaced `"<target>:<tag>"` so the planner compares apples to apples.

use glob::Pattern;

use regmirror_core::error::Result;

use crate::auth::Credential;
use crate::bucket::{self, BucketClient};
use crate::registry::RegistryClient;

/// Sentinel selecting all SemVer tags.
const SEMVER_SENTINEL: &str = "@semver";

/// Expand a job's requested tags against the source repository.
///
/// Fetches the full listing at most once, shared across patterns.
pub async fn source_tags(
    client: &RegistryClient,
    registry: &str,
    repository: &str,
    credential: &Credential,
    requested: &[String],
) -> Result<Vec<String>> {
    if requested.is_empty() {
        let mut tags = client.list_tags(registry, repository, credential).await?;
        tags.sort();
        tags.dedup();
        return Ok(tags);
    }

    let mut out = Vec::new();
    let mut listing: Option<Vec<String>> = None;

    for entry in requested {
        if entry == SEMVER_SENTINEL {
            if listing.is_none() {
                listing = Some(client.list_tags(registry, repository, credential).await?);
            }
            let all = listing.as_deref().unwrap_or_default();
            out.extend(all.iter().filter(|t| is_semver_tag(t)).cloned());
        } else if entry.contains('*') {
            if listing.is_none() {
                listing = Some(client.list_tags(registry, repository, credential).await?);
            }
            let all = listing.as_deref().unwrap_or_default();
            if let Ok(pattern) = Pattern::new(entry) {
                out.extend(all.iter().filter(|t| pattern.matches(t)).cloned());
            }
        } else {
            out.push(entry.clone());
        }
    }

    out.sort();
    out.dedup();
    Ok(out)
}

/// List an OCI destination's tags, namespaced with the target string.
pub async fn oci_destination_tags(
    client: &RegistryClient,
    target: &str,
    registry: &str,
    repository: &str,
    credential: &Credential,
) -> Result<Vec<String>> {
    let tags = client.list_tags(registry, repository, credential).await?;
    Ok(namespace_tags(target, tags))
}

/// List a bucket destination's tags: the non-digest file names under
/// `v2/<repository>/manifests/`, namespaced with the target string.
pub async fn bucket_destination_tags(
    client: &BucketClient,
    target: &str,
) -> Result<Vec<String>> {
    let keys = client.list_keys(&client.manifest_key("")).await?;

    let tags = keys
        .iter()
        .map(|k| bucket::object_basename(k))
        .filter(|name| !name.starts_with("sha256:") && !name.is_empty())
        .map(str::to_string)
        .collect();

    Ok(namespace_tags(target, tags))
}

/// Prefix each tag with `"<target>:"`.
pub fn namespace_tags(target: &str, tags: Vec<String>) -> Vec<String> {
    tags.into_iter()
        .map(|t| format!("{}:{}", target, t))
        .collect()
}

/// Permissive SemVer test: accepts a leading `v`, a bare `MAJOR.MINOR`,
/// pre-release suffixes, and build metadata.
pub fn is_semver_tag(tag: &str) -> bool {
    let tag = tag.strip_prefix('v').unwrap_or(tag);
    if semver::Version::parse(tag).is_ok() {
        return true;
    }

    // Complete MAJOR.MINOR to MAJOR.MINOR.0, keeping any suffix
    let (core, rest) = match tag.find(['-', '+']) {
        Some(i) => (&tag[..i], &tag[i..]),
        None => (tag, ""),
    };
    let parts: Vec<&str> = core.split('.').collect();
    if parts.len() == 2
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
    {
        return semver::Version::parse(&format!("{}.0{}", core, rest)).is_ok();
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_semver_tag() {
        let cases = [
            ("1.0.0", true),
            ("v1.0.0", true),
            ("1.0.0-alpha", true),
            ("1.0.0+build", true),
            ("latest", false),
            ("1.0", true),
            ("1.0.0-beta+exp.sha.5114f85", true),
            ("25.3.3.20143.altinityantalya", false),
            ("25.3.3-altinityantalya.20143", true),
        ];

        for (tag, expected) in cases {
            assert_eq!(is_semver_tag(tag), expected, "tag {:?}", tag);
        }
    }

    #[test]
    fn test_is_semver_tag_rejects_partial() {
        assert!(!is_semver_tag("1"));
        assert!(!is_semver_tag("v"));
        assert!(!is_semver_tag(""));
        assert!(!is_semver_tag("1.x"));
        assert!(!is_semver_tag("1.0.x"));
    }

    #[test]
    fn test_namespace_tags() {
        let tags = vec!["3.18".to_string(), "3.19".to_string()];
        assert_eq!(
            namespace_tags("ghcr.io/mirror/alpine", tags),
            vec!["ghcr.io/mirror/alpine:3.18", "ghcr.io/mirror/alpine:3.19"]
        );
    }

    #[test]
    fn test_namespace_tags_bucket_target() {
        let tags = vec!["1.36".to_string()];
        assert_eq!(
            namespace_tags("s3:us-east-1:mybucket:library/busybox", tags),
            vec!["s3:us-east-1:mybucket:library/busybox:1.36"]
        );
    }
}
