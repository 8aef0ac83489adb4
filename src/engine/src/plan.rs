//! Transfer planning.
//!
//! Pure set arithmetic over the discovery results; no network I/O. A
//! `(tag, target)` pair makes the plan unless the tag already exists at
//! the target and is not mutable. Ignored tags never make the plan.

use std::collections::HashSet;

use glob::Pattern;

/// One tag and the targets still needing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    pub tag: String,
    pub targets: Vec<String>,
}

/// The transfer plan for one job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    pub entries: Vec<PlanEntry>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total `(tag, target)` pairs.
    pub fn pair_count(&self) -> usize {
        self.entries.iter().map(|e| e.targets.len()).sum()
    }
}

/// A tag matching `"*"`, a glob pattern, or a literal entry is mutable and
/// always re-pushed.
pub fn is_mutable(tag: &str, mutable_tags: &[String]) -> bool {
    matches_any(tag, mutable_tags)
}

/// Ignored tags use the same matching rules.
pub fn is_ignored(tag: &str, ignored_tags: &[String]) -> bool {
    matches_any(tag, ignored_tags)
}

fn matches_any(tag: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|entry| {
        entry == "*"
            || entry == tag
            || Pattern::new(entry).map(|p| p.matches(tag)).unwrap_or(false)
    })
}

/// Compute the plan.
///
/// `destination_tags` holds namespaced `"<target>:<tag>"` strings from
/// discovery.
pub fn plan(
    source_tags: &[String],
    targets: &[String],
    destination_tags: &[String],
    mutable_tags: &[String],
    ignored_tags: &[String],
) -> SyncPlan {
    let existing: HashSet<&str> = destination_tags.iter().map(String::as_str).collect();

    let mut entries = Vec::new();
    for tag in source_tags {
        if is_ignored(tag, ignored_tags) {
            continue;
        }

        let mutable = is_mutable(tag, mutable_tags);
        let needed: Vec<String> = targets
            .iter()
            .filter(|target| {
                mutable || !existing.contains(format!("{}:{}", target, tag).as_str())
            })
            .cloned()
            .collect();

        if !needed.is_empty() {
            entries.push(PlanEntry {
                tag: tag.clone(),
                targets: needed,
            });
        }
    }

    SyncPlan { entries }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_plan_new_tags() {
        let plan = plan(
            &strings(&["3.18", "3.19"]),
            &strings(&["example.com/mirror/alpine"]),
            &[],
            &[],
            &[],
        );

        assert_eq!(plan.pair_count(), 2);
        assert_eq!(plan.entries[0].tag, "3.18");
        assert_eq!(plan.entries[1].tag, "3.19");
    }

    #[test]
    fn test_plan_skips_existing() {
        let plan = plan(
            &strings(&["3.18", "3.19"]),
            &strings(&["example.com/mirror/alpine"]),
            &strings(&["example.com/mirror/alpine:3.18"]),
            &[],
            &[],
        );

        assert_eq!(plan.pair_count(), 1);
        assert_eq!(plan.entries[0].tag, "3.19");
    }

    #[test]
    fn test_plan_mutable_always_included() {
        let plan = plan(
            &strings(&["latest"]),
            &strings(&["example.com/mirror/alpine"]),
            &strings(&["example.com/mirror/alpine:latest"]),
            &strings(&["latest"]),
            &[],
        );

        assert_eq!(plan.pair_count(), 1);
    }

    #[test]
    fn test_plan_star_makes_all_mutable() {
        let plan = plan(
            &strings(&["3.18", "3.19"]),
            &strings(&["example.com/mirror/alpine"]),
            &strings(&[
                "example.com/mirror/alpine:3.18",
                "example.com/mirror/alpine:3.19",
            ]),
            &strings(&["*"]),
            &[],
        );

        assert_eq!(plan.pair_count(), 2);
    }

    #[test]
    fn test_plan_glob_mutable() {
        let plan = plan(
            &strings(&["3.18", "nightly-2024"]),
            &strings(&["example.com/mirror/alpine"]),
            &strings(&[
                "example.com/mirror/alpine:3.18",
                "example.com/mirror/alpine:nightly-2024",
            ]),
            &strings(&["nightly-*"]),
            &[],
        );

        assert_eq!(plan.pair_count(), 1);
        assert_eq!(plan.entries[0].tag, "nightly-2024");
    }

    #[test]
    fn test_plan_ignored_tags_dropped() {
        let plan = plan(
            &strings(&["3.18", "foo"]),
            &strings(&["example.com/mirror/alpine"]),
            &[],
            &[],
            &strings(&["foo"]),
        );

        assert_eq!(plan.pair_count(), 1);
        assert_eq!(plan.entries[0].tag, "3.18");
    }

    #[test]
    fn test_plan_ignored_glob() {
        let plan = plan(
            &strings(&["3.18", "rc-1", "rc-2"]),
            &strings(&["example.com/mirror/alpine"]),
            &[],
            &[],
            &strings(&["rc-*"]),
        );

        assert_eq!(plan.pair_count(), 1);
    }

    #[test]
    fn test_plan_ignored_beats_mutable() {
        let plan = plan(
            &strings(&["foo"]),
            &strings(&["example.com/mirror/alpine"]),
            &[],
            &strings(&["*"]),
            &strings(&["foo"]),
        );

        assert!(plan.is_empty());
    }

    #[test]
    fn test_plan_multiple_targets_partial_coverage() {
        let plan = plan(
            &strings(&["3.19"]),
            &strings(&[
                "example.com/mirror/alpine",
                "s3:us-east-1:mybucket:library/alpine",
            ]),
            &strings(&["example.com/mirror/alpine:3.19"]),
            &[],
            &[],
        );

        assert_eq!(plan.pair_count(), 1);
        assert_eq!(
            plan.entries[0].targets,
            strings(&["s3:us-east-1:mybucket:library/alpine"])
        );
    }

    #[test]
    fn test_plan_empty_when_everything_synced() {
        let plan = plan(
            &strings(&["3.19"]),
            &strings(&["example.com/mirror/alpine"]),
            &strings(&["example.com/mirror/alpine:3.19"]),
            &[],
            &[],
        );

        assert!(plan.is_empty());
        assert_eq!(plan.pair_count(), 0);
    }

    #[test]
    fn test_is_mutable() {
        assert!(is_mutable("anything", &strings(&["*"])));
        assert!(is_mutable("latest", &strings(&["latest"])));
        assert!(is_mutable("nightly-5", &strings(&["nightly-*"])));
        assert!(!is_mutable("3.19", &strings(&["latest"])));
        assert!(!is_mutable("3.19", &[]));
    }
}
