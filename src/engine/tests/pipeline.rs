//! Engine pipeline tests that need no live registry or bucket.
//!
//! These walk the discovery → plan → purge arithmetic end to end with
//! synthetic listings, mirroring the behaviors a live mirror run shows:
//! idempotent re-runs, mutable overrides, ignore rules, and the orphan
//! sweep's reference extraction.
//!
//! A gated live test at the bottom stages a real public image; it needs
//! network access and is `#[ignore]` by default:
//!
//! ```bash
//! cargo test -p regmirror-engine --test pipeline -- --ignored --nocapture
//! ```

use regmirror_engine::plan;
use regmirror_engine::purge::{purgable_tags, DigestScanner};
use regmirror_engine::tags::namespace_tags;

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[test]
fn first_run_plans_every_pair() {
    // Scenario: two fresh tags, one OCI target
    let source_tags = strings(&["3.18", "3.19"]);
    let targets = strings(&["example.com/mirror/alpine"]);

    let plan = plan::plan(&source_tags, &targets, &[], &[], &[]);

    assert_eq!(plan.pair_count(), 2);
    let tags: Vec<&str> = plan.entries.iter().map(|e| e.tag.as_str()).collect();
    assert_eq!(tags, vec!["3.18", "3.19"]);
}

#[test]
fn second_run_is_idempotent() {
    // After a completed run the destination listing holds every tag;
    // with no mutable tags the next plan is empty.
    let source_tags = strings(&["3.18", "3.19"]);
    let targets = strings(&["example.com/mirror/alpine"]);
    let destination = namespace_tags("example.com/mirror/alpine", source_tags.clone());

    let plan = plan::plan(&source_tags, &targets, &destination, &[], &[]);

    assert!(plan.is_empty());
}

#[test]
fn mutable_tag_repushes_on_every_run() {
    let source_tags = strings(&["latest"]);
    let targets = strings(&["example.com/mirror/alpine"]);
    let destination = namespace_tags("example.com/mirror/alpine", source_tags.clone());
    let mutable = strings(&["latest"]);

    let first = plan::plan(&source_tags, &targets, &destination, &mutable, &[]);
    let second = plan::plan(&source_tags, &targets, &destination, &mutable, &[]);

    assert_eq!(first.pair_count(), 1);
    assert_eq!(second.pair_count(), 1);
}

#[test]
fn ignored_tag_never_reaches_any_target() {
    let source_tags = strings(&["3.19", "foo"]);
    let targets = strings(&[
        "example.com/mirror/alpine",
        "s3:us-east-1:mybucket:library/alpine",
    ]);

    let plan = plan::plan(&source_tags, &targets, &[], &[], &strings(&["foo"]));

    assert!(plan.entries.iter().all(|e| e.tag != "foo"));
    assert_eq!(plan.pair_count(), 2);
}

#[test]
fn mixed_targets_plan_independently() {
    // The OCI target has 3.19 already; the bucket has nothing.
    let source_tags = strings(&["3.19"]);
    let targets = strings(&[
        "example.com/mirror/alpine",
        "s3:us-east-1:mybucket:library/alpine",
    ]);
    let destination = strings(&["example.com/mirror/alpine:3.19"]);

    let plan = plan::plan(&source_tags, &targets, &destination, &[], &[]);

    assert_eq!(plan.pair_count(), 1);
    assert_eq!(
        plan.entries[0].targets,
        strings(&["s3:us-east-1:mybucket:library/alpine"])
    );
}

#[test]
fn purge_then_sweep_arithmetic() {
    // Scenario: source {a, b}, destination {a, b, c}; c is purgable.
    let target = "s3:us-east-1:mybucket:library/alpine";
    let source_tags = strings(&["a", "b"]);
    let destination = namespace_tags(target, strings(&["a", "b", "c"]));

    let purgable = purgable_tags(target, &destination, &source_tags, &[]);
    assert_eq!(purgable, strings(&["c"]));

    // After c's pointer is gone, only digests referenced by the two
    // surviving manifests stay.
    let kept = "sha256:1111111111111111111111111111111111111111111111111111111111111111";
    let orphan = "sha256:2222222222222222222222222222222222222222222222222222222222222222";

    let mut scanner = DigestScanner::new();
    scanner.push_chunk(format!(r#"{{"layers":[{{"digest":"{}"}}]}}"#, kept).as_bytes());
    let referenced = scanner.into_found();

    let all_blobs = [kept.to_string(), orphan.to_string()];
    let orphaned: Vec<&String> = all_blobs
        .iter()
        .filter(|b| !referenced.contains(*b))
        .collect();

    assert_eq!(orphaned, vec![&orphan.to_string()]);
}

#[test]
fn purge_spares_mutable_tags() {
    let target = "example.com/mirror/alpine";
    let destination = namespace_tags(target, strings(&["3.18", "latest"]));

    let purgable = purgable_tags(target, &destination, &strings(&["3.19"]), &strings(&["latest"]));

    assert_eq!(purgable, strings(&["3.18"]));
}

mod live {
    //! Needs network access to docker.io.

    use regmirror_core::config::SyncConfig;
    use regmirror_engine::auth::CredentialResolver;
    use regmirror_engine::stage::stage_tag;
    use regmirror_engine::RegistryClient;

    #[tokio::test]
    #[ignore]
    async fn stage_public_multi_arch_image() {
        let client = RegistryClient::new();
        let resolver = CredentialResolver::new(&SyncConfig::default());
        let (credential, _) = resolver.resolve("docker.io", "library/busybox").await;

        let staged = stage_tag(
            &client,
            "registry-1.docker.io",
            "library/busybox",
            "1.36",
            &credential,
            4,
            &|_| {},
        )
        .await
        .expect("staging should succeed");

        // Multi-arch: the index plus at least one platform manifest
        assert!(staged.manifests.len() > 1);
        assert!(!staged.blobs.is_empty());
        assert!(staged.tag_pointer.is_file());

        // Every staged blob file name matches its content digest
        for blob in &staged.blobs {
            let (digest, _) = regmirror_engine::stage::shamove(
                blob.path.parent().unwrap(),
                &blob.path,
            )
            .unwrap();
            assert_eq!(digest, blob.digest);
        }
    }
}
