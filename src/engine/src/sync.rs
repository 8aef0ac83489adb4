//! The synchronization engine.
//!
//! Jobs run sequentially; work inside a job fans out under the configured
//! bounds. A cancelled token stops the engine before it launches new work
//! and aborts pending backoff waits.

use tokio_util::sync::CancellationToken;

use regmirror_core::config::{ImageSyncJob, SyncConfig};
use regmirror_core::error::{Result, SyncError};

use crate::auth::CredentialResolver;
use crate::cache::{BucketInitSet, ObjectCache};
use crate::plan;
use crate::purge;
use crate::push::{self, Target};
use crate::reference::Reference;
use crate::registry::RegistryClient;
use crate::retry;
use crate::stage;
use crate::tags;
use crate::telemetry::{Metrics, TransferKind};

/// A destination that may have failed to open; its error surfaces on
/// every (tag, target) pair instead of aborting the image.
enum TargetState {
    Ready(Target),
    Failed { target: String, error: String },
}

impl TargetState {
    fn name(&self) -> &str {
        match self {
            TargetState::Ready(target) => target.name(),
            TargetState::Failed { target, .. } => target,
        }
    }
}

/// Process-wide engine state: one config snapshot, shared caches, metrics.
pub struct SyncEngine {
    config: SyncConfig,
    registry_client: RegistryClient,
    resolver: CredentialResolver,
    object_cache: ObjectCache,
    bucket_init: BucketInitSet,
    metrics: Metrics,
    cancel: CancellationToken,
}

impl SyncEngine {
    pub fn new(config: SyncConfig, cancel: CancellationToken) -> Self {
        let resolver = CredentialResolver::new(&config);
        let object_cache = ObjectCache::new(&config.sync.s3.object_cache);
        Self {
            config,
            registry_client: RegistryClient::new(),
            resolver,
            object_cache,
            bucket_init: BucketInitSet::new(),
            metrics: Metrics::new(),
            cancel,
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Daemon loop: run, sleep `sync.interval`, repeat until cancelled.
    pub async fn run(&self) -> Result<()> {
        loop {
            self.run_once().await?;

            let interval = self.config.sync.interval;
            tracing::info!(interval = ?interval, "Waiting for next sync");

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// One pass over every job.
    ///
    /// Image-level errors accumulate; the pass aborts early once
    /// `sync.maxErrors` of them pile up.
    pub async fn run_once(&self) -> Result<()> {
        let jobs = &self.config.sync.images;
        self.metrics.set_monitored_images(jobs.len() as i64);

        let max_errors = self.config.sync.max_errors as usize;
        let mut errors: Vec<String> = Vec::new();

        for job in jobs {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            if let Err(e) = self.sync_image(job).await {
                tracing::error!(
                    image = %job.source,
                    error = %e,
                    "Failed to sync image"
                );
                self.metrics.image_sync_error(&job.source, &e.to_string());
                errors.push(e.to_string());

                if errors.len() >= max_errors {
                    return Err(SyncError::TooManyErrors {
                        count: errors.len(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Discovery, planning, transfer, and purge for one job.
    async fn sync_image(&self, job: &ImageSyncJob) -> Result<()> {
        tracing::info!(
            image = %job.source,
            targets = ?job.targets,
            "Syncing image"
        );

        let (src_registry, src_repository) = match Reference::classify(&job.source)? {
            Reference::Oci {
                registry,
                repository,
                ..
            } => (registry, repository),
            Reference::S3Compatible { .. } => {
                return Err(SyncError::ConfigError(format!(
                    "source '{}' must be an OCI reference",
                    job.source
                )))
            }
        };

        let (src_credential, src_auth_label) =
            self.resolver.resolve(&src_registry, &src_repository).await;
        tracing::info!(
            image = %job.source,
            auth = src_auth_label,
            "Fetching tags"
        );

        let src_tags = retry::with_backoff(
            "list-source-tags",
            self.config.sync.max_errors,
            &self.cancel,
            || {
                tags::source_tags(
                    &self.registry_client,
                    &src_registry,
                    &src_repository,
                    &src_credential,
                    &job.tags,
                )
            },
        )
        .await?;

        if src_tags.is_empty() {
            tracing::warn!(image = %job.source, "No source tags found, skipping image");
            return Ok(());
        }

        tracing::info!(
            image = %job.source,
            tags = src_tags.len(),
            "Found tags"
        );
        self.metrics
            .set_monitored_tags(&job.source, src_tags.len() as i64);

        // Open every destination; failures surface per (tag, target).
        let mut targets = Vec::with_capacity(job.targets.len());
        for target in &job.targets {
            match Target::connect(target, &self.resolver).await {
                Ok(connected) => targets.push(TargetState::Ready(connected)),
                Err(e) => {
                    tracing::error!(
                        image = %job.source,
                        target = %target,
                        error = %e,
                        "Failed to open target"
                    );
                    targets.push(TargetState::Failed {
                        target: target.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let destination_tags = self.destination_tags(job, &targets).await?;

        let plan = plan::plan(
            &src_tags,
            &job.targets,
            &destination_tags,
            &job.mutable_tags,
            &job.ignored_tags,
        );

        if plan.is_empty() {
            tracing::debug!(
                image = %job.source,
                "Tags already exist in all targets, skipping"
            );
        }

        for entry in &plan.entries {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            self.sync_tag(job, &src_registry, &src_repository, &src_credential, entry, &targets)
                .await;
        }

        if job.purge {
            for state in &targets {
                if let TargetState::Ready(target) = state {
                    purge::purge_target(
                        &self.registry_client,
                        &self.resolver,
                        &job.source,
                        target,
                        &src_tags,
                        &destination_tags,
                        &job.mutable_tags,
                        self.config.sync.s3.max_purge_concurrency,
                        &self.object_cache,
                        &self.metrics,
                    )
                    .await;
                }
            }
        }

        Ok(())
    }

    /// Enumerate existing tags on every reachable target, namespaced.
    async fn destination_tags(
        &self,
        job: &ImageSyncJob,
        targets: &[TargetState],
    ) -> Result<Vec<String>> {
        let mut destination_tags = Vec::new();

        for state in targets {
            let TargetState::Ready(target) = state else {
                // Unknown contents; the planner treats its tags as absent.
                continue;
            };

            let found = match target {
                Target::Oci {
                    target: name,
                    registry,
                    repository,
                } => {
                    let (credential, auth_label) =
                        self.resolver.resolve(registry, repository).await;
                    let listed = tags::oci_destination_tags(
                        &self.registry_client,
                        name,
                        registry,
                        repository,
                        &credential,
                    )
                    .await?;
                    tracing::info!(
                        image = %job.source,
                        target = %name,
                        tags = listed.len(),
                        auth = auth_label,
                        "Found destination tags"
                    );
                    listed
                }
                Target::Bucket {
                    target: name,
                    client,
                } => {
                    let listed = tags::bucket_destination_tags(client, name).await?;
                    if !listed.is_empty() {
                        tracing::info!(
                            image = %job.source,
                            target = %name,
                            tags = listed.len(),
                            "Found destination tags"
                        );
                    }
                    listed
                }
            };
            destination_tags.extend(found);
        }

        destination_tags.sort();
        destination_tags.dedup();
        Ok(destination_tags)
    }

    /// Stage one tag and push it to every target still needing it.
    /// Failures are recorded per pair and never abort the image.
    async fn sync_tag(
        &self,
        job: &ImageSyncJob,
        src_registry: &str,
        src_repository: &str,
        src_credential: &crate::auth::Credential,
        entry: &plan::PlanEntry,
        targets: &[TargetState],
    ) {
        let tag = &entry.tag;
        self.metrics.init_tag_sync_errors(&job.source, tag);

        tracing::info!(
            image = %job.source,
            tag,
            targets = ?entry.targets,
            "Syncing tag"
        );

        let source = job.source.clone();
        let metrics = self.metrics.clone();
        let on_downloaded = move |bytes: u64| {
            metrics.downloaded_bytes(&source, TransferKind::Oci, bytes);
        };

        let staged = match retry::with_backoff(
            "pull",
            self.config.sync.max_errors,
            &self.cancel,
            || {
                stage::stage_tag(
                    &self.registry_client,
                    src_registry,
                    src_repository,
                    tag,
                    src_credential,
                    self.config.sync.s3.max_concurrent_uploads,
                    &on_downloaded,
                )
            },
        )
        .await
        {
            Ok(staged) => staged,
            Err(SyncError::SchemaV1 { reference }) => {
                tracing::warn!(
                    image = %job.source,
                    tag,
                    reference = %reference,
                    "Skipping schema v1 image"
                );
                return;
            }
            Err(e) => {
                tracing::error!(
                    image = %job.source,
                    tag,
                    error = %e,
                    "Failed to pull tag"
                );
                self.metrics
                    .tag_sync_error(&job.source, tag, &e.to_string());
                return;
            }
        };

        for target_name in &entry.targets {
            let Some(state) = targets.iter().find(|t| t.name() == target_name.as_str()) else {
                continue;
            };

            let result = match state {
                TargetState::Failed { error, .. } => Err(SyncError::Other(error.clone())),
                TargetState::Ready(target) => {
                    retry::with_backoff(
                        "push",
                        self.config.sync.max_errors,
                        &self.cancel,
                        || {
                            push::push_staged(
                                &self.registry_client,
                                &self.resolver,
                                &staged,
                                target,
                                &self.config.sync.s3,
                                &self.object_cache,
                                &self.bucket_init,
                                &self.metrics,
                            )
                        },
                    )
                    .await
                }
            };

            match result {
                Ok(()) => {
                    self.metrics.push(&job.source, tag, target_name);
                }
                Err(e) => {
                    tracing::error!(
                        image = %job.source,
                        tag,
                        target = %target_name,
                        error = %e,
                        "Failed to sync tag"
                    );
                    self.metrics
                        .tag_sync_error(&job.source, tag, &e.to_string());
                }
            }
        }
    }
}
