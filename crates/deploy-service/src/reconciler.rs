//! Reconciliation loop
//!
//! Periodically compares the registry against the container engine and
//! repairs drift: syncs health, restarts exited containers, rebuilds ghosts
//! from their source snapshot, evicts stale records and removes orphaned
//! containers. Ids with an operation in flight are skipped for the pass.

use crate::orchestrator::{mark_lost, Orchestrator};
use chrono::Utc;
use paygate_common::{DeployedResource, ResourceStatus};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interval: Duration,
    /// Terminal records whose `updated_at` is older than this are evicted.
    /// Measured from the last state change, not from `deployed_at`.
    pub stale_retention: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stale_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Counts for one pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub checked: usize,
    pub skipped_busy: usize,
    pub synced: usize,
    pub restarted: usize,
    pub rebuilt: usize,
    pub failed: usize,
    pub lost: usize,
    pub evicted: usize,
    pub orphans_removed: usize,
    pub errors: usize,
}

pub struct Reconciler {
    orchestrator: Arc<Orchestrator>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(orchestrator: Arc<Orchestrator>, config: ReconcilerConfig) -> Self {
        Self { orchestrator, config }
    }

    /// Run forever: one pass at startup, then one per interval
    pub async fn run(self: Arc<Self>) {
        info!(
            "Starting reconciliation loop (interval: {}s, retention: {}s)",
            self.config.interval.as_secs(),
            self.config.stale_retention.as_secs()
        );

        loop {
            self.reconcile_once().await;
            sleep(self.config.interval).await;
        }
    }

    /// One full pass over the registry and the engine
    pub async fn reconcile_once(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let resources = match self.orchestrator.list().await {
            Ok(resources) => resources,
            Err(e) => {
                error!("Reconciliation skipped, registry unavailable: {}", e);
                report.errors += 1;
                return report;
            }
        };

        let known: HashSet<String> = resources.iter().map(|r| r.id().to_string()).collect();
        for id in &known {
            self.reconcile_resource(id, &mut report).await;
        }

        self.remove_orphans(&known, &mut report).await;
        self.orchestrator.locks().prune();

        if report == (ReconcileReport { checked: report.checked, ..Default::default() }) {
            debug!("Reconciliation pass found no drift ({} checked)", report.checked);
        } else {
            info!(
                checked = report.checked,
                skipped_busy = report.skipped_busy,
                synced = report.synced,
                restarted = report.restarted,
                rebuilt = report.rebuilt,
                failed = report.failed,
                lost = report.lost,
                evicted = report.evicted,
                orphans_removed = report.orphans_removed,
                errors = report.errors,
                "Reconciliation pass complete"
            );
        }

        report
    }

    async fn reconcile_resource(&self, id: &str, report: &mut ReconcileReport) {
        let Some(_guard) = self.orchestrator.locks().try_acquire(id) else {
            debug!(resource_id = %id, "Operation in flight, skipping");
            report.skipped_busy += 1;
            return;
        };

        // Re-read under the lock; the listing may be stale
        let mut resource = match self.orchestrator.registry().get(id).await {
            Ok(Some(resource)) => resource,
            Ok(None) => return,
            Err(e) => {
                warn!(resource_id = %id, "Failed to read record: {}", e);
                report.errors += 1;
                return;
            }
        };
        report.checked += 1;

        if self.is_stale(&resource) {
            self.evict(&resource, report).await;
            return;
        }

        let Some(container_id) = resource.container_id.clone() else {
            if resource.status == ResourceStatus::Running || resource.status.is_transitional() {
                self.recover_ghost(&mut resource, report).await;
            }
            return;
        };

        match self.orchestrator.engine().container_status(&container_id).await {
            Ok(status) if status.running => {
                if resource.status != ResourceStatus::Running || resource.healthy != status.healthy {
                    if resource.status != ResourceStatus::Running {
                        resource.transition(ResourceStatus::Running);
                        resource.error = None;
                    }
                    resource.healthy = status.healthy;
                    self.save(&resource, "Status synced with container engine", report).await;
                    report.synced += 1;
                }
            }
            Ok(status) => {
                if resource.status.expects_container() {
                    warn!(
                        resource_id = %id,
                        exit_code = ?status.exit_code,
                        "Container is not running, attempting restart"
                    );
                    match self.orchestrator.restart_locked(&mut resource).await {
                        Ok(()) => report.restarted += 1,
                        Err(e) => {
                            self.orchestrator.mark_failed(&mut resource, &e).await;
                            report.failed += 1;
                        }
                    }
                } else if resource.healthy {
                    resource.healthy = false;
                    self.save(&resource, "Container is not running", report).await;
                    report.synced += 1;
                }
            }
            Err(e) if e.is_not_found() => {
                if resource.status.expects_container() || resource.status.is_transitional() {
                    self.recover_ghost(&mut resource, report).await;
                } else {
                    resource.container_id = None;
                    resource.healthy = false;
                    self.save(&resource, "Container no longer exists", report).await;
                    report.synced += 1;
                }
            }
            Err(e) => {
                warn!(resource_id = %id, "Could not query container {}: {}", container_id, e);
                report.errors += 1;
            }
        }
    }

    fn is_stale(&self, resource: &DeployedResource) -> bool {
        if !resource.status.is_terminal() {
            return false;
        }
        let age = (Utc::now() - resource.updated_at).to_std().unwrap_or_default();
        age > self.config.stale_retention
    }

    /// Removal is attempted whether or not the container and image exist
    async fn evict(&self, resource: &DeployedResource, report: &mut ReconcileReport) {
        let id = resource.id();
        info!(resource_id = %id, status = %resource.status, "Evicting stale resource");

        if let Some(container_id) = &resource.container_id {
            self.orchestrator.remove_container_quietly(id, container_id).await;
        }
        self.orchestrator
            .remove_container_quietly(id, &container_client::container_name(id))
            .await;
        self.orchestrator.remove_image_quietly(id).await;

        match self.orchestrator.registry().delete(id).await {
            Ok(()) => report.evicted += 1,
            Err(e) => {
                warn!(resource_id = %id, "Failed to delete stale record: {}", e);
                report.errors += 1;
            }
        }
    }

    /// The record says a container should exist and none does
    async fn recover_ghost(&self, resource: &mut DeployedResource, report: &mut ReconcileReport) {
        let id = resource.id().to_string();

        if resource.source_files.is_none() {
            warn!(resource_id = %id, "Container missing and no source snapshot, marking lost");
            mark_lost(resource);
            self.save(resource, "Container lost", report).await;
            report.lost += 1;
            return;
        }

        info!(resource_id = %id, status = %resource.status, "Container missing, rebuilding from snapshot");
        match self.orchestrator.rebuild_locked(resource).await {
            Ok(()) => report.rebuilt += 1,
            Err(e) => {
                self.orchestrator.mark_failed(resource, &e).await;
                report.failed += 1;
            }
        }
    }

    async fn remove_orphans(&self, known: &HashSet<String>, report: &mut ReconcileReport) {
        let containers = match self.orchestrator.engine().list_resource_containers().await {
            Ok(containers) => containers,
            Err(e) => {
                warn!("Failed to list managed containers: {}", e);
                report.errors += 1;
                return;
            }
        };

        for container in containers {
            let resource_id = container.resource_id.as_str();
            if known.contains(resource_id) {
                continue;
            }

            if resource_id.is_empty() {
                warn!("Removing managed container {} without a resource id", container.id);
                self.orchestrator.remove_container_quietly("", &container.id).await;
                report.orphans_removed += 1;
                continue;
            }

            let Some(_guard) = self.orchestrator.locks().try_acquire(resource_id) else {
                report.skipped_busy += 1;
                continue;
            };

            // Deployed after the listing was taken
            match self.orchestrator.registry().get(resource_id).await {
                Ok(None) => {}
                Ok(Some(_)) => continue,
                Err(e) => {
                    warn!(resource_id = %resource_id, "Failed to re-check orphan: {}", e);
                    report.errors += 1;
                    continue;
                }
            }

            warn!(resource_id = %resource_id, "Removing orphaned container {}", container.id);
            self.orchestrator
                .remove_container_quietly(resource_id, &container.id)
                .await;
            self.orchestrator.remove_image_quietly(resource_id).await;
            report.orphans_removed += 1;
        }
    }

    async fn save(&self, resource: &DeployedResource, message: &str, report: &mut ReconcileReport) {
        if let Err(e) = self.orchestrator.persist(resource, message).await {
            warn!(resource_id = %resource.id(), "Failed to persist reconciled record: {}", e);
            report.errors += 1;
        }
    }
}
