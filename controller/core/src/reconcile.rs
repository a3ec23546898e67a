use crate::{
    translate, Changes, ListServices, ResolveEndpoints, RoutableService, SharedSnapshotStore,
    Snapshot, Synced, TranslateConfig, Translation, VersionSequencer,
};
use anyhow::{Context, Result};
use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};
use std::sync::Arc;
use tokio::time;
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug)]
pub struct ReconcileConfig {
    /// The node identity snapshots are published for.
    pub node_id: String,

    /// Restricts listing to a single namespace.
    pub namespace: Option<String>,

    pub translate: TranslateConfig,

    /// The number of consecutive listing attempts before a pass fails.
    pub list_retry_limit: u32,
    pub list_backoff_min: time::Duration,
    pub list_backoff_max: time::Duration,
}

#[derive(Clone, Debug)]
pub struct ReconcileMetrics {
    passes: Counter,
    publish_failures: Counter,
    list_failures: Counter,
    resolve_warnings: Counter,
    version: Gauge,
}

/// Rebuilds and publishes the node's snapshot whenever intents or topology change.
///
/// Each pass lists all services, translates them from scratch, stamps a new version, and
/// replaces the node's snapshot. Between passes the reconciler waits for a change signal.
pub struct Reconciler<L, R> {
    config: ReconcileConfig,
    lister: L,
    resolver: R,
    store: SharedSnapshotStore,
    versions: VersionSequencer,
    metrics: ReconcileMetrics,
}

// === impl ReconcileConfig ===

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            node_id: "knative".to_string(),
            namespace: None,
            translate: TranslateConfig::default(),
            list_retry_limit: 5,
            list_backoff_min: time::Duration::from_millis(100),
            list_backoff_max: time::Duration::from_secs(10),
        }
    }
}

// === impl ReconcileMetrics ===

impl ReconcileMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let passes = Counter::default();
        reg.register(
            "passes",
            "Total number of reconciliation passes",
            passes.clone(),
        );

        let publish_failures = Counter::default();
        reg.register(
            "publish_failures",
            "Total number of snapshots rejected by the snapshot store",
            publish_failures.clone(),
        );

        let list_failures = Counter::default();
        reg.register(
            "list_failures",
            "Total number of failed attempts to list routable services",
            list_failures.clone(),
        );

        let resolve_warnings = Counter::default();
        reg.register(
            "resolve_warnings",
            "Total number of traffic splits dropped because their revision could not be resolved",
            resolve_warnings.clone(),
        );

        let version = Gauge::default();
        reg.register(
            "snapshot_version",
            "The version of the most recently published snapshot",
            version.clone(),
        );

        Self {
            passes,
            publish_failures,
            list_failures,
            resolve_warnings,
            version,
        }
    }
}

// === impl Reconciler ===

impl<L, R> Reconciler<L, R>
where
    L: ListServices + Send + Sync,
    R: ResolveEndpoints + Send + Sync,
{
    pub fn new(
        config: ReconcileConfig,
        lister: L,
        resolver: R,
        store: SharedSnapshotStore,
        metrics: ReconcileMetrics,
    ) -> Self {
        Self {
            config,
            lister,
            resolver,
            store,
            versions: VersionSequencer::new(),
            metrics,
        }
    }

    /// Runs for the lifetime of the process.
    ///
    /// The first pass runs once every source in `synced` has delivered its initial state, and
    /// then after each change. Only listing failures that exhaust their retries end the loop.
    pub async fn run(self, changes: Changes, synced: Vec<Synced>) -> Result<()> {
        for source in &synced {
            source.wait().await;
        }
        debug!(sources = synced.len(), "Sources synced");

        loop {
            self.reconcile().await?;
            changes.changed().await;
            debug!("Change observed");
        }
    }

    /// Performs a single pass, returning the published snapshot.
    ///
    /// Returns `Ok(None)` when the snapshot store rejected the new snapshot; the prior snapshot
    /// remains in place until a later pass succeeds.
    pub async fn reconcile(&self) -> Result<Option<Arc<Snapshot>>> {
        self.metrics.passes.inc();
        let services = self.list().await?;

        let Translation {
            clusters,
            routes,
            listeners,
            warnings,
        } = translate(&self.config.translate, &services, &self.resolver);
        for warning in &warnings {
            warn!(%warning, "Degraded translation");
        }
        self.metrics.resolve_warnings.inc_by(
            warnings
                .iter()
                .filter(|w| matches!(w, crate::TranslateWarning::Unresolved { .. }))
                .count() as u64,
        );

        let version = self.versions.next();
        let snapshot = Snapshot::new(version, clusters, routes, listeners);
        match self.store.set(&self.config.node_id, snapshot) {
            Ok(snapshot) => {
                info!(
                    node = %self.config.node_id,
                    version = %snapshot.version(),
                    clusters = snapshot.clusters().len(),
                    routes = snapshot.routes().len(),
                    "Published snapshot"
                );
                if let Ok(v) = snapshot.version().parse::<i64>() {
                    self.metrics.version.set(v);
                }
                Ok(Some(snapshot))
            }
            Err(error) => {
                error!(node = %self.config.node_id, %error, "Failed to publish snapshot");
                self.metrics.publish_failures.inc();
                Ok(None)
            }
        }
    }

    async fn list(&self) -> Result<Vec<RoutableService>> {
        let namespace = self.config.namespace.as_deref();
        let mut backoff = self.config.list_backoff_min;
        let mut failures = 0;
        loop {
            match self.lister.list_services(namespace).await {
                Ok(services) => return Ok(services),
                Err(error) => {
                    self.metrics.list_failures.inc();
                    failures += 1;
                    if failures >= self.config.list_retry_limit {
                        return Err(error).with_context(|| {
                            format!("failed to list routable services after {failures} attempts")
                        });
                    }
                    warn!(%error, failures, ?backoff, "Failed to list routable services");
                    time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.config.list_backoff_max);
                }
            }
        }
    }
}
