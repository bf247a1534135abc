//! Controller service: cluster file reconciliation and the check scheduler

use async_trait::async_trait;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use warden_core::{Result, WardenConfig, WardenError, WardenService};
use warden_lb::{
    load_clusters, CheckContext, ClusterCollection, HttpHealthFetcher, IpvsAdm, LbError,
    ReconcileReport, ShellExecutor, StatusFileDir,
};
use warden_telemetry::{Counter, Gauge, Histogram};

struct ControllerMetrics {
    check_cycles: Counter,
    clusters_checked: Counter,
    reconciliations: Counter,
    running_clusters: Gauge,
    cycle_ms: Histogram,
}

impl ControllerMetrics {
    fn new() -> Self {
        Self {
            check_cycles: Counter::new("warden_check_cycles_total"),
            clusters_checked: Counter::new("warden_clusters_checked_total"),
            reconciliations: Counter::new("warden_reconciliations_total"),
            running_clusters: Gauge::new("warden_running_clusters"),
            cycle_ms: Histogram::new("warden_check_cycle_ms"),
        }
    }
}

pub struct ControllerService {
    config: WardenConfig,
    // reconciliation and check cycles never interleave
    collection: Mutex<ClusterCollection>,
    ctx: CheckContext,
    metrics: ControllerMetrics,
}

impl ControllerService {
    pub fn new(config: WardenConfig) -> Result<Self> {
        let executor = Arc::new(ShellExecutor::new(config.max_concurrent_commands));
        let kernel = Arc::new(IpvsAdm::new(config.ipvsadm_path.clone(), executor));
        let health = Arc::new(HttpHealthFetcher::new(config.probe_timeout).map_err(to_warden_error)?);
        let status = Arc::new(StatusFileDir::new(config.status_dir.clone()));

        Ok(Self::with_context(config, CheckContext::new(health, status, kernel)))
    }

    pub fn with_context(config: WardenConfig, ctx: CheckContext) -> Self {
        Self {
            config,
            collection: Mutex::new(ClusterCollection::new()),
            ctx,
            metrics: ControllerMetrics::new(),
        }
    }

    /// Load the cluster file and reconcile it into the running collection.
    ///
    /// A file that fails to load or validate leaves the collection untouched.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let clusters = load_clusters(&self.config.clusters_file, Instant::now())
            .await
            .map_err(to_warden_error)?;

        let kernel = self.ctx.kernel.as_ref();
        let mut collection = self.collection.lock().await;
        let report = collection.config(clusters, kernel).await;

        let mut started = 0;
        for cluster in collection.iter_mut() {
            if cluster.autostart && !cluster.is_monitored() {
                cluster.start_monitoring(kernel).await;
                started += 1;
            }
        }

        self.metrics.reconciliations.inc();
        self.metrics.running_clusters.set(collection.running().len() as u64);

        match serde_json::to_string(&report) {
            Ok(json) => info!(report = %json, started, "Cluster configuration applied"),
            Err(e) => warn!(error = %e, "Failed to serialize reconcile report"),
        }

        Ok(report)
    }

    /// Run one check for every cluster whose interval has elapsed.
    pub async fn check_cycle(&self, now: Instant) -> usize {
        let started = Instant::now();
        let mut collection = self.collection.lock().await;

        let due = collection.ready_for_check_mut(now);
        let checked = due.len();
        join_all(due.into_iter().map(|cluster| cluster.monitor_nodes(&self.ctx, now))).await;

        self.metrics.check_cycles.inc();
        self.metrics.clusters_checked.add(checked as u64);
        self.metrics.running_clusters.set(collection.running().len() as u64);
        self.metrics.cycle_ms.record(started.elapsed().as_secs_f64() * 1000.0);

        if checked > 0 {
            debug!(clusters = checked, "Check cycle complete");
        }
        checked
    }

    pub async fn running_clusters(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .collection
            .lock()
            .await
            .running()
            .into_iter()
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl WardenService for ControllerService {
    fn service_id(&self) -> &'static str {
        "warden-controller"
    }

    async fn start(&self) -> Result<()> {
        if let Err(e) = self.reconcile().await {
            error!(
                error = %e,
                code = e.error_code(),
                file = %self.config.clusters_file.display(),
                "Initial cluster file could not be applied, waiting for reload"
            );
        }

        info!(tick_ms = self.config.check_tick.as_millis() as u64, "Check scheduler running");

        let mut tick = tokio::time::interval(self.config.check_tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            self.check_cycle(Instant::now()).await;
        }
    }

    async fn reload(&self) -> Result<()> {
        self.reconcile().await.map(drop)
    }

    async fn shutdown(&self) -> Result<()> {
        let running = self.running_clusters().await;
        info!(
            running = running.len(),
            check_cycles = self.metrics.check_cycles.get(),
            p99_cycle_ms = self.metrics.cycle_ms.percentile(99.0),
            "Shutting down, kernel state left in place"
        );
        Ok(())
    }
}

fn to_warden_error(e: LbError) -> WardenError {
    match e {
        LbError::Config(msg) | LbError::Parse(msg) => WardenError::Config(msg),
        LbError::Io(e) => WardenError::Io(e.to_string()),
        other => WardenError::Unavailable(other.to_string()),
    }
}
