// Background reconciliation supervisor.
//
// Four idempotent loops (health, migration, expiry, scrub) drive the
// fleet toward its target state: every active lease on an alive clean node,
// every expired lease torn down, every resurrected node scrubbed before
// reuse. Each loop follows the same claim–act–commit pattern: claim a small
// batch under `FOR UPDATE SKIP LOCKED`, update a marker that removes the
// rows from the claim predicate, commit, then apply results. Any number of
// replicas run the same loops against the same catalog; cadence is
// configuration, not correctness.
//
// Loops never surface errors upward: an iteration that fails is logged and
// retried on the next tick.

mod expiry;
mod health;
mod migration;
mod scrub;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::warn;

use crate::catalog::Catalog;
use crate::probe::NodeProbe;
use crate::provision::Provisioner;
use crate::vault::Vault;

/// Per-iteration batch bounds. Small on purpose: claims hold row locks and
/// the migration loop provisions under its lock.
pub(crate) const HEALTH_BATCH: usize = 10;
pub(crate) const MIGRATION_BATCH: usize = 5;
pub(crate) const EXPIRY_BATCH: usize = 20;
pub(crate) const SCRUB_BATCH: usize = 10;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub health_interval: Duration,
    pub migration_interval: Duration,
    pub expiry_interval: Duration,
    pub scrub_interval: Duration,
    /// A node probed longer ago than this is due for a fresh liveness check.
    pub stale_period: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(30),
            migration_interval: Duration::from_secs(10),
            expiry_interval: Duration::from_secs(60),
            scrub_interval: Duration::from_secs(30),
            stale_period: Duration::from_secs(30),
        }
    }
}

/// Counters for one loop. `provision_failures` is the visibility hook for a
/// permanently failing provisioner: the rows stay claimed-and-retried
/// forever, but the counter keeps climbing.
#[derive(Debug, Default)]
pub struct LoopStats {
    iterations: AtomicU64,
    items: AtomicU64,
    provision_failures: AtomicU64,
}

impl LoopStats {
    pub(crate) fn record(&self, items: u64, provision_failures: u64) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
        self.items.fetch_add(items, Ordering::Relaxed);
        self.provision_failures.fetch_add(provision_failures, Ordering::Relaxed);
    }

    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    pub fn items(&self) -> u64 {
        self.items.load(Ordering::Relaxed)
    }

    pub fn provision_failures(&self) -> u64 {
        self.provision_failures.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct ReconcilerStats {
    pub health: LoopStats,
    pub migration: LoopStats,
    pub expiry: LoopStats,
    pub scrub: LoopStats,
}

pub struct Reconciler {
    pub(crate) catalog: Catalog,
    pub(crate) provisioner: Arc<dyn Provisioner>,
    pub(crate) probe: Arc<dyn NodeProbe>,
    pub(crate) vault: Vault,
    pub(crate) config: ReconcilerConfig,
    pub(crate) stats: ReconcilerStats,
}

impl Reconciler {
    pub fn new(
        catalog: Catalog,
        provisioner: Arc<dyn Provisioner>,
        probe: Arc<dyn NodeProbe>,
        vault: Vault,
        config: ReconcilerConfig,
    ) -> Self {
        Self { catalog, provisioner, probe, vault, config, stats: ReconcilerStats::default() }
    }

    pub fn stats(&self) -> &ReconcilerStats {
        &self.stats
    }

    /// Launch the four loops on their own schedules. They stop when the
    /// shutdown signal flips to `true`.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            spawn_loop("health", self.config.health_interval, shutdown.clone(), {
                let this = Arc::clone(&self);
                move || {
                    let this = Arc::clone(&this);
                    async move { this.health_tick().await.map(|_| ()) }
                }
            }),
            spawn_loop("migration", self.config.migration_interval, shutdown.clone(), {
                let this = Arc::clone(&self);
                move || {
                    let this = Arc::clone(&this);
                    async move { this.migration_tick().await.map(|_| ()) }
                }
            }),
            spawn_loop("expiry", self.config.expiry_interval, shutdown.clone(), {
                let this = Arc::clone(&self);
                move || {
                    let this = Arc::clone(&this);
                    async move { this.expiry_tick().await.map(|_| ()) }
                }
            }),
            spawn_loop("scrub", self.config.scrub_interval, shutdown, {
                let this = Arc::clone(&self);
                move || {
                    let this = Arc::clone(&this);
                    async move { this.scrub_tick().await.map(|_| ()) }
                }
            }),
        ]
    }
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<(), sqlx::Error>> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = tick().await {
                        warn!(loop_name = name, %error, "reconciliation iteration failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

/// Std-to-chrono duration conversion for window arithmetic.
pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).expect("loop cadence should fit within chrono::Duration")
}
