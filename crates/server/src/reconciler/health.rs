// Health loop: keep `status` and `last_checked` current.
//
// The marker update (`last_checked := now`) happens inside the claiming
// transaction, so no two replicas probe the same node within one stale
// period regardless of cadence. Probing itself runs after commit, with no
// row lock held across the network.

use chrono::Utc;
use tracing::info;

use crate::catalog;

use super::{chrono_duration, Reconciler, HEALTH_BATCH};

impl Reconciler {
    /// One health iteration. Returns how many nodes were probed.
    pub async fn health_tick(&self) -> Result<usize, sqlx::Error> {
        let now = Utc::now();
        let cutoff = now - chrono_duration(self.config.stale_period);

        let mut tx = self.catalog.begin().await?;
        let nodes = catalog::claim_stale_nodes(&mut *tx, cutoff, HEALTH_BATCH).await?;
        if nodes.is_empty() {
            tx.rollback().await.ok();
            return Ok(0);
        }

        let node_ids: Vec<i64> = nodes.iter().map(|node| node.id).collect();
        catalog::touch_last_checked(&mut *tx, &node_ids, now).await?;
        tx.commit().await?;

        for node in &nodes {
            let status = self.probe.check(&node.endpoint).await;
            if status != node.status {
                info!(node_id = node.id, endpoint = %node.endpoint,
                      from = %node.status, to = %status, "node status changed");
            }
            catalog::set_status(self.catalog.pool(), node.id, status, Utc::now()).await?;
        }

        self.stats.health.record(nodes.len() as u64, 0);
        Ok(nodes.len())
    }
}
