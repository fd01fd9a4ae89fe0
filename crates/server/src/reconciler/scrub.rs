// Scrub loop: sanitize nodes abandoned under failure before readmission.
//
// A node that died and came back may still carry OS users from any tenant
// that ever leased it, including tenants long since migrated elsewhere. The
// sweep deletes every distinct historical tenant's user; all deletes must
// succeed before the cleanup flag clears and the node reenters the
// allocator's eligible pool. Over-deletion is safe under the idempotent
// `delete_user` contract.

use tracing::{info, warn};

use crate::catalog;

use super::{Reconciler, SCRUB_BATCH};

impl Reconciler {
    /// One scrub iteration. Returns how many nodes were cleared.
    pub async fn scrub_tick(&self) -> Result<usize, sqlx::Error> {
        let mut tx = self.catalog.begin().await?;
        let nodes = catalog::claim_scrub_nodes(&mut *tx, SCRUB_BATCH).await?;
        if nodes.is_empty() {
            tx.rollback().await.ok();
            return Ok(0);
        }

        let mut cleared = 0;
        let mut provision_failures = 0;

        for node in &nodes {
            let tenants = catalog::historical_tenants(&mut *tx, node.id).await?;
            let mut all_deleted = true;

            for tenant in &tenants {
                let secret = match self.vault.decrypt_opt(tenant.secret_enc.as_deref()) {
                    Ok(secret) => secret,
                    Err(error) => {
                        warn!(node_id = node.id, tenant = %tenant.handle, %error,
                              "historic secret unreadable, treating as missing");
                        None
                    }
                };

                if let Err(error) = self
                    .provisioner
                    .delete_user(&node.endpoint, &tenant.handle, secret.as_deref())
                    .await
                {
                    all_deleted = false;
                    provision_failures += 1;
                    warn!(node_id = node.id, tenant = %tenant.handle, %error,
                          "scrub delete failed, node stays quarantined");
                }
            }

            if all_deleted {
                catalog::set_cleanup(&mut *tx, node.id, false).await?;
                cleared += 1;
                info!(node_id = node.id, endpoint = %node.endpoint,
                      swept_tenants = tenants.len(), "node scrubbed and readmitted");
            }
        }

        tx.commit().await?;

        self.stats.scrub.record(cleared as u64, provision_failures);
        Ok(cleared)
    }
}
