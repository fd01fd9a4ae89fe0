// Expiry loop: reclaim leases whose window has closed.
//
// Cleanup-first policy: the lease only goes inactive after the worker's OS
// user is confirmed gone. A failed delete leaves the row inside the claim
// predicate, so the next iteration retries; `delete_user` is idempotent
// and reports success for an already-missing account.

use chrono::Utc;
use tracing::{info, warn};

use crate::catalog;

use super::{Reconciler, EXPIRY_BATCH};

impl Reconciler {
    /// One expiry iteration. Returns how many leases were reclaimed.
    pub async fn expiry_tick(&self) -> Result<usize, sqlx::Error> {
        let now = Utc::now();

        let mut tx = self.catalog.begin().await?;
        let rows = catalog::claim_expired_leases(&mut *tx, now, EXPIRY_BATCH).await?;
        if rows.is_empty() {
            tx.rollback().await.ok();
            return Ok(0);
        }

        let mut reclaimed = 0;
        let mut provision_failures = 0;

        for row in &rows {
            let secret = match self.vault.decrypt_opt(row.secret_enc.as_deref()) {
                Ok(secret) => secret,
                Err(error) => {
                    warn!(lease_id = row.id, %error,
                          "lease secret unreadable, treating as missing");
                    None
                }
            };

            match self.provisioner.delete_user(&row.endpoint(), &row.handle, secret.as_deref()).await
            {
                Err(error) => {
                    provision_failures += 1;
                    warn!(lease_id = row.id, node_id = row.node_id, tenant = %row.handle, %error,
                          "expired lease cleanup failed, leaving for retry");
                }
                Ok(()) => {
                    catalog::deactivate_lease(&mut *tx, row.id).await?;
                    catalog::mark_free(&mut *tx, row.node_id).await?;
                    reclaimed += 1;
                    info!(lease_id = row.id, node_id = row.node_id, tenant = %row.handle,
                          until = %row.leased_until, "expired lease reclaimed");
                }
            }
        }

        tx.commit().await?;

        self.stats.expiry.record(reclaimed as u64, provision_failures);
        Ok(reclaimed)
    }
}
