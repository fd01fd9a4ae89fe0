// Migration loop: relocate leases off dead nodes.
//
// One transaction per dead node. Provisioning runs inside that transaction
// on purpose: the relocation of a node's leases commits as one unit, and
// the new placement is committed even when user creation on the replacement
// fails, so the catalog stays the single source of truth and the failure is
// logged per lease. Replacement nodes are claimed with the same skip-locked
// primitive and marked allocated before commit, so concurrent migrations
// never race for the same replacement.

use tracing::{info, warn};

use crate::catalog;

use super::{Reconciler, MIGRATION_BATCH};

impl Reconciler {
    /// One migration iteration. Returns how many dead nodes were handled.
    pub async fn migration_tick(&self) -> Result<usize, sqlx::Error> {
        let mut handled = 0;
        let mut provision_failures = 0;

        for _ in 0..MIGRATION_BATCH {
            let mut tx = self.catalog.begin().await?;

            let Some(dead) = catalog::claim_dead_allocated_nodes(&mut *tx, 1).await?.pop() else {
                tx.rollback().await.ok();
                break;
            };

            let leases = catalog::active_leases_on_node(&mut *tx, dead.id).await?;
            if leases.is_empty() {
                // Allocation flag out of sync with lease rows; repair and
                // queue the node for scrubbing.
                catalog::mark_free(&mut *tx, dead.id).await?;
                catalog::set_cleanup(&mut *tx, dead.id, true).await?;
                tx.commit().await?;
                handled += 1;
                continue;
            }

            warn!(node_id = dead.id, endpoint = %dead.endpoint, leases = leases.len(),
                  "dead node holds active leases, migrating");

            let replacements =
                catalog::claim_eligible_nodes(&mut *tx, leases.len(), Some(dead.id)).await?;

            for (lease, replacement) in leases.iter().zip(&replacements) {
                catalog::deactivate_lease(&mut *tx, lease.id).await?;
                let new_lease = catalog::insert_lease(
                    &mut *tx,
                    replacement.id,
                    lease.tenant_id,
                    lease.leased_from,
                    lease.leased_until,
                    lease.secret_enc.as_deref(),
                )
                .await?;
                catalog::mark_allocated(&mut *tx, replacement.id).await?;

                let secret = match self.vault.decrypt_opt(lease.secret_enc.as_deref()) {
                    Ok(secret) => secret,
                    Err(error) => {
                        warn!(lease_id = lease.id, %error,
                              "lease secret unreadable, treating as missing");
                        None
                    }
                };

                let provisioned = match secret {
                    Some(secret) => self
                        .provisioner
                        .create_user(&replacement.endpoint, &lease.handle, &secret)
                        .await
                        .map_err(|error| error.to_string()),
                    None => Err("no usable secret on file".to_owned()),
                };

                match provisioned {
                    Ok(()) => {
                        info!(lease_id = lease.id, new_lease_id = new_lease.id,
                              from_node = dead.id, to_node = replacement.id,
                              tenant = %lease.handle, "lease migrated");
                    }
                    Err(reason) => {
                        // The placement stands; the tenant may need manual
                        // recovery on the replacement.
                        provision_failures += 1;
                        warn!(lease_id = lease.id, new_lease_id = new_lease.id,
                              to_node = replacement.id, tenant = %lease.handle, %reason,
                              "lease migrated but provisioning on replacement failed");
                    }
                }
            }

            for lease in leases.iter().skip(replacements.len()) {
                warn!(lease_id = lease.id, node_id = dead.id, tenant = %lease.handle,
                      "no eligible replacement, lease stays on dead node for retry");
            }

            if replacements.len() >= leases.len() {
                // Fully evacuated: free the corpse and gate it behind scrub.
                catalog::mark_free(&mut *tx, dead.id).await?;
                catalog::set_cleanup(&mut *tx, dead.id, true).await?;
            }

            tx.commit().await?;
            handled += 1;

            // A starved node stays in the claim predicate; without capacity
            // this tick would just re-claim it, so stop here.
            if replacements.is_empty() && !leases.is_empty() {
                break;
            }
        }

        if handled > 0 || provision_failures > 0 {
            self.stats.migration.record(handled as u64, provision_failures);
        }
        Ok(handled)
    }
}
