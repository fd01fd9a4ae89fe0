// Synchronous placement path.
//
// `rent` claims eligible nodes, writes lease rows, and provisions OS users
// all inside one transaction: any failure rolls back every catalog effect.
// Remote user creation runs before commit, so a rollback can strand an OS
// user on a worker whose create succeeded; the scrub loop is the designated
// cleaner for exactly that residue.

use chrono::{Duration, SubsecRound, Utc};
use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};
use std::sync::Arc;
use tracing::{info, warn};

use corral_common::protocol::{Allocation, LeaseView, ListNodesResponse, NodeView};

use crate::auth::Principal;
use crate::catalog::{self, Catalog};
use crate::error::{CoreError, ErrorCode};
use crate::provision::Provisioner;
use crate::vault::Vault;

const NODE_SECRET_LEN: usize = 16;

/// Fresh per-node access secret: 16 alphanumeric characters from the OS
/// entropy source.
pub fn generate_node_secret() -> String {
    OsRng.sample_iter(&Alphanumeric).take(NODE_SECRET_LEN).map(char::from).collect()
}

#[derive(Clone)]
pub struct Allocator {
    catalog: Catalog,
    provisioner: Arc<dyn Provisioner>,
    vault: Vault,
    host_alias: String,
}

impl Allocator {
    pub fn new(
        catalog: Catalog,
        provisioner: Arc<dyn Provisioner>,
        vault: Vault,
        host_alias: impl Into<String>,
    ) -> Self {
        Self { catalog, provisioner, vault, host_alias: host_alias.into() }
    }

    /// Rent `count` nodes for `duration`. All-or-nothing: on any failure the
    /// catalog is left exactly as before the call.
    pub async fn rent(
        &self,
        principal: &Principal,
        count: usize,
        duration: Duration,
        provided_secret: Option<&str>,
    ) -> Result<Vec<Allocation>, CoreError> {
        if count < 1 {
            return Err(CoreError::new(ErrorCode::ValidationFailed, "count must be at least 1"));
        }
        if duration <= Duration::zero() {
            return Err(CoreError::new(ErrorCode::ValidationFailed, "duration must be positive"));
        }

        let mut tx = self.catalog.begin().await?;

        let nodes = catalog::claim_eligible_nodes(&mut *tx, count, None).await?;
        if nodes.len() < count {
            let found = nodes.len();
            tx.rollback().await.ok();
            warn!(requested = count, found, "rent failed: not enough free workers");
            return Err(CoreError::insufficient_capacity(count, found));
        }

        // Microsecond precision matches what the catalog stores back.
        let now = Utc::now().trunc_subsecs(6);
        let leased_until = now + duration;
        let mut allocations = Vec::with_capacity(nodes.len());

        for node in &nodes {
            let secret =
                provided_secret.map(ToOwned::to_owned).unwrap_or_else(generate_node_secret);
            let secret_enc = self.vault.encrypt(&secret).map_err(|error| {
                CoreError::new(ErrorCode::Internal, format!("secret encryption failed: {error}"))
            })?;

            let lease = catalog::insert_lease(
                &mut *tx,
                node.id,
                principal.id,
                now,
                leased_until,
                Some(&secret_enc),
            )
            .await?;
            catalog::mark_allocated(&mut *tx, node.id).await?;

            if let Err(error) =
                self.provisioner.create_user(&node.endpoint, &principal.handle, &secret).await
            {
                warn!(node_id = node.id, tenant = %principal.handle, %error,
                      "rent failed: provisioning error, rolling back batch");
                tx.rollback().await.ok();
                return Err(CoreError::new(
                    ErrorCode::ProvisioningFailed,
                    format!("worker provisioning failed on node {}", node.id),
                ));
            }

            let resolved = node.endpoint.resolved(&self.host_alias);
            allocations.push(Allocation {
                lease_id: lease.id,
                host: resolved.hostname,
                ssh_port: resolved.ssh_port,
                user: principal.handle.clone(),
                secret,
                leased_until,
            });
        }

        tx.commit().await?;

        info!(tenant = %principal.handle, count, until = %leased_until, "rent granted");
        Ok(allocations)
    }

    /// Release an active lease: best-effort remote user removal, then the
    /// lease goes inactive and its node returns to the free pool.
    pub async fn release(&self, principal: &Principal, lease_id: i64) -> Result<(), CoreError> {
        let mut tx = self.catalog.begin().await?;

        let Some(row) = catalog::lease_with_context_for_update(&mut *tx, lease_id).await? else {
            return Err(CoreError::from_code(ErrorCode::NotFound));
        };
        if !principal.may_manage_lease(row.tenant_id) {
            return Err(CoreError::from_code(ErrorCode::PermissionDenied));
        }
        if !row.active {
            return Err(CoreError::from_code(ErrorCode::NotActive));
        }

        let secret = match self.vault.decrypt_opt(row.secret_enc.as_deref()) {
            Ok(secret) => secret,
            Err(error) => {
                warn!(lease_id, %error, "lease secret unreadable, treating as missing");
                None
            }
        };

        if let Err(error) =
            self.provisioner.delete_user(&row.endpoint(), &row.handle, secret.as_deref()).await
        {
            warn!(lease_id, node_id = row.node_id, %error,
                  "release: remote user removal failed, continuing");
        }

        catalog::deactivate_lease(&mut *tx, row.id).await?;
        catalog::mark_free(&mut *tx, row.node_id).await?;
        tx.commit().await?;

        info!(lease_id, node_id = row.node_id, tenant = %row.handle, "lease released");
        Ok(())
    }

    /// Extend an active lease by `additional`. Monotonic: the window end
    /// only ever grows.
    pub async fn extend(
        &self,
        principal: &Principal,
        lease_id: i64,
        additional: Duration,
    ) -> Result<chrono::DateTime<Utc>, CoreError> {
        if additional <= Duration::zero() {
            return Err(CoreError::new(
                ErrorCode::ValidationFailed,
                "additional duration must be positive",
            ));
        }

        let mut tx = self.catalog.begin().await?;

        let Some(row) = catalog::lease_with_context_for_update(&mut *tx, lease_id).await? else {
            return Err(CoreError::from_code(ErrorCode::NotFound));
        };
        if !principal.may_manage_lease(row.tenant_id) {
            return Err(CoreError::from_code(ErrorCode::PermissionDenied));
        }
        if !row.active {
            return Err(CoreError::from_code(ErrorCode::NotActive));
        }

        let leased_until = row.leased_until + additional;
        catalog::update_lease_end(&mut *tx, row.id, leased_until).await?;
        tx.commit().await?;

        info!(lease_id, until = %leased_until, "lease extended");
        Ok(leased_until)
    }

    /// Role-filtered fleet view: admins see every node, tenants their own
    /// active leases with dialable endpoints.
    pub async fn list_nodes(&self, principal: &Principal) -> Result<ListNodesResponse, CoreError> {
        if principal.role.is_admin() {
            let nodes = self.catalog.list_nodes().await?;
            return Ok(ListNodesResponse {
                nodes: nodes
                    .into_iter()
                    .map(|node| NodeView {
                        id: node.id,
                        hostname: node.endpoint.hostname,
                        ssh_port: node.endpoint.ssh_port,
                        status: node.status,
                        allocated: node.allocated,
                        needs_cleanup: node.needs_cleanup,
                        last_checked: node.last_checked,
                    })
                    .collect(),
                leases: vec![],
            });
        }

        let leases = self.catalog.active_leases_for_tenant(principal.id).await?;
        Ok(ListNodesResponse {
            nodes: vec![],
            leases: leases
                .into_iter()
                .map(|row| {
                    let resolved = row.endpoint().resolved(&self.host_alias);
                    LeaseView {
                        lease_id: row.id,
                        host: resolved.hostname,
                        ssh_port: resolved.ssh_port,
                        leased_from: row.leased_from,
                        leased_until: row.leased_until,
                    }
                })
                .collect(),
        })
    }

    /// Cleartext secret of a lease; strictly owner-only.
    pub async fn lease_secret(
        &self,
        principal: &Principal,
        lease_id: i64,
    ) -> Result<String, CoreError> {
        let Some(row) =
            catalog::lease_with_context_for_update(self.catalog.pool(), lease_id).await?
        else {
            return Err(CoreError::from_code(ErrorCode::NotFound));
        };
        if !principal.may_read_secret(row.tenant_id) {
            return Err(CoreError::from_code(ErrorCode::PermissionDenied));
        }
        if !row.active {
            return Err(CoreError::from_code(ErrorCode::NotActive));
        }

        match self.vault.decrypt_opt(row.secret_enc.as_deref()) {
            Ok(Some(secret)) => Ok(secret),
            Ok(None) => {
                Err(CoreError::new(ErrorCode::NotFound, "lease has no stored secret"))
            }
            Err(error) => {
                warn!(lease_id, %error, "lease secret unreadable, treating as missing");
                Err(CoreError::new(ErrorCode::NotFound, "lease has no stored secret"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::generate_node_secret;

    #[test]
    fn node_secrets_are_sixteen_alphanumeric_chars() {
        for _ in 0..32 {
            let secret = generate_node_secret();
            assert_eq!(secret.len(), 16);
            assert!(secret.chars().all(|c| c.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn node_secrets_are_not_repeated() {
        let a = generate_node_secret();
        let b = generate_node_secret();
        assert_ne!(a, b);
    }
}
