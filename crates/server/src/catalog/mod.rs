// Transactional catalog of nodes, leases, and tenants.
//
// The catalog is the only shared resource: every component coordinates
// through it and nothing else. Work-queue claims use `FOR UPDATE SKIP
// LOCKED` so any number of control-plane replicas can run the same loops
// without handing the same row to two of them; row locks release at
// transaction end.
//
// Operations that participate in a caller-owned transaction take a
// `PgExecutor`, so the same function runs against a pool or `&mut *tx`.

mod rows;

use chrono::{DateTime, Utc};
use corral_common::types::NodeStatus;
use sqlx::{PgExecutor, PgPool, Postgres, Transaction};

pub use rows::{HistoricalTenant, Lease, LeaseJoinedRow, Node, Tenant};
use rows::{NodeRow, TenantRow};

const NODE_COLUMNS: &str =
    "id, hostname, ssh_port, status, allocated, needs_cleanup, last_checked, registered_at";

const LEASE_COLUMNS: &str =
    "id, node_id, tenant_id, leased_from, leased_until, active, secret_enc";

/// Handle on the catalog database.
#[derive(Clone)]
pub struct Catalog {
    pool: PgPool,
}

impl Catalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, sqlx::Error> {
        self.pool.begin().await
    }

    /// Register a worker endpoint with `status='unknown'`; the health loop
    /// verifies it before it becomes eligible. Duplicate `(hostname, port)`
    /// surfaces as a unique violation for the caller to map to `Conflict`.
    pub async fn register_node(&self, hostname: &str, ssh_port: u16) -> Result<Node, sqlx::Error> {
        let row = sqlx::query_as::<_, NodeRow>(&format!(
            "INSERT INTO nodes (hostname, ssh_port) VALUES ($1, $2) RETURNING {NODE_COLUMNS}"
        ))
        .bind(hostname)
        .bind(ssh_port as i32)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    pub async fn create_tenant(
        &self,
        handle: &str,
        password_hash: &str,
        role: corral_common::types::Role,
    ) -> Result<Tenant, sqlx::Error> {
        let row = sqlx::query_as::<_, TenantRow>(
            "INSERT INTO tenants (handle, password_hash, role) VALUES ($1, $2, $3) \
             RETURNING id, handle, password_hash, role",
        )
        .bind(handle)
        .bind(password_hash)
        .bind(role.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    pub async fn tenant_by_handle(&self, handle: &str) -> Result<Option<Tenant>, sqlx::Error> {
        let row = sqlx::query_as::<_, TenantRow>(
            "SELECT id, handle, password_hash, role FROM tenants WHERE handle = $1",
        )
        .bind(handle)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    /// Full fleet listing, for admins.
    pub async fn list_nodes(&self) -> Result<Vec<Node>, sqlx::Error> {
        let rows = sqlx::query_as::<_, NodeRow>(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// A tenant's own active leases with their node endpoints.
    pub async fn active_leases_for_tenant(
        &self,
        tenant_id: i64,
    ) -> Result<Vec<LeaseJoinedRow>, sqlx::Error> {
        sqlx::query_as::<_, LeaseJoinedRow>(
            "SELECT l.id, l.node_id, l.tenant_id, l.leased_from, l.leased_until, l.active, \
                    l.secret_enc, t.handle, n.hostname, n.ssh_port \
             FROM leases l \
             JOIN nodes n ON n.id = l.node_id \
             JOIN tenants t ON t.id = l.tenant_id \
             WHERE l.tenant_id = $1 AND l.active \
             ORDER BY l.id",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Administrative reset: drop every node and lease. Tenants survive.
    pub async fn reset_fleet(&self) -> Result<(), sqlx::Error> {
        sqlx::query("TRUNCATE leases, nodes RESTART IDENTITY CASCADE")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ── Claims (FOR UPDATE SKIP LOCKED work queues) ─────────────────────

/// Claim up to `k` freely eligible nodes: alive, unallocated, clean.
/// Freshest `last_checked` first, skipping rows held by peers.
pub async fn claim_eligible_nodes<'e, E: PgExecutor<'e>>(
    executor: E,
    k: usize,
    exclude_node: Option<i64>,
) -> Result<Vec<Node>, sqlx::Error> {
    let rows = sqlx::query_as::<_, NodeRow>(&format!(
        "SELECT {NODE_COLUMNS} \
         FROM nodes \
         WHERE status = 'alive' AND allocated = FALSE AND needs_cleanup = FALSE \
           AND ($2::BIGINT IS NULL OR id <> $2) \
         ORDER BY last_checked DESC NULLS LAST \
         LIMIT $1 \
         FOR UPDATE SKIP LOCKED"
    ))
    .bind(k as i64)
    .bind(exclude_node)
    .fetch_all(executor)
    .await?;

    Ok(rows.into_iter().map(Into::into).collect())
}

/// Health-loop claim: nodes whose liveness has not been checked since
/// `cutoff` (or ever), stalest first.
pub async fn claim_stale_nodes<'e, E: PgExecutor<'e>>(
    executor: E,
    cutoff: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<Node>, sqlx::Error> {
    let rows = sqlx::query_as::<_, NodeRow>(&format!(
        "SELECT {NODE_COLUMNS} \
         FROM nodes \
         WHERE last_checked IS NULL OR last_checked < $1 \
         ORDER BY last_checked ASC NULLS FIRST \
         LIMIT $2 \
         FOR UPDATE SKIP LOCKED"
    ))
    .bind(cutoff)
    .bind(limit as i64)
    .fetch_all(executor)
    .await?;

    Ok(rows.into_iter().map(Into::into).collect())
}

/// Migration-loop claim: dead nodes still carrying an allocation.
pub async fn claim_dead_allocated_nodes<'e, E: PgExecutor<'e>>(
    executor: E,
    limit: usize,
) -> Result<Vec<Node>, sqlx::Error> {
    let rows = sqlx::query_as::<_, NodeRow>(&format!(
        "SELECT {NODE_COLUMNS} \
         FROM nodes \
         WHERE status = 'dead' AND allocated = TRUE \
         ORDER BY id \
         LIMIT $1 \
         FOR UPDATE SKIP LOCKED"
    ))
    .bind(limit as i64)
    .fetch_all(executor)
    .await?;

    Ok(rows.into_iter().map(Into::into).collect())
}

/// Expiry-loop claim: active leases on allocated nodes whose window has
/// closed, joined with node endpoint and tenant handle.
pub async fn claim_expired_leases<'e, E: PgExecutor<'e>>(
    executor: E,
    now: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<LeaseJoinedRow>, sqlx::Error> {
    sqlx::query_as::<_, LeaseJoinedRow>(
        "SELECT l.id, l.node_id, l.tenant_id, l.leased_from, l.leased_until, l.active, \
                l.secret_enc, t.handle, n.hostname, n.ssh_port \
         FROM leases l \
         JOIN nodes n ON n.id = l.node_id \
         JOIN tenants t ON t.id = l.tenant_id \
         WHERE l.active AND n.allocated AND l.leased_until <= $1 \
         ORDER BY l.leased_until \
         LIMIT $2 \
         FOR UPDATE OF l, n SKIP LOCKED",
    )
    .bind(now)
    .bind(limit as i64)
    .fetch_all(executor)
    .await
}

/// Scrub-loop claim: resurrected nodes awaiting sanitization.
pub async fn claim_scrub_nodes<'e, E: PgExecutor<'e>>(
    executor: E,
    limit: usize,
) -> Result<Vec<Node>, sqlx::Error> {
    let rows = sqlx::query_as::<_, NodeRow>(&format!(
        "SELECT {NODE_COLUMNS} \
         FROM nodes \
         WHERE status = 'alive' AND needs_cleanup = TRUE \
         ORDER BY id \
         LIMIT $1 \
         FOR UPDATE SKIP LOCKED"
    ))
    .bind(limit as i64)
    .fetch_all(executor)
    .await?;

    Ok(rows.into_iter().map(Into::into).collect())
}

// ── Lease operations ────────────────────────────────────────────────

pub async fn insert_lease<'e, E: PgExecutor<'e>>(
    executor: E,
    node_id: i64,
    tenant_id: i64,
    leased_from: DateTime<Utc>,
    leased_until: DateTime<Utc>,
    secret_enc: Option<&str>,
) -> Result<Lease, sqlx::Error> {
    sqlx::query_as::<_, Lease>(&format!(
        "INSERT INTO leases (node_id, tenant_id, leased_from, leased_until, active, secret_enc) \
         VALUES ($1, $2, $3, $4, TRUE, $5) \
         RETURNING {LEASE_COLUMNS}"
    ))
    .bind(node_id)
    .bind(tenant_id)
    .bind(leased_from)
    .bind(leased_until)
    .bind(secret_enc)
    .fetch_one(executor)
    .await
}

pub async fn deactivate_lease<'e, E: PgExecutor<'e>>(
    executor: E,
    lease_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE leases SET active = FALSE WHERE id = $1")
        .bind(lease_id)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn update_lease_end<'e, E: PgExecutor<'e>>(
    executor: E,
    lease_id: i64,
    leased_until: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE leases SET leased_until = $2 WHERE id = $1")
        .bind(lease_id)
        .bind(leased_until)
        .execute(executor)
        .await?;
    Ok(())
}

/// Active leases placed on a node, locked for the caller's transaction.
/// Used by the migration loop to enumerate what must move.
pub async fn active_leases_on_node<'e, E: PgExecutor<'e>>(
    executor: E,
    node_id: i64,
) -> Result<Vec<LeaseJoinedRow>, sqlx::Error> {
    sqlx::query_as::<_, LeaseJoinedRow>(
        "SELECT l.id, l.node_id, l.tenant_id, l.leased_from, l.leased_until, l.active, \
                l.secret_enc, t.handle, n.hostname, n.ssh_port \
         FROM leases l \
         JOIN nodes n ON n.id = l.node_id \
         JOIN tenants t ON t.id = l.tenant_id \
         WHERE l.node_id = $1 AND l.active \
         ORDER BY l.id \
         FOR UPDATE OF l",
    )
    .bind(node_id)
    .fetch_all(executor)
    .await
}

/// One lease with its node and tenant context, locked. Release and extend
/// go through this.
pub async fn lease_with_context_for_update<'e, E: PgExecutor<'e>>(
    executor: E,
    lease_id: i64,
) -> Result<Option<LeaseJoinedRow>, sqlx::Error> {
    sqlx::query_as::<_, LeaseJoinedRow>(
        "SELECT l.id, l.node_id, l.tenant_id, l.leased_from, l.leased_until, l.active, \
                l.secret_enc, t.handle, n.hostname, n.ssh_port \
         FROM leases l \
         JOIN nodes n ON n.id = l.node_id \
         JOIN tenants t ON t.id = l.tenant_id \
         WHERE l.id = $1 \
         FOR UPDATE OF l, n",
    )
    .bind(lease_id)
    .fetch_optional(executor)
    .await
}

/// Every tenant that ever held a lease on this node, with the encrypted
/// secret of their most recent lease there. A resurrected node may still
/// carry OS users for any of them.
pub async fn historical_tenants<'e, E: PgExecutor<'e>>(
    executor: E,
    node_id: i64,
) -> Result<Vec<HistoricalTenant>, sqlx::Error> {
    sqlx::query_as::<_, HistoricalTenant>(
        "SELECT DISTINCT ON (t.id) t.id AS tenant_id, t.handle, l.secret_enc \
         FROM leases l \
         JOIN tenants t ON t.id = l.tenant_id \
         WHERE l.node_id = $1 \
         ORDER BY t.id, l.leased_from DESC",
    )
    .bind(node_id)
    .fetch_all(executor)
    .await
}

// ── Node state transitions ──────────────────────────────────────────

pub async fn mark_allocated<'e, E: PgExecutor<'e>>(
    executor: E,
    node_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE nodes SET allocated = TRUE WHERE id = $1")
        .bind(node_id)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn mark_free<'e, E: PgExecutor<'e>>(
    executor: E,
    node_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE nodes SET allocated = FALSE WHERE id = $1")
        .bind(node_id)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn set_cleanup<'e, E: PgExecutor<'e>>(
    executor: E,
    node_id: i64,
    needs_cleanup: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE nodes SET needs_cleanup = $2 WHERE id = $1")
        .bind(node_id)
        .bind(needs_cleanup)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn set_status<'e, E: PgExecutor<'e>>(
    executor: E,
    node_id: i64,
    status: NodeStatus,
    at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE nodes SET status = $2, last_checked = $3 WHERE id = $1")
        .bind(node_id)
        .bind(status.as_str())
        .bind(at)
        .execute(executor)
        .await?;
    Ok(())
}

/// Health-loop marker: stamps `last_checked` inside the claiming
/// transaction so peers and later iterations skip these nodes for the next
/// stale period.
pub async fn touch_last_checked<'e, E: PgExecutor<'e>>(
    executor: E,
    node_ids: &[i64],
    at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE nodes SET last_checked = $2 WHERE id = ANY($1)")
        .bind(node_ids)
        .bind(at)
        .execute(executor)
        .await?;
    Ok(())
}

/// Fetch one node by id (fresh read, no lock).
pub async fn node_by_id<'e, E: PgExecutor<'e>>(
    executor: E,
    node_id: i64,
) -> Result<Option<Node>, sqlx::Error> {
    let row = sqlx::query_as::<_, NodeRow>(&format!(
        "SELECT {NODE_COLUMNS} FROM nodes WHERE id = $1"
    ))
    .bind(node_id)
    .fetch_optional(executor)
    .await?;

    Ok(row.map(Into::into))
}

/// Fetch one lease by id (fresh read, no lock).
pub async fn lease_by_id<'e, E: PgExecutor<'e>>(
    executor: E,
    lease_id: i64,
) -> Result<Option<Lease>, sqlx::Error> {
    sqlx::query_as::<_, Lease>(&format!("SELECT {LEASE_COLUMNS} FROM leases WHERE id = $1"))
        .bind(lease_id)
        .fetch_optional(executor)
        .await
}
