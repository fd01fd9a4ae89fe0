// Typed catalog records and their raw row shapes.
//
// Raw `*Row` structs mirror the SQL result sets; the public records carry
// the domain types. Nodes and leases are plain records keyed by id; no
// in-memory references between them survive a transaction.

use chrono::{DateTime, Utc};
use corral_common::types::{Endpoint, NodeStatus, Role};

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct NodeRow {
    pub id: i64,
    pub hostname: String,
    pub ssh_port: i32,
    pub status: String,
    pub allocated: bool,
    pub needs_cleanup: bool,
    pub last_checked: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

/// A worker slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: i64,
    pub endpoint: Endpoint,
    pub status: NodeStatus,
    pub allocated: bool,
    pub needs_cleanup: bool,
    pub last_checked: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

impl From<NodeRow> for Node {
    fn from(row: NodeRow) -> Self {
        Self {
            id: row.id,
            endpoint: Endpoint::new(row.hostname, row.ssh_port as u16),
            status: row.status.parse().unwrap_or(NodeStatus::Unknown),
            allocated: row.allocated,
            needs_cleanup: row.needs_cleanup,
            last_checked: row.last_checked,
            registered_at: row.registered_at,
        }
    }
}

/// A tenant's hold on one node over a time window.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Lease {
    pub id: i64,
    pub node_id: i64,
    pub tenant_id: i64,
    pub leased_from: DateTime<Utc>,
    pub leased_until: DateTime<Utc>,
    pub active: bool,
    pub secret_enc: Option<String>,
}

/// A lease joined with its node endpoint and owning tenant, as consumed by
/// the expiry and migration loops and the release/extend paths.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct LeaseJoinedRow {
    pub id: i64,
    pub node_id: i64,
    pub tenant_id: i64,
    pub leased_from: DateTime<Utc>,
    pub leased_until: DateTime<Utc>,
    pub active: bool,
    pub secret_enc: Option<String>,
    pub handle: String,
    pub hostname: String,
    pub ssh_port: i32,
}

impl LeaseJoinedRow {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.hostname.clone(), self.ssh_port as u16)
    }
}

/// One tenant that ever held a lease on a node, with the encrypted secret of
/// their most recent lease there. Input to the scrub sweep.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct HistoricalTenant {
    pub tenant_id: i64,
    pub handle: String,
    pub secret_enc: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct TenantRow {
    pub id: i64,
    pub handle: String,
    pub password_hash: String,
    pub role: String,
}

/// A principal that may hold leases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    pub id: i64,
    pub handle: String,
    pub password_hash: String,
    pub role: Role,
}

impl From<TenantRow> for Tenant {
    fn from(row: TenantRow) -> Self {
        Self {
            id: row.id,
            handle: row.handle,
            password_hash: row.password_hash,
            role: row.role.parse().unwrap_or(Role::Tenant),
        }
    }
}
