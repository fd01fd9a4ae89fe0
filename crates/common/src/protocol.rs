// HTTP request/response bodies exchanged with the control plane.
//
// Shared between the server and the worker agent so registration cannot
// drift, and available to API clients as a typed contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::NodeStatus;

/// Worker agent announcing itself to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterWorkerRequest {
    pub hostname: String,
    pub ssh_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignupRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RentRequest {
    pub duration_hours: i64,
    /// Number of nodes to allocate atomically. Defaults to 1.
    #[serde(default = "default_count")]
    pub count: u32,
    /// Optional caller-supplied access secret applied to every node; when
    /// absent the server generates a fresh one per node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

fn default_count() -> u32 {
    1
}

/// One granted node of a rent call. `secret` is cleartext and only ever
/// appears in this response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub lease_id: i64,
    pub host: String,
    pub ssh_port: u16,
    pub user: String,
    pub secret: String,
    pub leased_until: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RentResponse {
    pub allocated: Vec<Allocation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendRequest {
    pub additional_hours: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendResponse {
    pub lease_id: i64,
    pub leased_until: DateTime<Utc>,
}

/// Fleet view for admins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeView {
    pub id: i64,
    pub hostname: String,
    pub ssh_port: u16,
    pub status: NodeStatus,
    pub allocated: bool,
    pub needs_cleanup: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
}

/// A tenant's view of one of their active leases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseView {
    pub lease_id: i64,
    pub host: String,
    pub ssh_port: u16,
    pub leased_from: DateTime<Utc>,
    pub leased_until: DateTime<Utc>,
}

/// Role-filtered listing: admins get `nodes`, tenants get `leases`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListNodesResponse {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodeView>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub leases: Vec<LeaseView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseSecretResponse {
    pub lease_id: i64,
    pub user: String,
    pub secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}
