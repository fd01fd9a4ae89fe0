// Shared domain types and wire protocol for the corral control plane.
//
// `types` holds the catalog-facing domain vocabulary (node status, roles,
// endpoints); `protocol` holds the HTTP request/response bodies exchanged
// between the control plane and its clients (tenants and worker agents).

pub mod protocol;
pub mod types;

pub use types::{Endpoint, NodeStatus, Role};
