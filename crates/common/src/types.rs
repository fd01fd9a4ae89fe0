// Core domain types shared across all corral crates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Liveness status of a worker node, refreshed by the health loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Freshly registered, never probed.
    Unknown,
    Alive,
    Dead,
}

impl NodeStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Alive => "alive",
            Self::Dead => "dead",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized node status `{0}`")]
pub struct ParseNodeStatusError(String);

impl FromStr for NodeStatus {
    type Err = ParseNodeStatusError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "unknown" => Ok(Self::Unknown),
            "alive" => Ok(Self::Alive),
            "dead" => Ok(Self::Dead),
            other => Err(ParseNodeStatusError(other.to_owned())),
        }
    }
}

/// Role of a principal. Admins see the whole fleet and may release any
/// lease; tenants only act on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Tenant,
    Admin,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tenant => "tenant",
            Self::Admin => "admin",
        }
    }

    pub const fn is_admin(self) -> bool {
        matches!(self, Self::Admin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized role `{0}`")]
pub struct ParseRoleError(String);

impl FromStr for Role {
    type Err = ParseRoleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "tenant" => Ok(Self::Tenant),
            "admin" => Ok(Self::Admin),
            other => Err(ParseRoleError(other.to_owned())),
        }
    }
}

/// Address prefix of container-internal worker registrations. Workers that
/// self-register from inside the default bridge network report an address
/// the control plane cannot dial directly; those are rewritten to the
/// host-loopback alias at dial time.
pub const CONTAINER_INTERNAL_PREFIX: &str = "172.17.";

/// Default host-loopback alias used when none is configured.
pub const DEFAULT_HOST_ALIAS: &str = "host.docker.internal";

/// A worker's SSH endpoint as stored in the catalog.
///
/// `hostname` is the single canonical address column; the container-internal
/// rewrite happens only at dial time via [`Endpoint::resolved`], so the
/// probe, the provisioner, and the endpoint handed back to tenants all agree
/// on the same target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub hostname: String,
    pub ssh_port: u16,
}

impl Endpoint {
    pub fn new(hostname: impl Into<String>, ssh_port: u16) -> Self {
        Self { hostname: hostname.into(), ssh_port }
    }

    /// The hostname to actually dial, with the container-internal prefix
    /// rewritten to the supplied host-loopback alias.
    pub fn dial_host(&self, host_alias: &str) -> String {
        if self.hostname.starts_with(CONTAINER_INTERNAL_PREFIX) {
            host_alias.to_owned()
        } else {
            self.hostname.clone()
        }
    }

    /// This endpoint with the dial-time rewrite applied.
    pub fn resolved(&self, host_alias: &str) -> Endpoint {
        Endpoint { hostname: self.dial_host(host_alias), ssh_port: self.ssh_port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.ssh_port)
    }
}
