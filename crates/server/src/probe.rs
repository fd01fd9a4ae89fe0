// Node liveness oracle.
//
// A node is `alive` when its resolved SSH endpoint accepts a TCP connection
// within the probe budget, `dead` otherwise. The cheap reachability check is
// the oracle here; the health loop records whatever this returns.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use corral_common::types::{Endpoint, NodeStatus};
use tokio::net::TcpStream;
use tracing::debug;

#[async_trait]
pub trait NodeProbe: Send + Sync {
    /// Returns `Alive` or `Dead`, never `Unknown`, within the probe budget.
    async fn check(&self, endpoint: &Endpoint) -> NodeStatus;
}

pub struct TcpProbe {
    timeout: Duration,
    host_alias: String,
}

impl TcpProbe {
    pub fn new(timeout: Duration, host_alias: impl Into<String>) -> Self {
        Self { timeout, host_alias: host_alias.into() }
    }
}

#[async_trait]
impl NodeProbe for TcpProbe {
    async fn check(&self, endpoint: &Endpoint) -> NodeStatus {
        let dial_host = endpoint.dial_host(&self.host_alias);
        let target = format!("{dial_host}:{}", endpoint.ssh_port);

        match tokio::time::timeout(self.timeout, TcpStream::connect(&target)).await {
            Ok(Ok(_stream)) => NodeStatus::Alive,
            Ok(Err(error)) => {
                debug!(%target, %error, "probe connect failed");
                NodeStatus::Dead
            }
            Err(_elapsed) => {
                debug!(%target, timeout_secs = self.timeout.as_secs(), "probe timed out");
                NodeStatus::Dead
            }
        }
    }
}

/// Scriptable probe for exercising the health loop without a fleet:
/// answers per-hostname, defaulting to `Dead` for unscripted endpoints.
#[derive(Default)]
pub struct ScriptedProbe {
    verdicts: Mutex<HashMap<String, NodeStatus>>,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_verdict(&self, hostname: impl Into<String>, status: NodeStatus) {
        self.verdicts
            .lock()
            .expect("verdict lock should not be poisoned")
            .insert(hostname.into(), status);
    }
}

#[async_trait]
impl NodeProbe for ScriptedProbe {
    async fn check(&self, endpoint: &Endpoint) -> NodeStatus {
        self.verdicts
            .lock()
            .expect("verdict lock should not be poisoned")
            .get(&endpoint.hostname)
            .copied()
            .unwrap_or(NodeStatus::Dead)
    }
}
