// Uniform interface to the external provisioning tool.
//
// The tool owns OS-user lifecycle on workers; the control plane only ever
// asks it to create or delete one account. Both operations are idempotent
// by contract: re-creating an existing user or re-deleting a missing one
// reports success. Callers treat any `Err` as the single failure signal and
// log it themselves.

mod playbook;
mod recording;

use async_trait::async_trait;
use corral_common::types::Endpoint;

pub use playbook::{PlaybookConfig, PlaybookProvisioner};
pub use recording::{ProvisionCall, RecordingProvisioner};

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("provisioning tool failed to run: {0}")]
    Io(#[from] std::io::Error),
    #[error("provisioning tool exited with {code:?}")]
    Failed { code: Option<i32> },
    #[error("provisioning call exceeded its {timeout_secs}s budget")]
    Timeout { timeout_secs: u64 },
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// After success the account exists on the worker with the supplied
    /// secret; calling again with the same arguments is a no-op success.
    async fn create_user(
        &self,
        endpoint: &Endpoint,
        user: &str,
        secret: &str,
    ) -> Result<(), ProvisionError>;

    /// After success the account does not exist; calling again is a no-op
    /// success. The secret is advisory and may be absent.
    async fn delete_user(
        &self,
        endpoint: &Endpoint,
        user: &str,
        secret: Option<&str>,
    ) -> Result<(), ProvisionError>;
}
