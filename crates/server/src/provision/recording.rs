// Scriptable in-memory provisioner.
//
// Records every call and answers from a queue of scripted outcomes, so the
// allocator and reconciliation loops can be exercised without a worker
// fleet. Defaults to success when nothing is scripted.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use corral_common::types::Endpoint;

use super::{ProvisionError, Provisioner};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionCall {
    CreateUser { endpoint: Endpoint, user: String, secret: String },
    DeleteUser { endpoint: Endpoint, user: String, secret: Option<String> },
}

#[derive(Default)]
pub struct RecordingProvisioner {
    calls: Mutex<Vec<ProvisionCall>>,
    scripted_failures: Mutex<VecDeque<bool>>,
}

impl RecordingProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the outcome of the next calls: `true` entries fail, `false`
    /// entries succeed. Once the queue drains every call succeeds.
    pub fn script_failures(&self, outcomes: impl IntoIterator<Item = bool>) {
        self.scripted_failures
            .lock()
            .expect("scripted outcome lock should not be poisoned")
            .extend(outcomes);
    }

    pub fn calls(&self) -> Vec<ProvisionCall> {
        self.calls.lock().expect("call log lock should not be poisoned").clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("call log lock should not be poisoned").len()
    }

    fn record(&self, call: ProvisionCall) -> Result<(), ProvisionError> {
        self.calls.lock().expect("call log lock should not be poisoned").push(call);
        let fail = self
            .scripted_failures
            .lock()
            .expect("scripted outcome lock should not be poisoned")
            .pop_front()
            .unwrap_or(false);
        if fail {
            Err(ProvisionError::Failed { code: Some(1) })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Provisioner for RecordingProvisioner {
    async fn create_user(
        &self,
        endpoint: &Endpoint,
        user: &str,
        secret: &str,
    ) -> Result<(), ProvisionError> {
        self.record(ProvisionCall::CreateUser {
            endpoint: endpoint.clone(),
            user: user.to_owned(),
            secret: secret.to_owned(),
        })
    }

    async fn delete_user(
        &self,
        endpoint: &Endpoint,
        user: &str,
        secret: Option<&str>,
    ) -> Result<(), ProvisionError> {
        self.record(ProvisionCall::DeleteUser {
            endpoint: endpoint.clone(),
            user: user.to_owned(),
            secret: secret.map(ToOwned::to_owned),
        })
    }
}
