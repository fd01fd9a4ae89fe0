// Playbook-driven provisioner.
//
// Shells out to an `ansible-playbook`-compatible CLI with an inline
// inventory pointing at the resolved worker endpoint. The playbook
// identifiers are opaque strings from configuration; the playbooks
// themselves guarantee the idempotence the Provisioner contract requires.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use corral_common::types::Endpoint;
use serde_json::json;
use tokio::process::Command;
use tracing::debug;

use super::{ProvisionError, Provisioner};

#[derive(Debug, Clone)]
pub struct PlaybookConfig {
    /// Executable to invoke, e.g. `ansible-playbook`.
    pub tool: String,
    pub create_user_playbook: String,
    pub delete_user_playbook: String,
    /// Administrative SSH identity on workers.
    pub ssh_user: String,
    pub ssh_pass: String,
    /// Per-invocation deadline.
    pub timeout: Duration,
    /// Host-loopback alias for container-internal worker addresses.
    pub host_alias: String,
}

impl Default for PlaybookConfig {
    fn default() -> Self {
        Self {
            tool: "ansible-playbook".into(),
            create_user_playbook: "/ansible/create_user.yml".into(),
            delete_user_playbook: "/ansible/delete_user.yml".into(),
            ssh_user: "root".into(),
            ssh_pass: "password".into(),
            timeout: Duration::from_secs(120),
            host_alias: corral_common::types::DEFAULT_HOST_ALIAS.into(),
        }
    }
}

pub struct PlaybookProvisioner {
    config: PlaybookConfig,
}

impl PlaybookProvisioner {
    pub fn new(config: PlaybookConfig) -> Self {
        Self { config }
    }

    async fn run_playbook(
        &self,
        playbook: &str,
        endpoint: &Endpoint,
        target_user: &str,
        target_pass: Option<&str>,
    ) -> Result<(), ProvisionError> {
        let dial_host = endpoint.dial_host(&self.config.host_alias);

        let mut extravars = json!({
            "ansible_host": dial_host,
            "ansible_port": endpoint.ssh_port,
            "ansible_user": self.config.ssh_user,
            "ansible_password": self.config.ssh_pass,
            "ansible_ssh_common_args":
                "-o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null",
            "target_user": target_user,
        });
        if let Some(pass) = target_pass {
            extravars["target_pass"] = json!(pass);
        }

        debug!(playbook, host = %dial_host, port = endpoint.ssh_port, target_user,
               "invoking provisioning playbook");

        let child = Command::new(&self.config.tool)
            .arg(playbook)
            .arg("-i")
            .arg(format!("{dial_host},"))
            .arg("--extra-vars")
            .arg(extravars.to_string())
            .env("ANSIBLE_HOST_KEY_CHECKING", "False")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let status = tokio::time::timeout(self.config.timeout, child.wait_with_output())
            .await
            .map_err(|_| ProvisionError::Timeout {
                timeout_secs: self.config.timeout.as_secs(),
            })??
            .status;

        if status.success() {
            Ok(())
        } else {
            Err(ProvisionError::Failed { code: status.code() })
        }
    }
}

#[async_trait]
impl Provisioner for PlaybookProvisioner {
    async fn create_user(
        &self,
        endpoint: &Endpoint,
        user: &str,
        secret: &str,
    ) -> Result<(), ProvisionError> {
        self.run_playbook(&self.config.create_user_playbook, endpoint, user, Some(secret)).await
    }

    async fn delete_user(
        &self,
        endpoint: &Endpoint,
        user: &str,
        secret: Option<&str>,
    ) -> Result<(), ProvisionError> {
        self.run_playbook(&self.config.delete_user_playbook, endpoint, user, secret).await
    }
}
