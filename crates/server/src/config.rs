// Control-plane configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The DB pool sizing has its own env block in db/pool.rs;
// this module covers the core server settings.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Result};
use corral_common::types::DEFAULT_HOST_ALIAS;

const DEV_JWT_SECRET: &str = "corral_local_development_jwt_secret_must_be_32_chars";
const DEV_VAULT_KEY: &str = "Y29ycmFsLWRldi12YXVsdC1rZXktMDEyMzQ1Njc4OSE=";

/// Core control-plane configuration.
///
/// Constructed via [`ServerConfig::from_env`] which reads environment
/// variables and falls back to sensible development defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// PostgreSQL connection string for the catalog.
    pub database_url: Option<String>,
    /// JWT signing secret for access tokens.
    pub jwt_secret: String,
    /// Base64-encoded 32-byte key for lease-secret encryption at rest.
    pub vault_key: String,
    /// Administrative SSH user the probe and provisioner authenticate as.
    pub worker_ssh_user: String,
    /// Administrative SSH password for the above.
    pub worker_ssh_pass: String,
    /// Playbook identifier handed to the provisioning tool for user creation.
    pub create_user_playbook: String,
    /// Playbook identifier handed to the provisioning tool for user removal.
    pub delete_user_playbook: String,
    /// Per-invocation timeout for provisioning calls.
    pub provision_timeout: Duration,
    /// Time budget for a single liveness probe.
    pub probe_timeout: Duration,
    /// Cadences of the four reconciliation loops.
    pub health_interval: Duration,
    pub migration_interval: Duration,
    pub expiry_interval: Duration,
    pub scrub_interval: Duration,
    /// A node whose `last_checked` is older than this is due for a probe.
    pub stale_period: Duration,
    /// Host-loopback alias substituted for container-internal addresses.
    pub host_alias: String,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `corral_server=debug`).
    pub log_filter: String,
}

impl ServerConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `CORRAL_HOST` | `0.0.0.0` |
    /// | `CORRAL_PORT` | `8080` |
    /// | `CORRAL_DATABASE_URL` | *(none)* |
    /// | `CORRAL_JWT_SECRET` | dev-only placeholder |
    /// | `CORRAL_VAULT_KEY` | dev-only placeholder |
    /// | `CORRAL_WORKER_SSH_USER` | `root` |
    /// | `CORRAL_WORKER_SSH_PASS` | `password` |
    /// | `CORRAL_CREATE_USER_PLAYBOOK` | `/ansible/create_user.yml` |
    /// | `CORRAL_DELETE_USER_PLAYBOOK` | `/ansible/delete_user.yml` |
    /// | `CORRAL_PROVISION_TIMEOUT_SECS` | `120` |
    /// | `CORRAL_PROBE_TIMEOUT_SECS` | `5` |
    /// | `CORRAL_HEALTH_INTERVAL_SECS` | `30` |
    /// | `CORRAL_MIGRATION_INTERVAL_SECS` | `10` |
    /// | `CORRAL_EXPIRY_INTERVAL_SECS` | `60` |
    /// | `CORRAL_SCRUB_INTERVAL_SECS` | `30` |
    /// | `CORRAL_STALE_PERIOD_SECS` | `30` |
    /// | `CORRAL_HOST_ALIAS` | `host.docker.internal` |
    /// | `CORRAL_CORS_ORIGINS` | *(none — cors.rs uses dev defaults)* |
    /// | `CORRAL_LOG_FILTER` | `info` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("CORRAL_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("CORRAL_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let secs = |key: &str, default: u64| {
            Duration::from_secs(env(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default))
        };

        Self {
            listen_addr,
            database_url: env("CORRAL_DATABASE_URL").ok(),
            jwt_secret: env("CORRAL_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into()),
            vault_key: env("CORRAL_VAULT_KEY").unwrap_or_else(|_| DEV_VAULT_KEY.into()),
            worker_ssh_user: env("CORRAL_WORKER_SSH_USER").unwrap_or_else(|_| "root".into()),
            worker_ssh_pass: env("CORRAL_WORKER_SSH_PASS").unwrap_or_else(|_| "password".into()),
            create_user_playbook: env("CORRAL_CREATE_USER_PLAYBOOK")
                .unwrap_or_else(|_| "/ansible/create_user.yml".into()),
            delete_user_playbook: env("CORRAL_DELETE_USER_PLAYBOOK")
                .unwrap_or_else(|_| "/ansible/delete_user.yml".into()),
            provision_timeout: secs("CORRAL_PROVISION_TIMEOUT_SECS", 120),
            probe_timeout: secs("CORRAL_PROBE_TIMEOUT_SECS", 5),
            health_interval: secs("CORRAL_HEALTH_INTERVAL_SECS", 30),
            migration_interval: secs("CORRAL_MIGRATION_INTERVAL_SECS", 10),
            expiry_interval: secs("CORRAL_EXPIRY_INTERVAL_SECS", 60),
            scrub_interval: secs("CORRAL_SCRUB_INTERVAL_SECS", 30),
            stale_period: secs("CORRAL_STALE_PERIOD_SECS", 30),
            host_alias: env("CORRAL_HOST_ALIAS").unwrap_or_else(|_| DEFAULT_HOST_ALIAS.into()),
            cors_origins: env("CORRAL_CORS_ORIGINS").ok(),
            log_filter: env("CORRAL_LOG_FILTER").unwrap_or_else(|_| "info".into()),
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }

    /// Returns true when using the development-only vault key.
    pub fn is_dev_vault_key(&self) -> bool {
        self.vault_key == DEV_VAULT_KEY
    }

    /// Validate cross-field requirements before startup.
    pub fn validate(&self) -> Result<()> {
        if self.jwt_secret.len() < 32 {
            bail!("CORRAL_JWT_SECRET must be at least 32 characters long");
        }
        if self.stale_period.is_zero() {
            bail!("CORRAL_STALE_PERIOD_SECS must be positive");
        }
        if self.probe_timeout.is_zero() {
            bail!("CORRAL_PROBE_TIMEOUT_SECS must be positive");
        }
        Ok(())
    }
}
