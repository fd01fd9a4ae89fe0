// Worker-side registration agent.
//
// Runs on each worker next to sshd. On startup it announces the worker's
// endpoint to the control plane and retries until the registration lands
// (201) or turns out to already exist (409, e.g. after a worker restart).
// The control plane's health loop takes it from there.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use corral_common::protocol::RegisterWorkerRequest;
use reqwest::StatusCode;
use tracing::{info, warn};

const DEFAULT_RETRY_DELAY_SECS: u64 = 10;
const MAX_ATTEMPTS: u32 = 10;

#[derive(Debug, Parser)]
#[command(name = "corral-agent", about = "corral worker registration agent")]
struct Args {
    /// Base URL of the control plane.
    #[arg(long, env = "CORRAL_API_ENDPOINT", default_value = "http://host.docker.internal:8080")]
    api_endpoint: String,

    /// Hostname or address to register; defaults to the machine hostname.
    #[arg(long, env = "CORRAL_AGENT_HOSTNAME")]
    hostname: Option<String>,

    /// Externally reachable SSH port of this worker.
    #[arg(long, env = "CORRAL_AGENT_SSH_PORT")]
    ssh_port: u16,

    /// Seconds between registration attempts.
    #[arg(long, env = "CORRAL_AGENT_RETRY_SECS", default_value_t = DEFAULT_RETRY_DELAY_SECS)]
    retry_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let hostname = match args.hostname.clone() {
        Some(hostname) => hostname,
        None => local_hostname().context("could not determine local hostname")?,
    };

    let request = RegisterWorkerRequest { hostname, ssh_port: args.ssh_port };
    register_with_retry(
        &args.api_endpoint,
        &request,
        MAX_ATTEMPTS,
        Duration::from_secs(args.retry_secs),
    )
    .await
}

fn local_hostname() -> Result<String> {
    let output = std::process::Command::new("hostname")
        .output()
        .context("failed to run hostname")?;
    let hostname = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    if hostname.is_empty() {
        bail!("hostname returned nothing");
    }
    Ok(hostname)
}

async fn register_with_retry(
    api_endpoint: &str,
    request: &RegisterWorkerRequest,
    max_attempts: u32,
    retry_delay: Duration,
) -> Result<()> {
    let url = format!("{}/api/workers/register", api_endpoint.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .context("failed to build http client")?;

    info!(%url, hostname = %request.hostname, ssh_port = request.ssh_port,
          "registering worker with control plane");

    for attempt in 1..=max_attempts {
        match client.post(&url).json(request).send().await {
            Ok(response) => match response.status() {
                StatusCode::OK | StatusCode::CREATED => {
                    info!("worker registered");
                    return Ok(());
                }
                // Already registered, e.g. the worker restarted.
                StatusCode::CONFLICT => {
                    info!("worker already registered");
                    return Ok(());
                }
                status => {
                    warn!(attempt, %status, "registration rejected, retrying");
                }
            },
            Err(error) => {
                warn!(attempt, %error, "control plane unreachable, retrying");
            }
        }

        if attempt < max_attempts {
            tokio::time::sleep(retry_delay).await;
        }
    }

    bail!("failed to register worker after {max_attempts} attempts")
}
