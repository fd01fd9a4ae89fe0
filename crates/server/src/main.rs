use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use corral_server::allocator::Allocator;
use corral_server::api::{build_router, ApiState};
use corral_server::auth::jwt::JwtService;
use corral_server::catalog::Catalog;
use corral_server::config::ServerConfig;
use corral_server::cors::cors_layer;
use corral_server::db::migrations::run_migrations;
use corral_server::db::pool::{check_pool_health, create_pg_pool, PoolConfig};
use corral_server::probe::TcpProbe;
use corral_server::provision::{PlaybookConfig, PlaybookProvisioner, Provisioner};
use corral_server::reconciler::{Reconciler, ReconcilerConfig};
use corral_server::vault::Vault;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = ServerConfig::from_env();
    cfg.validate().context("control-plane configuration is invalid")?;

    tracing_subscriber::fmt()
        .json()
        .flatten_event(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.log_filter)),
        )
        .init();

    if cfg.is_dev_jwt_secret() {
        tracing::warn!("using development JWT secret — set CORRAL_JWT_SECRET in production");
    }
    if cfg.is_dev_vault_key() {
        tracing::warn!("using development vault key — set CORRAL_VAULT_KEY in production");
    }

    let database_url = cfg
        .database_url
        .as_deref()
        .context("CORRAL_DATABASE_URL must be set")?;
    let pool = create_pg_pool(database_url, PoolConfig::from_env())
        .await
        .context("failed to initialize catalog PostgreSQL pool")?;
    check_pool_health(&pool).await.context("catalog PostgreSQL health check failed")?;
    run_migrations(&pool).await?;

    let catalog = Catalog::new(pool);
    let vault = Vault::from_base64_key(&cfg.vault_key).context("invalid vault key")?;
    let jwt = Arc::new(JwtService::new(&cfg.jwt_secret).context("invalid JWT secret")?);

    let provisioner: Arc<dyn Provisioner> = Arc::new(PlaybookProvisioner::new(PlaybookConfig {
        tool: "ansible-playbook".into(),
        create_user_playbook: cfg.create_user_playbook.clone(),
        delete_user_playbook: cfg.delete_user_playbook.clone(),
        ssh_user: cfg.worker_ssh_user.clone(),
        ssh_pass: cfg.worker_ssh_pass.clone(),
        timeout: cfg.provision_timeout,
        host_alias: cfg.host_alias.clone(),
    }));
    let probe = Arc::new(TcpProbe::new(cfg.probe_timeout, cfg.host_alias.clone()));

    let allocator =
        Allocator::new(catalog.clone(), Arc::clone(&provisioner), vault.clone(), &cfg.host_alias);

    let reconciler = Arc::new(Reconciler::new(
        catalog.clone(),
        provisioner,
        probe,
        vault,
        ReconcilerConfig {
            health_interval: cfg.health_interval,
            migration_interval: cfg.migration_interval,
            expiry_interval: cfg.expiry_interval,
            scrub_interval: cfg.scrub_interval,
            stale_period: cfg.stale_period,
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loop_handles = Arc::clone(&reconciler).spawn(shutdown_rx);
    info!(
        health = ?cfg.health_interval,
        migration = ?cfg.migration_interval,
        expiry = ?cfg.expiry_interval,
        scrub = ?cfg.scrub_interval,
        "reconciliation loops started"
    );

    let app = build_router(ApiState { catalog, allocator, jwt })
        .layer(cors_layer(cfg.cors_origins.as_deref()));

    let listener = TcpListener::bind(cfg.listen_addr)
        .await
        .with_context(|| format!("failed to bind control-plane listener on {}", cfg.listen_addr))?;

    info!(listen_addr = %cfg.listen_addr, "starting corral control plane");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("control-plane server exited unexpectedly")?;

    shutdown_tx.send(true).ok();
    for handle in loop_handles {
        if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
            tracing::warn!("reconciliation loop did not stop within shutdown budget");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
