// End-to-end reconciliation scenarios against a real Postgres catalog.
//
// These tests need a database: set CORRAL_TEST_DATABASE_URL to run them,
// otherwise each test skips. Remote side effects are scripted through the
// recording provisioner and probe, so no worker fleet is involved. The
// claim queries operate on shared tables, so every test serializes on one
// guard and starts from a truncated catalog.

use std::sync::Arc;

use chrono::{Duration, Utc};
use corral_common::types::{NodeStatus, Role};
use corral_server::allocator::Allocator;
use corral_server::auth::Principal;
use corral_server::catalog::{self, Catalog};
use corral_server::db::migrations::run_migrations;
use corral_server::db::pool::{create_pg_pool, PoolConfig};
use corral_server::error::ErrorCode;
use corral_server::probe::{NodeProbe, ScriptedProbe};
use corral_server::provision::{ProvisionCall, Provisioner, RecordingProvisioner};
use corral_server::reconciler::{Reconciler, ReconcilerConfig};
use corral_server::vault::Vault;

const TEST_VAULT_KEY: &str = "Y29ycmFsLXRlc3QtdmF1bHQta2V5LTEyMzQ1Njc4OSE=";
const HOST_ALIAS: &str = "host.docker.internal";

static DB_GUARD: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

async fn test_catalog() -> Option<Catalog> {
    let Some(database_url) = std::env::var("CORRAL_TEST_DATABASE_URL").ok() else {
        eprintln!("skipping reconciliation postgres test: set CORRAL_TEST_DATABASE_URL");
        return None;
    };

    let config = PoolConfig { min_connections: 1, max_connections: 5, ..PoolConfig::default() };
    let pool = create_pg_pool(&database_url, config)
        .await
        .expect("test postgres pool should connect");
    run_migrations(&pool).await.expect("catalog migrations should apply");

    let catalog = Catalog::new(pool);
    sqlx::query("TRUNCATE leases, nodes, tenants RESTART IDENTITY CASCADE")
        .execute(catalog.pool())
        .await
        .expect("test catalog should truncate");

    Some(catalog)
}

struct Harness {
    catalog: Catalog,
    allocator: Allocator,
    reconciler: Reconciler,
    provisioner: Arc<RecordingProvisioner>,
    probe: Arc<ScriptedProbe>,
    vault: Vault,
}

fn harness(catalog: Catalog) -> Harness {
    let provisioner = Arc::new(RecordingProvisioner::new());
    let probe = Arc::new(ScriptedProbe::new());
    let vault = Vault::from_base64_key(TEST_VAULT_KEY).expect("test vault key should build");

    let provisioner_dyn: Arc<dyn Provisioner> = Arc::clone(&provisioner) as Arc<dyn Provisioner>;
    let probe_dyn: Arc<dyn NodeProbe> = Arc::clone(&probe) as Arc<dyn NodeProbe>;

    let allocator =
        Allocator::new(catalog.clone(), Arc::clone(&provisioner_dyn), vault.clone(), HOST_ALIAS);
    let reconciler = Reconciler::new(
        catalog.clone(),
        provisioner_dyn,
        probe_dyn,
        vault.clone(),
        ReconcilerConfig::default(),
    );

    Harness { catalog, allocator, reconciler, provisioner, probe, vault }
}

async fn seed_tenant(catalog: &Catalog, handle: &str, role: Role) -> Principal {
    let tenant = catalog
        .create_tenant(handle, "argon2-hash-placeholder", role)
        .await
        .expect("tenant should insert");
    Principal { id: tenant.id, handle: tenant.handle, role: tenant.role }
}

async fn seed_node(
    catalog: &Catalog,
    hostname: &str,
    status: NodeStatus,
    allocated: bool,
    needs_cleanup: bool,
    checked_secs_ago: i64,
) -> i64 {
    sqlx::query_scalar::<_, i64>(
        "INSERT INTO nodes (hostname, ssh_port, status, allocated, needs_cleanup, last_checked) \
         VALUES ($1, 2222, $2, $3, $4, $5) RETURNING id",
    )
    .bind(hostname)
    .bind(status.as_str())
    .bind(allocated)
    .bind(needs_cleanup)
    .bind(Utc::now() - Duration::seconds(checked_secs_ago))
    .fetch_one(catalog.pool())
    .await
    .expect("node should insert")
}

async fn node(catalog: &Catalog, node_id: i64) -> catalog::Node {
    catalog::node_by_id(catalog.pool(), node_id)
        .await
        .expect("node lookup should succeed")
        .expect("node should exist")
}

async fn lease(catalog: &Catalog, lease_id: i64) -> catalog::Lease {
    catalog::lease_by_id(catalog.pool(), lease_id)
        .await
        .expect("lease lookup should succeed")
        .expect("lease should exist")
}

async fn active_lease_on(catalog: &Catalog, node_id: i64) -> Option<catalog::Lease> {
    sqlx::query_as::<_, catalog::Lease>(
        "SELECT id, node_id, tenant_id, leased_from, leased_until, active, secret_enc \
         FROM leases WHERE node_id = $1 AND active",
    )
    .bind(node_id)
    .fetch_optional(catalog.pool())
    .await
    .expect("lease lookup should succeed")
}

/// I1: a node is allocated iff exactly one active lease references it.
async fn assert_exclusive_allocation(catalog: &Catalog) {
    let rows = sqlx::query_as::<_, (i64, bool, i64)>(
        "SELECT n.id, n.allocated, COUNT(l.id) FILTER (WHERE l.active) \
         FROM nodes n LEFT JOIN leases l ON l.node_id = n.id \
         GROUP BY n.id, n.allocated",
    )
    .fetch_all(catalog.pool())
    .await
    .expect("invariant query should succeed");

    for (node_id, allocated, active_leases) in rows {
        assert_eq!(
            allocated,
            active_leases == 1,
            "node {node_id}: allocated={allocated} but {active_leases} active lease(s)"
        );
    }
}

#[tokio::test]
async fn s1_rent_places_on_freshest_node_and_release_frees_it() {
    let _guard = DB_GUARD.lock().await;
    let Some(catalog) = test_catalog().await else { return };
    let h = harness(catalog);

    let alice = seed_tenant(&h.catalog, "alice", Role::Tenant).await;
    let n1 = seed_node(&h.catalog, "worker-1", NodeStatus::Alive, false, false, 5).await;
    let n2 = seed_node(&h.catalog, "worker-2", NodeStatus::Alive, false, false, 60).await;

    let allocated = h
        .allocator
        .rent(&alice, 1, Duration::hours(2), Some("s"))
        .await
        .expect("rent should succeed");

    assert_eq!(allocated.len(), 1);
    let allocation = &allocated[0];
    // worker-1 has the freshest last_checked, so it wins.
    assert_eq!(allocation.host, "worker-1");
    assert_eq!(allocation.user, "alice");
    assert_eq!(allocation.secret, "s");

    assert!(node(&h.catalog, n1).await.allocated);
    assert!(!node(&h.catalog, n2).await.allocated);
    let granted = lease(&h.catalog, allocation.lease_id).await;
    assert!(granted.active);
    assert_eq!(granted.leased_until, allocation.leased_until);
    assert_eq!(
        h.vault
            .decrypt_opt(granted.secret_enc.as_deref())
            .expect("stored secret should decrypt"),
        Some("s".to_owned())
    );
    assert_eq!(
        h.provisioner.calls(),
        vec![ProvisionCall::CreateUser {
            endpoint: node(&h.catalog, n1).await.endpoint,
            user: "alice".into(),
            secret: "s".into(),
        }]
    );
    assert_exclusive_allocation(&h.catalog).await;

    h.allocator.release(&alice, allocation.lease_id).await.expect("release should succeed");

    assert!(!lease(&h.catalog, allocation.lease_id).await.active);
    assert!(!node(&h.catalog, n1).await.allocated);
    let calls = h.provisioner.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(
        calls[1],
        ProvisionCall::DeleteUser {
            endpoint: node(&h.catalog, n1).await.endpoint,
            user: "alice".into(),
            secret: Some("s".into()),
        }
    );
    assert_exclusive_allocation(&h.catalog).await;
}

#[tokio::test]
async fn s2_insufficient_capacity_is_atomic() {
    let _guard = DB_GUARD.lock().await;
    let Some(catalog) = test_catalog().await else { return };
    let h = harness(catalog);

    let alice = seed_tenant(&h.catalog, "alice", Role::Tenant).await;
    let n1 = seed_node(&h.catalog, "worker-1", NodeStatus::Alive, false, false, 5).await;

    let error = h
        .allocator
        .rent(&alice, 2, Duration::hours(1), None)
        .await
        .expect_err("two nodes cannot come from a one-node pool");

    assert_eq!(error.code(), ErrorCode::InsufficientCapacity);
    assert_eq!(error.details()["found"], 1);

    // Catalog untouched, no provisioner traffic.
    assert!(!node(&h.catalog, n1).await.allocated);
    assert!(active_lease_on(&h.catalog, n1).await.is_none());
    assert_eq!(h.provisioner.call_count(), 0);
}

#[tokio::test]
async fn s3_provisioning_failure_rolls_back_everything() {
    let _guard = DB_GUARD.lock().await;
    let Some(catalog) = test_catalog().await else { return };
    let h = harness(catalog);

    let alice = seed_tenant(&h.catalog, "alice", Role::Tenant).await;
    let n1 = seed_node(&h.catalog, "worker-1", NodeStatus::Alive, false, false, 5).await;
    h.provisioner.script_failures([true]);

    let error = h
        .allocator
        .rent(&alice, 1, Duration::hours(1), None)
        .await
        .expect_err("a failing provisioner should fail the rent");

    assert_eq!(error.code(), ErrorCode::ProvisioningFailed);
    assert!(!node(&h.catalog, n1).await.allocated);
    assert!(active_lease_on(&h.catalog, n1).await.is_none());
    let lease_rows = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM leases")
        .fetch_one(h.catalog.pool())
        .await
        .expect("count should succeed");
    assert_eq!(lease_rows, 0);
}

#[tokio::test]
async fn s4_migration_moves_lease_with_window_and_secret_intact() {
    let _guard = DB_GUARD.lock().await;
    let Some(catalog) = test_catalog().await else { return };
    let h = harness(catalog);

    let alice = seed_tenant(&h.catalog, "alice", Role::Tenant).await;
    let dead = seed_node(&h.catalog, "worker-1", NodeStatus::Dead, true, false, 5).await;
    let fresh = seed_node(&h.catalog, "worker-2", NodeStatus::Alive, false, false, 5).await;

    let leased_from = Utc::now() - Duration::minutes(30);
    let leased_until = Utc::now() + Duration::hours(3);
    let secret_enc = h.vault.encrypt("s3cret").expect("secret should encrypt");
    let old = catalog::insert_lease(
        h.catalog.pool(),
        dead,
        alice.id,
        leased_from,
        leased_until,
        Some(&secret_enc),
    )
    .await
    .expect("lease should insert");

    let handled = h.reconciler.migration_tick().await.expect("migration tick should run");
    assert_eq!(handled, 1);

    assert!(!lease(&h.catalog, old.id).await.active);

    let moved = active_lease_on(&h.catalog, fresh).await.expect("replacement lease should exist");
    assert_eq!(moved.tenant_id, alice.id);
    assert_eq!(moved.leased_from, old.leased_from);
    assert_eq!(moved.leased_until, old.leased_until);
    assert_eq!(moved.secret_enc, old.secret_enc);

    let dead_node = node(&h.catalog, dead).await;
    assert!(!dead_node.allocated);
    assert!(dead_node.needs_cleanup);
    assert!(node(&h.catalog, fresh).await.allocated);

    assert_eq!(
        h.provisioner.calls(),
        vec![ProvisionCall::CreateUser {
            endpoint: node(&h.catalog, fresh).await.endpoint,
            user: "alice".into(),
            secret: "s3cret".into(),
        }]
    );
    assert_exclusive_allocation(&h.catalog).await;
}

#[tokio::test]
async fn s5_scrub_clears_resurrected_node_and_readmits_it() {
    let _guard = DB_GUARD.lock().await;
    let Some(catalog) = test_catalog().await else { return };
    let h = harness(catalog);

    let alice = seed_tenant(&h.catalog, "alice", Role::Tenant).await;
    // Resurrected after a migration: alive again, quarantined, one
    // historical (inactive) lease left behind.
    let n1 = seed_node(&h.catalog, "worker-1", NodeStatus::Alive, false, true, 5).await;
    let secret_enc = h.vault.encrypt("s3cret").expect("secret should encrypt");
    let old = catalog::insert_lease(
        h.catalog.pool(),
        n1,
        alice.id,
        Utc::now() - Duration::hours(2),
        Utc::now() + Duration::hours(1),
        Some(&secret_enc),
    )
    .await
    .expect("lease should insert");
    catalog::deactivate_lease(h.catalog.pool(), old.id).await.expect("lease should deactivate");

    // Quarantined nodes never count as capacity (I4).
    let error = h
        .allocator
        .rent(&alice, 1, Duration::hours(1), None)
        .await
        .expect_err("quarantined node must not be rented");
    assert_eq!(error.code(), ErrorCode::InsufficientCapacity);
    assert_eq!(error.details()["found"], 0);

    let cleared = h.reconciler.scrub_tick().await.expect("scrub tick should run");
    assert_eq!(cleared, 1);

    assert!(!node(&h.catalog, n1).await.needs_cleanup);
    assert_eq!(
        h.provisioner.calls(),
        vec![ProvisionCall::DeleteUser {
            endpoint: node(&h.catalog, n1).await.endpoint,
            user: "alice".into(),
            secret: Some("s3cret".into()),
        }]
    );

    let allocated = h
        .allocator
        .rent(&alice, 1, Duration::hours(1), None)
        .await
        .expect("scrubbed node should be rentable again");
    assert_eq!(allocated[0].host, "worker-1");
    assert_exclusive_allocation(&h.catalog).await;
}

#[tokio::test]
async fn s6_expiry_retries_until_the_provisioner_recovers() {
    let _guard = DB_GUARD.lock().await;
    let Some(catalog) = test_catalog().await else { return };
    let h = harness(catalog);

    let alice = seed_tenant(&h.catalog, "alice", Role::Tenant).await;
    let n1 = seed_node(&h.catalog, "worker-1", NodeStatus::Alive, true, false, 5).await;
    let secret_enc = h.vault.encrypt("s3cret").expect("secret should encrypt");
    let expired = catalog::insert_lease(
        h.catalog.pool(),
        n1,
        alice.id,
        Utc::now() - Duration::hours(2),
        Utc::now() - Duration::hours(1),
        Some(&secret_enc),
    )
    .await
    .expect("lease should insert");

    // First pass: provisioner flaps, nothing is reclaimed.
    h.provisioner.script_failures([true]);
    let reclaimed = h.reconciler.expiry_tick().await.expect("expiry tick should run");
    assert_eq!(reclaimed, 0);
    assert!(lease(&h.catalog, expired.id).await.active);
    assert!(node(&h.catalog, n1).await.allocated);
    assert_eq!(h.reconciler.stats().expiry.provision_failures(), 1);

    // Second pass: provisioner healthy, lease reclaimed.
    let reclaimed = h.reconciler.expiry_tick().await.expect("expiry tick should run");
    assert_eq!(reclaimed, 1);
    assert!(!lease(&h.catalog, expired.id).await.active);
    assert!(!node(&h.catalog, n1).await.allocated);

    let deletes: Vec<_> = h
        .provisioner
        .calls()
        .into_iter()
        .filter(|call| matches!(call, ProvisionCall::DeleteUser { .. }))
        .collect();
    assert_eq!(deletes.len(), 2);
    assert_exclusive_allocation(&h.catalog).await;
}

#[tokio::test]
async fn health_marker_prevents_reprobing_within_stale_period() {
    let _guard = DB_GUARD.lock().await;
    let Some(catalog) = test_catalog().await else { return };
    let h = harness(catalog);

    let n1 = seed_node(&h.catalog, "worker-1", NodeStatus::Unknown, false, false, 3600).await;
    let n2 = seed_node(&h.catalog, "worker-2", NodeStatus::Alive, false, false, 3600).await;
    h.probe.set_verdict("worker-1", NodeStatus::Alive);
    // worker-2 is unscripted and probes dead.

    let probed = h.reconciler.health_tick().await.expect("health tick should run");
    assert_eq!(probed, 2);
    assert_eq!(node(&h.catalog, n1).await.status, NodeStatus::Alive);
    assert_eq!(node(&h.catalog, n2).await.status, NodeStatus::Dead);

    // The marker update keeps freshly probed nodes out of the next claim.
    let probed_again = h.reconciler.health_tick().await.expect("health tick should run");
    assert_eq!(probed_again, 0);
}

#[tokio::test]
async fn migration_waits_for_capacity_then_completes() {
    let _guard = DB_GUARD.lock().await;
    let Some(catalog) = test_catalog().await else { return };
    let h = harness(catalog);

    let alice = seed_tenant(&h.catalog, "alice", Role::Tenant).await;
    let dead = seed_node(&h.catalog, "worker-1", NodeStatus::Dead, true, false, 5).await;
    let secret_enc = h.vault.encrypt("s3cret").expect("secret should encrypt");
    let stranded = catalog::insert_lease(
        h.catalog.pool(),
        dead,
        alice.id,
        Utc::now() - Duration::minutes(5),
        Utc::now() + Duration::hours(1),
        Some(&secret_enc),
    )
    .await
    .expect("lease should insert");

    // No replacement available: the lease stays put for a later retry.
    h.reconciler.migration_tick().await.expect("migration tick should run");
    assert!(lease(&h.catalog, stranded.id).await.active);
    assert!(node(&h.catalog, dead).await.allocated);

    // Capacity appears; the next iteration finishes the job.
    let fresh = seed_node(&h.catalog, "worker-2", NodeStatus::Alive, false, false, 5).await;
    h.reconciler.migration_tick().await.expect("migration tick should run");

    assert!(!lease(&h.catalog, stranded.id).await.active);
    assert!(active_lease_on(&h.catalog, fresh).await.is_some());
    assert!(node(&h.catalog, dead).await.needs_cleanup);
    assert_exclusive_allocation(&h.catalog).await;
}

#[tokio::test]
async fn skip_locked_claims_never_hand_out_held_rows() {
    let _guard = DB_GUARD.lock().await;
    let Some(catalog) = test_catalog().await else { return };

    seed_node(&catalog, "worker-1", NodeStatus::Alive, false, false, 5).await;

    let mut tx_a = catalog.begin().await.expect("tx a should begin");
    let claimed_a = catalog::claim_eligible_nodes(&mut *tx_a, 1, None)
        .await
        .expect("claim a should succeed");
    assert_eq!(claimed_a.len(), 1);

    // A peer transaction skips the locked row instead of blocking on it.
    let mut tx_b = catalog.begin().await.expect("tx b should begin");
    let claimed_b = catalog::claim_eligible_nodes(&mut *tx_b, 1, None)
        .await
        .expect("claim b should succeed");
    assert!(claimed_b.is_empty());

    // Once the holder rolls back, the row is claimable again.
    tx_a.rollback().await.expect("tx a should roll back");
    let claimed_b = catalog::claim_eligible_nodes(&mut *tx_b, 1, None)
        .await
        .expect("claim b retry should succeed");
    assert_eq!(claimed_b.len(), 1);
    tx_b.rollback().await.expect("tx b should roll back");
}

#[tokio::test]
async fn release_and_extend_enforce_ownership() {
    let _guard = DB_GUARD.lock().await;
    let Some(catalog) = test_catalog().await else { return };
    let h = harness(catalog);

    let alice = seed_tenant(&h.catalog, "alice", Role::Tenant).await;
    let mallory = seed_tenant(&h.catalog, "mallory", Role::Tenant).await;
    let admin = seed_tenant(&h.catalog, "ops", Role::Admin).await;
    seed_node(&h.catalog, "worker-1", NodeStatus::Alive, false, false, 5).await;

    let allocated = h
        .allocator
        .rent(&alice, 1, Duration::hours(1), None)
        .await
        .expect("rent should succeed");
    let lease_id = allocated[0].lease_id;

    let denied = h
        .allocator
        .extend(&mallory, lease_id, Duration::hours(1))
        .await
        .expect_err("cross-tenant extend must be denied");
    assert_eq!(denied.code(), ErrorCode::PermissionDenied);

    let before = lease(&h.catalog, lease_id).await.leased_until;
    let after = h
        .allocator
        .extend(&alice, lease_id, Duration::hours(3))
        .await
        .expect("owner extend should succeed");
    assert_eq!(after, before + Duration::hours(3));

    let denied = h
        .allocator
        .release(&mallory, lease_id)
        .await
        .expect_err("cross-tenant release must be denied");
    assert_eq!(denied.code(), ErrorCode::PermissionDenied);

    h.allocator.release(&admin, lease_id).await.expect("admin release should succeed");
    assert!(!lease(&h.catalog, lease_id).await.active);

    let not_active = h
        .allocator
        .release(&alice, lease_id)
        .await
        .expect_err("double release must fail");
    assert_eq!(not_active.code(), ErrorCode::NotActive);

    let not_found = h
        .allocator
        .release(&alice, 424242)
        .await
        .expect_err("unknown lease must fail");
    assert_eq!(not_found.code(), ErrorCode::NotFound);
}

#[tokio::test]
async fn duplicate_worker_registration_conflicts() {
    let _guard = DB_GUARD.lock().await;
    let Some(catalog) = test_catalog().await else { return };

    let first = catalog
        .register_node("172.17.0.9", 2222)
        .await
        .expect("first registration should succeed");
    assert_eq!(first.status, NodeStatus::Unknown);

    let duplicate = catalog
        .register_node("172.17.0.9", 2222)
        .await
        .expect_err("duplicate registration should conflict");
    assert!(corral_server::error::is_unique_violation(&duplicate));
}
