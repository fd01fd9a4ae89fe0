use corral_server::db::migrations::run_migrations;
use corral_server::db::pool::{create_pg_pool, PoolConfig};

const EXPECTED_TABLES: &[&str] = &["tenants", "nodes", "leases"];

#[tokio::test]
async fn catalog_migrations_create_expected_tables() {
    let Some(database_url) = std::env::var("CORRAL_TEST_DATABASE_URL").ok() else {
        eprintln!("skipping db migration integration test: set CORRAL_TEST_DATABASE_URL");
        return;
    };

    let config = PoolConfig { min_connections: 1, max_connections: 2, ..PoolConfig::default() };

    let pool =
        create_pg_pool(&database_url, config).await.expect("pool should connect to test database");

    run_migrations(&pool).await.expect("migrations should apply");

    let table_names: Vec<String> = sqlx::query_scalar::<_, String>(
        "SELECT table_name \
         FROM information_schema.tables \
         WHERE table_schema = 'public'",
    )
    .fetch_all(&pool)
    .await
    .expect("table lookup should succeed");

    for expected_table in EXPECTED_TABLES {
        assert!(
            table_names.iter().any(|name| name == expected_table),
            "expected table `{expected_table}` to exist after migrations"
        );
    }

    let indexes: Vec<String> = sqlx::query_scalar::<_, String>(
        "SELECT indexname FROM pg_indexes WHERE schemaname = 'public'",
    )
    .fetch_all(&pool)
    .await
    .expect("index lookup should succeed");

    // One-active-lease-per-node and the expiry join support must exist.
    for expected_index in ["leases_one_active_per_node", "leases_active_until"] {
        assert!(
            indexes.iter().any(|name| name == expected_index),
            "expected index `{expected_index}` to exist after migrations"
        );
    }
}
