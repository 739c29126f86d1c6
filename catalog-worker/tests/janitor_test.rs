//! Integration tests for the retention janitor
//!
//! Records are inserted directly so `deleted_at` can be backdated.

use catalog_orchestrator::{GatewayConfig, HttpResourceGateway, Orchestrator};
use catalog_worker::{purge_expired, start_janitor_task};
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

/// Helper to create an in-memory test database with migrations
async fn create_test_db() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    // Run migrations from catalog-orchestrator
    sqlx::migrate!("../catalog-orchestrator/migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

fn orchestrator(pool: SqlitePool) -> Orchestrator {
    // Never contacted: purging is purely local.
    let gateway = HttpResourceGateway::new(&GatewayConfig {
        base_url: "http://127.0.0.1:9".to_string(),
        admin_token: None,
        request_timeout_secs: 1,
    })
    .unwrap();
    Orchestrator::new(pool, Arc::new(gateway))
}

async fn insert_instance(pool: &SqlitePool, name: &str, status: &str, deleted_ago_secs: Option<i64>) -> i64 {
    let now = Utc::now().timestamp();
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO service_instances
            (uuid, name, account_id, service_definition_id, plugin_type, backend,
             status, created_at, updated_at, deleted_at)
         VALUES (?, ?, 'acct-1', 'efs-openstack', 'storage_efs', 'openstack', ?, ?, ?, ?)
         RETURNING id",
    )
    .bind(format!("uuid-{name}"))
    .bind(name)
    .bind(status)
    .bind(now - 30 * 24 * 3600)
    .bind(now)
    .bind(deleted_ago_secs.map(|ago| now - ago))
    .fetch_one(pool)
    .await
    .expect("Failed to insert instance");

    sqlx::query(
        "INSERT INTO operations (id, instance_id, operation_type, request_id, status, started_at)
         VALUES (?, ?, 'delete', 'req-test', 'success', ?)",
    )
    .bind(format!("op-{name}"))
    .bind(id)
    .bind(now)
    .execute(pool)
    .await
    .expect("Failed to insert operation");

    id
}

async fn remaining_names(pool: &SqlitePool) -> Vec<String> {
    sqlx::query_scalar("SELECT name FROM service_instances ORDER BY name")
        .fetch_all(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_purges_only_expired_deleted_records() {
    let pool = create_test_db().await;
    insert_instance(&pool, "old-deleted", "deleted", Some(2 * 24 * 3600)).await;
    insert_instance(&pool, "fresh-deleted", "deleted", Some(60)).await;
    insert_instance(&pool, "active", "active", None).await;
    insert_instance(&pool, "errored", "error", None).await;

    let orchestrator = orchestrator(pool.clone());
    let purged = purge_expired(&orchestrator, Duration::from_secs(24 * 3600))
        .await
        .unwrap();

    assert_eq!(purged, 1);
    assert_eq!(
        remaining_names(&pool).await,
        vec!["active", "errored", "fresh-deleted"]
    );

    let orphaned: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM operations WHERE id = 'op-old-deleted'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(orphaned, 0);

    // A second pass has nothing left to do.
    assert_eq!(
        purge_expired(&orchestrator, Duration::from_secs(24 * 3600))
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_janitor_task_runs_immediately() {
    let pool = create_test_db().await;
    insert_instance(&pool, "old-deleted", "deleted", Some(3600)).await;
    insert_instance(&pool, "active", "active", None).await;

    let orchestrator = Arc::new(orchestrator(pool.clone()));
    let janitor = tokio::spawn(start_janitor_task(orchestrator, 3600, 60));

    let mut remaining = remaining_names(&pool).await;
    for _ in 0..50 {
        if remaining.len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        remaining = remaining_names(&pool).await;
    }
    janitor.abort();

    assert_eq!(remaining, vec!["active"]);
}
