//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p saga-store --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{ActivationId, ChatId, ProfileId};
use domain::{Amount, Saga, SagaFlag, SagaStatus, Version};
use saga_store::{PostgresSagaStore, SagaStore, SagaStoreError, SagaStoreExt, TransitionOptions};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            // Create a temporary pool just for migrations
            let temp_pool = PgPool::connect(&connection_string).await.unwrap();

            // Run migrations using raw_sql to execute multiple statements
            sqlx::raw_sql(include_str!("../../../migrations/001_create_sagas_table.sql"))
                .execute(&temp_pool)
                .await
                .unwrap();

            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store() -> PostgresSagaStore {
    let info = get_container_info().await;

    // Create a fresh pool for each test to avoid connection issues
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    // Clear tables for test isolation
    sqlx::query("TRUNCATE TABLE sagas")
        .execute(&pool)
        .await
        .unwrap();

    PostgresSagaStore::new(pool)
}

fn create_test_saga(activation: i64, delay: Duration) -> Saga {
    Saga::scheduled(
        ActivationId::new(activation),
        ProfileId::new(42),
        ChatId::new(4200),
        Amount::new(2.5).unwrap(),
        delay,
        Utc::now(),
    )
    .unwrap()
}

#[tokio::test]
#[serial]
async fn insert_and_load_roundtrip() {
    let store = get_test_store().await;
    let saga = create_test_saga(1001, Duration::from_secs(180));

    let inserted = store.insert(saga.clone()).await.unwrap();
    assert_eq!(inserted.id, saga.id);
    assert_eq!(inserted.status, SagaStatus::Scheduled);
    assert_eq!(inserted.version, Version::first());

    let loaded = store.get_required(ActivationId::new(1001)).await.unwrap();
    assert_eq!(loaded.profile_id, ProfileId::new(42));
    assert_eq!(loaded.amount.as_f64(), 2.5);
    assert!(loaded.run_at.is_some());
}

#[tokio::test]
#[serial]
async fn duplicate_activation_is_rejected() {
    let store = get_test_store().await;
    store
        .insert(create_test_saga(1001, Duration::ZERO))
        .await
        .unwrap();

    let result = store.insert(create_test_saga(1001, Duration::ZERO)).await;
    assert!(matches!(result, Err(SagaStoreError::AlreadyExists(id)) if id.as_i64() == 1001));
}

#[tokio::test]
#[serial]
async fn conditional_transition_commits_once() {
    let store = get_test_store().await;
    let saga = store
        .insert(create_test_saga(1001, Duration::ZERO))
        .await
        .unwrap();

    let checking = store
        .transition(
            saga.activation_id,
            SagaStatus::Checking,
            TransitionOptions::from_current(&saga),
        )
        .await
        .unwrap();
    assert_eq!(checking.version, Version::new(2));
    assert!(checking.run_at.is_none());

    // Same stale guard a second time
    let result = store
        .transition(
            saga.activation_id,
            SagaStatus::Cancelling,
            TransitionOptions::new(saga.version, &SagaStatus::CANCELLABLE),
        )
        .await;
    assert!(matches!(
        result,
        Err(SagaStoreError::ConcurrencyConflict { .. })
    ));
}

#[tokio::test]
#[serial]
async fn transition_outside_source_set_reports_status() {
    let store = get_test_store().await;
    let saga = store
        .insert(create_test_saga(1001, Duration::ZERO))
        .await
        .unwrap();

    let result = store
        .transition(
            saga.activation_id,
            SagaStatus::Refunded,
            TransitionOptions::new(saga.version, &SagaStatus::COMPENSABLE),
        )
        .await;

    assert!(matches!(
        result,
        Err(SagaStoreError::StatusConflict {
            actual: SagaStatus::Scheduled,
            to: SagaStatus::Refunded,
            ..
        })
    ));
}

#[tokio::test]
#[serial]
async fn racing_transitions_have_one_winner() {
    let store = get_test_store().await;
    let saga = store
        .insert(create_test_saga(1001, Duration::ZERO))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for target in [SagaStatus::Checking, SagaStatus::Cancelling] {
        let store = store.clone();
        let options = TransitionOptions::new(saga.version, &[SagaStatus::Scheduled]);
        handles.push(tokio::spawn(async move {
            store
                .transition(ActivationId::new(1001), target, options)
                .await
        }));
    }

    let mut wins = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1);

    let stored = store.get_required(ActivationId::new(1001)).await.unwrap();
    assert_eq!(stored.version, Version::new(2));
}

#[tokio::test]
#[serial]
async fn due_and_stalled_queries() {
    let store = get_test_store().await;
    store
        .insert(create_test_saga(1, Duration::ZERO))
        .await
        .unwrap();
    store
        .insert(create_test_saga(2, Duration::from_secs(3600)))
        .await
        .unwrap();

    let due = store
        .list_due(Utc::now() + chrono::Duration::seconds(1), 10)
        .await
        .unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].activation_id, ActivationId::new(1));

    store
        .transition(
            due[0].activation_id,
            SagaStatus::Checking,
            TransitionOptions::from_current(&due[0]),
        )
        .await
        .unwrap();

    let stalled = store
        .list_stalled(Utc::now() + chrono::Duration::seconds(1), 10)
        .await
        .unwrap();
    assert_eq!(stalled.len(), 1);
    assert_eq!(stalled[0].status, SagaStatus::Checking);
}

#[tokio::test]
#[serial]
async fn credit_and_flag_bookkeeping() {
    let store = get_test_store().await;
    let saga = store
        .insert(create_test_saga(1001, Duration::ZERO))
        .await
        .unwrap();

    let premature = store.mark_credited(saga.activation_id, Utc::now()).await;
    assert!(matches!(
        premature,
        Err(SagaStoreError::StatusConflict { .. })
    ));

    let cancelling = store
        .transition(
            saga.activation_id,
            SagaStatus::Cancelling,
            TransitionOptions::from_current(&saga),
        )
        .await
        .unwrap();
    let refunded = store
        .transition(
            saga.activation_id,
            SagaStatus::Refunded,
            TransitionOptions::from_current(&cancelling),
        )
        .await
        .unwrap();

    let credited = store
        .mark_credited(refunded.activation_id, Utc::now())
        .await
        .unwrap();
    assert!(credited.credited_at.is_some());

    let flagged = store
        .flag(
            saga.activation_id,
            SagaFlag::Reconciliation,
            "ledger unreachable",
        )
        .await
        .unwrap();
    assert_eq!(flagged.flag, Some(SagaFlag::Reconciliation));
    assert_eq!(flagged.version, credited.version);

    let listed = store
        .list_flagged(SagaFlag::Reconciliation, 10)
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].last_error.as_deref(), Some("ledger unreachable"));
}
