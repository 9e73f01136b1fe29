use std::time::Duration;

use chrono::Utc;
use fleet_dispatch::dispatch::models::{MissionQueueItem, Point, QueueStatus};
use fleet_dispatch::dispatch::store::{CancelOutcome, PgQueueStore, QueueStore};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

// These tests need a reachable Postgres. They skip themselves when neither
// TEST_DATABASE_URL nor DATABASE_URL is set, so the in-memory suites still
// run everywhere.
async fn connect() -> Result<PgPool, String> {
    let url = std::env::var("TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .map_err(|_| "TEST_DATABASE_URL is not set".to_string())?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&url)
        .await
        .map_err(|e| format!("failed to connect to Postgres: {e}"))?;

    sqlx::migrate!()
        .run(&pool)
        .await
        .map_err(|e| format!("failed to run migrations: {e}"))?;

    Ok(pool)
}

// Tests share one database, so each works against its own map code and
// robot id and touches rows only by primary key.
fn unique_map() -> String {
    format!("MAP-PG-{}", Uuid::new_v4().simple())
}

fn item_on(map_code: &str, priority: i32) -> MissionQueueItem {
    MissionQueueItem::enqueue(
        format!("M-{}", Uuid::new_v4().simple()),
        map_code.to_string(),
        Point::new(1.0, 2.0),
        priority,
        false,
    )
}

// ---------------------------------------------------------------------------
// 1. Round trip through the mission_queue table
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_insert_and_fetch_round_trip() {
    let pool = match connect().await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Skipping: {e}");
            return;
        }
    };
    let store = PgQueueStore::new(pool);

    let item = item_on(&unique_map(), 7);
    store.insert(&item).await.unwrap();

    let fetched = store
        .get(item.queue_item_id)
        .await
        .unwrap()
        .expect("inserted item should be fetchable");
    assert_eq!(fetched.queue_item_id, item.queue_item_id);
    assert_eq!(fetched.queue_item_code, item.queue_item_code);
    assert_eq!(fetched.mission_code, item.mission_code);
    assert_eq!(fetched.primary_map_code, item.primary_map_code);
    assert_eq!(fetched.priority, 7);
    assert_eq!(fetched.status, QueueStatus::Pending);
    assert_eq!(fetched.entry_x, 1.0);
    assert_eq!(fetched.entry_y, 2.0);
    assert_eq!(fetched.retry_count, 0);
    assert!(!fetched.cancel_requested);
    // Postgres keeps microseconds; the nanosecond tail is truncated.
    let drift = (fetched.enqueued_utc - item.enqueued_utc).num_milliseconds();
    assert_eq!(drift, 0, "enqueued_utc should survive the round trip");

    assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
}

// ---------------------------------------------------------------------------
// 2. Status transitions are compare-and-set
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_transition_chain_to_completed() {
    let pool = match connect().await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Skipping: {e}");
            return;
        }
    };
    let store = PgQueueStore::new(pool);

    let item = item_on(&unique_map(), 5);
    store.insert(&item).await.unwrap();
    let id = item.queue_item_id;

    // Out-of-order transitions never fire.
    assert!(!store.mark_executing(id).await.unwrap());
    assert!(!store.mark_assigned(id, "R-PG-1").await.unwrap());

    assert!(store.mark_ready(id).await.unwrap());
    assert!(!store.mark_ready(id).await.unwrap());
    assert!(store.mark_assigned(id, "R-PG-1").await.unwrap());
    assert!(store.mark_executing(id).await.unwrap());
    assert!(store.mark_completed(id).await.unwrap());
    assert!(!store.mark_completed(id).await.unwrap());

    let done = store.get(id).await.unwrap().unwrap();
    assert_eq!(done.status, QueueStatus::Completed);
    assert_eq!(done.assigned_robot_id.as_deref(), Some("R-PG-1"));
    assert!(done.started_utc.is_some());
    assert!(done.completed_utc.is_some());
}

// ---------------------------------------------------------------------------
// 3. Retry bookkeeping releases the robot but keeps the first start stamp
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_mark_retry_releases_robot_and_keeps_started() {
    let pool = match connect().await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Skipping: {e}");
            return;
        }
    };
    let store = PgQueueStore::new(pool);

    let item = item_on(&unique_map(), 5);
    store.insert(&item).await.unwrap();
    let id = item.queue_item_id;

    assert!(store.mark_ready(id).await.unwrap());
    assert!(store.mark_assigned(id, "R-PG-2").await.unwrap());
    let first_start = store.get(id).await.unwrap().unwrap().started_utc.unwrap();

    assert!(store
        .mark_retry(id, 1, Utc::now(), "submit failed")
        .await
        .unwrap());

    let after = store.get(id).await.unwrap().unwrap();
    assert_eq!(after.status, QueueStatus::ReadyToAssign);
    assert!(after.assigned_robot_id.is_none());
    assert_eq!(after.retry_count, 1);
    assert_eq!(after.error_message.as_deref(), Some("submit failed"));
    assert!(after.next_eligible_utc.is_some());
    assert_eq!(after.started_utc, Some(first_start));

    // A later reassignment must not overwrite the first start stamp.
    assert!(store.mark_assigned(id, "R-PG-3").await.unwrap());
    let reassigned = store.get(id).await.unwrap().unwrap();
    assert_eq!(reassigned.assigned_robot_id.as_deref(), Some("R-PG-3"));
    assert_eq!(reassigned.started_utc, Some(first_start));
}

// ---------------------------------------------------------------------------
// 4. Failing an item persists the final retry count
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_mark_failed_persists_retry_count() {
    let pool = match connect().await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Skipping: {e}");
            return;
        }
    };
    let store = PgQueueStore::new(pool);

    let item = item_on(&unique_map(), 5);
    store.insert(&item).await.unwrap();
    let id = item.queue_item_id;

    // Refused while the item is still pending.
    assert!(!store
        .mark_failed(id, QueueStatus::Assigned, 1, "nope")
        .await
        .unwrap());

    assert!(store.mark_ready(id).await.unwrap());
    assert!(store.mark_assigned(id, "R-PG-4").await.unwrap());
    assert!(store
        .mark_failed(id, QueueStatus::Assigned, 3, "boom")
        .await
        .unwrap());

    let failed = store.get(id).await.unwrap().unwrap();
    assert_eq!(failed.status, QueueStatus::Failed);
    assert_eq!(failed.retry_count, 3);
    assert_eq!(failed.error_message.as_deref(), Some("boom"));
    assert!(failed.completed_utc.is_some());
    assert!(failed.cancelled_utc.is_none());
}

// ---------------------------------------------------------------------------
// 5. Cancel requests resolve by current status
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_request_cancel_outcomes() {
    let pool = match connect().await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Skipping: {e}");
            return;
        }
    };
    let store = PgQueueStore::new(pool);
    let map = unique_map();

    let pending = item_on(&map, 5);
    store.insert(&pending).await.unwrap();
    match store.request_cancel(pending.queue_item_id).await.unwrap() {
        CancelOutcome::Cancelled(item) => {
            assert_eq!(item.status, QueueStatus::Cancelled);
            assert!(item.cancelled_utc.is_some());
        }
        other => panic!("pending item should cancel immediately, got {other:?}"),
    }

    let assigned = item_on(&map, 5);
    store.insert(&assigned).await.unwrap();
    store.mark_ready(assigned.queue_item_id).await.unwrap();
    store
        .mark_assigned(assigned.queue_item_id, "R-PG-5")
        .await
        .unwrap();
    match store.request_cancel(assigned.queue_item_id).await.unwrap() {
        CancelOutcome::Flagged(item) => {
            assert_eq!(item.status, QueueStatus::Assigned);
            assert!(item.cancel_requested);
        }
        other => panic!("assigned item should be flagged, got {other:?}"),
    }

    let executing = item_on(&map, 5);
    store.insert(&executing).await.unwrap();
    store.mark_ready(executing.queue_item_id).await.unwrap();
    store
        .mark_assigned(executing.queue_item_id, "R-PG-6")
        .await
        .unwrap();
    store.mark_executing(executing.queue_item_id).await.unwrap();
    match store.request_cancel(executing.queue_item_id).await.unwrap() {
        CancelOutcome::Rejected(status) => assert_eq!(status, QueueStatus::Executing),
        other => panic!("executing item should be rejected, got {other:?}"),
    }

    assert!(matches!(
        store.request_cancel(Uuid::new_v4()).await.unwrap(),
        CancelOutcome::NotFound
    ));
}

// ---------------------------------------------------------------------------
// 6. Scheduling order within one map
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_scheduling_order_per_map() {
    let pool = match connect().await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Skipping: {e}");
            return;
        }
    };
    let store = PgQueueStore::new(pool);
    let map = unique_map();

    let low = item_on(&map, 1);
    store.insert(&low).await.unwrap();
    let high = item_on(&map, 9);
    store.insert(&high).await.unwrap();
    let mid_old = item_on(&map, 5);
    store.insert(&mid_old).await.unwrap();
    // Explicit stamp keeps the FIFO comparison deterministic.
    let mut mid_new = item_on(&map, 5);
    mid_new.enqueued_utc = mid_old.enqueued_utc + chrono::Duration::milliseconds(5);
    store.insert(&mid_new).await.unwrap();

    let items = store
        .list_by_status(Some(&map), QueueStatus::Pending)
        .await
        .unwrap();
    let ids: Vec<Uuid> = items.iter().map(|i| i.queue_item_id).collect();
    assert_eq!(
        ids,
        vec![
            high.queue_item_id,
            mid_old.queue_item_id,
            mid_new.queue_item_id,
            low.queue_item_id
        ],
        "expected priority descending, FIFO within a band"
    );
}

// ---------------------------------------------------------------------------
// 7. Per-map statistics
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_statistics_per_map() {
    let pool = match connect().await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Skipping: {e}");
            return;
        }
    };
    let store = PgQueueStore::new(pool);
    let map = unique_map();

    for _ in 0..2 {
        store.insert(&item_on(&map, 5)).await.unwrap();
    }
    let executing = item_on(&map, 5);
    store.insert(&executing).await.unwrap();
    store.mark_ready(executing.queue_item_id).await.unwrap();
    store
        .mark_assigned(executing.queue_item_id, "R-PG-7")
        .await
        .unwrap();
    store.mark_executing(executing.queue_item_id).await.unwrap();
    let cancelled = item_on(&map, 5);
    store.insert(&cancelled).await.unwrap();
    store.request_cancel(cancelled.queue_item_id).await.unwrap();

    let stats = store.statistics(&map).await.unwrap();
    assert_eq!(stats.map_code, map);
    assert_eq!(stats.pending_count, 2);
    assert_eq!(stats.executing_count, 1);
    assert_eq!(stats.cancelled_count, 1);
    assert_eq!(stats.assigned_count, 0);
    assert_eq!(stats.completed_count, 0);
    assert_eq!(stats.failed_count, 0);
}

// ---------------------------------------------------------------------------
// 8. Current job lookup by robot
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_current_job_for_robot() {
    let pool = match connect().await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Skipping: {e}");
            return;
        }
    };
    let store = PgQueueStore::new(pool);
    let robot = format!("R-{}", Uuid::new_v4().simple());

    let item = item_on(&unique_map(), 5);
    store.insert(&item).await.unwrap();
    store.mark_ready(item.queue_item_id).await.unwrap();
    store.mark_assigned(item.queue_item_id, &robot).await.unwrap();
    store.mark_executing(item.queue_item_id).await.unwrap();

    let current = store
        .current_job_for_robot(&robot)
        .await
        .unwrap()
        .expect("executing job should be the robot's current job");
    assert_eq!(current.queue_item_id, item.queue_item_id);

    store.mark_completed(item.queue_item_id).await.unwrap();
    assert!(store.current_job_for_robot(&robot).await.unwrap().is_none());
}
