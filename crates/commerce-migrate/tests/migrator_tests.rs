mod common;

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use commerce_migrate::destination::DestinationApi;
use commerce_migrate::mapper::map_customer;
use commerce_migrate::{
    EntityKind, MapperSettings, MigrateError, Migrator, StagedRecord, StagingStore, StopReason,
};
use common::{fast_retry, memory_store, FakeDestination};

fn staged(kind: EntityKind, payload: Value) -> StagedRecord {
    StagedRecord::from_raw(kind, payload, Utc::now()).unwrap()
}

async fn stage(store: &Arc<dyn StagingStore>, kind: EntityKind, payloads: Vec<Value>) {
    let records: Vec<_> = payloads.into_iter().map(|p| staged(kind, p)).collect();
    store.upsert_batch(kind, &records).await.unwrap();
}

async fn stage_customers(store: &Arc<dyn StagingStore>, ids: std::ops::RangeInclusive<i64>) {
    let payloads = ids
        .map(|id| json!({"id": id, "email": format!("c{}@example.com", id), "first_name": "C"}))
        .collect();
    stage(store, EntityKind::Customer, payloads).await;
}

fn migrator(store: &Arc<dyn StagingStore>, destination: &FakeDestination) -> Migrator {
    Migrator::new(
        store.clone(),
        Arc::new(destination.clone()),
        MapperSettings::default(),
        fast_retry(),
    )
}

#[tokio::test]
async fn test_customer_with_embedded_subscription_history() {
    let store = memory_store();
    let destination = FakeDestination::new();
    stage(
        &store,
        EntityKind::Customer,
        vec![json!({"id": 42, "name": "A. Smith", "subscriptions": [{"id": 9, "status": "active"}]})],
    )
    .await;

    let result = migrator(&store, &destination).migrate_batch(50).await.unwrap();
    assert_eq!(result.customers.created, 1);
    assert!(result.failures.is_empty());

    let dest_id = store
        .lookup_link(EntityKind::Customer, 42)
        .await
        .unwrap()
        .expect("customer 42 is linked");
    let customer = destination.customer(dest_id).unwrap();
    assert!(customer.tags.contains(&"cj-import".to_string()));

    let history = customer
        .metafield("migration", "subscription_history")
        .unwrap()
        .decode()
        .unwrap();
    assert_eq!(
        history["subscriptions"],
        json!([{"id": 9, "status": "active"}])
    );

    let row = store.get(EntityKind::Customer, 42).await.unwrap().unwrap();
    assert!(row.migrated);
    assert!(row.migrated_at.is_some());
}

#[tokio::test]
async fn test_rerun_creates_no_duplicates_and_keeps_links() {
    let store = memory_store();
    let destination = FakeDestination::new();
    stage_customers(&store, 1..=5).await;
    let migrator = migrator(&store, &destination).with_workers(3);

    let first = migrator.migrate_batch(50).await.unwrap();
    assert_eq!(first.customers.created, 5);

    let mut links_before = Vec::new();
    for id in 1..=5 {
        links_before.push(store.lookup_link(EntityKind::Customer, id).await.unwrap());
    }

    // Everything is migrated, so nothing is fetched.
    let second = migrator.migrate_batch(50).await.unwrap();
    assert!(second.is_empty());

    // Re-collecting the same customers does not make them pending again.
    let rows: Vec<StagedRecord> = (1..=5)
        .map(|id| staged(EntityKind::Customer, json!({"id": id, "email": format!("c{}@example.com", id)})))
        .collect();
    store.upsert_batch(EntityKind::Customer, &rows).await.unwrap();
    let pending = store
        .fetch_unmigrated(EntityKind::Customer, 50)
        .await
        .unwrap();
    assert!(pending.is_empty(), "upsert keeps the migrated flag");

    assert_eq!(destination.customers().len(), 5);
    assert_eq!(destination.customer_creates(), 5);
    for (i, id) in (1..=5).enumerate() {
        assert_eq!(
            store.lookup_link(EntityKind::Customer, id).await.unwrap(),
            links_before[i]
        );
    }
}

#[tokio::test]
async fn test_linked_but_unmigrated_customer_is_updated() {
    let store = memory_store();
    let destination = FakeDestination::new();
    stage_customers(&store, 1..=1).await;

    let migrator = migrator(&store, &destination);
    migrator.migrate_batch(50).await.unwrap();

    // Link written, row not marked: drop staged rows but keep links, then
    // stage the customer again.
    let dest_id = store.lookup_link(EntityKind::Customer, 1).await.unwrap().unwrap();
    store.purge(false).await.unwrap();
    stage_customers(&store, 1..=1).await;

    let result = migrator.migrate_batch(50).await.unwrap();
    assert_eq!(result.customers.updated, 1);
    assert_eq!(result.customers.created, 0);
    assert_eq!(destination.customer_creates(), 1);
    assert_eq!(destination.customer_updates(), 1);
    assert_eq!(
        store.lookup_link(EntityKind::Customer, 1).await.unwrap(),
        Some(dest_id)
    );
}

#[tokio::test]
async fn test_crash_between_create_and_link_adopts_existing_customer() {
    let store = memory_store();
    let destination = FakeDestination::new();
    let payload = json!({"id": 7, "email": "seven@example.com"});
    stage(&store, EntityKind::Customer, vec![payload.clone()]).await;

    // The previous run created the customer and died before linking it.
    let request = map_customer(
        &staged(EntityKind::Customer, payload),
        &[],
        &MapperSettings::default(),
    )
    .unwrap();
    let orphan = destination.create_customer(&request).await.unwrap();
    assert_eq!(store.lookup_link(EntityKind::Customer, 7).await.unwrap(), None);

    let result = migrator(&store, &destination).migrate_batch(50).await.unwrap();
    assert_eq!(result.customers.created, 0);
    assert_eq!(result.customers.updated, 1);
    assert_eq!(destination.customer_creates(), 1);
    assert_eq!(
        store.lookup_link(EntityKind::Customer, 7).await.unwrap(),
        Some(orphan)
    );
}

#[tokio::test]
async fn test_validation_failure_does_not_abort_batch() {
    let store = memory_store();
    let destination = FakeDestination::new();
    stage_customers(&store, 1..=3).await;
    destination.reject_email("c2@example.com");

    let result = migrator(&store, &destination).migrate_batch(50).await.unwrap();
    assert_eq!(result.customers.created, 2);
    assert_eq!(result.customers.failed, 1);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].source_id, 2);
    assert_eq!(result.failures[0].class, "validation");

    let failed = store.get(EntityKind::Customer, 2).await.unwrap().unwrap();
    assert!(!failed.migrated);
    assert_eq!(store.lookup_link(EntityKind::Customer, 2).await.unwrap(), None);
}

#[tokio::test]
async fn test_invalid_payload_is_a_record_failure() {
    let store = memory_store();
    let destination = FakeDestination::new();
    stage(&store, EntityKind::Customer, vec![json!({"id": 1}), json!({"id": 2, "email": "b@example.com"})]).await;

    let result = migrator(&store, &destination).migrate_batch(50).await.unwrap();
    assert_eq!(result.customers.failed, 1);
    assert_eq!(result.customers.created, 1);
    assert_eq!(result.failures[0].class, "record");
}

#[tokio::test]
async fn test_auth_loss_aborts_batch() {
    let store = memory_store();
    let destination = FakeDestination::new();
    stage_customers(&store, 1..=4).await;
    destination.revoke_auth();

    let err = migrator(&store, &destination)
        .with_workers(2)
        .migrate_batch(50)
        .await
        .unwrap_err();
    assert!(matches!(err.root(), MigrateError::Auth { .. }));
    assert_eq!(err.exit_code(), 2);
    assert_eq!(
        store.fetch_unmigrated(EntityKind::Customer, 50).await.unwrap().len(),
        4
    );
}

#[tokio::test]
async fn test_auth_loss_mid_run_keeps_partial_totals() {
    let store = memory_store();
    let destination = FakeDestination::new();
    stage_customers(&store, 1..=5).await;
    destination.revoke_auth_after(2);

    let err = migrator(&store, &destination).run(50, None).await.unwrap_err();
    let MigrateError::Aborted { summary, source } = err else {
        panic!("expected an aborted run, got {:?}", err);
    };
    assert!(matches!(*source, MigrateError::Auth { .. }));
    assert_eq!(summary.stop_reason, StopReason::Aborted);
    assert_eq!(summary.batches, 1);
    assert_eq!(summary.fetched, 5);
    assert_eq!(summary.customers.created, 2);
    assert_eq!(summary.customers.failed, 0);

    // The totals match what was made durable before the abort.
    let pending = store.fetch_unmigrated(EntityKind::Customer, 50).await.unwrap();
    assert_eq!(pending.len(), 3);
    assert_eq!(destination.customer_creates(), 2);
}

#[tokio::test]
async fn test_auth_loss_in_a_later_batch_keeps_earlier_batches() {
    let store = memory_store();
    let destination = FakeDestination::new();
    stage_customers(&store, 1..=5).await;
    destination.revoke_auth_after(3);

    let err = migrator(&store, &destination).run(2, None).await.unwrap_err();
    let MigrateError::Aborted { summary, .. } = err else {
        panic!("expected an aborted run, got {:?}", err);
    };
    // Batch one created 1 and 2; batch two created 3 and then lost auth on 4.
    assert_eq!(summary.batches, 2);
    assert_eq!(summary.customers.created, 3);
    assert_eq!(summary.stop_reason, StopReason::Aborted);
}

#[tokio::test]
async fn test_record_failures_persist_until_resolved() {
    let store = memory_store();
    let destination = FakeDestination::new();
    stage_customers(&store, 1..=3).await;
    destination.reject_email("c2@example.com");

    let migrator = migrator(&store, &destination);
    let summary = migrator.run(50, None).await.unwrap();
    assert_eq!(summary.customers.failed, 1);

    let failures = store.list_failures(EntityKind::Customer, 10).await.unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].source_id, 2);
    assert_eq!(failures[0].class, "validation");
    assert!(failures[0].message.contains("email is invalid"));

    let stats = store.stats().await.unwrap();
    let customers = stats.kinds.iter().find(|k| k.kind == EntityKind::Customer).unwrap();
    assert_eq!(customers.failed, 1);
    assert_eq!(
        customers.last_failure.as_ref().map(|f| f.source_id),
        Some(2)
    );

    // A later run that migrates the customer clears its failure.
    destination.accept_email("c2@example.com");
    let summary = migrator.run(50, None).await.unwrap();
    assert_eq!(summary.customers.created, 1);
    assert!(store
        .list_failures(EntityKind::Customer, 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let store = memory_store();
    let destination = FakeDestination::new();
    stage_customers(&store, 1..=3).await;

    let result = migrator(&store, &destination)
        .with_dry_run(true)
        .migrate_batch(50)
        .await
        .unwrap();
    assert_eq!(result.customers.skipped, 3);
    assert!(destination.customers().is_empty());
    assert_eq!(
        store.fetch_unmigrated(EntityKind::Customer, 50).await.unwrap().len(),
        3
    );
}

#[tokio::test]
async fn test_dependents_migrate_with_their_customer() {
    let store = memory_store();
    let destination = FakeDestination::new();
    stage(&store, EntityKind::Customer, vec![json!({"id": 42, "email": "a@example.com"})]).await;
    stage(
        &store,
        EntityKind::Order,
        vec![
            json!({"id": 1001, "customer_id": 42, "status": "paid", "total": "10.00"}),
            json!({"id": 1002, "customer_id": 42, "status": "refunded", "subscription_id": 9}),
        ],
    )
    .await;
    stage(
        &store,
        EntityKind::Subscription,
        vec![json!({"id": 9, "customer": {"id": 42}, "status": "active"})],
    )
    .await;

    let result = migrator(&store, &destination).migrate_batch(50).await.unwrap();
    assert_eq!(result.customers.created, 1);
    assert_eq!(result.orders.created, 2);
    assert_eq!(result.subscriptions.created, 1);

    let customer_dest = store.lookup_link(EntityKind::Customer, 42).await.unwrap().unwrap();
    let orders = destination.orders_of(customer_dest);
    assert_eq!(orders.len(), 2);
    assert!(orders
        .iter()
        .any(|o| o.tags.contains(&"cj-import-subscription".to_string())));

    // Staged subscriptions feed the customer's history metafield too.
    let history = destination
        .customer(customer_dest)
        .unwrap()
        .metafield("migration", "subscription_history")
        .unwrap()
        .decode()
        .unwrap();
    assert_eq!(history["subscriptions"][0]["id"], 9);

    for kind in [EntityKind::Order, EntityKind::Subscription] {
        assert!(store.fetch_unmigrated(kind, 10).await.unwrap().is_empty());
    }
    assert_eq!(destination.subscription_record_count(), 1);
}

#[tokio::test]
async fn test_dependents_batch_picks_up_late_orders() {
    let store = memory_store();
    let destination = FakeDestination::new();
    stage_customers(&store, 1..=1).await;
    let migrator = migrator(&store, &destination);
    migrator.migrate_batch(50).await.unwrap();

    // Orders collected after the customer was migrated, one of them orphaned.
    stage(
        &store,
        EntityKind::Order,
        vec![
            json!({"id": 500, "customer_id": 1}),
            json!({"id": 501, "customer_id": 99}),
        ],
    )
    .await;

    let result = migrator
        .migrate_dependents_batch(EntityKind::Order, 50)
        .await
        .unwrap();
    assert_eq!(result.orders.created, 1);
    assert_eq!(result.orders.skipped, 1);
    assert!(store.lookup_link(EntityKind::Order, 500).await.unwrap().is_some());
    assert!(store.lookup_link(EntityKind::Order, 501).await.unwrap().is_none());

    let err = migrator
        .migrate_dependents_batch(EntityKind::Customer, 50)
        .await
        .unwrap_err();
    assert!(matches!(err, MigrateError::Config(_)));
}

#[tokio::test]
async fn test_run_moves_past_failed_customers() {
    let store = memory_store();
    let destination = FakeDestination::new();
    stage_customers(&store, 1..=7).await;
    destination.reject_email("c1@example.com");
    destination.reject_email("c4@example.com");

    let summary = migrator(&store, &destination).run(2, None).await.unwrap();
    assert_eq!(summary.stop_reason, StopReason::Completed);
    assert_eq!(summary.batches, 4);
    assert_eq!(summary.customers.created, 5);
    assert_eq!(summary.customers.failed, 2);
    assert_eq!(summary.failed(), 2);
}

#[tokio::test]
async fn test_run_honours_batch_limit_and_cancellation() {
    let store = memory_store();
    let destination = FakeDestination::new();
    stage_customers(&store, 1..=6).await;

    let summary = migrator(&store, &destination).run(2, Some(1)).await.unwrap();
    assert_eq!(summary.stop_reason, StopReason::BatchLimit);
    assert_eq!(summary.customers.created, 2);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let summary = migrator(&store, &destination)
        .with_cancel(cancel)
        .run(2, None)
        .await
        .unwrap();
    assert_eq!(summary.stop_reason, StopReason::Cancelled);
    assert_eq!(summary.batches, 0);
}

#[tokio::test]
async fn test_run_stops_on_failure_ratio() {
    let store = memory_store();
    let destination = FakeDestination::new();
    stage_customers(&store, 1..=4).await;
    destination.reject_email("c1@example.com");
    destination.reject_email("c2@example.com");

    let summary = migrator(&store, &destination)
        .with_max_failure_ratio(Some(0.5))
        .run(2, None)
        .await
        .unwrap();
    assert_eq!(summary.stop_reason, StopReason::FailureThreshold);
    assert_eq!(summary.batches, 1);
    assert_eq!(
        store.fetch_unmigrated(EntityKind::Customer, 10).await.unwrap().len(),
        4
    );
}

#[tokio::test]
async fn test_skip_inactive_customers() {
    let store = memory_store();
    let destination = FakeDestination::new();
    stage(
        &store,
        EntityKind::Customer,
        vec![
            json!({"id": 1, "email": "idle@example.com", "total_revenue": 0}),
            json!({"id": 2, "email": "buyer@example.com", "total_revenue": "25.00"}),
        ],
    )
    .await;

    let result = migrator(&store, &destination)
        .with_skip_inactive(true)
        .migrate_batch(50)
        .await
        .unwrap();
    assert_eq!(result.customers.skipped, 1);
    assert_eq!(result.customers.created, 1);
    assert!(!store.get(EntityKind::Customer, 1).await.unwrap().unwrap().migrated);
}

#[tokio::test]
async fn test_fetch_unmigrated_batch_boundary() {
    let store = memory_store();
    stage_customers(&store, 1..=5).await;
    stage(&store, EntityKind::Customer, vec![json!({"id": 0, "email": "zero@example.com"})]).await;

    assert!(store
        .fetch_unmigrated(EntityKind::Customer, 0)
        .await
        .unwrap()
        .is_empty());

    let rows = store.fetch_unmigrated(EntityKind::Customer, 3).await.unwrap();
    let ids: Vec<i64> = rows.iter().map(|r| r.source_id).collect();
    assert_eq!(ids, vec![0, 1, 2]);
}
