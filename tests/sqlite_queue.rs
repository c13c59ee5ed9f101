mod common;

use std::sync::Arc;

use review_queue::{
    CheckoutConfig, DocumentStore, Ingestor, ManualClock, Outcome, Owner, ScanFilter,
    SessionLease, SqliteStore,
};
use serde_json::{json, Map, Value};

use common::{make_now, selector, TTL};

fn row(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("row must be an object"),
    }
}

#[tokio::test]
async fn two_processes_share_one_queue() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let clock = Arc::new(ManualClock::new(make_now()));
    let config = CheckoutConfig::default();

    // 1. Load the queue
    let loader = Arc::new(SqliteStore::open(&path).unwrap());
    let created = Ingestor::new(loader, &config)
        .ingest_records(
            vec![
                row(json!({"IdCorreo": "A1", "Asunto": "Factura"})),
                row(json!({"IdCorreo": "B2", "Asunto": "Pedido"})),
            ],
            make_now(),
        )
        .await
        .unwrap();
    assert_eq!(created, 2);

    // 2. Two independent connections, as two server processes would have
    let first = selector(Arc::new(SqliteStore::open(&path).unwrap()), clock.clone(), config.clone());
    let second = selector(Arc::new(SqliteStore::open(&path).unwrap()), clock.clone(), config.clone());
    let alice = Owner::new("alice").unwrap();
    let bob = Owner::new("bob").unwrap();
    let mut alices = SessionLease::new();
    let mut bobs = SessionLease::new();

    let a = first.next_record(&mut alices, &alice).await.unwrap().unwrap();
    let b = second.next_record(&mut bobs, &bob).await.unwrap().unwrap();
    assert_ne!(a.key, b.key);

    // 3. Neither process can take the other's record
    assert!(second.leases().try_acquire(&a.key, &bob, TTL).await.unwrap().is_none());
    assert!(first.leases().try_acquire(&b.key, &alice, TTL).await.unwrap().is_none());

    // 4. Alice resolves, Bob releases
    first
        .resolve(&mut alices, &alice, Outcome::reviewed("OK", "").unwrap())
        .await
        .unwrap();
    assert!(second.release_current(&mut bobs, &bob).await.unwrap());

    // 5. Only Bob's record remains, and it is free again
    let remaining = second
        .leases()
        .store()
        .scan(&ScanFilter::partition("active"))
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    let record = remaining[0].as_ref().unwrap();
    assert_eq!(record.value.key, b.key);
    assert!(!record.value.lease.is_leased());
    assert_eq!(b.payload["Asunto"], if b.record_id == "A1" { "Factura" } else { "Pedido" });
}

#[tokio::test]
async fn lease_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let clock = Arc::new(ManualClock::new(make_now()));
    let config = CheckoutConfig::default();
    let alice = Owner::new("alice").unwrap();

    let held = {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        Ingestor::new(store.clone(), &config)
            .ingest_records(vec![row(json!({"IdCorreo": "A1"}))], make_now())
            .await
            .unwrap();
        let selector = selector(store.clone(), clock.clone(), config.clone());
        let mut session = SessionLease::new();
        let held = selector.next_record(&mut session, &alice).await.unwrap().unwrap();
        store.sync().await.unwrap();
        held
    };

    let reopened = selector(Arc::new(SqliteStore::open(&path).unwrap()), clock, config);
    assert!(reopened
        .leases()
        .validate(&held.key, &alice, &held.token)
        .await
        .unwrap());
    assert!(reopened
        .leases()
        .try_acquire(&held.key, &Owner::new("bob").unwrap(), TTL)
        .await
        .unwrap()
        .is_none());
}
