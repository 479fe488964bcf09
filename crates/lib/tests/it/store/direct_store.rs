use std::sync::{Arc, Mutex};
use std::time::Duration;

use convergent::crdt::{CountData, CountOperation, CrdtCount, CrdtModel, VersionMap};
use convergent::store::{
    ActiveStore, CrdtType, DirectStore, DriverProvider, ProxyMessage, StorageMode, StoreOptions,
    StoreState, VolatileDriverProvider,
};

use crate::helpers::*;

type CountMessage = ProxyMessage<CountData, CountOperation>;

fn options() -> StoreOptions<CountData> {
    StoreOptions::new(key("volatile://counters/visits"), CrdtType::Count, StorageMode::Direct)
}

fn increment(actor: &str, version: u64) -> CountOperation {
    CountOperation::Increment {
        actor: actor.into(),
        clock: VersionMap::from([(actor, version)]),
    }
}

fn operations(ops: Vec<CountOperation>) -> CountMessage {
    ProxyMessage::Operations {
        operations: ops,
        id: None,
    }
}

fn recorder() -> (Arc<Mutex<Vec<CountMessage>>>, Arc<dyn Fn(CountMessage) + Send + Sync>) {
    let seen: Arc<Mutex<Vec<CountMessage>>> = Arc::default();
    let sink = seen.clone();
    (seen, Arc::new(move |m: CountMessage| sink.lock().unwrap().push(m)))
}

#[tokio::test]
async fn test_rejected_send_waits_for_driver_model() {
    let driver = ScriptedDriver::<CountData>::new(key("volatile://counters/visits"));
    let store = DirectStore::<CrdtCount>::with_driver(options(), driver.clone())
        .await
        .unwrap();

    driver.reject_next_send();
    assert!(store.on_proxy_message(operations(vec![increment("A", 1)])).await.unwrap());
    let handle = &store;
    wait_until(|| async move {
        handle.state().await.unwrap() == StoreState::AwaitingDriverModel
    })
    .await;
    assert!(driver.sent().is_empty());

    // Another replica got there first.
    let mut remote = CrdtCount::new();
    remote
        .apply_operation(&CountOperation::MultiIncrement {
            actor: "B".into(),
            clock: VersionMap::from([("B", 1)]),
            delta: 3,
        })
        .unwrap();
    driver.push(remote.data(), 1);
    store.idle().await.unwrap();

    let mut expected = CrdtCount::new();
    expected.apply_operation(&increment("A", 1)).unwrap();
    expected.merge(remote.data()).unwrap();

    let local = store.local_data().await.unwrap();
    assert_eq!(local, expected.data());
    assert_eq!(CrdtCount::from_data(local.clone()).consumer_view(), 4);
    assert_eq!(driver.sent().last(), Some(&(local, 2)));
    assert_eq!(store.version().await.unwrap(), 2);
    assert_eq!(store.state().await.unwrap(), StoreState::Idle);
}

#[tokio::test]
async fn test_driver_models_merge_while_idle() {
    let driver = ScriptedDriver::<CountData>::new(key("volatile://counters/visits"));
    let store = DirectStore::<CrdtCount>::with_driver(options(), driver.clone())
        .await
        .unwrap();
    let (seen, callback) = recorder();
    store.on(callback);

    let mut remote = CrdtCount::new();
    remote.apply_operation(&increment("B", 1)).unwrap();
    driver.push(remote.data(), 7);
    store.idle().await.unwrap();

    assert_eq!(store.local_data().await.unwrap(), remote.data());
    assert_eq!(store.version().await.unwrap(), 7);
    // Nothing local to report back.
    assert!(driver.sent().is_empty());
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_divergent_driver_model_fails_idle() {
    let driver = ScriptedDriver::<CountData>::new(key("volatile://counters/visits"));
    let store = DirectStore::<CrdtCount>::with_driver(options(), driver.clone())
        .await
        .unwrap();

    driver.reject_next_send();
    assert!(store.on_proxy_message(operations(vec![increment("A", 1)])).await.unwrap());
    let handle = &store;
    wait_until(|| async move {
        handle.state().await.unwrap() == StoreState::AwaitingDriverModel
    })
    .await;

    // Same actor and version, different value.
    let mut forged = CrdtCount::new();
    forged
        .apply_operation(&CountOperation::MultiIncrement {
            actor: "A".into(),
            clock: VersionMap::from([("A", 1)]),
            delta: 7,
        })
        .unwrap();
    driver.push(forged.data(), 1);

    let err = tokio::time::timeout(Duration::from_secs(2), store.idle())
        .await
        .expect("idle must not hang on a divergent driver model")
        .unwrap_err();
    assert!(err.is_crdt_divergence());
    assert_eq!(store.state().await.unwrap(), StoreState::Idle);

    let mut expected = CrdtCount::new();
    expected.apply_operation(&increment("A", 1)).unwrap();
    assert_eq!(store.local_data().await.unwrap(), expected.data());

    // Reported once.
    store.idle().await.unwrap();
}

#[tokio::test]
async fn test_changes_reach_every_proxy_but_the_sender() {
    let provider = VolatileDriverProvider::default();
    let store = DirectStore::<CrdtCount>::new(options(), &provider).await.unwrap();
    let (seen_a, callback_a) = recorder();
    let (seen_b, callback_b) = recorder();
    let a = store.on(callback_a);
    let b = store.on(callback_b);

    let message = ProxyMessage::Operations {
        operations: vec![increment("A", 1)],
        id: Some(a),
    };
    assert!(store.on_proxy_message(message.clone()).await.unwrap());
    assert!(seen_a.lock().unwrap().is_empty());
    assert_eq!(*seen_b.lock().unwrap(), vec![message]);

    // Rejected: b is asked to resync, a hears nothing.
    let stale = ProxyMessage::Operations {
        operations: vec![increment("A", 1)],
        id: Some(b),
    };
    assert!(!store.on_proxy_message(stale).await.unwrap());
    assert_eq!(
        seen_b.lock().unwrap().last(),
        Some(&ProxyMessage::SyncRequest { id: Some(b) })
    );
    assert!(seen_a.lock().unwrap().is_empty());

    assert!(store.off(b));
    store
        .on_proxy_message(ProxyMessage::SyncRequest { id: Some(a) })
        .await
        .unwrap();
    let seen_a = seen_a.lock().unwrap();
    let [ProxyMessage::ModelUpdate { model, id }] = seen_a.as_slice() else {
        panic!("expected one model, got {seen_a:?}");
    };
    assert_eq!(*id, Some(a));
    assert_eq!(model.values.get("A"), Some(&1));
}

#[tokio::test]
async fn test_version_token_skips_replay() {
    let provider = VolatileDriverProvider::default();
    let writer = DirectStore::<CrdtCount>::new(options(), &provider).await.unwrap();
    writer
        .on_proxy_message(operations(vec![increment("A", 1), increment("A", 2)]))
        .await
        .unwrap();
    writer.idle().await.unwrap();

    let stored = writer.local_data().await.unwrap();
    let token = provider
        .driver::<CountData>(&key("volatile://counters/visits"))
        .unwrap()
        .token()
        .expect("written keys carry a token");

    let resumed = DirectStore::<CrdtCount>::new(
        options()
            .with_initial_model(stored.clone())
            .with_version_token(token),
        &provider,
    )
    .await
    .unwrap();
    resumed.idle().await.unwrap();
    assert_eq!(resumed.version().await.unwrap(), 0);
    assert_eq!(resumed.local_data().await.unwrap(), stored);

    let fresh = DirectStore::<CrdtCount>::new(options(), &provider).await.unwrap();
    fresh.idle().await.unwrap();
    assert_eq!(fresh.version().await.unwrap(), 1);
    assert_eq!(fresh.local_data().await.unwrap(), stored);
}

async fn total<S>(store: &S) -> u64
where
    S: ActiveStore<Data = CountData, Operation = CountOperation>,
{
    store.idle().await.unwrap();
    CrdtCount::from_data(store.local_data().await.unwrap()).consumer_view()
}

#[tokio::test]
async fn test_stores_sharing_a_key_converge() {
    let provider = VolatileDriverProvider::default();
    let stores = [
        DirectStore::<CrdtCount>::new(options(), &provider).await.unwrap(),
        DirectStore::<CrdtCount>::new(options(), &provider).await.unwrap(),
        DirectStore::<CrdtCount>::new(options(), &provider).await.unwrap(),
    ];

    for (i, store) in stores.iter().enumerate() {
        let actor = format!("actor-{i}");
        store
            .on_proxy_message(operations(vec![increment(&actor, 1)]))
            .await
            .unwrap();
    }
    let handles = &stores;
    wait_until(|| async move {
        let mut totals = Vec::new();
        for store in handles {
            totals.push(total(store).await);
        }
        totals.iter().all(|t| *t == 3)
    })
    .await;

    let expected = stores[0].local_data().await.unwrap();
    for store in &stores[1..] {
        assert_eq!(store.local_data().await.unwrap(), expected);
    }
}
