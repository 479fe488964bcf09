use std::sync::{Arc, Mutex};

use convergent::crdt::{
    CrdtEntity, CrdtModel, EntityData, EntityOperation, Primitive, RawEntity, VersionMap,
};
use convergent::store::{
    BackingStore, CrdtType, MuxedProxyMessage, ProxyMessage, StorageMode, StoreOptions,
};

use crate::helpers::*;

fn backing(provider: &Arc<RecordingProvider>) -> BackingStore<RecordingProvider> {
    let options = StoreOptions::new(
        key("volatile://library/books"),
        CrdtType::Entity,
        StorageMode::Backing,
    );
    BackingStore::new(options, provider.clone()).unwrap()
}

fn book(id: &str, title: &str) -> EntityData {
    let raw = RawEntity::new(id)
        .with_singleton("title", title)
        .with_collection("authors", ["anon"]);
    EntityData::from_raw(&raw, &VersionMap::from([("W", 1)]), &Default::default())
}

fn model_update(id: &str, model: EntityData) -> MuxedProxyMessage {
    MuxedProxyMessage::new(id, ProxyMessage::ModelUpdate { model, id: None })
}

#[tokio::test]
async fn test_each_record_has_its_own_location() {
    let provider = Arc::new(RecordingProvider::new());
    let store = backing(&provider);

    store.on_proxy_message(model_update("b2", book("b2", "Dune"))).await.unwrap();
    store.on_proxy_message(model_update("b1", book("b1", "Emma"))).await.unwrap();
    store.idle().await.unwrap();

    assert_eq!(store.record_ids(), vec!["b1".to_string(), "b2".to_string()]);
    let base = store.base_key().clone();
    assert_eq!(provider.memory().keys(), vec![base.child("b1"), base.child("b2")]);
    assert_eq!(
        provider.sends().iter().filter(|(_, version)| *version == 1).count(),
        2
    );

    let raw = CrdtEntity::from_data(store.get_local_data("b1").await.unwrap()).consumer_view();
    assert_eq!(raw.singletons["title"], Some(Primitive::from("Emma")));
}

#[tokio::test]
async fn test_record_updates_reach_other_backing_stores() {
    let provider = Arc::new(RecordingProvider::new());
    let writer = backing(&provider);
    let reader = backing(&provider);

    writer.on_proxy_message(model_update("b1", book("b1", "Emma"))).await.unwrap();
    writer.idle().await.unwrap();
    assert_eq!(
        reader.get_local_data("b1").await.unwrap(),
        writer.get_local_data("b1").await.unwrap()
    );

    let seen: Arc<Mutex<Vec<MuxedProxyMessage>>> = Arc::default();
    let sink = seen.clone();
    reader.on(Arc::new(move |m: MuxedProxyMessage| sink.lock().unwrap().push(m)));

    let retitle = EntityOperation::SetSingleton {
        actor: "W".into(),
        clock: VersionMap::from([("W", 2)]),
        field: "title".into(),
        value: "Persuasion".into(),
    };
    let accepted = writer
        .on_proxy_message(MuxedProxyMessage::new(
            "b1",
            ProxyMessage::Operations {
                operations: vec![retitle],
                id: None,
            },
        ))
        .await
        .unwrap();
    assert!(accepted);
    writer.idle().await.unwrap();

    let seen_by_reader = seen.clone();
    wait_until(|| {
        let seen = seen_by_reader.clone();
        async move { !seen.lock().unwrap().is_empty() }
    })
    .await;
    assert!(seen.lock().unwrap().iter().all(|m| m.mux_id == "b1"));

    reader.idle().await.unwrap();
    let raw = CrdtEntity::from_data(reader.get_local_data("b1").await.unwrap()).consumer_view();
    assert_eq!(raw.singletons["title"], Some(Primitive::from("Persuasion")));
}

#[tokio::test]
async fn test_rejected_record_write_asks_sender_to_resync() {
    let provider = Arc::new(RecordingProvider::new());
    let store = backing(&provider);
    store.on_proxy_message(model_update("b1", book("b1", "Emma"))).await.unwrap();

    let seen: Arc<Mutex<Vec<MuxedProxyMessage>>> = Arc::default();
    let sink = seen.clone();
    let token = store.on(Arc::new(move |m: MuxedProxyMessage| sink.lock().unwrap().push(m)));

    // Skips title version 2.
    let skipped = EntityOperation::SetSingleton {
        actor: "W".into(),
        clock: VersionMap::from([("W", 3)]),
        field: "title".into(),
        value: "Persuasion".into(),
    };
    let accepted = store
        .on_proxy_message(MuxedProxyMessage::new(
            "b1",
            ProxyMessage::Operations {
                operations: vec![skipped],
                id: Some(token),
            },
        ))
        .await
        .unwrap();
    assert!(!accepted);

    assert_eq!(
        *seen.lock().unwrap(),
        vec![MuxedProxyMessage::new(
            "b1",
            ProxyMessage::SyncRequest { id: Some(token) }
        )]
    );
}
