use std::sync::{Arc, Mutex};

use convergent::crdt::{
    CrdtModel, CrdtSet, EntityData, Primitive, RawEntity, SetData, SetOperation,
    SingletonOperation, VersionMap,
};
use convergent::store::{
    ActiveStore, CollectionData, CollectionOperation, CrdtType, DirectStore, ProxyMessage,
    RefModeData, RefModeOperation, Reference, ReferenceModeStorageKey, ReferenceModeStore,
    StorageMode, StoreOptions, VolatileDriverProvider,
};

use crate::helpers::*;

type RefModeMessage = ProxyMessage<RefModeData, RefModeOperation>;

fn rm_key() -> ReferenceModeStorageKey {
    ReferenceModeStorageKey {
        backing_key: key("volatile://team/members"),
        storage_key: key("volatile://team/roster"),
    }
}

fn options(kind: CrdtType) -> StoreOptions<RefModeData> {
    StoreOptions::new(rm_key(), kind, StorageMode::ReferenceMode)
}

fn member(id: &str, name: &str) -> RawEntity {
    RawEntity::new(id)
        .with_singleton("name", name)
        .with_collection("roles", ["engineer"])
}

fn names(data: &RefModeData) -> Vec<Option<Primitive>> {
    data.set_data()
        .values
        .values()
        .map(|item| item.value.singletons.get("name").cloned().flatten())
        .collect()
}

fn recorder() -> (
    Arc<Mutex<Vec<RefModeMessage>>>,
    Arc<dyn Fn(RefModeMessage) + Send + Sync>,
) {
    let seen: Arc<Mutex<Vec<RefModeMessage>>> = Arc::default();
    let sink = seen.clone();
    (seen, Arc::new(move |m: RefModeMessage| sink.lock().unwrap().push(m)))
}

async fn snapshot<S: ActiveStore>(store: &S) -> S::Data {
    store.idle().await.unwrap();
    store.local_data().await.unwrap()
}

#[tokio::test]
async fn test_record_is_stored_before_its_reference() {
    let provider = Arc::new(RecordingProvider::new());
    let store = ReferenceModeStore::new(options(CrdtType::Set), provider.clone())
        .await
        .unwrap();

    let mut data = SetData::new(VersionMap::from([("p", 1)]));
    data.insert(VersionMap::from([("p", 1)]), member("m1", "Ada"));
    assert!(
        store
            .on_proxy_message(ProxyMessage::ModelUpdate {
                model: CollectionData::Set(data),
                id: None,
            })
            .await
            .unwrap()
    );
    store.idle().await.unwrap();

    let record = provider
        .first_send_to(&rm_key().backing_key.child("m1"))
        .expect("record was written");
    let container = provider
        .first_send_to(&rm_key().storage_key)
        .expect("container was written");
    assert!(record < container, "sends: {:?}", provider.sends());

    assert_eq!(names(&snapshot(&store).await), vec![Some(Primitive::from("Ada"))]);
}

#[tokio::test]
async fn test_other_replicas_receive_hydrated_records() {
    let provider = Arc::new(VolatileDriverProvider::default());
    let writer = ReferenceModeStore::new(options(CrdtType::Set), provider.clone())
        .await
        .unwrap();
    let reader = ReferenceModeStore::new(options(CrdtType::Set), provider.clone())
        .await
        .unwrap();
    let (seen, callback) = recorder();
    reader.on(callback);

    let add = ProxyMessage::Operations {
        operations: vec![CollectionOperation::Set(SetOperation::Add {
            actor: "w".into(),
            clock: VersionMap::from([("w", 1)]),
            added: member("m1", "Ada"),
        })],
        id: None,
    };
    assert!(writer.on_proxy_message(add).await.unwrap());
    writer.idle().await.unwrap();
    reader.idle().await.unwrap();

    let seen = seen.lock().unwrap();
    assert!(!seen.is_empty());
    for message in seen.iter() {
        let ProxyMessage::ModelUpdate { model, id: None } = message else {
            panic!("expected a broadcast model, got {message:?}");
        };
        // Never a bare reference without its record.
        assert_eq!(names(model), vec![Some(Primitive::from("Ada"))]);
    }
    drop(seen);

    let local = snapshot(&reader).await;
    let record = &local.set_data().values["m1"].value;
    assert!(record.collections["roles"].contains(&Primitive::from("engineer")));
}

#[tokio::test]
async fn test_singleton_holds_latest_record() {
    let provider = Arc::new(VolatileDriverProvider::default());
    let store = ReferenceModeStore::new(options(CrdtType::Singleton), provider.clone())
        .await
        .unwrap();
    assert_eq!(store.crdt_type(), CrdtType::Singleton);

    for (version, (id, name)) in [(1, ("m1", "Ada")), (2, ("m2", "Grace"))] {
        let update = ProxyMessage::Operations {
            operations: vec![CollectionOperation::Singleton(SingletonOperation::Update {
                actor: "p".into(),
                clock: VersionMap::from([("p", version)]),
                value: member(id, name),
            })],
            id: None,
        };
        assert!(store.on_proxy_message(update).await.unwrap());
    }

    let local = snapshot(&store).await;
    assert_eq!(local.kind(), CrdtType::Singleton);
    assert_eq!(names(&local), vec![Some(Primitive::from("Grace"))]);
    assert_eq!(store.backing().record_ids(), vec!["m1".to_string(), "m2".to_string()]);

    // The replaced record is not cleared.
    let (replaced, _) = provider
        .memory()
        .get::<EntityData>(&rm_key().backing_key.child("m1"))
        .unwrap()
        .expect("replaced record is still stored");
    assert_eq!(
        replaced.to_raw().singletons.get("name").cloned().flatten(),
        Some(Primitive::from("Ada"))
    );
}

#[tokio::test]
async fn test_initial_model_is_written_through() {
    let provider = Arc::new(VolatileDriverProvider::default());
    let mut data = SetData::new(VersionMap::from([("p", 1)]));
    data.insert(VersionMap::from([("p", 1)]), member("m1", "Ada"));
    let store = ReferenceModeStore::new(
        options(CrdtType::Set).with_initial_model(CollectionData::Set(data)),
        provider.clone(),
    )
    .await
    .unwrap();

    assert_eq!(names(&snapshot(&store).await), vec![Some(Primitive::from("Ada"))]);
    let stored = provider.memory().keys();
    assert!(stored.contains(&rm_key().backing_key.child("m1")));
    assert!(stored.contains(&rm_key().storage_key));
}

#[tokio::test]
async fn test_sync_timeout_clears_unresolvable_references() {
    let provider = Arc::new(VolatileDriverProvider::default());

    // A container pointing at a record the backing store never received.
    let container = DirectStore::<CrdtSet<Reference>>::new(
        StoreOptions::new(rm_key().storage_key, CrdtType::Set, StorageMode::Direct),
        provider.as_ref(),
    )
    .await
    .unwrap();
    let ghost = Reference::new(
        "ghost",
        rm_key().backing_key,
        VersionMap::from([("lost", 1)]),
    );
    container
        .on_proxy_message(ProxyMessage::Operations {
            operations: vec![SetOperation::Add {
                actor: "x".into(),
                clock: VersionMap::from([("x", 1)]),
                added: ghost,
            }],
            id: None,
        })
        .await
        .unwrap();
    container.idle().await.unwrap();

    let store = ReferenceModeStore::new(
        options(CrdtType::Set).with_sync_timeout_ms(50),
        provider.clone(),
    )
    .await
    .unwrap();
    let (seen, callback) = recorder();
    let token = store.on(callback);
    store
        .on_proxy_message(ProxyMessage::SyncRequest { id: Some(token) })
        .await
        .unwrap();

    let watched = seen.clone();
    wait_until(|| {
        let seen = watched.clone();
        async move {
            seen.lock()
                .unwrap()
                .iter()
                .any(|m| matches!(m, ProxyMessage::ModelUpdate { id: Some(_), .. }))
        }
    })
    .await;

    let seen = seen.lock().unwrap();
    let reply = seen
        .iter()
        .find_map(|m| match m {
            ProxyMessage::ModelUpdate { model, id: Some(id) } if *id == token => Some(model),
            _ => None,
        })
        .expect("sync reply");
    assert!(reply.set_data().values.is_empty());
    drop(seen);

    store.idle().await.unwrap();
    container.idle().await.unwrap();
    let remaining = CrdtSet::from_data(container.local_data().await.unwrap());
    assert!(remaining.is_empty());
}

#[tokio::test]
async fn test_wrong_model_kind_is_rejected() {
    let provider = Arc::new(VolatileDriverProvider::default());
    let store = ReferenceModeStore::new(options(CrdtType::Set), provider)
        .await
        .unwrap();
    let model = CollectionData::Singleton(SetData::default());
    let err = store
        .on_proxy_message(ProxyMessage::ModelUpdate { model, id: None })
        .await
        .unwrap_err();
    assert!(err.is_store_error());
    assert!(snapshot(&store).await.set_data().values.is_empty());
}
