//! Many independently versioned records under one base location.
//!
//! A [`BackingStore`] holds one [`DirectStore`] of [`CrdtEntity`] per record
//! id, each persisted at `base_key.child(id)`. Record stores are created
//! lazily on first use; concurrent lookups of a record that is still being
//! set up wait for that one construction to finish.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;
use tracing::{debug, trace};

use crate::Result;
use crate::crdt::{CrdtEntity, EntityData, EntityOperation, ReferenceId};
use crate::store::{
    Callback, CallbackRegistry, CallbackToken, CrdtType, DirectStore, DriverProvider,
    ProxyMessage, StorageKey, StorageMode, StoreError, StoreOptions, StoreModel,
};

/// A proxy message addressed to one record.
#[derive(Debug, Clone, PartialEq)]
pub struct MuxedProxyMessage {
    pub mux_id: ReferenceId,
    pub message: ProxyMessage<EntityData, EntityOperation>,
}

impl MuxedProxyMessage {
    pub fn new(
        mux_id: impl Into<ReferenceId>,
        message: ProxyMessage<EntityData, EntityOperation>,
    ) -> Self {
        Self {
            mux_id: mux_id.into(),
            message,
        }
    }
}

pub type MuxedCallback = Callback<MuxedProxyMessage>;

type RecordCell = Arc<OnceCell<DirectStore<CrdtEntity>>>;

struct BackingInner<P> {
    base_key: StorageKey,
    provider: Arc<P>,
    stores: Mutex<HashMap<ReferenceId, RecordCell>>,
    callbacks: Arc<CallbackRegistry<MuxedProxyMessage>>,
}

/// Store of entity records keyed by id.
pub struct BackingStore<P> {
    inner: Arc<BackingInner<P>>,
}

impl<P> Clone for BackingStore<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P> std::fmt::Debug for BackingStore<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackingStore")
            .field("base_key", &self.inner.base_key)
            .field("records", &self.inner.stores.lock().unwrap().len())
            .finish()
    }
}

impl<P: DriverProvider> BackingStore<P> {
    pub fn new(options: StoreOptions<EntityData>, provider: Arc<P>) -> Result<Self> {
        options.validate()?;
        let base_key = options.direct_key()?.clone();
        if options.mode != StorageMode::Backing || options.crdt_type != CrdtType::Entity {
            return Err(StoreError::InvalidConfiguration {
                key: base_key.to_string(),
                reason: format!(
                    "backing stores need Backing mode and Entity records, got {:?} / {:?}",
                    options.mode, options.crdt_type
                ),
            }
            .into());
        }
        Ok(Self {
            inner: Arc::new(BackingInner {
                base_key,
                provider,
                stores: Mutex::new(HashMap::new()),
                callbacks: Arc::new(CallbackRegistry::new()),
            }),
        })
    }

    pub fn base_key(&self) -> &StorageKey {
        &self.inner.base_key
    }

    /// Store for record `id`, created on first use.
    pub async fn store_for(&self, id: &str) -> Result<DirectStore<CrdtEntity>> {
        let cell = self
            .inner
            .stores
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        cell.get_or_try_init(|| self.setup_store(id))
            .await
            .cloned()
    }

    async fn setup_store(&self, id: &str) -> Result<DirectStore<CrdtEntity>> {
        let key = self.inner.base_key.child(id);
        debug!(id, key = %key, "creating record store");
        let options = StoreOptions::new(key, CrdtEntity::CRDT_TYPE, StorageMode::Backing);
        let store = DirectStore::<CrdtEntity>::new(options, self.inner.provider.as_ref()).await?;

        let callbacks = self.inner.callbacks.clone();
        let mux_id = id.to_string();
        store.on(Arc::new(move |message: ProxyMessage<EntityData, EntityOperation>| {
            // Skip whichever backing client the change came from.
            let origin = message.id();
            callbacks.deliver(&MuxedProxyMessage::new(mux_id.clone(), message), origin);
        }));
        Ok(store)
    }

    /// Route a message to its record's store.
    pub async fn on_proxy_message(&self, muxed: MuxedProxyMessage) -> Result<bool> {
        let MuxedProxyMessage { mux_id, message } = muxed;
        let store = self.store_for(&mux_id).await?;
        trace!(id = %mux_id, kind = message.kind(), "backing message");

        match message {
            ProxyMessage::SyncRequest { id } => {
                if let Some(id) = id {
                    let model = store.local_data().await?;
                    self.inner.callbacks.send_to(
                        id,
                        MuxedProxyMessage::new(
                            mux_id,
                            ProxyMessage::ModelUpdate {
                                model,
                                id: Some(id),
                            },
                        ),
                    );
                }
                Ok(true)
            }
            message => {
                let origin = message.id();
                let accepted = store.on_proxy_message(message).await?;
                if !accepted && let Some(origin) = origin {
                    self.inner.callbacks.send_to(
                        origin,
                        MuxedProxyMessage::new(
                            mux_id,
                            ProxyMessage::SyncRequest { id: Some(origin) },
                        ),
                    );
                }
                Ok(accepted)
            }
        }
    }

    /// Copy of record `id`'s data, creating the record store if needed.
    pub async fn get_local_data(&self, id: &str) -> Result<EntityData> {
        self.store_for(id).await?.local_data().await
    }

    pub fn on(&self, callback: MuxedCallback) -> CallbackToken {
        self.inner.callbacks.register(callback)
    }

    pub fn off(&self, token: CallbackToken) -> bool {
        self.inner.callbacks.unregister(token)
    }

    /// Ids of records whose stores have been created.
    pub fn record_ids(&self) -> Vec<ReferenceId> {
        let mut ids: Vec<ReferenceId> = self
            .inner
            .stores
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Wait until record `id` has nothing in flight.
    pub async fn idle_record(&self, id: &str) -> Result<()> {
        self.store_for(id).await?.idle().await
    }

    /// Wait until every created record store has nothing in flight.
    pub async fn idle(&self) -> Result<()> {
        let stores: Vec<DirectStore<CrdtEntity>> = self
            .inner
            .stores
            .lock()
            .unwrap()
            .values()
            .filter_map(|cell| cell.get().cloned())
            .collect();
        for store in stores {
            store.idle().await?;
        }
        Ok(())
    }
}
