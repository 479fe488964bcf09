//! Collections of large records, persisted as references plus a backing store.
//!
//! A [`ReferenceModeStore`] looks to its proxies like a store of a set or
//! singleton of [`RawEntity`] records. Underneath it keeps two stores:
//!
//! - a container [`DirectStore`] holding a set or singleton of [`Reference`]s,
//! - a [`BackingStore`] holding one entity per referenced id.
//!
//! Proxy writes go to the backing store first and reach the container only
//! after every record write has settled, so no replica ever sees a reference
//! to a record that was never stored. Container updates arriving from other
//! replicas are held back until the records they reference are present at
//! the referenced version, then hydrated and forwarded to proxies in order.
//!
//! Every input (proxy messages, container updates, backing updates, timers)
//! is handled by a single worker task, one at a time.

mod send_queue;
mod types;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use crate::Result;
use crate::crdt::{
    Actor, CrdtSet, CrdtSingleton, DataValue, EntityData, EntityOperation, FieldName, RawEntity,
    ReferenceId, SetData, SetOperation, SingletonOperation, VersionMap,
};
use crate::store::{
    ActiveStore, BackingStore, CallbackRegistry, CallbackToken, CrdtType, DirectStore,
    DriverProvider, MuxedProxyMessage, ProxyCallback, ProxyMessage, ReferenceModeStorageKey,
    StorageMode, StoreError, StoreKey, StoreOptions,
};

use send_queue::{BlockId, SendQueue};
pub use types::{
    CollectionData, CollectionOperation, RefModeData, RefModeOperation, Reference,
};
use types::map_set_data;

type RefModeMessage = ProxyMessage<RefModeData, RefModeOperation>;
type ContainerMessage = ProxyMessage<SetData<Reference>, CollectionOperation<Reference>>;

enum Input {
    Proxy {
        message: RefModeMessage,
        reply: oneshot::Sender<Result<bool>>,
    },
    Container(ContainerMessage),
    Backing {
        id: ReferenceId,
    },
    SyncTimeout {
        block: BlockId,
        requester: CallbackToken,
    },
    LocalData {
        reply: oneshot::Sender<Result<RefModeData>>,
    },
    Barrier {
        reply: oneshot::Sender<()>,
    },
}

/// Something to tell proxies once the records it needs are available.
enum Outbound {
    /// Pass a proxy's message on to every other proxy.
    Mirror {
        message: RefModeMessage,
        except: Option<CallbackToken>,
    },
    /// A container operation, hydrated and broadcast.
    Operation(CollectionOperation<Reference>),
    /// A container model, hydrated and broadcast.
    Model(SetData<Reference>),
    /// A hydrated model for one proxy.
    SyncReply {
        to: CallbackToken,
        data: SetData<Reference>,
    },
    LocalData {
        reply: oneshot::Sender<Result<RefModeData>>,
        data: SetData<Reference>,
    },
}

/// The container store, over whichever collection type it holds.
#[derive(Debug, Clone)]
enum ContainerStore {
    Set(DirectStore<CrdtSet<Reference>>),
    Singleton(DirectStore<CrdtSingleton<Reference>>),
}

fn lift<O>(
    message: ProxyMessage<SetData<Reference>, O>,
    f: impl Fn(O) -> CollectionOperation<Reference>,
) -> ContainerMessage {
    match message {
        ProxyMessage::SyncRequest { id } => ProxyMessage::SyncRequest { id },
        ProxyMessage::ModelUpdate { model, id } => ProxyMessage::ModelUpdate { model, id },
        ProxyMessage::Operations { operations, id } => ProxyMessage::Operations {
            operations: operations.into_iter().map(f).collect(),
            id,
        },
    }
}

impl ContainerStore {
    fn subscribe(&self, inputs: mpsc::WeakUnboundedSender<Input>) -> CallbackToken {
        let forward = move |message: ContainerMessage| {
            if let Some(inputs) = inputs.upgrade() {
                let _ = inputs.send(Input::Container(message));
            }
        };
        match self {
            ContainerStore::Set(store) => store.on(Arc::new(
                move |message: ProxyMessage<SetData<Reference>, SetOperation<Reference>>| {
                    forward(lift(message, CollectionOperation::Set))
                },
            )),
            ContainerStore::Singleton(store) => store.on(Arc::new(
                move |message: ProxyMessage<SetData<Reference>, SingletonOperation<Reference>>| {
                    forward(lift(message, CollectionOperation::Singleton))
                },
            )),
        }
    }

    async fn local_data(&self) -> Result<SetData<Reference>> {
        match self {
            ContainerStore::Set(store) => store.local_data().await,
            ContainerStore::Singleton(store) => store.local_data().await,
        }
    }

    async fn apply(&self, op: CollectionOperation<Reference>, id: CallbackToken) -> Result<bool> {
        match (self, op) {
            (ContainerStore::Set(store), CollectionOperation::Set(op)) => {
                store
                    .on_proxy_message(ProxyMessage::Operations {
                        operations: vec![op],
                        id: Some(id),
                    })
                    .await
            }
            (ContainerStore::Singleton(store), CollectionOperation::Singleton(op)) => {
                store
                    .on_proxy_message(ProxyMessage::Operations {
                        operations: vec![op],
                        id: Some(id),
                    })
                    .await
            }
            (_, op) => Err(StoreError::UnsupportedMessage {
                key: self.key(),
                reason: format!("{:?} operation on a {:?} container", op.kind(), self.kind()),
            }
            .into()),
        }
    }

    async fn merge(&self, model: SetData<Reference>, id: CallbackToken) -> Result<bool> {
        let id = Some(id);
        match self {
            ContainerStore::Set(store) => {
                store.on_proxy_message(ProxyMessage::ModelUpdate { model, id }).await
            }
            ContainerStore::Singleton(store) => {
                store.on_proxy_message(ProxyMessage::ModelUpdate { model, id }).await
            }
        }
    }

    async fn idle(&self) -> Result<()> {
        match self {
            ContainerStore::Set(store) => store.idle().await,
            ContainerStore::Singleton(store) => store.idle().await,
        }
    }

    fn kind(&self) -> CrdtType {
        match self {
            ContainerStore::Set(_) => CrdtType::Set,
            ContainerStore::Singleton(_) => CrdtType::Singleton,
        }
    }

    fn key(&self) -> String {
        match self {
            ContainerStore::Set(store) => store.key().to_string(),
            ContainerStore::Singleton(store) => store.key().to_string(),
        }
    }
}

/// Handle to a store presenting a collection of full records.
pub struct ReferenceModeStore<P> {
    key: ReferenceModeStorageKey,
    inputs: mpsc::UnboundedSender<Input>,
    callbacks: Arc<CallbackRegistry<RefModeMessage>>,
    container: ContainerStore,
    backing: BackingStore<P>,
}

impl<P> Clone for ReferenceModeStore<P> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            inputs: self.inputs.clone(),
            callbacks: self.callbacks.clone(),
            container: self.container.clone(),
            backing: self.backing.clone(),
        }
    }
}

impl<P> std::fmt::Debug for ReferenceModeStore<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceModeStore")
            .field("key", &self.key)
            .field("kind", &self.container.kind())
            .field("callbacks", &self.callbacks)
            .finish()
    }
}

impl<P: DriverProvider> ReferenceModeStore<P> {
    /// Create a store over a container at `storage_key` and records under
    /// `backing_key`, both obtained from `provider`.
    pub async fn new(options: StoreOptions<RefModeData>, provider: Arc<P>) -> Result<Self> {
        options.validate()?;
        let key = match &options.key {
            StoreKey::ReferenceMode(key) => key.clone(),
            StoreKey::Direct(key) => {
                return Err(StoreError::InvalidConfiguration {
                    key: key.to_string(),
                    reason: "reference-mode stores need a reference-mode key".to_string(),
                }
                .into());
            }
        };
        if let Some(model) = &options.initial_model
            && model.kind() != options.crdt_type
        {
            return Err(StoreError::InvalidConfiguration {
                key: key.to_string(),
                reason: format!(
                    "initial model is a {:?} but the store holds a {:?}",
                    model.kind(),
                    options.crdt_type
                ),
            }
            .into());
        }

        let backing = BackingStore::new(
            StoreOptions::new(key.backing_key.clone(), CrdtType::Entity, StorageMode::Backing)
                .with_sync_timeout_ms(options.sync_timeout_ms),
            provider.clone(),
        )?;

        let mut container_options = StoreOptions::<SetData<Reference>>::new(
            key.storage_key.clone(),
            options.crdt_type,
            StorageMode::Direct,
        );
        container_options.version_token = options.version_token.clone();
        let container = match options.crdt_type {
            CrdtType::Singleton => ContainerStore::Singleton(
                DirectStore::new(container_options, provider.as_ref()).await?,
            ),
            _ => ContainerStore::Set(DirectStore::new(container_options, provider.as_ref()).await?),
        };

        let (inputs, input_rx) = mpsc::unbounded_channel();
        let container_token = container.subscribe(inputs.downgrade());
        let backing_inputs = inputs.downgrade();
        let backing_token = backing.on(Arc::new(move |message: MuxedProxyMessage| {
            if let Some(inputs) = backing_inputs.upgrade() {
                let _ = inputs.send(Input::Backing { id: message.mux_id });
            }
        }));

        let callbacks = Arc::new(CallbackRegistry::new());
        let worker = RefModeWorker {
            kind: options.crdt_type,
            container: container.clone(),
            container_token,
            backing: backing.clone(),
            backing_token,
            callbacks: callbacks.clone(),
            crdt_key: uuid::Uuid::new_v4().to_string(),
            versions: HashMap::new(),
            sends: SendQueue::new(),
            sync_timeout: Duration::from_millis(options.sync_timeout_ms),
            timers: inputs.downgrade(),
        };
        let span = info_span!("reference_mode_store", key = %key.storage_key);
        tokio::spawn(worker.run(input_rx).instrument(span));

        let store = Self {
            key,
            inputs,
            callbacks,
            container,
            backing,
        };
        if let Some(model) = options.initial_model {
            store
                .on_proxy_message(ProxyMessage::ModelUpdate { model, id: None })
                .await?;
        }
        Ok(store)
    }

    pub fn key(&self) -> &ReferenceModeStorageKey {
        &self.key
    }

    pub fn crdt_type(&self) -> CrdtType {
        self.container.kind()
    }

    /// The store holding the referenced records.
    pub fn backing(&self) -> &BackingStore<P> {
        &self.backing
    }

    fn stopped(&self) -> crate::Error {
        StoreError::WorkerStopped {
            key: self.key.to_string(),
        }
        .into()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Input) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.inputs.send(make(reply)).map_err(|_| self.stopped())?;
        rx.await.map_err(|_| self.stopped())
    }

    /// Apply a message from a proxy. `Ok(false)` means an operation was
    /// rejected and the sender has been asked to resynchronize.
    pub async fn on_proxy_message(&self, message: RefModeMessage) -> Result<bool> {
        self.request(|reply| Input::Proxy { message, reply }).await?
    }

    pub fn on(&self, callback: ProxyCallback<RefModeData, RefModeOperation>) -> CallbackToken {
        self.callbacks.register(callback)
    }

    pub fn off(&self, token: CallbackToken) -> bool {
        self.callbacks.unregister(token)
    }

    /// The collection with every reference replaced by its record.
    ///
    /// Waits for referenced records that have not arrived yet.
    pub async fn local_data(&self) -> Result<RefModeData> {
        self.request(|reply| Input::LocalData { reply }).await?
    }

    async fn barrier(&self) -> Result<()> {
        self.request(|reply| Input::Barrier { reply }).await
    }

    /// Wait until queued inputs are handled and both underlying stores are idle.
    pub async fn idle(&self) -> Result<()> {
        self.barrier().await?;
        self.container.idle().await?;
        self.backing.idle().await?;
        self.barrier().await
    }
}

#[async_trait]
impl<P: DriverProvider> ActiveStore for ReferenceModeStore<P> {
    type Data = RefModeData;
    type Operation = RefModeOperation;

    fn storage_key(&self) -> StoreKey {
        StoreKey::ReferenceMode(self.key.clone())
    }

    async fn on_proxy_message(&self, message: RefModeMessage) -> Result<bool> {
        ReferenceModeStore::on_proxy_message(self, message).await
    }

    fn on(&self, callback: ProxyCallback<RefModeData, RefModeOperation>) -> CallbackToken {
        ReferenceModeStore::on(self, callback)
    }

    fn off(&self, token: CallbackToken) -> bool {
        ReferenceModeStore::off(self, token)
    }

    async fn idle(&self) -> Result<()> {
        ReferenceModeStore::idle(self).await
    }

    async fn local_data(&self) -> Result<RefModeData> {
        ReferenceModeStore::local_data(self).await
    }
}

struct RefModeWorker<P> {
    kind: CrdtType,
    container: ContainerStore,
    /// Our subscription on the container; container writes carry it so they
    /// are not echoed back.
    container_token: CallbackToken,
    backing: BackingStore<P>,
    backing_token: CallbackToken,
    callbacks: Arc<CallbackRegistry<RefModeMessage>>,
    /// Actor that stamps the record versions this store synthesizes.
    crdt_key: Actor,
    /// Last synthesized version of each field of each record.
    versions: HashMap<ReferenceId, BTreeMap<FieldName, u64>>,
    sends: SendQueue<Outbound>,
    sync_timeout: Duration,
    timers: mpsc::WeakUnboundedSender<Input>,
}

impl<P: DriverProvider> RefModeWorker<P> {
    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<Input>) {
        debug!(crdt_key = %self.crdt_key, kind = ?self.kind, "reference mode worker started");
        while let Some(input) = inputs.recv().await {
            self.handle(input).await;
        }
        info!(pending_sends = self.sends.len(), "reference mode worker stopped");
    }

    async fn handle(&mut self, input: Input) {
        match input {
            Input::Proxy { message, reply } => {
                trace!(kind = message.kind(), id = ?message.id(), "proxy message");
                let result = self.on_proxy_message(message).await;
                if let Err(e) = &result {
                    warn!(error = %e, "proxy message failed");
                }
                let _ = reply.send(result);
            }
            Input::Container(message) => {
                if let Err(e) = self.on_container_message(message).await {
                    error!(error = %e, "failed to handle container update");
                }
            }
            Input::Backing { id } => {
                if let Err(e) = self.on_backing_update(&id).await {
                    error!(id, error = %e, "failed to handle backing update");
                }
            }
            Input::SyncTimeout { block, requester } => {
                if let Err(e) = self.on_sync_timeout(block, requester).await {
                    error!(block, error = %e, "failed to recover from sync timeout");
                }
            }
            Input::LocalData { reply } => self.on_local_data(reply).await,
            Input::Barrier { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn unsupported(&self, reason: String) -> crate::Error {
        StoreError::UnsupportedMessage {
            key: self.container.key(),
            reason,
        }
        .into()
    }

    fn check_kind(&self, kind: CrdtType) -> Result<()> {
        if kind != self.kind {
            return Err(self.unsupported(format!(
                "{kind:?} message sent to a {:?} store",
                self.kind
            )));
        }
        Ok(())
    }

    async fn on_proxy_message(&mut self, message: RefModeMessage) -> Result<bool> {
        match message {
            ProxyMessage::SyncRequest { id } => {
                let Some(requester) = id else {
                    debug!("sync request without a reply channel");
                    return Ok(true);
                };
                let data = self.container.local_data().await?;
                let pending = self.pending_records(&data).await?;
                let send = Outbound::SyncReply {
                    to: requester,
                    data,
                };
                if pending.is_empty() {
                    self.enqueue(send).await;
                } else {
                    let block = self.sends.enqueue_blocking(pending, send);
                    self.schedule_sync_timeout(block, requester);
                }
                Ok(true)
            }
            ProxyMessage::Operations { operations, id } => {
                for op in &operations {
                    self.check_kind(op.kind())?;
                }
                for op in operations {
                    let container_op = self.write_through(&op).await?;
                    if !self.container.apply(container_op, self.container_token).await? {
                        debug!(?id, "container rejected operation, requesting resync");
                        if let Some(id) = id {
                            self.callbacks
                                .send_to(id, ProxyMessage::SyncRequest { id: Some(id) });
                        }
                        return Ok(false);
                    }
                    self.enqueue(Outbound::Mirror {
                        message: ProxyMessage::Operations {
                            operations: vec![op],
                            id,
                        },
                        except: id,
                    })
                    .await;
                }
                Ok(true)
            }
            ProxyMessage::ModelUpdate { model, id } => {
                self.check_kind(model.kind())?;
                let data = model.set_data();
                let mut references = SetData::new(data.version_map.clone());
                for (ref_id, item) in &data.values {
                    let reference = self.write_record(&item.value).await?;
                    references
                        .values
                        .insert(ref_id.clone(), DataValue::new(item.version_map.clone(), reference));
                }
                self.container.merge(references, self.container_token).await?;
                self.enqueue(Outbound::Mirror {
                    message: ProxyMessage::ModelUpdate { model, id },
                    except: id,
                })
                .await;
                Ok(true)
            }
        }
    }

    /// Apply the record side of a proxy operation and return its container form.
    async fn write_through(
        &mut self,
        op: &RefModeOperation,
    ) -> Result<CollectionOperation<Reference>> {
        let mut references: HashMap<ReferenceId, Reference> = HashMap::new();
        for entity in op.written() {
            let reference = self.write_record(entity).await?;
            references.insert(reference.id.clone(), reference);
        }
        for entity in op.removed() {
            let reference = self.clear_record(&entity.id).await?;
            references.insert(reference.id.clone(), reference);
        }
        if matches!(op, CollectionOperation::Set(SetOperation::Clear { .. })) {
            self.clear_all_records().await?;
        }
        // A singleton Update or Clear leaves the record it replaced in the backing store.

        let storage_key = self.backing.base_key().clone();
        Ok(op.clone().map_elements(|entity| {
            references
                .remove(&entity.id)
                .unwrap_or_else(|| Reference::new(entity.id, storage_key.clone(), VersionMap::new()))
        }))
    }

    /// Stamp `raw` with fresh per-field versions under this store's actor.
    fn entity_to_model(&mut self, raw: &RawEntity) -> EntityData {
        let counters = self.versions.entry(raw.id.clone()).or_default();
        let mut field_versions = BTreeMap::new();
        let mut max_version = 0;
        for field in raw.field_names() {
            let counter = counters.entry(field.to_string()).or_insert(0);
            *counter += 1;
            max_version = max_version.max(*counter);
            field_versions.insert(
                field.to_string(),
                VersionMap::from([(self.crdt_key.clone(), *counter)]),
            );
        }
        EntityData::from_raw(
            raw,
            &VersionMap::from([(self.crdt_key.clone(), max_version)]),
            &field_versions,
        )
    }

    /// Write `entity` to its backing record and wait for the write to settle.
    async fn write_record(&mut self, entity: &RawEntity) -> Result<Reference> {
        let model = self.entity_to_model(entity);
        self.write_backing(MuxedProxyMessage::new(
            entity.id.clone(),
            ProxyMessage::ModelUpdate {
                model,
                id: Some(self.backing_token),
            },
        ))
        .await
    }

    /// Clear every value the backing record for `id` holds.
    async fn clear_record(&mut self, id: &str) -> Result<Reference> {
        let clock = self.backing.get_local_data(id).await?.version_map;
        let clear = EntityOperation::ClearAll {
            actor: self.crdt_key.clone(),
            clock,
        };
        self.write_backing(MuxedProxyMessage::new(
            id,
            ProxyMessage::Operations {
                operations: vec![clear],
                id: Some(self.backing_token),
            },
        ))
        .await
    }

    async fn clear_all_records(&mut self) -> Result<()> {
        let data = self.container.local_data().await?;
        for id in data.values.keys() {
            self.clear_record(id).await?;
        }
        Ok(())
    }

    async fn write_backing(&mut self, message: MuxedProxyMessage) -> Result<Reference> {
        let id = message.mux_id.clone();
        if !self.backing.on_proxy_message(message).await? {
            return Err(StoreError::BackingWriteFailed {
                id,
                reason: "record store rejected the write".to_string(),
            }
            .into());
        }
        self.backing.idle_record(&id).await?;
        let version = self.backing.get_local_data(&id).await?.version_map;
        trace!(id, %version, "backing record written");
        Ok(Reference::new(id, self.backing.base_key().clone(), version))
    }

    async fn on_container_message(&mut self, message: ContainerMessage) -> Result<()> {
        match message {
            ProxyMessage::Operations { operations, .. } => {
                for op in operations {
                    if matches!(op, CollectionOperation::Set(SetOperation::FastForward { .. })) {
                        // Batches have no per-record form; send the whole collection.
                        let data = self.container.local_data().await?;
                        let pending = self.pending_records(&data).await?;
                        self.enqueue_after(pending, Outbound::Model(data)).await;
                        break;
                    }
                    let mut pending = Vec::new();
                    for reference in op.written() {
                        if self.is_pending(reference).await? {
                            pending.push((reference.id.clone(), reference.version.clone()));
                        }
                    }
                    self.enqueue_after(pending, Outbound::Operation(op)).await;
                }
            }
            ProxyMessage::ModelUpdate { model, .. } => {
                let pending = self.pending_records(&model).await?;
                self.enqueue_after(pending, Outbound::Model(model)).await;
            }
            ProxyMessage::SyncRequest { .. } => {
                // Our own container writes are the only ones it can reject,
                // and the proxy behind them has already been told.
                trace!("ignoring container sync request");
            }
        }
        Ok(())
    }

    async fn on_backing_update(&mut self, id: &str) -> Result<()> {
        let version = self.backing.get_local_data(id).await?.version_map;
        let ready = self.sends.process_id(id, &version);
        self.run_sends(ready).await;
        Ok(())
    }

    async fn on_local_data(&mut self, reply: oneshot::Sender<Result<RefModeData>>) {
        let data = match self.container.local_data().await {
            Ok(data) => data,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        match self.pending_records(&data).await {
            Ok(pending) => {
                self.enqueue_after(pending, Outbound::LocalData { reply, data })
                    .await
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn schedule_sync_timeout(&self, block: BlockId, requester: CallbackToken) {
        let inputs = self.timers.clone();
        let timeout = self.sync_timeout;
        tokio::spawn(
            async move {
                tokio::time::sleep(timeout).await;
                if let Some(inputs) = inputs.upgrade() {
                    let _ = inputs.send(Input::SyncTimeout { block, requester });
                }
            }
            .in_current_span(),
        );
    }

    /// A sync reply waited too long for its records. Treat the backing store
    /// as corrupt: empty the container, tell every proxy, and answer the
    /// sync again.
    async fn on_sync_timeout(&mut self, block: BlockId, requester: CallbackToken) -> Result<()> {
        let Some((_, mut ready)) = self.sends.cancel(block) else {
            return Ok(());
        };
        warn!(
            block,
            %requester,
            timeout_ms = self.sync_timeout.as_millis() as u64,
            "sync request timed out waiting for backing records, clearing container"
        );
        let data = self.container.local_data().await?;
        let clear = match self.kind {
            CrdtType::Singleton => CollectionOperation::Singleton(SingletonOperation::Clear {
                actor: self.crdt_key.clone(),
                clock: data.version_map,
            }),
            _ => CollectionOperation::Set(SetOperation::Clear {
                actor: self.crdt_key.clone(),
                clock: data.version_map,
            }),
        };
        if !self.container.apply(clear, self.container_token).await? {
            warn!("container refused to clear");
        }
        // Nothing still held can rely on the backing store anymore.
        ready.extend(self.sends.release_all());
        ready.push(Outbound::Model(self.container.local_data().await?));
        self.run_sends(ready).await;
        self.on_proxy_message(ProxyMessage::SyncRequest {
            id: Some(requester),
        })
        .await?;
        Ok(())
    }

    /// True if the backing record for `reference` has not reached its version.
    async fn is_pending(&self, reference: &Reference) -> Result<bool> {
        if reference.version.is_empty() {
            return Ok(false);
        }
        let backing = self.backing.get_local_data(&reference.id).await?;
        Ok(!backing.version_map.dominates(&reference.version))
    }

    async fn pending_records(
        &self,
        data: &SetData<Reference>,
    ) -> Result<Vec<(ReferenceId, VersionMap)>> {
        let mut pending = Vec::new();
        for item in data.values.values() {
            if self.is_pending(&item.value).await? {
                pending.push((item.value.id.clone(), item.value.version.clone()));
            }
        }
        Ok(pending)
    }

    async fn enqueue(&mut self, send: Outbound) {
        let ready = self.sends.enqueue(send);
        self.run_sends(ready).await;
    }

    async fn enqueue_after(&mut self, pending: Vec<(ReferenceId, VersionMap)>, send: Outbound) {
        if pending.is_empty() {
            self.enqueue(send).await;
        } else {
            self.sends.enqueue_blocking(pending, send);
        }
    }

    async fn run_sends(&mut self, ready: Vec<Outbound>) {
        for send in ready {
            if let Err(e) = self.run_send(send).await {
                error!(error = %e, "failed to send to proxies");
            }
        }
    }

    async fn run_send(&self, send: Outbound) -> Result<()> {
        match send {
            Outbound::Mirror { message, except } => self.callbacks.deliver(&message, except),
            Outbound::Operation(op) => {
                let op = self.hydrate_operation(op).await?;
                self.callbacks.deliver(
                    &ProxyMessage::Operations {
                        operations: vec![op],
                        id: None,
                    },
                    None,
                );
            }
            Outbound::Model(data) => {
                let model = self.hydrate(data).await?;
                self.callbacks
                    .deliver(&ProxyMessage::ModelUpdate { model, id: None }, None);
            }
            Outbound::SyncReply { to, data } => {
                let model = self.hydrate(data).await?;
                self.callbacks.send_to(
                    to,
                    ProxyMessage::ModelUpdate {
                        model,
                        id: Some(to),
                    },
                );
            }
            Outbound::LocalData { reply, data } => {
                let _ = reply.send(self.hydrate(data).await);
            }
        }
        Ok(())
    }

    async fn hydrate_reference(&self, reference: &Reference) -> Result<RawEntity> {
        if reference.version.is_empty() {
            return Ok(RawEntity::new(reference.id.clone()));
        }
        let mut raw = self.backing.get_local_data(&reference.id).await?.to_raw();
        raw.id = reference.id.clone();
        Ok(raw)
    }

    async fn hydrate(&self, data: SetData<Reference>) -> Result<RefModeData> {
        let mut records = HashMap::new();
        for item in data.values.values() {
            records.insert(item.value.id.clone(), self.hydrate_reference(&item.value).await?);
        }
        let data = map_set_data(data, |id, reference| {
            records
                .remove(id)
                .unwrap_or_else(|| RawEntity::new(reference.id))
        });
        Ok(CollectionData::new(self.kind, data))
    }

    async fn hydrate_operation(
        &self,
        op: CollectionOperation<Reference>,
    ) -> Result<RefModeOperation> {
        let mut records = HashMap::new();
        for reference in op.written().into_iter().chain(op.removed()) {
            records.insert(reference.id.clone(), self.hydrate_reference(reference).await?);
        }
        Ok(op.map_elements(|reference| {
            records
                .remove(&reference.id)
                .unwrap_or_else(|| RawEntity::new(reference.id))
        }))
    }
}
