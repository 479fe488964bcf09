//! A store keeping one CRDT model in sync with one driver.
//!
//! [`DirectStore`] is a cheap, cloneable handle. The model itself is owned by
//! a background worker task that drains three inputs: commands from handles,
//! models pushed by the driver, and the outcomes of sends to the driver. Only
//! one send is ever in flight; the state machine in [`super::state`] decides
//! when to send again and when driver models may be merged.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use crate::Result;
use crate::crdt::{CRDTError, CrdtChange, CrdtModel};
use crate::store::{
    ActiveStore, CallbackRegistry, CallbackToken, Driver, DriverProvider, ProxyCallback,
    ProxyMessage, StorageKey, StorageMode, StoreError, StoreKey, StoreModel, StoreOptions,
    state::{StoreEffect, StoreEvent, StoreState, transition},
};

type Message<M> = ProxyMessage<<M as CrdtModel>::Data, <M as CrdtModel>::Operation>;

/// Commands sent from handles to the worker.
enum Command<M: CrdtModel> {
    ProxyMessage {
        message: Message<M>,
        reply: oneshot::Sender<Result<bool>>,
    },
    LocalData {
        reply: oneshot::Sender<M::Data>,
    },
    Version {
        reply: oneshot::Sender<u64>,
    },
    State {
        reply: oneshot::Sender<StoreState>,
    },
    Idle {
        reply: oneshot::Sender<Result<()>>,
    },
}

// oneshot senders and model data make a derived Debug noisy; log the kind only.
impl<M: CrdtModel> std::fmt::Debug for Command<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProxyMessage { message, .. } => f
                .debug_struct("ProxyMessage")
                .field("kind", &message.kind())
                .field("id", &message.id())
                .finish(),
            Self::LocalData { .. } => write!(f, "LocalData"),
            Self::Version { .. } => write!(f, "Version"),
            Self::State { .. } => write!(f, "State"),
            Self::Idle { .. } => write!(f, "Idle"),
        }
    }
}

/// Result of one send to the driver.
#[derive(Debug)]
struct SendOutcome {
    version: u64,
    accepted: bool,
}

/// Handle to a store synchronizing one model with one driver.
pub struct DirectStore<M: CrdtModel> {
    key: StorageKey,
    commands: mpsc::UnboundedSender<Command<M>>,
    callbacks: Arc<CallbackRegistry<Message<M>>>,
}

impl<M: CrdtModel> Clone for DirectStore<M> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            commands: self.commands.clone(),
            callbacks: self.callbacks.clone(),
        }
    }
}

impl<M: CrdtModel> std::fmt::Debug for DirectStore<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectStore")
            .field("key", &self.key)
            .field("callbacks", &self.callbacks)
            .finish()
    }
}

impl<M: StoreModel> DirectStore<M> {
    /// Create a store, obtaining its driver from `provider`.
    pub async fn new<P: DriverProvider>(options: StoreOptions<M::Data>, provider: &P) -> Result<Self> {
        let driver = provider.driver::<M::Data>(options.direct_key()?)?;
        Self::with_driver(options, driver).await
    }

    /// Create a store over an existing driver.
    pub async fn with_driver(
        options: StoreOptions<M::Data>,
        driver: Arc<dyn Driver<M::Data>>,
    ) -> Result<Self> {
        options.validate()?;
        let key = options.direct_key()?.clone();
        let invalid = |reason: String| -> crate::Error {
            StoreError::InvalidConfiguration {
                key: key.to_string(),
                reason,
            }
            .into()
        };
        if options.mode == StorageMode::ReferenceMode {
            return Err(invalid("a direct store cannot run in reference mode".to_string()));
        }
        if options.crdt_type != M::CRDT_TYPE {
            return Err(invalid(format!(
                "options name a {:?} model but the store holds {:?}",
                options.crdt_type,
                M::CRDT_TYPE
            )));
        }
        if driver.storage_key() != &key {
            return Err(invalid(format!(
                "driver is bound to '{}'",
                driver.storage_key()
            )));
        }

        let model = options.initial_model.map(M::from_data).unwrap_or_default();
        let (driver_tx, driver_rx) = mpsc::unbounded_channel();
        driver
            .register_receiver(options.version_token, driver_tx)
            .await?;

        Ok(Self::spawn(key, model, driver, driver_rx))
    }

    fn spawn(
        key: StorageKey,
        model: M,
        driver: Arc<dyn Driver<M::Data>>,
        driver_rx: mpsc::UnboundedReceiver<(M::Data, u64)>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let callbacks = Arc::new(CallbackRegistry::new());

        let worker = DirectStoreWorker {
            key: key.clone(),
            model,
            version: 0,
            state: StoreState::Idle,
            driver,
            callbacks: callbacks.clone(),
            pending_driver_models: VecDeque::new(),
            idle_waiters: Vec::new(),
            divergence: None,
            command_rx,
            driver_rx,
            send_tx,
            send_rx,
        };
        let span = info_span!("direct_store", key = %key);
        tokio::spawn(worker.run().instrument(span));

        Self {
            key,
            commands,
            callbacks,
        }
    }
}

impl<M: CrdtModel> DirectStore<M> {
    pub fn key(&self) -> &StorageKey {
        &self.key
    }

    fn stopped(&self) -> crate::Error {
        StoreError::WorkerStopped {
            key: self.key.to_string(),
        }
        .into()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command<M>) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| self.stopped())?;
        rx.await.map_err(|_| self.stopped())
    }

    /// Apply a message from a proxy. `Ok(false)` means it was rejected and
    /// the sender has been asked to resynchronize.
    pub async fn on_proxy_message(&self, message: Message<M>) -> Result<bool> {
        self.request(|reply| Command::ProxyMessage { message, reply })
            .await?
    }

    /// Register a proxy callback.
    pub fn on(&self, callback: ProxyCallback<M::Data, M::Operation>) -> CallbackToken {
        self.callbacks.register(callback)
    }

    pub fn off(&self, token: CallbackToken) -> bool {
        self.callbacks.unregister(token)
    }

    /// Copy of the current model data.
    pub async fn local_data(&self) -> Result<M::Data> {
        self.request(|reply| Command::LocalData { reply }).await
    }

    /// Last version acknowledged by or received from the driver.
    pub async fn version(&self) -> Result<u64> {
        self.request(|reply| Command::Version { reply }).await
    }

    pub async fn state(&self) -> Result<StoreState> {
        self.request(|reply| Command::State { reply }).await
    }

    /// Wait until no send is in flight and no driver model is buffered.
    ///
    /// Fails if a driver model could not be merged since the last call.
    pub async fn idle(&self) -> Result<()> {
        self.request(|reply| Command::Idle { reply }).await?
    }
}

#[async_trait]
impl<M: CrdtModel> ActiveStore for DirectStore<M> {
    type Data = M::Data;
    type Operation = M::Operation;

    fn storage_key(&self) -> StoreKey {
        StoreKey::Direct(self.key.clone())
    }

    async fn on_proxy_message(&self, message: Message<M>) -> Result<bool> {
        DirectStore::on_proxy_message(self, message).await
    }

    fn on(&self, callback: ProxyCallback<M::Data, M::Operation>) -> CallbackToken {
        DirectStore::on(self, callback)
    }

    fn off(&self, token: CallbackToken) -> bool {
        DirectStore::off(self, token)
    }

    async fn idle(&self) -> Result<()> {
        DirectStore::idle(self).await
    }

    async fn local_data(&self) -> Result<M::Data> {
        DirectStore::local_data(self).await
    }
}

struct DirectStoreWorker<M: CrdtModel> {
    key: StorageKey,
    model: M,
    version: u64,
    state: StoreState,
    driver: Arc<dyn Driver<M::Data>>,
    callbacks: Arc<CallbackRegistry<Message<M>>>,
    /// Driver models that arrived while a send was in flight, in arrival order.
    pending_driver_models: VecDeque<(M::Data, u64)>,
    idle_waiters: Vec<oneshot::Sender<Result<()>>>,
    /// Last driver model merge failure, reported to the next idle waiters.
    divergence: Option<CRDTError>,
    command_rx: mpsc::UnboundedReceiver<Command<M>>,
    driver_rx: mpsc::UnboundedReceiver<(M::Data, u64)>,
    send_tx: mpsc::UnboundedSender<SendOutcome>,
    send_rx: mpsc::UnboundedReceiver<SendOutcome>,
}

impl<M: CrdtModel> DirectStoreWorker<M> {
    async fn run(mut self) {
        debug!("direct store worker started");
        loop {
            // Driver traffic first, so a command never observes a model
            // that has already been pushed but not merged.
            tokio::select! {
                biased;

                Some((data, version)) = self.driver_rx.recv() => {
                    self.on_driver_model(data, version);
                }
                Some(outcome) = self.send_rx.recv() => {
                    self.on_send_outcome(outcome);
                }
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    // Every handle is gone.
                    None => break,
                },
            }
            self.notify_idle();
        }
        info!(state = %self.state, version = self.version, "direct store worker stopped");
    }

    fn handle_command(&mut self, command: Command<M>) {
        trace!(?command, "handling command");
        match command {
            Command::ProxyMessage { message, reply } => {
                let result = self.on_proxy_message(message);
                let _ = reply.send(result);
            }
            Command::LocalData { reply } => {
                let _ = reply.send(self.model.data());
            }
            Command::Version { reply } => {
                let _ = reply.send(self.version);
            }
            Command::State { reply } => {
                let _ = reply.send(self.state);
            }
            Command::Idle { reply } => self.idle_waiters.push(reply),
        }
    }

    fn is_idle(&self) -> bool {
        self.state == StoreState::Idle && self.pending_driver_models.is_empty()
    }

    fn notify_idle(&mut self) {
        if !self.is_idle() || self.idle_waiters.is_empty() {
            return;
        }
        let divergence = self.divergence.take();
        for waiter in self.idle_waiters.drain(..) {
            let outcome = match &divergence {
                Some(err) => Err(err.clone().into()),
                None => Ok(()),
            };
            let _ = waiter.send(outcome);
        }
    }

    fn on_proxy_message(&mut self, message: Message<M>) -> Result<bool> {
        match message {
            ProxyMessage::SyncRequest { id } => {
                if let Some(id) = id {
                    self.callbacks.send_to(
                        id,
                        ProxyMessage::ModelUpdate {
                            model: self.model.data(),
                            id: Some(id),
                        },
                    );
                }
                Ok(true)
            }
            ProxyMessage::Operations { operations, id } => {
                let mut next = self.model.clone();
                for op in &operations {
                    if !next.apply_operation(op)? {
                        debug!(
                            ?id,
                            operations = operations.len(),
                            "rejected proxy operations, requesting resync"
                        );
                        if let Some(id) = id {
                            self.callbacks
                                .send_to(id, ProxyMessage::SyncRequest { id: Some(id) });
                        }
                        return Ok(false);
                    }
                }
                self.model = next;
                if !operations.is_empty() {
                    self.deliver(CrdtChange::Operations(operations), id);
                    self.apply_event(StoreEvent::LocalChange);
                }
                Ok(true)
            }
            ProxyMessage::ModelUpdate { model, id } => {
                let changes = self.model.merge(model)?;
                if !changes.model_change.is_empty() {
                    self.deliver(changes.model_change, id);
                    self.apply_event(StoreEvent::LocalChange);
                }
                Ok(true)
            }
        }
    }

    fn on_driver_model(&mut self, data: M::Data, version: u64) {
        if !self.state.accepts_driver_models() {
            trace!(version, state = %self.state, "buffering driver model");
            self.pending_driver_models.push_back((data, version));
            return;
        }
        self.merge_driver_model(data, version);
    }

    fn merge_driver_model(&mut self, data: M::Data, version: u64) {
        let changes = match self.model.merge(data) {
            Ok(changes) => changes,
            Err(e) => {
                error!(version, error = %e, "failed to merge driver model");
                self.divergence = Some(match e {
                    crate::Error::CRDT(err) => err,
                    other => CRDTError::DivergentVersion {
                        reason: other.to_string(),
                    },
                });
                self.apply_event(StoreEvent::DriverModelDiverged);
                return;
            }
        };
        self.divergence = None;
        debug!(
            version,
            local_changed = !changes.model_change.is_empty(),
            driver_behind = !changes.other_change.is_empty(),
            "merged driver model"
        );
        self.version = version;
        self.deliver(changes.model_change, None);
        self.apply_event(StoreEvent::DriverModelMerged {
            driver_side_changes: !changes.other_change.is_empty(),
        });
    }

    fn on_send_outcome(&mut self, outcome: SendOutcome) {
        if outcome.accepted {
            debug!(version = outcome.version, "driver acknowledged send");
            self.version = outcome.version;
            self.apply_event(StoreEvent::SendAcknowledged);
        } else {
            debug!(version = outcome.version, "driver rejected send");
            self.apply_event(StoreEvent::SendRejected);
        }
    }

    fn apply_event(&mut self, event: StoreEvent) {
        let (next, effects) = transition(self.state, event);
        if next != self.state {
            debug!(from = %self.state, to = %next, ?event, "state transition");
        }
        self.state = next;
        for effect in effects {
            match effect {
                StoreEffect::SendToDriver => self.send_to_driver(),
                StoreEffect::ApplyPendingDriverModels => self.apply_pending_driver_models(),
            }
        }
    }

    fn send_to_driver(&mut self) {
        let version = self.version + 1;
        let data = self.model.data();
        let driver = self.driver.clone();
        let outcomes = self.send_tx.clone();
        trace!(version, "sending model to driver");
        tokio::spawn(
            async move {
                let accepted = match driver.send(data, version).await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(version, error = %e, "driver send failed");
                        false
                    }
                };
                let _ = outcomes.send(SendOutcome { version, accepted });
            }
            .in_current_span(),
        );
    }

    fn apply_pending_driver_models(&mut self) {
        let pending = std::mem::take(&mut self.pending_driver_models);
        for (data, version) in pending {
            // A merge may start a new send, after which the rest are buffered again.
            self.on_driver_model(data, version);
        }
    }

    /// Send a change to every proxy except the one it came from.
    fn deliver(&self, change: CrdtChange<M::Data, M::Operation>, origin: Option<CallbackToken>) {
        let message = match change {
            CrdtChange::Operations(operations) if operations.is_empty() => return,
            CrdtChange::Operations(operations) => ProxyMessage::Operations {
                operations,
                id: origin,
            },
            CrdtChange::Data(model) => ProxyMessage::ModelUpdate { model, id: origin },
        };
        self.callbacks.deliver(&message, origin);
    }
}
