//! Stores keep CRDT models synchronized with drivers and client proxies.
//!
//! - [`DirectStore`] owns one model and one [`Driver`], sending every local
//!   change and merging everything the driver pushes.
//! - [`BackingStore`] multiplexes one [`DirectStore`] per record id under a
//!   shared base location.
//! - [`ReferenceModeStore`] presents a collection of full records while
//!   persisting a collection of references plus one backing record per id.
//!
//! Proxies talk to every store with [`ProxyMessage`]s and receive updates
//! through callbacks registered with `on`.

use async_trait::async_trait;

use crate::Result;
use crate::crdt::{CrdtCount, CrdtData, CrdtEntity, CrdtModel, CrdtOperation, CrdtSet, CrdtSingleton, Referencable};

pub mod backing;
pub mod direct;
pub mod driver;
pub mod errors;
pub mod options;
pub mod proxy;
pub mod reference_mode;
pub mod state;

pub use backing::{BackingStore, MuxedCallback, MuxedProxyMessage};
pub use direct::DirectStore;
pub use driver::{
    Driver, DriverProvider, DriverReceiver, VolatileDriver, VolatileDriverProvider,
    VolatileMemory,
};
pub use errors::StoreError;
pub use options::{
    CrdtType, DEFAULT_SYNC_TIMEOUT_MS, ReferenceModeStorageKey, StorageKey, StorageMode,
    StoreKey, StoreOptions,
};
pub use proxy::{Callback, CallbackRegistry, CallbackToken, ProxyCallback, ProxyMessage};
pub use reference_mode::{
    CollectionData, CollectionOperation, RefModeData, RefModeOperation, Reference,
    ReferenceModeStore,
};
pub use state::{StoreEffect, StoreEvent, StoreState};

/// A model a store can be configured to hold.
pub trait StoreModel: CrdtModel {
    const CRDT_TYPE: CrdtType;
}

impl StoreModel for CrdtCount {
    const CRDT_TYPE: CrdtType = CrdtType::Count;
}

impl<T: Referencable> StoreModel for CrdtSet<T> {
    const CRDT_TYPE: CrdtType = CrdtType::Set;
}

impl<T: Referencable> StoreModel for CrdtSingleton<T> {
    const CRDT_TYPE: CrdtType = CrdtType::Singleton;
}

impl StoreModel for CrdtEntity {
    const CRDT_TYPE: CrdtType = CrdtType::Entity;
}

/// Common surface of stores that proxies talk to.
#[async_trait]
pub trait ActiveStore: Send + Sync {
    type Data: CrdtData;
    type Operation: CrdtOperation;

    fn storage_key(&self) -> StoreKey;

    /// Apply a proxy message. `Ok(false)` means the message was rejected.
    async fn on_proxy_message(
        &self,
        message: ProxyMessage<Self::Data, Self::Operation>,
    ) -> Result<bool>;

    fn on(&self, callback: ProxyCallback<Self::Data, Self::Operation>) -> CallbackToken;

    fn off(&self, token: CallbackToken) -> bool;

    /// Wait until the store has nothing in flight.
    async fn idle(&self) -> Result<()>;

    /// Copy of the data proxies would see.
    async fn local_data(&self) -> Result<Self::Data>;
}
