//! Persistence drivers.
//!
//! A [`Driver`] is the opaque backend a [`DirectStore`](crate::store::DirectStore)
//! synchronizes with. It accepts versioned writes and may push models written
//! by other stores on its own. [`VolatileDriver`] keeps everything in a shared
//! [`VolatileMemory`] and is what the tests and in-process setups use.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::Result;
use crate::crdt::CrdtData;
use crate::store::{StorageKey, StoreError};

/// Channel a driver pushes `(model, version)` pairs into.
pub type DriverReceiver<D> = mpsc::UnboundedSender<(D, u64)>;

/// Persistence backend for one storage key.
#[async_trait]
pub trait Driver<D: CrdtData>: Send + Sync {
    fn storage_key(&self) -> &StorageKey;

    /// Token identifying the data currently held, if any.
    fn token(&self) -> Option<String>;

    /// Register the channel pushed models are delivered to.
    ///
    /// When `token` does not match the driver's current token, the driver
    /// immediately pushes its current data.
    async fn register_receiver(&self, token: Option<String>, receiver: DriverReceiver<D>)
    -> Result<()>;

    /// Write `data` as `version`.
    ///
    /// Returns `Ok(false)` when the driver holds a different version than
    /// `version - 1`. The driver then pushes its current model so the caller
    /// can merge and retry.
    async fn send(&self, data: D, version: u64) -> Result<bool>;
}

/// Creates drivers for storage keys.
pub trait DriverProvider: Send + Sync + 'static {
    fn driver<D: CrdtData>(&self, key: &StorageKey) -> Result<Arc<dyn Driver<D>>>;
}

type RawReceiver = Arc<dyn Fn(serde_json::Value, u64) + Send + Sync>;

#[derive(Default)]
struct VolatileEntry {
    data: Option<serde_json::Value>,
    version: u64,
    token: Option<String>,
    receivers: Vec<(u64, RawReceiver)>,
}

/// In-memory storage shared by every [`VolatileDriver`] created from it.
///
/// Data is held as JSON so drivers for different model types share one map.
#[derive(Default)]
pub struct VolatileMemory {
    entries: Mutex<HashMap<StorageKey, VolatileEntry>>,
}

impl fmt::Debug for VolatileMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolatileMemory")
            .field("entries", &self.entries.lock().unwrap().len())
            .finish()
    }
}

impl VolatileMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored version for `key`, 0 if never written.
    pub fn version(&self, key: &StorageKey) -> u64 {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .map(|entry| entry.version)
            .unwrap_or(0)
    }

    /// Stored data for `key`, decoded as `D`.
    pub fn get<D: DeserializeOwned>(&self, key: &StorageKey) -> Result<Option<(D, u64)>> {
        let stored = self
            .entries
            .lock()
            .unwrap()
            .get(key)
            .and_then(|entry| entry.data.clone().map(|data| (data, entry.version)));
        match stored {
            Some((data, version)) => Ok(Some((serde_json::from_value(data)?, version))),
            None => Ok(None),
        }
    }

    /// Keys that hold data.
    pub fn keys(&self) -> Vec<StorageKey> {
        let mut keys: Vec<StorageKey> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, entry)| entry.data.is_some())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}

static NEXT_DRIVER_ID: AtomicU64 = AtomicU64::new(1);

/// Driver over a [`VolatileMemory`].
///
/// Accepted writes are pushed to every other driver registered on the same
/// key, never back to the writer.
pub struct VolatileDriver<D> {
    key: StorageKey,
    memory: Arc<VolatileMemory>,
    id: u64,
    _data: PhantomData<fn() -> D>,
}

impl<D> fmt::Debug for VolatileDriver<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolatileDriver")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

impl<D: CrdtData> VolatileDriver<D> {
    pub fn new(key: StorageKey, memory: Arc<VolatileMemory>) -> Self {
        Self {
            key,
            memory,
            id: NEXT_DRIVER_ID.fetch_add(1, Ordering::Relaxed),
            _data: PhantomData,
        }
    }

    fn serialization_error(&self, err: serde_json::Error) -> StoreError {
        StoreError::Serialization {
            key: self.key.to_string(),
            reason: err.to_string(),
        }
    }
}

impl<D> Drop for VolatileDriver<D> {
    fn drop(&mut self) {
        if let Ok(mut entries) = self.memory.entries.lock()
            && let Some(entry) = entries.get_mut(&self.key)
        {
            entry.receivers.retain(|(id, _)| *id != self.id);
        }
    }
}

#[async_trait]
impl<D: CrdtData> Driver<D> for VolatileDriver<D> {
    fn storage_key(&self) -> &StorageKey {
        &self.key
    }

    fn token(&self) -> Option<String> {
        self.memory
            .entries
            .lock()
            .unwrap()
            .get(&self.key)
            .and_then(|entry| entry.token.clone())
    }

    async fn register_receiver(
        &self,
        token: Option<String>,
        receiver: DriverReceiver<D>,
    ) -> Result<()> {
        let key = self.key.clone();
        let raw: RawReceiver = Arc::new(move |value, version| {
            match serde_json::from_value::<D>(value) {
                Ok(data) => {
                    // The store may already be gone.
                    let _ = receiver.send((data, version));
                }
                Err(e) => warn!(key = %key, error = %e, "dropping undecodable driver model"),
            }
        });

        let replay = {
            let mut entries = self.memory.entries.lock().unwrap();
            let entry = entries.entry(self.key.clone()).or_default();
            entry.receivers.retain(|(id, _)| *id != self.id);
            entry.receivers.push((self.id, raw.clone()));
            match &entry.data {
                Some(data) if entry.token != token => Some((data.clone(), entry.version)),
                _ => None,
            }
        };

        if let Some((data, version)) = replay {
            debug!(key = %self.key, version, "replaying stored model to new receiver");
            raw(data, version);
        }
        Ok(())
    }

    async fn send(&self, data: D, version: u64) -> Result<bool> {
        let value = serde_json::to_value(&data).map_err(|e| self.serialization_error(e))?;

        let (receivers, pushed) = {
            let mut entries = self.memory.entries.lock().unwrap();
            let entry = entries.entry(self.key.clone()).or_default();
            if version != entry.version + 1 {
                debug!(
                    key = %self.key,
                    version,
                    stored = entry.version,
                    "rejecting out-of-order write"
                );
                // The writer is behind; hand it the stored model to merge.
                let own = entry
                    .receivers
                    .iter()
                    .find(|(id, _)| *id == self.id)
                    .map(|(_, receiver)| receiver.clone());
                let stored = entry.data.clone().map(|data| (data, entry.version));
                drop(entries);
                if let (Some(receiver), Some((data, stored_version))) = (own, stored) {
                    receiver(data, stored_version);
                }
                return Ok(false);
            }
            entry.data = Some(value.clone());
            entry.version = version;
            entry.token = Some(uuid::Uuid::new_v4().to_string());
            let receivers = entry
                .receivers
                .iter()
                .filter(|(id, _)| *id != self.id)
                .map(|(_, receiver)| receiver.clone())
                .collect::<Vec<_>>();
            (receivers, value)
        };

        trace!(key = %self.key, version, pushed_to = receivers.len(), "stored model");
        for receiver in receivers {
            receiver(pushed.clone(), version);
        }
        Ok(true)
    }
}

/// Provides [`VolatileDriver`]s for `volatile://` keys.
#[derive(Debug, Clone, Default)]
pub struct VolatileDriverProvider {
    memory: Arc<VolatileMemory>,
}

impl VolatileDriverProvider {
    pub const PROTOCOL: &'static str = "volatile";

    pub fn new(memory: Arc<VolatileMemory>) -> Self {
        Self { memory }
    }

    pub fn memory(&self) -> &Arc<VolatileMemory> {
        &self.memory
    }
}

impl DriverProvider for VolatileDriverProvider {
    fn driver<D: CrdtData>(&self, key: &StorageKey) -> Result<Arc<dyn Driver<D>>> {
        if key.protocol() != Self::PROTOCOL {
            return Err(StoreError::DriverUnavailable {
                key: key.to_string(),
                reason: format!("expected the '{}' protocol", Self::PROTOCOL),
            }
            .into());
        }
        Ok(Arc::new(VolatileDriver::new(key.clone(), self.memory.clone())))
    }
}
