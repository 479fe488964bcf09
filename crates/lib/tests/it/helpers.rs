use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use convergent::{
    Result,
    crdt::CrdtData,
    store::{
        Driver, DriverProvider, DriverReceiver, StorageKey, VolatileDriverProvider,
        VolatileMemory,
    },
};

// Re-export tokio test macro for convenience
pub use tokio;

// ==========================
// DRIVER DOUBLES
// ==========================

/// Wraps [`VolatileDriverProvider`] and records every accepted send in order.
#[derive(Default)]
pub struct RecordingProvider {
    inner: VolatileDriverProvider,
    sends: Arc<Mutex<Vec<(StorageKey, u64)>>>,
}

impl RecordingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn memory(&self) -> &Arc<VolatileMemory> {
        self.inner.memory()
    }

    /// `(key, version)` of every accepted write, oldest first.
    pub fn sends(&self) -> Vec<(StorageKey, u64)> {
        self.sends.lock().unwrap().clone()
    }

    /// Position of the first accepted write to `key`.
    pub fn first_send_to(&self, key: &StorageKey) -> Option<usize> {
        self.sends().iter().position(|(k, _)| k == key)
    }
}

impl DriverProvider for RecordingProvider {
    fn driver<D: CrdtData>(&self, key: &StorageKey) -> Result<Arc<dyn Driver<D>>> {
        Ok(Arc::new(RecordingDriver {
            inner: self.inner.driver::<D>(key)?,
            sends: self.sends.clone(),
        }))
    }
}

struct RecordingDriver<D> {
    inner: Arc<dyn Driver<D>>,
    sends: Arc<Mutex<Vec<(StorageKey, u64)>>>,
}

#[async_trait]
impl<D: CrdtData> Driver<D> for RecordingDriver<D> {
    fn storage_key(&self) -> &StorageKey {
        self.inner.storage_key()
    }

    fn token(&self) -> Option<String> {
        self.inner.token()
    }

    async fn register_receiver(
        &self,
        token: Option<String>,
        receiver: DriverReceiver<D>,
    ) -> Result<()> {
        self.inner.register_receiver(token, receiver).await
    }

    async fn send(&self, data: D, version: u64) -> Result<bool> {
        let accepted = self.inner.send(data, version).await?;
        if accepted {
            self.sends
                .lock()
                .unwrap()
                .push((self.inner.storage_key().clone(), version));
        }
        Ok(accepted)
    }
}

/// A driver the test controls: it can reject the next send and push models
/// on demand.
pub struct ScriptedDriver<D> {
    key: StorageKey,
    receiver: Mutex<Option<DriverReceiver<D>>>,
    reject_next: AtomicBool,
    sent: Mutex<Vec<(D, u64)>>,
}

impl<D: CrdtData> ScriptedDriver<D> {
    pub fn new(key: StorageKey) -> Arc<Self> {
        Arc::new(Self {
            key,
            receiver: Mutex::new(None),
            reject_next: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn reject_next_send(&self) {
        self.reject_next.store(true, Ordering::SeqCst);
    }

    /// Push a model to the registered store.
    pub fn push(&self, data: D, version: u64) {
        let receiver = self.receiver.lock().unwrap();
        receiver
            .as_ref()
            .expect("no store registered")
            .send((data, version))
            .expect("store is gone");
    }

    /// Every accepted send, oldest first.
    pub fn sent(&self) -> Vec<(D, u64)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl<D: CrdtData> Driver<D> for ScriptedDriver<D> {
    fn storage_key(&self) -> &StorageKey {
        &self.key
    }

    fn token(&self) -> Option<String> {
        None
    }

    async fn register_receiver(
        &self,
        _token: Option<String>,
        receiver: DriverReceiver<D>,
    ) -> Result<()> {
        *self.receiver.lock().unwrap() = Some(receiver);
        Ok(())
    }

    async fn send(&self, data: D, version: u64) -> Result<bool> {
        if self.reject_next.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }
        self.sent.lock().unwrap().push((data, version));
        Ok(true)
    }
}

// ==========================
// WAITING
// ==========================

/// Poll `check` until it returns true, failing the test after a few seconds.
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached in time");
}

pub fn key(s: &str) -> StorageKey {
    s.parse().expect("valid storage key")
}
