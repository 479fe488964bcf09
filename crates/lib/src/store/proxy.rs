//! Messages exchanged between a store and its client proxies.
//!
//! Every registered callback has a [`CallbackToken`]. Messages carry the
//! token of the channel they came from, which lets a store avoid echoing a
//! change back to its own sender.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::trace;

static NEXT_CALLBACK_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallbackToken(u64);

impl CallbackToken {
    /// Allocate a token no other callback in this process has.
    pub fn next() -> Self {
        CallbackToken(NEXT_CALLBACK_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallbackToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb-{}", self.0)
    }
}

/// The store/proxy wire protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProxyMessage<D, O> {
    /// Ask the store to reply with its full model.
    SyncRequest { id: Option<CallbackToken> },
    /// A full model.
    ModelUpdate { model: D, id: Option<CallbackToken> },
    /// A batch of operations, applied all-or-nothing.
    Operations {
        operations: Vec<O>,
        id: Option<CallbackToken>,
    },
}

impl<D, O> ProxyMessage<D, O> {
    /// The channel this message belongs to.
    pub fn id(&self) -> Option<CallbackToken> {
        match self {
            ProxyMessage::SyncRequest { id }
            | ProxyMessage::ModelUpdate { id, .. }
            | ProxyMessage::Operations { id, .. } => *id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProxyMessage::SyncRequest { .. } => "SyncRequest",
            ProxyMessage::ModelUpdate { .. } => "ModelUpdate",
            ProxyMessage::Operations { .. } => "Operations",
        }
    }
}

/// A subscriber callback.
pub type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

/// A proxy callback.
pub type ProxyCallback<D, O> = Callback<ProxyMessage<D, O>>;

/// Subscriber registry keyed by [`CallbackToken`].
///
/// Callbacks are invoked by the owning store's worker, never while the
/// registry lock is held, so a callback may register or unregister others.
/// Messages are passed on unchanged: their `id` names the channel the change
/// originated from, which is also the channel excluded from fan-out.
pub struct CallbackRegistry<T> {
    callbacks: Mutex<BTreeMap<CallbackToken, Callback<T>>>,
}

impl<T> Default for CallbackRegistry<T> {
    fn default() -> Self {
        Self {
            callbacks: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<T> fmt::Debug for CallbackRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("callbacks", &self.callbacks.lock().unwrap().len())
            .finish()
    }
}

impl<T: Clone> CallbackRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, callback: Callback<T>) -> CallbackToken {
        let token = CallbackToken::next();
        self.callbacks.lock().unwrap().insert(token, callback);
        token
    }

    /// Returns false if `token` was not registered.
    pub fn unregister(&self, token: CallbackToken) -> bool {
        self.callbacks.lock().unwrap().remove(&token).is_some()
    }

    pub fn get(&self, token: CallbackToken) -> Option<Callback<T>> {
        self.callbacks.lock().unwrap().get(&token).cloned()
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send `message` to one callback. Returns false if it is not registered.
    pub fn send_to(&self, token: CallbackToken, message: T) -> bool {
        match self.get(token) {
            Some(callback) => {
                callback(message);
                true
            }
            None => false,
        }
    }

    /// Send `message` to every callback except `exclude`.
    pub fn deliver(&self, message: &T, exclude: Option<CallbackToken>) {
        let targets: Vec<Callback<T>> = self
            .callbacks
            .lock()
            .unwrap()
            .iter()
            .filter(|(token, _)| Some(**token) != exclude)
            .map(|(_, callback)| callback.clone())
            .collect();
        trace!(targets = targets.len(), "delivering to subscribers");
        for callback in targets {
            callback(message.clone());
        }
    }
}
