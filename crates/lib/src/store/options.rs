//! Storage locations and store configuration.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::store::StoreError;

/// Default time a blocked sync reply may wait for backing records.
pub const DEFAULT_SYNC_TIMEOUT_MS: u64 = 30_000;

fn default_sync_timeout_ms() -> u64 {
    DEFAULT_SYNC_TIMEOUT_MS
}

/// Hierarchical storage location, written `protocol://segment/segment`.
///
/// ```
/// use convergent::store::StorageKey;
///
/// let key: StorageKey = "volatile://arc/people".parse().unwrap();
/// let child = key.child("p1");
/// assert_eq!(child.to_string(), "volatile://arc/people/p1");
/// assert_eq!(child.parent(), Some(key));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorageKey {
    protocol: String,
    segments: Vec<String>,
}

impl StorageKey {
    pub fn new<I, S>(protocol: impl Into<String>, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            protocol: protocol.into(),
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Location nested one level below this one.
    pub fn child(&self, segment: &str) -> StorageKey {
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        StorageKey {
            protocol: self.protocol.clone(),
            segments,
        }
    }

    /// Location one level up, `None` at the root.
    pub fn parent(&self) -> Option<StorageKey> {
        let (_, rest) = self.segments.split_last()?;
        Some(StorageKey {
            protocol: self.protocol.clone(),
            segments: rest.to_vec(),
        })
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.segments.join("/"))
    }
}

impl FromStr for StorageKey {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| StoreError::InvalidConfiguration {
            key: s.to_string(),
            reason: reason.to_string(),
        };
        let (protocol, path) = s
            .split_once("://")
            .ok_or_else(|| invalid("missing '://' separator"))?;
        if protocol.is_empty() {
            return Err(invalid("empty protocol").into());
        }
        let segments = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .collect();
        Ok(StorageKey {
            protocol: protocol.to_string(),
            segments,
        })
    }
}

impl TryFrom<String> for StorageKey {
    type Error = crate::Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<StorageKey> for String {
    fn from(key: StorageKey) -> Self {
        key.to_string()
    }
}

/// Pair of locations used by a reference-mode store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReferenceModeStorageKey {
    /// Where full records live, one child location per record id.
    pub backing_key: StorageKey,
    /// Where the collection of references lives.
    pub storage_key: StorageKey,
}

impl fmt::Display for ReferenceModeStorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reference-mode://{{{}}}{{{}}}", self.backing_key, self.storage_key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key")]
pub enum StoreKey {
    Direct(StorageKey),
    ReferenceMode(ReferenceModeStorageKey),
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKey::Direct(key) => key.fmt(f),
            StoreKey::ReferenceMode(key) => key.fmt(f),
        }
    }
}

impl From<StorageKey> for StoreKey {
    fn from(key: StorageKey) -> Self {
        StoreKey::Direct(key)
    }
}

impl From<ReferenceModeStorageKey> for StoreKey {
    fn from(key: ReferenceModeStorageKey) -> Self {
        StoreKey::ReferenceMode(key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageMode {
    Direct,
    Backing,
    ReferenceMode,
}

/// Which CRDT model a store holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CrdtType {
    Count,
    Set,
    Singleton,
    Entity,
}

/// Configuration for constructing a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreOptions<D> {
    pub key: StoreKey,
    pub crdt_type: CrdtType,
    pub mode: StorageMode,
    /// Data to start from instead of an empty model.
    #[serde(default)]
    pub initial_model: Option<D>,
    /// Token identifying the driver state `initial_model` came from.
    #[serde(default)]
    pub version_token: Option<String>,
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,
}

impl<D> StoreOptions<D> {
    pub fn new(key: impl Into<StoreKey>, crdt_type: CrdtType, mode: StorageMode) -> Self {
        Self {
            key: key.into(),
            crdt_type,
            mode,
            initial_model: None,
            version_token: None,
            sync_timeout_ms: DEFAULT_SYNC_TIMEOUT_MS,
        }
    }

    pub fn with_initial_model(mut self, model: D) -> Self {
        self.initial_model = Some(model);
        self
    }

    pub fn with_version_token(mut self, token: impl Into<String>) -> Self {
        self.version_token = Some(token.into());
        self
    }

    pub fn with_sync_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.sync_timeout_ms = timeout_ms;
        self
    }

    /// Reject combinations of key, mode and model type that no store supports.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| -> crate::Error {
            StoreError::InvalidConfiguration {
                key: self.key.to_string(),
                reason,
            }
            .into()
        };
        match (&self.key, self.mode) {
            (StoreKey::ReferenceMode(_), StorageMode::ReferenceMode) => {
                if !matches!(self.crdt_type, CrdtType::Set | CrdtType::Singleton) {
                    return Err(invalid(format!(
                        "reference mode holds sets or singletons of entities, not {:?}",
                        self.crdt_type
                    )));
                }
            }
            (StoreKey::ReferenceMode(_), mode) => {
                return Err(invalid(format!(
                    "a reference-mode key requires ReferenceMode storage, not {mode:?}"
                )));
            }
            (StoreKey::Direct(_), StorageMode::ReferenceMode) => {
                return Err(invalid(
                    "ReferenceMode storage requires a reference-mode key".to_string(),
                ));
            }
            (StoreKey::Direct(_), StorageMode::Backing) => {
                if self.crdt_type != CrdtType::Entity {
                    return Err(invalid(format!(
                        "backing stores hold entities, not {:?}",
                        self.crdt_type
                    )));
                }
            }
            (StoreKey::Direct(_), StorageMode::Direct) => {}
        }
        if self.sync_timeout_ms == 0 {
            return Err(invalid("sync timeout must be positive".to_string()));
        }
        Ok(())
    }

    /// The direct storage key, or a configuration error for reference-mode keys.
    pub fn direct_key(&self) -> Result<&StorageKey> {
        match &self.key {
            StoreKey::Direct(key) => Ok(key),
            StoreKey::ReferenceMode(_) => Err(StoreError::InvalidConfiguration {
                key: self.key.to_string(),
                reason: "expected a direct storage key".to_string(),
            }
            .into()),
        }
    }
}
