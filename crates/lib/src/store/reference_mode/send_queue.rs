//! Ordered outbound sends, some of which wait for backing records.
//!
//! A send may be blocked on a set of record ids, each at a minimum version.
//! A blocked send also holds back every send queued after it, so proxies
//! observe changes in the order they were processed.

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, trace};

use crate::crdt::{ReferenceId, VersionMap};

/// Identifies one blocked send.
pub(crate) type BlockId = u64;

struct PendingSend<S> {
    block: Option<BlockId>,
    send: S,
}

pub(crate) struct SendQueue<S> {
    pending: VecDeque<PendingSend<S>>,
    /// Outstanding requirements of each blocked send.
    holds: BTreeMap<BlockId, BTreeMap<ReferenceId, VersionMap>>,
    next_block: BlockId,
}

impl<S> Default for SendQueue<S> {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
            holds: BTreeMap::new(),
            next_block: 0,
        }
    }
}

impl<S> SendQueue<S> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn is_blocked(&self, block: BlockId) -> bool {
        self.holds.contains_key(&block)
    }

    /// Queue a send with no requirements. Returns the sends that may run now.
    pub(crate) fn enqueue(&mut self, send: S) -> Vec<S> {
        self.pending.push_back(PendingSend { block: None, send });
        self.drain_ready()
    }

    /// Queue a send that waits until every `(id, version)` requirement is met.
    pub(crate) fn enqueue_blocking(
        &mut self,
        requirements: impl IntoIterator<Item = (ReferenceId, VersionMap)>,
        send: S,
    ) -> BlockId {
        let block = self.next_block;
        self.next_block += 1;
        let requirements: BTreeMap<_, _> = requirements.into_iter().collect();
        debug!(block, ids = ?requirements.keys().collect::<Vec<_>>(), "blocking send");
        if !requirements.is_empty() {
            self.holds.insert(block, requirements);
        }
        self.pending.push_back(PendingSend {
            block: Some(block),
            send,
        });
        block
    }

    /// Record that `id` is now available at `version`.
    ///
    /// Returns the sends this releases, in queue order.
    pub(crate) fn process_id(&mut self, id: &str, version: &VersionMap) -> Vec<S> {
        let mut released = false;
        self.holds.retain(|block, requirements| {
            if let Some(required) = requirements.get(id)
                && version.dominates(required)
            {
                requirements.remove(id);
                if requirements.is_empty() {
                    debug!(block, id, "send unblocked");
                    released = true;
                    return false;
                }
            }
            true
        });
        if !released {
            trace!(id, %version, "record update released nothing");
        }
        self.drain_ready()
    }

    /// Drop a blocked send without running it.
    ///
    /// Returns `None` if `block` is not blocked anymore. Otherwise returns the
    /// dropped send and the sends that were only waiting behind it.
    pub(crate) fn cancel(&mut self, block: BlockId) -> Option<(S, Vec<S>)> {
        self.holds.remove(&block)?;
        let index = self
            .pending
            .iter()
            .position(|pending| pending.block == Some(block))?;
        let dropped = self.pending.remove(index)?;
        Some((dropped.send, self.drain_ready()))
    }

    /// Drop every outstanding requirement. Returns all queued sends in order.
    pub(crate) fn release_all(&mut self) -> Vec<S> {
        if !self.holds.is_empty() {
            debug!(blocks = self.holds.len(), "releasing every blocked send");
        }
        self.holds.clear();
        self.drain_ready()
    }

    fn drain_ready(&mut self) -> Vec<S> {
        let mut ready = Vec::new();
        while let Some(front) = self.pending.front() {
            if let Some(block) = front.block
                && self.holds.contains_key(&block)
            {
                break;
            }
            if let Some(front) = self.pending.pop_front() {
                ready.push(front.send);
            }
        }
        ready
    }
}
