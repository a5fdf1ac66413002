//! Bounded MRU cache of resident B-tree nodes.
//!
//! Guarantees identity: for any NodeUid currently cached, every caller
//! gets a clone of the same `Arc`, so all observers of a node see the
//! same mutable object behind its lock. Capacity is enforced by evicting
//! the least-recently-used entry whose only remaining reference is the
//! cache itself — an entry anyone else still holds a clone of is never
//! reclaimed out from under them.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::btree::lock::Locked;
use crate::btree::NodeData;
use crate::error::{Error, Result};
use crate::storage::ChunkUid;

const RECLAIM_RETRIES: u32 = 64;
const RECLAIM_WAIT: Duration = Duration::from_millis(2);

struct Inner {
    /// Front = least recently used, back = most recently used.
    order: VecDeque<ChunkUid>,
    nodes: HashMap<ChunkUid, Arc<Locked<NodeData>>>,
}

/// An MRU cache of `Arc<Locked<NodeData>>`, keyed by NodeUid.
pub struct BTreeCache {
    capacity: usize,
    inner: Mutex<Inner>,
    reclaimed: Condvar,
}

impl BTreeCache {
    pub fn new(capacity: usize) -> Self {
        BTreeCache {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner { order: VecDeque::new(), nodes: HashMap::new() }),
            reclaimed: Condvar::new(),
        }
    }

    /// Returns the resident node for `uid`, loading it via `load` on a
    /// cache miss. `load` runs outside any lock so a slow disk read never
    /// blocks unrelated cache lookups.
    pub fn get<F>(&self, uid: ChunkUid, load: F) -> Result<Arc<Locked<NodeData>>>
    where
        F: FnOnce() -> Result<NodeData>,
    {
        {
            let mut inner = self.inner.lock();
            if let Some(node) = inner.nodes.get(&uid).cloned() {
                inner.touch(uid);
                return Ok(node);
            }
        }

        let data = load()?;
        let node = Arc::new(Locked::new(data));

        let mut inner = self.inner.lock();
        // Another thread may have loaded the same uid while we were
        // building ours; prefer the one already resident so identity
        // holds.
        if let Some(existing) = inner.nodes.get(&uid).cloned() {
            inner.touch(uid);
            return Ok(existing);
        }

        let mut attempts = 0;
        loop {
            if inner.nodes.len() < self.capacity {
                inner.insert(uid, node.clone());
                return Ok(node);
            }
            if let Some(victim) = inner.reclaimable_victim() {
                inner.evict(victim);
                inner.insert(uid, node.clone());
                return Ok(node);
            }
            attempts += 1;
            if attempts > RECLAIM_RETRIES {
                return Err(Error::TooManyConcurrentOps);
            }
            self.reclaimed.wait_for(&mut inner, RECLAIM_WAIT);
        }
    }

    /// Relabels a cached entry — used when a node keeps its in-memory
    /// identity across a chunk reallocation (a split's surviving left
    /// node, say), but its stable NodeUid changes underneath it. No-op if
    /// `old` isn't resident.
    pub fn update_uid(&self, old: ChunkUid, new: ChunkUid) {
        let mut inner = self.inner.lock();
        if let Some(node) = inner.nodes.remove(&old) {
            if let Some(pos) = inner.order.iter().position(|&u| u == old) {
                inner.order[pos] = new;
            }
            inner.nodes.insert(new, node);
        }
    }

    /// Drops a cached entry outright (used after a node is erased).
    pub fn drop_uid(&self, uid: ChunkUid) {
        let mut inner = self.inner.lock();
        inner.evict(uid);
        self.reclaimed.notify_one();
    }
}

impl Inner {
    fn touch(&mut self, uid: ChunkUid) {
        if let Some(pos) = self.order.iter().position(|&u| u == uid) {
            self.order.remove(pos);
        }
        self.order.push_back(uid);
    }

    fn insert(&mut self, uid: ChunkUid, node: Arc<Locked<NodeData>>) {
        self.nodes.insert(uid, node);
        self.order.push_back(uid);
    }

    fn evict(&mut self, uid: ChunkUid) {
        self.nodes.remove(&uid);
        if let Some(pos) = self.order.iter().position(|&u| u == uid) {
            self.order.remove(pos);
        }
    }

    /// The least-recently-used entry the cache can reclaim without
    /// invalidating a reference someone else is holding.
    fn reclaimable_victim(&self) -> Option<ChunkUid> {
        self.order
            .iter()
            .find(|&&uid| {
                self.nodes
                    .get(&uid)
                    .map(|n| Arc::strong_count(n) == 1)
                    .unwrap_or(false)
            })
            .copied()
    }
}
