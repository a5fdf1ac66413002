//! A readers-biased, upgradeable lock sized for one B-tree node.
//!
//! Ported from the original's sharded shared-counter mutex: rather than one
//! shared atomic counter every reader thread contends on, shared locks are
//! spread across a small fixed array of cache-line-sized slots, picked by
//! hashing the calling thread's ID. A writer must see every slot drop to
//! zero before it proceeds, so readers never block each other, and a
//! writer only contends with other writers on the single exclusive flag.

use std::cell::Cell;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;

const SHARDS: usize = 15;
const SPIN_LIMIT: u32 = 1000;

#[repr(align(64))]
struct ShardCounter(AtomicU32);

/// A per-node lock: many concurrent shared holders, at most one exclusive
/// holder, upgrade from shared to exclusive guaranteed to resolve to a
/// single winner.
pub struct NodeLock {
    exclusive: AtomicBool,
    shards: [ShardCounter; SHARDS],
}

impl NodeLock {
    pub fn new() -> Self {
        NodeLock {
            exclusive: AtomicBool::new(false),
            shards: std::array::from_fn(|_| ShardCounter(AtomicU32::new(0))),
        }
    }

    fn shard_index() -> usize {
        thread_local! {
            static SHARD: Cell<Option<usize>> = Cell::new(None);
        }
        SHARD.with(|cell| {
            if let Some(idx) = cell.get() {
                return idx;
            }
            let mut hasher = DefaultHasher::new();
            thread::current().id().hash(&mut hasher);
            let idx = (hasher.finish() as usize) % SHARDS;
            cell.set(Some(idx));
            idx
        })
    }

    /// Acquires a shared (read) hold.
    pub fn lock_shared(&self) -> SharedGuard<'_> {
        let idx = Self::shard_index();
        loop {
            self.shards[idx].0.fetch_add(1, Ordering::Acquire);
            if !self.exclusive.load(Ordering::Acquire) {
                break;
            }
            // A writer arrived between our increment and our check; back
            // off and let it proceed before retrying.
            self.shards[idx].0.fetch_sub(1, Ordering::Release);
            let mut spins = 0;
            while self.exclusive.load(Ordering::Acquire) {
                spins += 1;
                if spins % SPIN_LIMIT == 0 {
                    thread::yield_now();
                }
            }
        }
        SharedGuard { lock: self, idx }
    }

    /// Acquires the exclusive (write) hold. Spins for the exclusive flag,
    /// then waits for every shard's reader count to drain; if a shard
    /// fails to drain within its spin budget the exclusive flag is
    /// released and the whole acquisition is retried, which is what
    /// prevents a deadlock against a reader that is mid-upgrade.
    pub fn lock_exclusive(&self) -> ExclusiveGuard<'_> {
        loop {
            let mut spins = 0;
            while self
                .exclusive
                .compare_exchange_weak(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                spins += 1;
                if spins % SPIN_LIMIT == 0 {
                    thread::yield_now();
                }
            }

            if self.drain_shards() {
                return ExclusiveGuard { lock: self };
            }
            self.exclusive.store(false, Ordering::Release);
        }
    }

    /// Returns true once every shard reads zero; gives up (returning
    /// false) if any shard is still occupied after its spin budget.
    fn drain_shards(&self) -> bool {
        for shard in &self.shards {
            let mut spins = 0;
            while shard.0.load(Ordering::Acquire) != 0 {
                spins += 1;
                if spins > SPIN_LIMIT {
                    return false;
                }
                thread::yield_now();
            }
        }
        true
    }
}

impl Default for NodeLock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SharedGuard<'a> {
    lock: &'a NodeLock,
    idx: usize,
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        self.lock.shards[self.idx].0.fetch_sub(1, Ordering::Release);
    }
}

pub struct ExclusiveGuard<'a> {
    lock: &'a NodeLock,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.lock.exclusive.store(false, Ordering::Release);
    }
}

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};

/// A value of `T` guarded by a [`NodeLock`]. This is how a B-tree node's
/// contents are actually shared: the sharded lock above sequences access,
/// this wrapper is what makes holding it give you a `&T` or `&mut T`.
pub struct Locked<T> {
    lock: NodeLock,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Locked<T> {}
unsafe impl<T: Send> Sync for Locked<T> {}

impl<T> Locked<T> {
    pub fn new(data: T) -> Self {
        Locked { lock: NodeLock::new(), data: UnsafeCell::new(data) }
    }

    pub fn read(&self) -> ReadGuard<'_, T> {
        ReadGuard { _guard: self.lock.lock_shared(), data: &self.data }
    }

    pub fn write(&self) -> WriteGuard<'_, T> {
        WriteGuard { _guard: self.lock.lock_exclusive(), data: &self.data }
    }
}

pub struct ReadGuard<'a, T> {
    _guard: SharedGuard<'a>,
    data: &'a UnsafeCell<T>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // Safe: `_guard` proves no exclusive holder exists concurrently.
        unsafe { &*self.data.get() }
    }
}

pub struct WriteGuard<'a, T> {
    _guard: ExclusiveGuard<'a>,
    data: &'a UnsafeCell<T>,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.data.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safe: `_guard` proves exclusive access.
        unsafe { &mut *self.data.get() }
    }
}
