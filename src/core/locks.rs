// src/core/locks.rs

//! The four-entity reader/writer lock machinery.
//!
//! Every RPC handler and background activity declares, up front, the mode it
//! needs for each of the four coarse entities (configuration, jobs, nodes,
//! partitions) and acquires them as one all-or-nothing vector. Acquisition
//! always proceeds in the canonical order config -> job -> node -> partition,
//! which makes deadlock between any two lock vectors impossible.
//!
//! The underlying `tokio::sync::RwLock` is fair: once a writer is queued,
//! later readers wait behind it, and queued writers are granted in FIFO
//! order. Handlers must never hold a vector across a blocking network call
//! and must never upgrade in place; they acquire a fresh vector instead.
//!
//! Per-entity reader/writer counters feed the diagnostic snapshot the
//! background loop consults at shutdown before saving state.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// The mode requested for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    #[default]
    None,
    Read,
    Write,
}

/// A lock vector: one mode per entity.
#[derive(Debug, Clone, Copy, Default)]
pub struct LockRequest {
    pub config: LockMode,
    pub job: LockMode,
    pub node: LockMode,
    pub part: LockMode,
}

impl LockRequest {
    pub const fn none() -> Self {
        Self {
            config: LockMode::None,
            job: LockMode::None,
            node: LockMode::None,
            part: LockMode::None,
        }
    }
}

/// Reader/writer hold counts for one entity at a sampling instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityCounts {
    pub readers: usize,
    pub writers: usize,
}

/// The diagnostic snapshot across all four entities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockSnapshot {
    pub config: EntityCounts,
    pub job: EntityCounts,
    pub node: EntityCounts,
    pub part: EntityCounts,
}

impl LockSnapshot {
    /// True when no entity is held in any mode.
    pub fn is_clear(&self) -> bool {
        [self.config, self.job, self.node, self.part]
            .iter()
            .all(|c| c.readers == 0 && c.writers == 0)
    }
}

/// One guarded entity: the data, plus hold counters for diagnostics.
#[derive(Debug)]
pub struct EntityLock<T> {
    lock: Arc<RwLock<T>>,
    readers: Arc<AtomicUsize>,
    writers: Arc<AtomicUsize>,
}

impl<T: Send + Sync + 'static> EntityLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            lock: Arc::new(RwLock::new(value)),
            readers: Arc::new(AtomicUsize::new(0)),
            writers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Acquires the entity in the requested mode. `LockMode::None` returns
    /// immediately with an empty hold.
    pub async fn acquire(&self, mode: LockMode) -> Held<T> {
        match mode {
            LockMode::None => Held::None,
            LockMode::Read => {
                let guard = self.lock.clone().read_owned().await;
                self.readers.fetch_add(1, Ordering::SeqCst);
                Held::Read(ReadHeld {
                    guard,
                    counter: self.readers.clone(),
                })
            }
            LockMode::Write => {
                let guard = self.lock.clone().write_owned().await;
                self.writers.fetch_add(1, Ordering::SeqCst);
                Held::Write(WriteHeld {
                    guard,
                    counter: self.writers.clone(),
                })
            }
        }
    }

    pub fn counts(&self) -> EntityCounts {
        EntityCounts {
            readers: self.readers.load(Ordering::SeqCst),
            writers: self.writers.load(Ordering::SeqCst),
        }
    }
}

/// A read hold that keeps the diagnostic counter honest on drop.
#[derive(Debug)]
pub struct ReadHeld<T> {
    guard: OwnedRwLockReadGuard<T>,
    counter: Arc<AtomicUsize>,
}

impl<T> Deref for ReadHeld<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> Drop for ReadHeld<T> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A write hold that keeps the diagnostic counter honest on drop.
#[derive(Debug)]
pub struct WriteHeld<T> {
    guard: OwnedRwLockWriteGuard<T>,
    counter: Arc<AtomicUsize>,
}

impl<T> Deref for WriteHeld<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for WriteHeld<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for WriteHeld<T> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The hold a caller ends up with for one entity.
///
/// `get`/`get_mut` panic when the entity was not requested in a sufficient
/// mode; that is a lock-vector declaration bug in the caller, not a runtime
/// condition, and surfacing it loudly mirrors how missing-lock assertions
/// behave in the rest of the controller.
#[derive(Debug)]
pub enum Held<T> {
    None,
    Read(ReadHeld<T>),
    Write(WriteHeld<T>),
}

// Hand-written so `Held<T>: Default` does not demand `T: Default`.
impl<T> Default for Held<T> {
    fn default() -> Self {
        Held::None
    }
}

impl<T> Held<T> {
    pub fn held(&self) -> bool {
        !matches!(self, Held::None)
    }

    pub fn get(&self) -> &T {
        match self {
            Held::None => panic!("entity accessed without a lock in the request vector"),
            Held::Read(g) => g,
            Held::Write(g) => g,
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        match self {
            Held::Write(g) => g,
            _ => panic!("entity mutated without a write lock in the request vector"),
        }
    }
}
