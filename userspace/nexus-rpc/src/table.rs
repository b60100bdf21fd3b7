// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-process handle tables.
//!
//! Both tables hold weak entries; strong ownership lives in [`RemoteObject`]s
//! and, for local objects referenced by other processes, in explicit pins.
//! Values that might run destructors are always dropped after the table lock
//! is released, because those destructors re-enter the table.
//!
//! [`RemoteObject`]: crate::RemoteObject

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Weak};
use std::thread;

use log::debug;
use parking_lot::Mutex;

use crate::death::DeathRegistry;
use crate::error::{Result, RpcError};
use crate::object::{Handle, LocalHandle, LocalObject, RemoteHandle};
use crate::parcel::DEFAULT_MAX_CAPACITY;

struct LocalEntry {
    object: Weak<LocalObject>,
    pins: usize,
    pinned: Option<Arc<LocalObject>>,
}

/// Objects hosted by this process, keyed by never-reused local handles.
pub(crate) struct LocalTable {
    next: AtomicU64,
    entries: Mutex<HashMap<LocalHandle, LocalEntry>>,
    max_parcel: usize,
    oneway: OnewayPool,
}

impl Default for LocalTable {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CAPACITY, 1)
    }
}

impl LocalTable {
    /// Table whose objects build parcels of at most `max_parcel` bytes and
    /// run same-process one-way calls on up to `oneway_threads` workers.
    pub(crate) fn new(max_parcel: usize, oneway_threads: usize) -> Self {
        Self {
            next: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
            max_parcel,
            oneway: OnewayPool { threads: oneway_threads.max(1), queue: Mutex::new(None) },
        }
    }

    pub(crate) fn max_parcel(&self) -> usize {
        self.max_parcel
    }

    /// Hands `object` to a one-way worker, which drains its queue in order.
    pub(crate) fn schedule_oneway(&self, object: Arc<LocalObject>) -> Result<()> {
        self.oneway.submit(object)
    }

    pub(crate) fn insert<F>(&self, build: F) -> Arc<LocalObject>
    where
        F: FnOnce(LocalHandle) -> LocalObject,
    {
        let handle = LocalHandle::new(self.next.fetch_add(1, Ordering::Relaxed));
        let object = Arc::new(build(handle));
        self.entries
            .lock()
            .insert(handle, LocalEntry { object: Arc::downgrade(&object), pins: 0, pinned: None });
        object
    }

    pub(crate) fn lookup(&self, handle: LocalHandle) -> Option<Arc<LocalObject>> {
        self.entries.lock().get(&handle).and_then(|entry| entry.object.upgrade())
    }

    /// Keeps the object alive on behalf of another process.
    pub(crate) fn pin(&self, handle: LocalHandle) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&handle).ok_or(RpcError::DeadObject)?;
        let object = entry.object.upgrade().ok_or(RpcError::DeadObject)?;
        entry.pins += 1;
        entry.pinned.get_or_insert(object);
        Ok(())
    }

    pub(crate) fn unpin(&self, handle: LocalHandle) {
        let released = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&handle) {
                Some(entry) if entry.pins > 0 => {
                    entry.pins -= 1;
                    if entry.pins == 0 {
                        entry.pinned.take()
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        drop(released);
    }

    pub(crate) fn remove(&self, handle: LocalHandle) {
        let removed = self.entries.lock().remove(&handle);
        drop(removed);
    }

    /// Drops every pin, letting objects die once local owners let go.
    pub(crate) fn release_pins(&self) {
        let released: Vec<Arc<LocalObject>> = self
            .entries
            .lock()
            .values_mut()
            .filter_map(|entry| {
                entry.pins = 0;
                entry.pinned.take()
            })
            .collect();
        drop(released);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Workers for one-way calls between objects of the same process. An object
/// is queued at most once at a time, so its calls run in posting order.
struct OnewayPool {
    threads: usize,
    queue: Mutex<Option<Sender<Arc<LocalObject>>>>,
}

impl OnewayPool {
    fn submit(&self, object: Arc<LocalObject>) -> Result<()> {
        let rejected = {
            let mut queue = self.queue.lock();
            if queue.is_none() {
                *queue = Some(self.start()?);
            }
            match queue.as_ref() {
                Some(sender) => sender.send(object).err(),
                None => None,
            }
        };
        // A returned object may be the last reference; drop it unlocked.
        match rejected {
            Some(_) => Err(RpcError::DeadObject),
            None => Ok(()),
        }
    }

    fn start(&self) -> Result<Sender<Arc<LocalObject>>> {
        let (sender, receiver) = mpsc::channel::<Arc<LocalObject>>();
        let receiver = Arc::new(Mutex::new(receiver));
        for index in 0..self.threads {
            let receiver = Arc::clone(&receiver);
            thread::Builder::new()
                .name(format!("rpc-oneway-{index}"))
                .spawn(move || loop {
                    let next = receiver.lock().recv();
                    match next {
                        Ok(object) => object.drain_oneway(),
                        Err(_) => return,
                    }
                })
                .map_err(|_| RpcError::OutOfMemory)?;
        }
        debug!("started {} one-way worker(s)", self.threads);
        Ok(sender)
    }
}

/// Canonical remote handles of this process: at most one live
/// [`RemoteHandle`] per handle number.
pub(crate) struct RemoteTable {
    entries: Mutex<HashMap<Handle, Weak<RemoteHandle>>>,
    deaths: Arc<DeathRegistry>,
}

impl RemoteTable {
    pub(crate) fn new(deaths: Arc<DeathRegistry>) -> Self {
        Self { entries: Mutex::new(HashMap::new()), deaths }
    }

    /// Returns the live entry for `handle`, creating it when missing or dead.
    pub(crate) fn get_or_insert<F>(&self, handle: Handle, create: F) -> Result<Arc<RemoteHandle>>
    where
        F: FnOnce() -> Result<RemoteHandle>,
    {
        // Declared before the guard so a stale entry is dropped after unlocking.
        let _stale;
        let mut entries = self.entries.lock();
        match entries.get(&handle).and_then(Weak::upgrade) {
            Some(existing) if !existing.is_dead() => return Ok(existing),
            other => _stale = other,
        }
        let remote = Arc::new(create()?);
        entries.insert(handle, Arc::downgrade(&remote));
        Ok(remote)
    }

    pub(crate) fn get(&self, handle: Handle) -> Option<Arc<RemoteHandle>> {
        self.entries.lock().get(&handle).and_then(Weak::upgrade)
    }

    /// Removes the entry for `handle` if it still belongs to `remote`, along
    /// with the death registrations made through it.
    pub(crate) fn forget(&self, handle: Handle, remote: *const RemoteHandle) {
        let dropped = {
            let mut entries = self.entries.lock();
            if entries.get(&handle).is_some_and(|weak| weak.as_ptr() == remote) {
                entries.remove(&handle);
                // Under the entry lock so a re-import cannot register in between.
                self.deaths.forget_handle(handle)
            } else {
                Vec::new()
            }
        };
        drop(dropped);
    }

    /// Marks the live entry for `handle` dead and returns it.
    pub(crate) fn mark_dead(&self, handle: Handle) -> Option<Arc<RemoteHandle>> {
        let remote = self.get(handle)?;
        remote.mark_dead();
        Some(remote)
    }
}
