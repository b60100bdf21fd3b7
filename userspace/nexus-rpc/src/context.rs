// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-process RPC state with explicit init/shutdown
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests (lifecycle, local registration) + loopback integration tests
//!
//! An [`IpcContext`] owns the local object table, the canonical remote handle
//! table, the broker registry and the death registry of one process. It is
//! passed to whoever needs it; nothing in the runtime is global.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use log::{debug, info};

use crate::broker::BrokerRegistry;
use crate::channel::{Channel, TransactionHandler};
use crate::config::RpcConfig;
use crate::death::{DeathRecipient, DeathRegistry, RegistrationId};
use crate::error::{Result, RpcError};
use crate::object::{Handle, LocalHandle, LocalObject, RemoteHandle, RemoteObject};
use crate::parcel::Parcel;
use crate::stub::Stub;
use crate::table::{LocalTable, RemoteTable};

struct ContextInner {
    config: RpcConfig,
    channel: Arc<dyn Channel>,
    locals: Arc<LocalTable>,
    remotes: Arc<RemoteTable>,
    brokers: BrokerRegistry,
    deaths: Arc<DeathRegistry>,
    running: AtomicBool,
}

impl ContextInner {
    fn ensure_running(&self) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(RpcError::InvalidOperation("ipc context is shut down".into()))
        }
    }

    fn remote(&self, handle: Handle) -> Result<RemoteObject> {
        let remote = self.remotes.get_or_insert(handle, || {
            self.channel.acquire(handle)?;
            self.deaths.clear_dead(handle);
            debug!("imported {handle}");
            Ok(RemoteHandle::new(
                handle,
                Arc::clone(&self.channel),
                self.config.sync_timeout(),
                self.config.max_parcel_capacity,
                Arc::downgrade(&self.remotes),
            ))
        })?;
        Ok(RemoteObject::Remote(remote))
    }

    fn on_death(&self, handle: Handle) {
        // Registrations only exist while the handle has a live entry, which
        // is held until the recipients have been taken.
        if let Some(_remote) = self.remotes.mark_dead(handle) {
            self.deaths.notify(handle);
        } else {
            debug!("death of forgotten {handle} ignored");
        }
    }

    fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.channel.detach();
        self.locals.release_pins();
        info!("ipc context shut down");
    }
}

impl TransactionHandler for ContextInner {
    fn on_transaction(
        &self,
        target: LocalHandle,
        request: Parcel,
        oneway: bool,
    ) -> Result<Option<Parcel>> {
        if !self.running.load(Ordering::Acquire) {
            return Err(RpcError::DeadObject);
        }
        let object = self.locals.lookup(target).ok_or(RpcError::DeadObject)?;
        object.dispatch(request, oneway)
    }

    fn on_acquire(&self, target: LocalHandle) -> Result<()> {
        self.locals.pin(target)
    }

    fn on_release(&self, target: LocalHandle) {
        self.locals.unpin(target);
    }

    fn import_local(&self, target: LocalHandle) -> Result<RemoteObject> {
        self.locals.lookup(target).map(RemoteObject::Local).ok_or(RpcError::DeadObject)
    }

    fn import_handle(&self, handle: Handle) -> Result<RemoteObject> {
        self.remote(handle)
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// RPC runtime state of one process.
#[derive(Clone)]
pub struct IpcContext {
    inner: Arc<ContextInner>,
}

/// Non-owning reference to an [`IpcContext`], for handlers that must not keep
/// their own context alive.
#[derive(Clone)]
pub struct WeakIpcContext {
    inner: Weak<ContextInner>,
}

impl WeakIpcContext {
    /// Returns the context if it still exists.
    pub fn upgrade(&self) -> Option<IpcContext> {
        self.inner.upgrade().map(|inner| IpcContext { inner })
    }
}

impl IpcContext {
    /// Validates `config`, attaches to `channel` and starts the death
    /// notification thread.
    pub fn init(config: RpcConfig, channel: Arc<dyn Channel>) -> Result<Self> {
        config.validate().map_err(|err| RpcError::InvalidOperation(err.to_string()))?;
        let events = channel.death_events()?;
        let deaths = Arc::new(DeathRegistry::default());
        let inner = Arc::new(ContextInner {
            locals: Arc::new(LocalTable::new(config.max_parcel_capacity, config.max_threads)),
            remotes: Arc::new(RemoteTable::new(Arc::clone(&deaths))),
            config,
            channel,
            brokers: BrokerRegistry::default(),
            deaths,
            running: AtomicBool::new(true),
        });
        let weak: Weak<ContextInner> = Arc::downgrade(&inner);
        let handler: Weak<dyn TransactionHandler> = weak.clone();
        inner.channel.attach(handler);

        thread::Builder::new()
            .name("rpc-death".into())
            .spawn(move || {
                for handle in events {
                    let Some(inner) = weak.upgrade() else { break };
                    inner.on_death(handle);
                }
            })
            .map_err(|_| RpcError::OutOfMemory)?;

        info!(
            "ipc context up (threads={}, timeout={:?})",
            inner.config.max_threads,
            inner.config.sync_timeout()
        );
        Ok(Self { inner })
    }

    /// Detaches from the channel and drops every pin held for other
    /// processes. Idempotent; also runs when the last clone is dropped.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Returns `true` until [`IpcContext::shutdown`].
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Creates a weak reference to this context.
    pub fn downgrade(&self) -> WeakIpcContext {
        WeakIpcContext { inner: Arc::downgrade(&self.inner) }
    }

    /// Configuration in effect.
    pub fn config(&self) -> &RpcConfig {
        &self.inner.config
    }

    /// Empty parcel capped at the configured capacity.
    pub fn new_parcel(&self) -> Parcel {
        Parcel::with_max_capacity(self.inner.config.max_parcel_capacity)
    }

    /// Proxy factories of this process.
    pub fn brokers(&self) -> &BrokerRegistry {
        &self.inner.brokers
    }

    /// Hosts `stub` and returns the owning reference. The object is reachable
    /// until that reference (and every clone and remote pin) is dropped, or
    /// until [`LocalObject::unregister`] is called.
    pub fn register_local(&self, stub: Stub) -> Result<RemoteObject> {
        self.inner.ensure_running()?;
        let table = &self.inner.locals;
        let object = table.insert(|handle| LocalObject::new(handle, stub, Arc::downgrade(table)));
        debug!("registered {} ({})", object.handle(), object.descriptor());
        Ok(RemoteObject::Local(object))
    }

    /// Number of local objects currently registered.
    pub fn local_object_count(&self) -> usize {
        self.inner.locals.len()
    }

    /// Canonical reference for `handle`. Repeated calls return references
    /// that compare equal while any of them is alive.
    pub fn resolve_remote(&self, handle: Handle) -> Result<RemoteObject> {
        self.inner.ensure_running()?;
        self.inner.remote(handle)
    }

    /// Reference to the registry service (handle 0).
    pub fn context_manager(&self) -> Result<RemoteObject> {
        self.resolve_remote(Handle::CONTEXT_MANAGER)
    }

    /// Arms `recipient` for the death of the process hosting `object`.
    pub fn register_death_recipient(
        &self,
        object: &RemoteObject,
        recipient: Arc<dyn DeathRecipient>,
    ) -> Result<RegistrationId> {
        self.inner.ensure_running()?;
        match object {
            RemoteObject::Local(_) => Err(RpcError::InvalidOperation(
                "death recipients apply to remote objects only".into(),
            )),
            RemoteObject::Remote(remote) if remote.is_dead() => Err(RpcError::DeadObject),
            RemoteObject::Remote(remote) => self.inner.deaths.register(remote.handle(), recipient),
        }
    }

    /// Cancels a registration; `true` means the recipient will never run.
    pub fn unregister_death_recipient(&self, id: RegistrationId) -> bool {
        self.inner.deaths.unregister(id)
    }

    /// Death registry of this process.
    pub fn deaths(&self) -> &DeathRegistry {
        &self.inner.deaths
    }
}
