// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Remote object identity and reference model
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests (lifecycle, draining, weak upgrade)
//!
//! PUBLIC API:
//!   - RemoteObject: strong reference, either a local object or a remote handle
//!   - WeakRemoteObject: observer that must be upgraded before use
//!   - LocalObject: stub hosted in this process (Active -> Unregistering -> Retired)
//!   - RemoteHandle: canonical per-process proxy endpoint for a foreign object
//!
//! INVARIANTS:
//!   - A local object leaves its table before its stub is released; inbound
//!     transactions then fail with `DeadObject`
//!   - A dispatch holds a strong reference for its whole duration, so a local
//!     object is never freed under an in-flight transaction
//!   - A caller waiting for a serialized object's lock is not in flight; it
//!     re-checks the lifecycle once it holds the lock
//!   - Same-process one-way calls to one object run in posting order
//!   - A remote handle acquires one strong reference on its target when created
//!     and releases it exactly once when dropped

use core::fmt;
use core::hash::{Hash, Hasher};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex, ReentrantMutex};

use crate::channel::Channel;
use crate::error::{Result, RpcError};
use crate::parcel::{Parcel, DEFAULT_MAX_CAPACITY};
use crate::stub::{Stub, Threading};
use crate::table::{LocalTable, RemoteTable};

thread_local! {
    /// Local objects the current thread is dispatching into, innermost last.
    static FRAMES: RefCell<Vec<LocalHandle>> = const { RefCell::new(Vec::new()) };
}

/// Per-process identifier of a hosted object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalHandle(u64);

impl LocalHandle {
    /// Wraps a raw identifier.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw identifier.
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LocalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local#{}", self.0)
    }
}

/// Per-process reference number naming a foreign object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(u32);

impl Handle {
    /// Handle reserved for the context manager (the service registry).
    pub const CONTEXT_MANAGER: Handle = Handle(0);

    /// Wraps a raw handle number.
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Raw handle number.
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle#{}", self.0)
    }
}

/// Lifecycle of a hosted stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubState {
    /// Accepting transactions.
    Active,
    /// Refusing new transactions while in-flight ones drain.
    Unregistering,
    /// Gone from the object table.
    Retired,
}

struct Lifecycle {
    state: StubState,
    in_flight: usize,
}

#[derive(Default)]
struct OnewayQueue {
    pending: VecDeque<Parcel>,
    scheduled: bool,
}

/// Object hosted in this process and reachable by other processes.
pub struct LocalObject {
    handle: LocalHandle,
    stub: Stub,
    serial: Option<ReentrantMutex<()>>,
    lifecycle: Mutex<Lifecycle>,
    drained: Condvar,
    oneway: Mutex<OnewayQueue>,
    table: Weak<LocalTable>,
}

impl LocalObject {
    pub(crate) fn new(handle: LocalHandle, stub: Stub, table: Weak<LocalTable>) -> Self {
        let serial = match stub.threading() {
            Threading::Serialized => Some(ReentrantMutex::new(())),
            Threading::Concurrent => None,
        };
        Self {
            handle,
            stub,
            serial,
            lifecycle: Mutex::new(Lifecycle { state: StubState::Active, in_flight: 0 }),
            drained: Condvar::new(),
            oneway: Mutex::new(OnewayQueue::default()),
            table,
        }
    }

    /// Identifier under which the object is registered.
    pub fn handle(&self) -> LocalHandle {
        self.handle
    }

    /// Interface descriptor of the hosted stub.
    pub fn descriptor(&self) -> &str {
        self.stub.descriptor()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StubState {
        self.lifecycle.lock().state
    }

    /// Transactions currently executing against this object.
    pub fn in_flight(&self) -> usize {
        self.lifecycle.lock().in_flight
    }

    pub(crate) fn local_impl<I: ?Sized + 'static>(&self) -> Option<Arc<I>> {
        self.stub.local_impl::<I>()
    }

    /// Parcel capacity of the hosting process.
    pub fn max_parcel_capacity(&self) -> usize {
        self.table.upgrade().map_or(DEFAULT_MAX_CAPACITY, |table| table.max_parcel())
    }

    /// Runs one inbound transaction through the stub.
    ///
    /// Returns `Ok(None)` for one-way transactions.
    pub fn dispatch(&self, mut request: Parcel, oneway: bool) -> Result<Option<Parcel>> {
        // The frame is dropped before the serial guard.
        let _serial = self.serial.as_ref().map(|lock| lock.lock());
        let _frame = self.enter()?;
        self.stub.on_remote_request(&mut request, oneway)
    }

    /// Queues a one-way transaction from this process.
    pub(crate) fn post(self: &Arc<Self>, request: Parcel) -> Result<()> {
        if self.state() != StubState::Active {
            return Err(RpcError::DeadObject);
        }
        let table = self.table.upgrade().ok_or(RpcError::DeadObject)?;
        let schedule = {
            let mut queue = self.oneway.lock();
            queue.pending.push_back(request);
            !std::mem::replace(&mut queue.scheduled, true)
        };
        if !schedule {
            return Ok(());
        }
        table.schedule_oneway(Arc::clone(self)).inspect_err(|_| {
            let dropped = {
                let mut queue = self.oneway.lock();
                queue.scheduled = false;
                std::mem::take(&mut queue.pending)
            };
            drop(dropped);
        })
    }

    /// Runs queued one-way transactions until the queue is empty.
    pub(crate) fn drain_oneway(&self) {
        loop {
            let next = {
                let mut queue = self.oneway.lock();
                match queue.pending.pop_front() {
                    Some(request) => request,
                    None => {
                        queue.scheduled = false;
                        return;
                    }
                }
            };
            if let Err(err) = self.dispatch(next, true) {
                warn!("one-way call into {} failed: {err}", self.handle);
            }
        }
    }

    fn enter(&self) -> Result<InFlight<'_>> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != StubState::Active {
            return Err(RpcError::DeadObject);
        }
        lifecycle.in_flight += 1;
        drop(lifecycle);
        FRAMES.with(|frames| frames.borrow_mut().push(self.handle));
        Ok(InFlight { object: self })
    }

    /// Stops accepting transactions, waits for in-flight ones to finish and
    /// removes the object from its table.
    ///
    /// When called from one of this object's own handlers, the caller's frames
    /// are not waited for.
    pub fn unregister(&self) {
        let own_frames = FRAMES
            .with(|frames| frames.borrow().iter().filter(|handle| **handle == self.handle).count());
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != StubState::Active {
            return;
        }
        lifecycle.state = StubState::Unregistering;
        while lifecycle.in_flight > own_frames {
            self.drained.wait(&mut lifecycle);
        }
        lifecycle.state = StubState::Retired;
        drop(lifecycle);
        if let Some(table) = self.table.upgrade() {
            table.remove(self.handle);
        }
        info!("unregistered {} ({})", self.handle, self.stub.descriptor());
    }
}

impl Drop for LocalObject {
    fn drop(&mut self) {
        self.lifecycle.get_mut().state = StubState::Retired;
        if let Some(table) = self.table.upgrade() {
            table.remove(self.handle);
        }
        debug!("released {} ({})", self.handle, self.stub.descriptor());
    }
}

impl fmt::Debug for LocalObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalObject")
            .field("handle", &self.handle)
            .field("descriptor", &self.stub.descriptor())
            .finish()
    }
}

struct InFlight<'a> {
    object: &'a LocalObject,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        FRAMES.with(|frames| {
            let mut frames = frames.borrow_mut();
            if let Some(pos) = frames.iter().rposition(|handle| *handle == self.object.handle) {
                frames.remove(pos);
            }
        });
        let mut lifecycle = self.object.lifecycle.lock();
        lifecycle.in_flight -= 1;
        if lifecycle.state != StubState::Active {
            self.object.drained.notify_all();
        }
    }
}

/// Endpoint for an object hosted by another process.
pub struct RemoteHandle {
    handle: Handle,
    channel: Arc<dyn Channel>,
    dead: AtomicBool,
    sync_timeout: Option<Duration>,
    max_parcel: usize,
    table: Weak<RemoteTable>,
}

impl RemoteHandle {
    pub(crate) fn new(
        handle: Handle,
        channel: Arc<dyn Channel>,
        sync_timeout: Option<Duration>,
        max_parcel: usize,
        table: Weak<RemoteTable>,
    ) -> Self {
        Self { handle, channel, dead: AtomicBool::new(false), sync_timeout, max_parcel, table }
    }

    /// Handle number in this process.
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Returns `true` once the hosting process is known to be gone.
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dead(&self) {
        self.dead.store(true, Ordering::Release);
    }

    fn transact(&self, request: Parcel, timeout: Option<Duration>) -> Result<Parcel> {
        if self.is_dead() {
            return Err(RpcError::DeadObject);
        }
        let outcome = self.channel.send(self.handle, request, timeout);
        if let Err(RpcError::DeadObject) = outcome {
            self.mark_dead();
        }
        outcome
    }

    fn post(&self, request: Parcel) -> Result<()> {
        if self.is_dead() {
            return Err(RpcError::DeadObject);
        }
        let outcome = self.channel.post(self.handle, request);
        if let Err(RpcError::DeadObject) = outcome {
            self.mark_dead();
        }
        outcome
    }
}

impl Drop for RemoteHandle {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.forget(self.handle, self as *const RemoteHandle);
        }
        self.channel.release(self.handle);
    }
}

impl fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteHandle")
            .field("handle", &self.handle)
            .field("dead", &self.is_dead())
            .finish()
    }
}

/// Strong reference to an RPC endpoint.
///
/// Cloning shares ownership. Two references compare equal when they name the
/// same object in this process.
#[derive(Clone)]
pub enum RemoteObject {
    /// Object hosted by this process.
    Local(Arc<LocalObject>),
    /// Object hosted by another process.
    Remote(Arc<RemoteHandle>),
}

impl RemoteObject {
    /// Returns `true` for objects hosted by this process.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    /// Local registration, if the object lives in this process.
    pub fn as_local(&self) -> Option<&Arc<LocalObject>> {
        match self {
            Self::Local(local) => Some(local),
            Self::Remote(_) => None,
        }
    }

    /// Local handle, if the object lives in this process.
    pub fn local_handle(&self) -> Option<LocalHandle> {
        self.as_local().map(|local| local.handle())
    }

    /// Remote handle number, if the object lives elsewhere.
    pub fn remote_handle(&self) -> Option<Handle> {
        match self {
            Self::Local(_) => None,
            Self::Remote(remote) => Some(remote.handle()),
        }
    }

    /// Returns `false` once the object is known to be unreachable.
    pub fn is_alive(&self) -> bool {
        match self {
            Self::Local(local) => local.state() == StubState::Active,
            Self::Remote(remote) => !remote.is_dead(),
        }
    }

    /// Largest parcel this process will build for the object.
    pub fn max_parcel_capacity(&self) -> usize {
        match self {
            Self::Local(local) => local.max_parcel_capacity(),
            Self::Remote(remote) => remote.max_parcel,
        }
    }

    /// Sends a synchronous transaction using the default timeout.
    pub fn send_request(&self, request: Parcel) -> Result<Parcel> {
        match self {
            Self::Local(local) => Self::local_reply(local.dispatch(request, false)),
            Self::Remote(remote) => remote.transact(request, remote.sync_timeout),
        }
    }

    /// Sends a synchronous transaction that gives up after `timeout`.
    ///
    /// The timeout does not apply to objects in this process, which are
    /// invoked directly on the calling thread.
    pub fn send_request_timeout(&self, request: Parcel, timeout: Duration) -> Result<Parcel> {
        match self {
            Self::Local(local) => Self::local_reply(local.dispatch(request, false)),
            Self::Remote(remote) => remote.transact(request, Some(timeout)),
        }
    }

    /// Sends a one-way transaction and returns without waiting for the handler.
    ///
    /// Objects in this process are invoked on the process's one-way workers.
    pub fn send_oneway(&self, request: Parcel) -> Result<()> {
        match self {
            Self::Local(local) => local.post(request),
            Self::Remote(remote) => remote.post(request),
        }
    }

    /// Creates a weak observer of this object.
    pub fn downgrade(&self) -> WeakRemoteObject {
        match self {
            Self::Local(local) => WeakRemoteObject::Local(Arc::downgrade(local)),
            Self::Remote(remote) => WeakRemoteObject::Remote(Arc::downgrade(remote)),
        }
    }

    /// Typed local implementation, if the object lives here and was registered with one.
    pub fn local_impl<I: ?Sized + 'static>(&self) -> Option<Arc<I>> {
        self.as_local().and_then(|local| local.local_impl::<I>())
    }

    fn local_reply(outcome: Result<Option<Parcel>>) -> Result<Parcel> {
        outcome?.ok_or_else(|| RpcError::ProtocolError("synchronous call produced no reply".into()))
    }

    fn identity(&self) -> (bool, u64) {
        match self {
            Self::Local(local) => (true, local.handle().value()),
            Self::Remote(remote) => (false, u64::from(remote.handle().value())),
        }
    }
}

impl PartialEq for RemoteObject {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for RemoteObject {}

impl Hash for RemoteObject {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(local) => write!(f, "RemoteObject({})", local.handle()),
            Self::Remote(remote) => write!(f, "RemoteObject({})", remote.handle()),
        }
    }
}

/// Observer that does not keep the object alive.
#[derive(Clone, Debug)]
pub enum WeakRemoteObject {
    /// Observer of a local object.
    Local(Weak<LocalObject>),
    /// Observer of a remote handle.
    Remote(Weak<RemoteHandle>),
}

impl WeakRemoteObject {
    /// Re-validates the object, failing if it has been released or has died.
    pub fn upgrade(&self) -> Option<RemoteObject> {
        match self {
            Self::Local(weak) => weak
                .upgrade()
                .filter(|local| local.state() == StubState::Active)
                .map(RemoteObject::Local),
            Self::Remote(weak) => {
                weak.upgrade().filter(|remote| !remote.is_dead()).map(RemoteObject::Remote)
            }
        }
    }
}
