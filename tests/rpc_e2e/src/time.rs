// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! `ITimeService` / `ITimeListener`: a small interface pair written the way
//! generated proxies and stubs are laid out.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::debug;
use nexus_rpc::{
    InterfaceDescriptor, IpcContext, Parcel, RemoteObject, RemoteProxy, Result, RpcError,
    ServiceId, Stub, WeakIpcContext, FIRST_CALL_TRANSACTION,
};
use parking_lot::Mutex;

/// Registry id the time service is published under.
pub const TIME_SERVICE_ID: ServiceId = ServiceId(7);

/// Descriptor of [`ITimeService`].
pub const TIME_SERVICE_DESCRIPTOR: &str = "ITimeService";
/// `[]` -> `[now:i64]`
pub const GET_TIME: u32 = FIRST_CALL_TRANSACTION;
/// `[now:i64]` -> `[]`
pub const SET_TIME: u32 = FIRST_CALL_TRANSACTION + 1;
/// `[listener]` -> `[]`
pub const REGISTER_LISTENER: u32 = FIRST_CALL_TRANSACTION + 2;
/// `[millis:u32]` -> `[now:i64]`
pub const SLEEP: u32 = FIRST_CALL_TRANSACTION + 3;

/// Descriptor of [`ITimeListener`].
pub const TIME_LISTENER_DESCRIPTOR: &str = "ITimeListener";
/// One-way `[now:i64]`
pub const ON_TIME_CHANGED: u32 = FIRST_CALL_TRANSACTION;

/// Wall clock service.
pub trait ITimeService: Send + Sync {
    /// Current time.
    fn get_time(&self) -> Result<i64>;
    /// Sets the time and notifies listeners.
    fn set_time(&self, now: i64) -> Result<()>;
    /// Subscribes `listener` (an [`ITimeListener`] object) to changes.
    fn register_listener(&self, listener: &RemoteObject) -> Result<()>;
    /// Blocks for `millis` and then reports the time.
    fn sleep(&self, millis: u32) -> Result<i64>;
}

impl InterfaceDescriptor for dyn ITimeService {
    const DESCRIPTOR: &'static str = TIME_SERVICE_DESCRIPTOR;
}

/// Receives time changes.
pub trait ITimeListener: Send + Sync {
    /// Called after the time was set.
    fn on_time_changed(&self, now: i64) -> Result<()>;
}

impl InterfaceDescriptor for dyn ITimeListener {
    const DESCRIPTOR: &'static str = TIME_LISTENER_DESCRIPTOR;
}

/// Client side of [`ITimeService`].
pub struct TimeServiceProxy {
    remote: RemoteProxy,
}

impl TimeServiceProxy {
    /// Binds `object`.
    pub fn new(object: RemoteObject) -> Self {
        Self { remote: RemoteProxy::new(object, TIME_SERVICE_DESCRIPTOR) }
    }
}

impl ITimeService for TimeServiceProxy {
    fn get_time(&self) -> Result<i64> {
        let reply = self.remote.call(GET_TIME, |_| Ok(()))?;
        self.remote.decode(reply, Parcel::read_i64)
    }

    fn set_time(&self, now: i64) -> Result<()> {
        self.remote.call(SET_TIME, |request| request.write_i64(now)).map(drop)
    }

    fn register_listener(&self, listener: &RemoteObject) -> Result<()> {
        self.remote.call(REGISTER_LISTENER, |request| request.write_remote_object(listener)).map(drop)
    }

    fn sleep(&self, millis: u32) -> Result<i64> {
        let reply = self.remote.call(SLEEP, |request| request.write_u32(millis))?;
        self.remote.decode(reply, Parcel::read_i64)
    }
}

/// Client side of [`ITimeListener`].
pub struct TimeListenerProxy {
    remote: RemoteProxy,
}

impl TimeListenerProxy {
    /// Binds `object`.
    pub fn new(object: RemoteObject) -> Self {
        Self { remote: RemoteProxy::new(object, TIME_LISTENER_DESCRIPTOR) }
    }
}

impl ITimeListener for TimeListenerProxy {
    fn on_time_changed(&self, now: i64) -> Result<()> {
        self.remote.call_oneway(ON_TIME_CHANGED, |request| request.write_i64(now))
    }
}

/// Dispatch table for an [`ITimeService`] implementation.
pub fn time_service_stub(service: Arc<dyn ITimeService>) -> Result<Stub> {
    let get = Arc::clone(&service);
    let set = Arc::clone(&service);
    let register = Arc::clone(&service);
    let sleep = Arc::clone(&service);
    Stub::builder(TIME_SERVICE_DESCRIPTOR)
        .local(service)
        .handler(GET_TIME, move |_request, reply| reply.write_i64(get.get_time()?))
        .handler(SET_TIME, move |request, _reply| set.set_time(request.read_i64()?))
        .handler(REGISTER_LISTENER, move |request, _reply| {
            register.register_listener(&request.read_remote_object()?)
        })
        .handler(SLEEP, move |request, reply| {
            let now = sleep.sleep(request.read_u32()?)?;
            reply.write_i64(now)
        })
        .build()
}

/// Dispatch table for an [`ITimeListener`] implementation.
pub fn time_listener_stub(listener: Arc<dyn ITimeListener>) -> Result<Stub> {
    let changed = Arc::clone(&listener);
    Stub::builder(TIME_LISTENER_DESCRIPTOR)
        .local(listener)
        .handler(ON_TIME_CHANGED, move |request, _reply| changed.on_time_changed(request.read_i64()?))
        .build()
}

/// Installs both proxy factories in `context`.
pub fn register_brokers(context: &IpcContext) -> Result<()> {
    let brokers = context.brokers();
    brokers.register::<dyn ITimeService, _>(|object| {
        Arc::new(TimeServiceProxy::new(object)) as Arc<dyn ITimeService>
    })?;
    brokers.register::<dyn ITimeListener, _>(|object| {
        Arc::new(TimeListenerProxy::new(object)) as Arc<dyn ITimeListener>
    })
}

/// In-memory [`ITimeService`].
pub struct Clock {
    now: AtomicI64,
    sleeping: AtomicUsize,
    listeners: Mutex<Vec<Arc<dyn ITimeListener>>>,
    context: WeakIpcContext,
}

impl Clock {
    /// Clock reading `now`, resolving listeners through `context`'s brokers.
    pub fn new(context: &IpcContext, now: i64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicI64::new(now),
            sleeping: AtomicUsize::new(0),
            listeners: Mutex::new(Vec::new()),
            context: context.downgrade(),
        })
    }

    /// Calls currently blocked in [`ITimeService::sleep`].
    pub fn sleeping(&self) -> usize {
        self.sleeping.load(Ordering::SeqCst)
    }

    /// Subscribed listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl ITimeService for Clock {
    fn get_time(&self) -> Result<i64> {
        Ok(self.now.load(Ordering::SeqCst))
    }

    fn set_time(&self, now: i64) -> Result<()> {
        self.now.store(now, Ordering::SeqCst);
        let listeners = self.listeners.lock().clone();
        let mut gone = Vec::new();
        for listener in listeners {
            if let Err(err) = listener.on_time_changed(now) {
                debug!("clock: dropping listener ({err})");
                gone.push(listener);
            }
        }
        if !gone.is_empty() {
            self.listeners.lock().retain(|kept| !gone.iter().any(|dead| Arc::ptr_eq(kept, dead)));
        }
        Ok(())
    }

    fn register_listener(&self, listener: &RemoteObject) -> Result<()> {
        let context = self.context.upgrade().ok_or(RpcError::DeadObject)?;
        let listener =
            context.brokers().wrap::<dyn ITimeListener>(listener).ok_or(RpcError::BadDescriptor)?;
        self.listeners.lock().push(listener);
        Ok(())
    }

    fn sleep(&self, millis: u32) -> Result<i64> {
        self.sleeping.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(u64::from(millis)));
        self.sleeping.fetch_sub(1, Ordering::SeqCst);
        self.get_time()
    }
}
