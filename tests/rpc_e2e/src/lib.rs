// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Host-only end-to-end harness for nexus-rpc.
//!
//! A [`Node`] is one loopback bus with the service manager running as the
//! context manager. Further processes are spawned on the same bus, each with
//! its own [`IpcContext`], broker registrations for the sample interfaces and
//! a [`samgr::SamgrProxy`] for lookups. [`Tap`] sits between a context and its
//! channel and records every synchronous exchange, so tests can check the
//! bytes a proxy actually puts on the wire.

#![forbid(unsafe_code)]

mod time;

pub use time::*;

use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::info;
use nexus_rpc::{
    Channel, DeathEvents, Handle, InterfaceDescriptor, IpcContext, LoopbackBus, LoopbackChannel,
    Parcel, ProcessId, RemoteObject, RpcConfig, RpcError, ServiceId, ServiceRegistry,
    TransactionHandler,
};
use parking_lot::Mutex;
use samgr::{SamgrProxy, SamgrService, SystemAbilityManager};
use thiserror::Error;

/// Errors produced by the harness helpers.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// The runtime reported a failure.
    #[error("rpc failed: {0}")]
    Rpc(#[from] RpcError),
    /// The service manager refused the request.
    #[error("samgr failed: {0}")]
    Samgr(#[from] samgr::Error),
    /// No proxy could be produced for the object.
    #[error("object does not implement {0}")]
    Interface(&'static str),
}

/// Configuration used by every harness process.
pub fn config() -> RpcConfig {
    RpcConfig {
        max_threads: 2,
        sync_timeout_ms: 5_000,
        resolve_attempts: 20,
        resolve_backoff_ms: 10,
        ..RpcConfig::default()
    }
}

/// Polls `done` for up to five seconds.
pub fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

/// A bus with a running service manager.
pub struct Node {
    bus: LoopbackBus,
    samgr: Process,
    registry: Arc<SamgrService>,
    _manager: RemoteObject,
}

impl Node {
    /// Boots the bus and publishes the service manager as handle 0.
    pub fn start() -> Result<Self> {
        let bus = LoopbackBus::new();
        let (context, pid) = bus.spawn_context("samgr", config()).context("spawn samgr")?;
        let (registry, manager) = SamgrService::publish(&context).context("publish samgr")?;
        bus.set_context_manager(pid, &manager).context("install context manager")?;
        let samgr = Process::new(context, pid).context("prepare samgr process")?;
        info!("[rpc_e2e] node up, samgr is pid {}", pid.value());
        Ok(Self { bus, samgr, registry, _manager: manager })
    }

    /// Underlying bus.
    pub fn bus(&self) -> &LoopbackBus {
        &self.bus
    }

    /// The service manager process.
    pub fn samgr(&self) -> &Process {
        &self.samgr
    }

    /// The service manager's table.
    pub fn registry(&self) -> &SamgrService {
        &self.registry
    }

    /// Spawns a process with the sample brokers installed.
    pub fn spawn(&self, name: &str) -> Result<Process> {
        let (context, pid) = self.bus.spawn_context(name, config()).context("spawn process")?;
        Process::new(context, pid)
    }

    /// Spawns a process whose channel records its synchronous traffic.
    pub fn spawn_tapped(&self, name: &str) -> Result<(Process, Arc<Tap>)> {
        let config = config();
        let channel = self.bus.spawn_process(name, &config).context("spawn process")?;
        let pid = channel.pid();
        let tap = Arc::new(Tap::new(channel));
        let context = IpcContext::init(config, Arc::clone(&tap) as Arc<dyn Channel>)
            .context("init tapped context")?;
        Ok((Process::new(context, pid)?, tap))
    }

    /// Spawns a process hosting a [`Clock`] published as [`TIME_SERVICE_ID`].
    pub fn start_time_server(&self, name: &str, now: i64) -> Result<TimeServer> {
        let process = self.spawn(name)?;
        let clock = Clock::new(process.context(), now);
        let stub = time_service_stub(Arc::clone(&clock) as Arc<dyn ITimeService>)?;
        let object = process.context().register_local(stub)?;
        process.publish(TIME_SERVICE_ID, &object)?;
        info!("[rpc_e2e] {name} serving time as {TIME_SERVICE_ID}");
        Ok(TimeServer { process, clock, object })
    }
}

/// One simulated process.
pub struct Process {
    context: IpcContext,
    pid: ProcessId,
}

impl Process {
    fn new(context: IpcContext, pid: ProcessId) -> Result<Self> {
        register_brokers(&context).context("register time brokers")?;
        samgr::register_broker(&context).context("register samgr broker")?;
        Ok(Self { context, pid })
    }

    /// Runtime state of the process.
    pub fn context(&self) -> &IpcContext {
        &self.context
    }

    /// Bus identifier.
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Client for the service manager.
    pub fn samgr(&self) -> Result<SamgrProxy, HarnessError> {
        Ok(SamgrProxy::connect(&self.context)?)
    }

    /// Publishes `object` under `id`.
    pub fn publish(&self, id: ServiceId, object: &RemoteObject) -> Result<(), HarnessError> {
        self.samgr()?.add_service(id, object)?;
        Ok(())
    }

    /// Resolves `id` with the configured retry policy.
    pub fn lookup(&self, id: ServiceId) -> Result<RemoteObject, HarnessError> {
        Ok(self.samgr()?.resolve(id)?)
    }

    /// Wraps `object` through this process's broker registry.
    pub fn wrap<I>(&self, object: &RemoteObject) -> Result<Arc<I>, HarnessError>
    where
        I: ?Sized + InterfaceDescriptor + 'static,
    {
        self.context.brokers().wrap::<I>(object).ok_or(HarnessError::Interface(I::DESCRIPTOR))
    }

    /// Resolves and wraps the time service.
    pub fn time_service(&self) -> Result<Arc<dyn ITimeService>, HarnessError> {
        let object = self.lookup(TIME_SERVICE_ID)?;
        self.wrap::<dyn ITimeService>(&object)
    }
}

/// Process hosting the time service.
pub struct TimeServer {
    process: Process,
    clock: Arc<Clock>,
    object: RemoteObject,
}

impl TimeServer {
    /// Hosting process.
    pub fn process(&self) -> &Process {
        &self.process
    }

    /// Implementation behind the stub.
    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    /// Published object.
    pub fn object(&self) -> &RemoteObject {
        &self.object
    }
}

/// One synchronous transaction seen by a [`Tap`].
#[derive(Debug, Clone)]
pub struct Exchange {
    /// Addressed handle.
    pub target: Handle,
    /// Request bytes as handed to the transport.
    pub request: Vec<u8>,
    /// Reply bytes, if the call succeeded.
    pub reply: Option<Vec<u8>>,
}

/// Channel decorator recording synchronous traffic.
pub struct Tap {
    inner: LoopbackChannel,
    log: Mutex<Vec<Exchange>>,
}

impl Tap {
    fn new(inner: LoopbackChannel) -> Self {
        Self { inner, log: Mutex::new(Vec::new()) }
    }

    /// Recorded exchanges, oldest first.
    pub fn exchanges(&self) -> Vec<Exchange> {
        self.log.lock().clone()
    }

    /// Forgets everything recorded so far.
    pub fn clear(&self) {
        self.log.lock().clear();
    }
}

impl Channel for Tap {
    fn attach(&self, handler: Weak<dyn TransactionHandler>) {
        self.inner.attach(handler);
    }

    fn detach(&self) {
        self.inner.detach();
    }

    fn send(
        &self,
        target: Handle,
        request: Parcel,
        timeout: Option<Duration>,
    ) -> nexus_rpc::Result<Parcel> {
        let bytes = request.as_bytes().to_vec();
        let outcome = self.inner.send(target, request, timeout);
        let reply = outcome.as_ref().ok().map(|reply| reply.as_bytes().to_vec());
        self.log.lock().push(Exchange { target, request: bytes, reply });
        outcome
    }

    fn post(&self, target: Handle, request: Parcel) -> nexus_rpc::Result<()> {
        self.inner.post(target, request)
    }

    fn acquire(&self, target: Handle) -> nexus_rpc::Result<()> {
        self.inner.acquire(target)
    }

    fn release(&self, target: Handle) {
        self.inner.release(target);
    }

    fn death_events(&self) -> nexus_rpc::Result<DeathEvents> {
        self.inner.death_events()
    }
}
