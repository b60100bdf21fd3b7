// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: In-process transport simulating several processes on the host
//! OWNERS: @runtime
//! STATUS: Functional (host backend)
//! API_STABILITY: Unstable (test and tooling transport)
//! TEST_COVERAGE: Integration tests in tests/ and tests/rpc_e2e
//!
//! Each simulated process has its own worker pool, handle table and death
//! stream. Object references are rewritten into the receiver's terms while a
//! parcel crosses between processes, and every remote reference holds one pin
//! on the object it names. Terminating a process fails the calls waiting on
//! it, drops the pins it held, and sends one death event per affected handle
//! to every survivor.
//!
//! INVARIANTS:
//!   - No bus or process lock is held while calling into a context
//!   - Handle numbers are never reused within a process (0 is the context manager)

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::channel::{Channel, DeathEvents, TransactionHandler};
use crate::config::RpcConfig;
use crate::context::IpcContext;
use crate::error::{Result, RpcError};
use crate::object::{Handle, LocalHandle, RemoteObject};
use crate::parcel::Parcel;

/// Identifier of a simulated process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(u32);

impl ProcessId {
    /// Raw process number.
    pub fn value(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Target {
    pid: ProcessId,
    object: LocalHandle,
}

struct ReplySlot {
    result: Mutex<Option<Result<Parcel>>>,
    ready: Condvar,
}

impl ReplySlot {
    fn new() -> Self {
        Self { result: Mutex::new(None), ready: Condvar::new() }
    }

    /// First completion wins.
    fn complete(&self, outcome: Result<Parcel>) {
        let mut result = self.result.lock();
        if result.is_none() {
            *result = Some(outcome);
            self.ready.notify_all();
        }
    }

    fn wait(&self, timeout: Option<Duration>) -> Option<Result<Parcel>> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut result = self.result.lock();
        loop {
            if let Some(outcome) = result.take() {
                return Some(outcome);
            }
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut result, deadline).timed_out() {
                        return result.take();
                    }
                }
                None => self.ready.wait(&mut result),
            }
        }
    }
}

struct Call {
    id: u64,
    caller: ProcessId,
    slot: Arc<ReplySlot>,
}

struct Job {
    target: LocalHandle,
    request: Parcel,
    call: Option<Call>,
}

struct RefEntry {
    target: Target,
    strong: usize,
}

struct HandleTable {
    next: u32,
    by_handle: HashMap<Handle, RefEntry>,
    by_target: HashMap<Target, Handle>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self { next: 1, by_handle: HashMap::new(), by_target: HashMap::new() }
    }
}

struct Process {
    pid: ProcessId,
    name: String,
    max_parcel: usize,
    alive: AtomicBool,
    handler: RwLock<Option<Weak<dyn TransactionHandler>>>,
    queue: Mutex<Option<Sender<Job>>>,
    handles: Mutex<HandleTable>,
    pending: Mutex<HashMap<u64, Arc<ReplySlot>>>,
    deaths: Mutex<Option<Sender<Handle>>>,
    death_rx: Mutex<Option<Receiver<Handle>>>,
}

impl Process {
    fn handler(&self) -> Option<Arc<dyn TransactionHandler>> {
        self.handler.read().as_ref().and_then(Weak::upgrade)
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

struct BusInner {
    next_pid: AtomicU32,
    next_call: AtomicU64,
    processes: RwLock<HashMap<ProcessId, Arc<Process>>>,
    context_manager: Mutex<Option<Target>>,
}

/// Host-side bus connecting simulated processes.
#[derive(Clone)]
pub struct LoopbackBus {
    inner: Arc<BusInner>,
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                next_pid: AtomicU32::new(1),
                next_call: AtomicU64::new(1),
                processes: RwLock::new(HashMap::new()),
                context_manager: Mutex::new(None),
            }),
        }
    }

    /// Creates a process with `config.max_threads` transaction workers and
    /// returns its channel.
    pub fn spawn_process(&self, name: &str, config: &RpcConfig) -> Result<LoopbackChannel> {
        let pid = ProcessId(self.inner.next_pid.fetch_add(1, Ordering::Relaxed));
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let (death_tx, death_rx) = mpsc::channel();
        let process = Arc::new(Process {
            pid,
            name: name.to_string(),
            max_parcel: config.max_parcel_capacity,
            alive: AtomicBool::new(true),
            handler: RwLock::new(None),
            queue: Mutex::new(Some(job_tx)),
            handles: Mutex::new(HandleTable::default()),
            pending: Mutex::new(HashMap::new()),
            deaths: Mutex::new(Some(death_tx)),
            death_rx: Mutex::new(Some(death_rx)),
        });

        let job_rx = Arc::new(Mutex::new(job_rx));
        for index in 0..config.max_threads.max(1) {
            let worker = Worker {
                bus: Arc::downgrade(&self.inner),
                process: Arc::downgrade(&process),
                jobs: Arc::clone(&job_rx),
            };
            thread::Builder::new()
                .name(format!("rpc-{name}-{index}"))
                .spawn(move || worker.run())
                .map_err(|_| RpcError::OutOfMemory)?;
        }

        self.inner.processes.write().insert(pid, process);
        info!("loopback: spawned {name} as pid {}", pid.0);
        Ok(LoopbackChannel { bus: self.clone(), pid })
    }

    /// Spawns a process and brings up its [`IpcContext`].
    pub fn spawn_context(&self, name: &str, config: RpcConfig) -> Result<(IpcContext, ProcessId)> {
        let channel = self.spawn_process(name, &config)?;
        let pid = channel.pid();
        let context = IpcContext::init(config, Arc::new(channel))?;
        Ok((context, pid))
    }

    /// Makes `object`, hosted by `pid`, reachable as handle 0 from every
    /// process. The bus pins it until replaced or until `pid` dies.
    pub fn set_context_manager(&self, pid: ProcessId, object: &RemoteObject) -> Result<()> {
        let handle = object.local_handle().ok_or_else(|| {
            RpcError::InvalidOperation("context manager must be hosted by its process".into())
        })?;
        let owner = self.process(pid).ok_or(RpcError::DeadObject)?;
        owner.handler().ok_or(RpcError::DeadObject)?.on_acquire(handle)?;
        let previous = self.inner.context_manager.lock().replace(Target { pid, object: handle });
        if let Some(previous) = previous {
            self.release_target(previous);
        }
        info!("loopback: context manager is {handle} in pid {}", pid.0);
        Ok(())
    }

    /// Returns `true` while `pid` has not been terminated.
    pub fn is_alive(&self, pid: ProcessId) -> bool {
        self.process(pid).is_some()
    }

    /// Kills `pid`. Returns `false` if it was already gone.
    pub fn terminate(&self, pid: ProcessId) -> bool {
        let Some(process) = self.inner.processes.write().remove(&pid) else {
            return false;
        };
        process.alive.store(false, Ordering::Release);
        *process.queue.lock() = None;
        *process.handler.write() = None;

        let pending: Vec<Arc<ReplySlot>> =
            process.pending.lock().drain().map(|(_, slot)| slot).collect();
        for slot in &pending {
            slot.complete(Err(RpcError::DeadObject));
        }

        let held = std::mem::take(&mut *process.handles.lock());
        for entry in held.by_handle.into_values() {
            for _ in 0..entry.strong {
                self.release_target(entry.target);
            }
        }

        let lost_manager = {
            let mut manager = self.inner.context_manager.lock();
            if manager.is_some_and(|target| target.pid == pid) {
                *manager = None;
                true
            } else {
                false
            }
        };

        let survivors: Vec<Arc<Process>> = self.inner.processes.read().values().cloned().collect();
        for survivor in survivors {
            let mut dead: Vec<Handle> = {
                let mut table = survivor.handles.lock();
                let handles: Vec<Handle> = table
                    .by_handle
                    .iter()
                    .filter(|(_, entry)| entry.target.pid == pid)
                    .map(|(handle, _)| *handle)
                    .collect();
                for handle in &handles {
                    if let Some(entry) = table.by_handle.remove(handle) {
                        table.by_target.remove(&entry.target);
                    }
                }
                handles
            };
            if lost_manager {
                dead.push(Handle::CONTEXT_MANAGER);
            }
            if let Some(events) = survivor.deaths.lock().as_ref() {
                for handle in dead {
                    // A survivor that never started its context has no reader.
                    let _ = events.send(handle);
                }
            }
        }

        *process.deaths.lock() = None;
        info!(
            "loopback: terminated {} (pid {}), failed {} pending call(s)",
            process.name,
            pid.0,
            pending.len()
        );
        true
    }

    fn process(&self, pid: ProcessId) -> Option<Arc<Process>> {
        self.inner.processes.read().get(&pid).cloned()
    }

    fn release_target(&self, target: Target) {
        if let Some(handler) = self.process(target.pid).and_then(|owner| owner.handler()) {
            handler.on_release(target.object);
        }
    }

    fn resolve(&self, from: &Process, handle: Handle) -> Result<Target> {
        if handle == Handle::CONTEXT_MANAGER {
            return self.inner.context_manager.lock().ok_or(RpcError::DeadObject);
        }
        from.handles.lock().by_handle.get(&handle).map(|entry| entry.target).ok_or(RpcError::DeadObject)
    }

    fn handle_for(&self, holder: &Process, target: Target) -> Handle {
        if *self.inner.context_manager.lock() == Some(target) {
            return Handle::CONTEXT_MANAGER;
        }
        let mut table = holder.handles.lock();
        if let Some(handle) = table.by_target.get(&target) {
            return *handle;
        }
        let handle = Handle::new(table.next);
        table.next += 1;
        table.by_target.insert(target, handle);
        table.by_handle.insert(handle, RefEntry { target, strong: 0 });
        handle
    }

    /// Rewrites every object in `parcel` from `from`'s terms into `to`'s.
    fn translate(&self, from: &Process, to: &Process, parcel: &mut Parcel) -> Result<()> {
        if parcel.object_count() == 0 {
            return Ok(());
        }
        let handler = to.handler().ok_or(RpcError::DeadObject)?;
        parcel.translate_objects(|object| {
            let target = match object {
                RemoteObject::Local(local) => Target { pid: from.pid, object: local.handle() },
                RemoteObject::Remote(remote) => self.resolve(from, remote.handle())?,
            };
            if target.pid == to.pid {
                handler.import_local(target.object)
            } else {
                handler.import_handle(self.handle_for(to, target))
            }
        })
    }

    fn enqueue(&self, to: &Process, job: Job) -> Result<()> {
        let queue = to.queue.lock();
        let sender = queue.as_ref().ok_or(RpcError::DeadObject)?;
        sender.send(job).map_err(|_| RpcError::DeadObject)
    }

    fn send(
        &self,
        from: ProcessId,
        handle: Handle,
        mut request: Parcel,
        timeout: Option<Duration>,
    ) -> Result<Parcel> {
        let caller = self.process(from).ok_or(RpcError::DeadObject)?;
        if request.size() > caller.max_parcel {
            return Err(RpcError::OutOfMemory);
        }
        let target = self.resolve(&caller, handle)?;
        let callee = self.process(target.pid).ok_or(RpcError::DeadObject)?;
        request.limit_capacity(callee.max_parcel)?;
        self.translate(&caller, &callee, &mut request)?;

        let id = self.inner.next_call.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(ReplySlot::new());
        callee.pending.lock().insert(id, Arc::clone(&slot));
        let call = Call { id, caller: from, slot: Arc::clone(&slot) };
        let queued = if callee.is_alive() {
            self.enqueue(&callee, Job { target: target.object, request, call: Some(call) })
        } else {
            Err(RpcError::DeadObject)
        };
        if let Err(err) = queued {
            callee.pending.lock().remove(&id);
            return Err(err);
        }

        match slot.wait(timeout) {
            Some(outcome) => outcome,
            None => {
                callee.pending.lock().remove(&id);
                warn!("loopback: call {id} to {} timed out", callee.name);
                Err(RpcError::Timeout)
            }
        }
    }

    fn post(&self, from: ProcessId, handle: Handle, mut request: Parcel) -> Result<()> {
        let caller = self.process(from).ok_or(RpcError::DeadObject)?;
        if request.size() > caller.max_parcel {
            return Err(RpcError::OutOfMemory);
        }
        let target = self.resolve(&caller, handle)?;
        let callee = self.process(target.pid).ok_or(RpcError::DeadObject)?;
        request.limit_capacity(callee.max_parcel)?;
        self.translate(&caller, &callee, &mut request)?;
        self.enqueue(&callee, Job { target: target.object, request, call: None })
    }

    fn acquire(&self, from: ProcessId, handle: Handle) -> Result<()> {
        if handle == Handle::CONTEXT_MANAGER {
            return Ok(());
        }
        let holder = self.process(from).ok_or(RpcError::DeadObject)?;
        let target = {
            let mut table = holder.handles.lock();
            let entry = table.by_handle.get_mut(&handle).ok_or(RpcError::DeadObject)?;
            entry.strong += 1;
            entry.target
        };
        let pinned = self
            .process(target.pid)
            .and_then(|owner| owner.handler())
            .ok_or(RpcError::DeadObject)
            .and_then(|handler| handler.on_acquire(target.object));
        if pinned.is_err() {
            if let Some(entry) = holder.handles.lock().by_handle.get_mut(&handle) {
                entry.strong = entry.strong.saturating_sub(1);
            }
        }
        pinned
    }

    fn release(&self, from: ProcessId, handle: Handle) {
        if handle == Handle::CONTEXT_MANAGER {
            return;
        }
        let Some(holder) = self.process(from) else { return };
        let target = {
            let mut table = holder.handles.lock();
            match table.by_handle.get_mut(&handle) {
                Some(entry) if entry.strong > 0 => {
                    entry.strong -= 1;
                    Some(entry.target)
                }
                _ => None,
            }
        };
        if let Some(target) = target {
            self.release_target(target);
        }
    }
}

struct Worker {
    bus: Weak<BusInner>,
    process: Weak<Process>,
    jobs: Arc<Mutex<Receiver<Job>>>,
}

impl Worker {
    fn run(self) {
        loop {
            let job = match self.jobs.lock().recv() {
                Ok(job) => job,
                Err(_) => return,
            };
            self.handle(job);
        }
    }

    fn handle(&self, job: Job) {
        let (Some(bus), Some(process)) = (self.bus.upgrade(), self.process.upgrade()) else {
            if let Some(call) = job.call {
                call.slot.complete(Err(RpcError::DeadObject));
            }
            return;
        };
        let bus = LoopbackBus { inner: bus };
        let oneway = job.call.is_none();
        let outcome = match process.handler() {
            Some(handler) => handler.on_transaction(job.target, job.request, oneway),
            None => Err(RpcError::DeadObject),
        };

        let Some(call) = job.call else {
            if let Err(err) = outcome {
                debug!("loopback: one-way call into {} failed: {err}", job.target);
            }
            return;
        };
        let reply = match outcome {
            Ok(Some(mut reply)) => match bus.process(call.caller) {
                Some(caller) => {
                    let delivered = reply
                        .limit_capacity(caller.max_parcel)
                        .and_then(|()| bus.translate(&process, &caller, &mut reply));
                    delivered.map(|()| reply)
                }
                None => {
                    error!("loopback: reply for vanished pid {}", call.caller.0);
                    Err(RpcError::DeadObject)
                }
            },
            Ok(None) => Err(RpcError::ProtocolError("synchronous call produced no reply".into())),
            Err(err) => Err(err.across_boundary()),
        };
        process.pending.lock().remove(&call.id);
        call.slot.complete(reply);
    }
}

/// Channel of one simulated process.
pub struct LoopbackChannel {
    bus: LoopbackBus,
    pid: ProcessId,
}

impl LoopbackChannel {
    /// Process this channel belongs to.
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Bus the process is attached to.
    pub fn bus(&self) -> &LoopbackBus {
        &self.bus
    }
}

impl Channel for LoopbackChannel {
    fn attach(&self, handler: Weak<dyn TransactionHandler>) {
        if let Some(process) = self.bus.process(self.pid) {
            *process.handler.write() = Some(handler);
        }
    }

    fn detach(&self) {
        self.bus.terminate(self.pid);
    }

    fn send(&self, target: Handle, request: Parcel, timeout: Option<Duration>) -> Result<Parcel> {
        self.bus.send(self.pid, target, request, timeout)
    }

    fn post(&self, target: Handle, request: Parcel) -> Result<()> {
        self.bus.post(self.pid, target, request)
    }

    fn acquire(&self, target: Handle) -> Result<()> {
        self.bus.acquire(self.pid, target)
    }

    fn release(&self, target: Handle) {
        self.bus.release(self.pid, target);
    }

    fn death_events(&self) -> Result<DeathEvents> {
        let process = self.bus.process(self.pid).ok_or(RpcError::DeadObject)?;
        let rx = process
            .death_rx
            .lock()
            .take()
            .ok_or_else(|| RpcError::InvalidOperation("death events already taken".into()))?;
        Ok(DeathEvents::new(rx))
    }
}
