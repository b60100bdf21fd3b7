// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! System ability manager: maps numeric service ids to remote objects.
//!
//! The [`Registry`] is the in-memory table. [`SamgrService`] hosts it over
//! nexus-rpc as the context manager (handle 0 in every process) and
//! [`SamgrProxy`] is the client side, usable wherever a
//! [`nexus_rpc::ServiceRegistry`] is expected. Every registration carries a
//! [`Generation`]; a service whose hosting process dies is removed, and a new
//! registration under the same id gets a newer generation.

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

mod client;
mod server;

pub use client::{register_broker, system_ability_manager, SamgrProxy};
pub use server::SamgrService;

use std::collections::HashMap;

use nexus_rpc::{
    InterfaceDescriptor, RegistrationId, RemoteObject, RpcError, ServiceId,
    FIRST_CALL_TRANSACTION,
};
use parking_lot::Mutex;

/// Interface descriptor of the service manager.
pub const DESCRIPTOR: &str = "nexus.samgr.ISystemAbilityManager";

/// `[id:u32][object]` -> `[generation:u64]`
pub const ADD_SERVICE: u32 = FIRST_CALL_TRANSACTION;
/// `[id:u32]` -> `[generation:u64][object]`
pub const GET_SERVICE: u32 = FIRST_CALL_TRANSACTION + 1;
/// `[id:u32]` -> `[object?]`
pub const CHECK_SERVICE: u32 = FIRST_CALL_TRANSACTION + 2;
/// `[id:u32][generation:u64]` -> `[]`
pub const REMOVE_SERVICE: u32 = FIRST_CALL_TRANSACTION + 3;
/// `[]` -> `[count:u32][id:u32]*`
pub const LIST_SERVICES: u32 = FIRST_CALL_TRANSACTION + 4;

const ERR_DUPLICATE: i32 = 1;
const ERR_NOT_FOUND: i32 = 2;
const ERR_STALE: i32 = 3;

/// Result alias for service manager operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors produced by the service manager.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// A live service is already registered under the id.
    #[error("service already registered")]
    Duplicate,
    /// The requested service does not exist.
    #[error("service not found")]
    NotFound,
    /// A handle refers to an outdated generation.
    #[error("stale service handle")]
    StaleHandle,
    /// The RPC layer failed.
    #[error(transparent)]
    Rpc(RpcError),
}

impl From<RpcError> for Error {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::RemoteError(ERR_DUPLICATE) => Self::Duplicate,
            RpcError::RemoteError(ERR_NOT_FOUND) => Self::NotFound,
            RpcError::RemoteError(ERR_STALE) => Self::StaleHandle,
            other => Self::Rpc(other),
        }
    }
}

impl From<Error> for RpcError {
    fn from(err: Error) -> Self {
        match err {
            Error::Duplicate => RpcError::RemoteError(ERR_DUPLICATE),
            Error::NotFound => RpcError::RemoteError(ERR_NOT_FOUND),
            Error::StaleHandle => RpcError::RemoteError(ERR_STALE),
            Error::Rpc(err) => err,
        }
    }
}

/// Unique generation identifier assigned to each service registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl Generation {
    const fn first() -> Self {
        Self(1)
    }

    /// Returns the next monotonically increasing generation value.
    fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub(crate) const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Exposes the raw numeric value.
    pub fn value(self) -> u64 {
        self.0
    }
}

/// Names one registration of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceHandle {
    /// Service id.
    pub id: ServiceId,
    /// Generation of this registration.
    pub generation: Generation,
}

/// Anything the registry can hold. Dead endpoints may be replaced without
/// [`Error::Duplicate`].
pub trait Endpoint: Clone {
    /// Returns `false` once the endpoint is known to be unreachable.
    fn is_alive(&self) -> bool;
}

impl Endpoint for RemoteObject {
    fn is_alive(&self) -> bool {
        RemoteObject::is_alive(self)
    }
}

struct ServiceRecord<E> {
    endpoint: E,
    generation: Generation,
    watch: Option<RegistrationId>,
}

struct Inner<E> {
    services: HashMap<ServiceId, ServiceRecord<E>>,
    last: HashMap<ServiceId, Generation>,
}

/// In-memory service table.
pub struct Registry<E = RemoteObject> {
    inner: Mutex<Inner<E>>,
}

impl<E: Endpoint> Default for Registry<E> {
    fn default() -> Self {
        Self { inner: Mutex::new(Inner { services: HashMap::new(), last: HashMap::new() }) }
    }
}

impl<E: Endpoint> Registry<E> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `endpoint` under `id`. An existing registration is replaced
    /// only if its endpoint is dead.
    pub fn register(&self, id: ServiceId, endpoint: E) -> Result<ServiceHandle> {
        let mut inner = self.inner.lock();
        if inner.services.get(&id).is_some_and(|record| record.endpoint.is_alive()) {
            return Err(Error::Duplicate);
        }
        let generation = inner.last.get(&id).map_or(Generation::first(), |last| last.next());
        inner.last.insert(id, generation);
        let replaced = inner.services.insert(id, ServiceRecord { endpoint, generation, watch: None });
        drop(inner);
        drop(replaced);
        Ok(ServiceHandle { id, generation })
    }

    /// Records the death registration guarding `handle`.
    pub fn attach_watch(&self, handle: &ServiceHandle, watch: RegistrationId) -> Result<()> {
        let mut inner = self.inner.lock();
        let record = inner.services.get_mut(&handle.id).ok_or(Error::NotFound)?;
        if record.generation != handle.generation {
            return Err(Error::StaleHandle);
        }
        record.watch = Some(watch);
        Ok(())
    }

    /// Current registration of `id`.
    pub fn lookup(&self, id: ServiceId) -> Result<(ServiceHandle, E)> {
        let inner = self.inner.lock();
        let record = inner.services.get(&id).ok_or(Error::NotFound)?;
        Ok((ServiceHandle { id, generation: record.generation }, record.endpoint.clone()))
    }

    /// Endpoint of `id`, if registered.
    pub fn check(&self, id: ServiceId) -> Option<E> {
        self.inner.lock().services.get(&id).map(|record| record.endpoint.clone())
    }

    /// Removes the registration named by `handle`, returning its death watch.
    pub fn remove(&self, handle: &ServiceHandle) -> Result<Option<RegistrationId>> {
        let mut inner = self.inner.lock();
        let record = inner.services.get(&handle.id).ok_or(Error::NotFound)?;
        if record.generation != handle.generation {
            return Err(Error::StaleHandle);
        }
        let removed = inner.services.remove(&handle.id);
        drop(inner);
        Ok(removed.and_then(|record| record.watch))
    }

    /// Registered ids in ascending order.
    pub fn list(&self) -> Vec<ServiceId> {
        let mut ids: Vec<ServiceId> = self.inner.lock().services.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.inner.lock().services.len()
    }

    /// Returns `true` when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Client-visible operations of the service manager.
pub trait SystemAbilityManager: Send + Sync {
    /// Publishes `object` under `id`.
    fn add_service(&self, id: ServiceId, object: &RemoteObject) -> Result<Generation>;

    /// Current registration of `id`, or [`Error::NotFound`].
    fn get_service(&self, id: ServiceId) -> Result<(Generation, RemoteObject)>;

    /// Non-failing lookup.
    fn find_service(&self, id: ServiceId) -> Result<Option<RemoteObject>>;

    /// Withdraws the registration of `id` made at `generation`.
    fn remove_service(&self, id: ServiceId, generation: Generation) -> Result<()>;

    /// Registered ids in ascending order.
    fn list_services(&self) -> Result<Vec<ServiceId>>;
}

impl InterfaceDescriptor for dyn SystemAbilityManager {
    const DESCRIPTOR: &'static str = DESCRIPTOR;
}
