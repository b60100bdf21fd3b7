// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Proxy/stub distributed-object RPC runtime
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests per module + loopback integration tests
//!
//! PUBLIC API:
//!   - Parcel / Parcelable: positional wire buffer and typed encoding
//!   - RemoteObject / WeakRemoteObject: local or remote endpoint references
//!   - Stub / StubBuilder: descriptor-checked transaction dispatch tables
//!   - RemoteProxy: client-side call helper for generated proxies
//!   - BrokerRegistry: descriptor -> proxy factory, local short-circuit
//!   - DeathRegistry / DeathRecipient: at-most-once death notification
//!   - Channel / TransactionHandler: transport seam
//!   - ServiceRegistry: bounded-retry service resolution
//!   - IpcContext: per-process state with explicit init/shutdown
//!   - LoopbackBus (backend-host): multi-process simulation on the host
//!
//! DEPENDENCIES:
//!   - parking_lot: table locks, reentrant per-object serialisation
//!   - log: diagnostics
//!   - serde/toml: RpcConfig
//!   - thiserror: error types

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(missing_docs)]

mod broker;
mod channel;
mod config;
mod context;
mod death;
mod error;
#[cfg(feature = "backend-host")]
mod loopback;
mod object;
mod parcel;
mod parcelable;
mod proxy;
mod registry;
mod stub;
mod table;

pub use broker::{BrokerRegistry, InterfaceDescriptor};
pub use channel::{Channel, DeathEvents, TransactionHandler};
pub use config::{ConfigError, RpcConfig};
pub use context::{IpcContext, WeakIpcContext};
pub use death::{DeathRecipient, DeathRegistry, RegistrationId};
pub use error::{Result, RpcError, FAULT_HANDLER_FAILED, FAULT_HANDLER_PANICKED};
#[cfg(feature = "backend-host")]
pub use loopback::{LoopbackBus, LoopbackChannel, ProcessId};
pub use object::{
    Handle, LocalHandle, LocalObject, RemoteHandle, RemoteObject, StubState, WeakRemoteObject,
};
pub use parcel::{Parcel, DEFAULT_MAX_CAPACITY};
pub use parcelable::{Parcelable, Utf16String};
pub use proxy::RemoteProxy;
pub use registry::{RetryPolicy, ServiceId, ServiceRegistry};
pub use stub::{
    Handler, RequestHeader, Stub, StubBuilder, Threading, FIRST_CALL_TRANSACTION,
    LAST_CALL_TRANSACTION, PING_TRANSACTION,
};
