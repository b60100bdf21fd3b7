// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Server-side transaction dispatch
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests (descriptor check, unknown code, fault conversion, one-way)
//!
//! Every request starts with `[descriptor:string][code:u32]`. The descriptor is
//! checked before the handler table is consulted; handler failures and panics
//! become structured errors and never unwind past the stub. A handler cannot
//! report `DeadObject`, `Timeout`, `BadDescriptor` or `UnknownTransaction`:
//! those describe the addressed endpoint, so one leaking out of a nested call
//! is replaced by `RemoteError(FAULT_HANDLER_FAILED)`.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use log::{debug, warn};

use crate::error::{Result, RpcError, FAULT_HANDLER_FAILED, FAULT_HANDLER_PANICKED};
use crate::parcel::Parcel;
use crate::parcelable::Parcelable;

/// First code available to interface methods.
pub const FIRST_CALL_TRANSACTION: u32 = 0x0000_0001;
/// Last code available to interface methods.
pub const LAST_CALL_TRANSACTION: u32 = 0x00ff_ffff;
/// Liveness check answered by every stub.
pub const PING_TRANSACTION: u32 = u32::from_be_bytes(*b"_PNG");

/// Handler invoked with the request (positioned after the header) and a
/// fresh reply parcel.
pub type Handler = Arc<dyn Fn(&mut Parcel, &mut Parcel) -> Result<()> + Send + Sync>;

/// Concurrency model of a hosted object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Threading {
    /// Transactions may run in parallel.
    #[default]
    Concurrent,
    /// One transaction at a time; re-entry from the same thread is allowed.
    Serialized,
}

/// First two fields of every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    /// Interface the caller believes it is invoking.
    pub descriptor: String,
    /// Transaction code.
    pub code: u32,
}

impl Parcelable for RequestHeader {
    fn write_to(&self, parcel: &mut Parcel) -> Result<()> {
        parcel.write_string(&self.descriptor)?;
        parcel.write_u32(self.code)
    }

    fn read_from(parcel: &mut Parcel) -> Result<Self> {
        let descriptor = parcel.read_string()?;
        let code = parcel.read_u32()?;
        Ok(Self { descriptor, code })
    }
}

/// Builder for a [`Stub`]'s dispatch table.
pub struct StubBuilder {
    descriptor: String,
    handlers: HashMap<u32, Handler>,
    threading: Threading,
    local_impl: Option<Arc<dyn Any + Send + Sync>>,
    rejected: Vec<String>,
}

impl StubBuilder {
    /// Registers the handler for `code`.
    pub fn handler<F>(mut self, code: u32, handler: F) -> Self
    where
        F: Fn(&mut Parcel, &mut Parcel) -> Result<()> + Send + Sync + 'static,
    {
        if !(FIRST_CALL_TRANSACTION..=LAST_CALL_TRANSACTION).contains(&code) {
            self.rejected.push(format!("code {code:#x} outside the call range"));
        } else if self.handlers.insert(code, Arc::new(handler)).is_some() {
            self.rejected.push(format!("code {code:#x} registered twice"));
        }
        self
    }

    /// Sets the concurrency model.
    pub fn threading(mut self, threading: Threading) -> Self {
        self.threading = threading;
        self
    }

    /// Attaches the typed implementation returned to same-process callers.
    pub fn local<I: ?Sized + Send + Sync + 'static>(mut self, object: Arc<I>) -> Self {
        self.local_impl = Some(Arc::new(object));
        self
    }

    /// Finalises the table.
    pub fn build(self) -> Result<Stub> {
        if let Some(reason) = self.rejected.into_iter().next() {
            return Err(RpcError::InvalidOperation(format!("{}: {reason}", self.descriptor)));
        }
        Ok(Stub {
            descriptor: self.descriptor.into(),
            handlers: self.handlers,
            threading: self.threading,
            local_impl: self.local_impl,
        })
    }
}

/// Dispatch table for one interface.
pub struct Stub {
    descriptor: Arc<str>,
    handlers: HashMap<u32, Handler>,
    threading: Threading,
    local_impl: Option<Arc<dyn Any + Send + Sync>>,
}

impl Stub {
    /// Starts a table for `descriptor`.
    pub fn builder(descriptor: impl Into<String>) -> StubBuilder {
        StubBuilder {
            descriptor: descriptor.into(),
            handlers: HashMap::new(),
            threading: Threading::default(),
            local_impl: None,
            rejected: Vec::new(),
        }
    }

    /// Interface descriptor.
    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    /// Concurrency model.
    pub fn threading(&self) -> Threading {
        self.threading
    }

    pub(crate) fn local_impl<I: ?Sized + 'static>(&self) -> Option<Arc<I>> {
        self.local_impl.as_ref()?.downcast_ref::<Arc<I>>().cloned()
    }

    /// Checks the header and dispatches the request.
    pub fn on_remote_request(&self, request: &mut Parcel, oneway: bool) -> Result<Option<Parcel>> {
        let header = RequestHeader::read_from(request).map_err(|err| match err {
            RpcError::ParcelUnderflow => RpcError::ProtocolError("truncated request header".into()),
            other => other,
        })?;
        if header.descriptor != *self.descriptor {
            warn!(
                "descriptor mismatch: stub {} received {} (code {:#x})",
                self.descriptor, header.descriptor, header.code
            );
            return Err(RpcError::BadDescriptor);
        }
        if header.code == PING_TRANSACTION {
            return Ok((!oneway).then(Parcel::new));
        }
        self.on_transaction(header.code, request, oneway)
    }

    /// Invokes the handler registered for `code`.
    pub fn on_transaction(
        &self,
        code: u32,
        request: &mut Parcel,
        oneway: bool,
    ) -> Result<Option<Parcel>> {
        let handler = self.handlers.get(&code).ok_or_else(|| {
            warn!("{}: unknown transaction {code:#x}", self.descriptor);
            RpcError::UnknownTransaction(code)
        })?;
        debug!("{}: dispatch {code:#x} oneway={oneway}", self.descriptor);

        let mut reply = Parcel::with_max_capacity(request.max_capacity());
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(request, &mut reply)));
        match outcome {
            Ok(Ok(())) => Ok((!oneway).then_some(reply)),
            Ok(Err(RpcError::ParcelUnderflow)) => {
                Err(RpcError::ProtocolError("request arguments truncated".into()))
            }
            Ok(Err(err)) if err.is_transport() => {
                warn!("{}: handler for {code:#x} failed: {err}", self.descriptor);
                Err(RpcError::RemoteError(FAULT_HANDLER_FAILED))
            }
            Ok(Err(err)) => Err(err),
            Err(_) => {
                warn!("{}: handler for {code:#x} panicked", self.descriptor);
                Err(RpcError::RemoteError(FAULT_HANDLER_PANICKED))
            }
        }
    }
}
