// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy shared by every RPC component.
//!
//! Errors that cross a process boundary are reduced to a `(status, detail)`
//! pair. Only that pair is part of the wire contract; message strings stay in
//! the process that produced them.

use thiserror::Error;

/// Result alias used across the runtime.
pub type Result<T> = core::result::Result<T, RpcError>;

/// Application code reported when a stub handler panics.
pub const FAULT_HANDLER_PANICKED: i32 = -1;
/// Application code reported when a stub handler fails with an error that
/// only a transport may raise, such as `DeadObject` from its own nested call.
pub const FAULT_HANDLER_FAILED: i32 = -2;

const STATUS_OK: i32 = 0;
const STATUS_UNDERFLOW: i32 = -1;
const STATUS_NO_MEMORY: i32 = -2;
const STATUS_BAD_DESCRIPTOR: i32 = -3;
const STATUS_UNKNOWN_TRANSACTION: i32 = -4;
const STATUS_DEAD_OBJECT: i32 = -5;
const STATUS_TIMEOUT: i32 = -6;
const STATUS_PROTOCOL: i32 = -7;
const STATUS_REMOTE: i32 = -8;
const STATUS_NOT_FOUND: i32 = -9;
const STATUS_INVALID_OPERATION: i32 = -10;
const STATUS_ALREADY_REGISTERED: i32 = -11;

/// Errors produced by the RPC runtime.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    /// A read went past the written end of a parcel.
    #[error("parcel underflow")]
    ParcelUnderflow,
    /// A write would exceed the parcel capacity or allocation failed.
    #[error("parcel out of memory")]
    OutOfMemory,
    /// The request carried a descriptor the target stub does not implement.
    #[error("interface descriptor mismatch")]
    BadDescriptor,
    /// The stub has no handler for the transaction code.
    #[error("unknown transaction code {0:#x}")]
    UnknownTransaction(u32),
    /// The endpoint is gone (process died or object unregistered).
    #[error("dead object")]
    DeadObject,
    /// The channel gave up waiting for a reply.
    #[error("transaction timed out")]
    Timeout,
    /// A reply or request was malformed.
    #[error("protocol error: {0}")]
    ProtocolError(String),
    /// The remote handler returned an application-level failure.
    #[error("remote error {0}")]
    RemoteError(i32),
    /// The registry could not produce the requested service.
    #[error("service {0} not found")]
    ServiceNotFound(u32),
    /// The caller used the API in a way the runtime refuses.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    /// A descriptor or handle is already registered.
    #[error("already registered: {0}")]
    AlreadyRegistered(String),
}

impl RpcError {
    /// Encodes the error as a `(status, detail)` pair for transports.
    pub fn to_wire(&self) -> (i32, i32) {
        match self {
            Self::ParcelUnderflow => (STATUS_UNDERFLOW, 0),
            Self::OutOfMemory => (STATUS_NO_MEMORY, 0),
            Self::BadDescriptor => (STATUS_BAD_DESCRIPTOR, 0),
            Self::UnknownTransaction(code) => (STATUS_UNKNOWN_TRANSACTION, *code as i32),
            Self::DeadObject => (STATUS_DEAD_OBJECT, 0),
            Self::Timeout => (STATUS_TIMEOUT, 0),
            Self::ProtocolError(_) => (STATUS_PROTOCOL, 0),
            Self::RemoteError(code) => (STATUS_REMOTE, *code),
            Self::ServiceNotFound(id) => (STATUS_NOT_FOUND, *id as i32),
            Self::InvalidOperation(_) => (STATUS_INVALID_OPERATION, 0),
            Self::AlreadyRegistered(_) => (STATUS_ALREADY_REGISTERED, 0),
        }
    }

    /// Decodes a `(status, detail)` pair produced by [`RpcError::to_wire`].
    ///
    /// Returns `None` for the success status. Unknown statuses decode as
    /// protocol errors.
    pub fn from_wire(status: i32, detail: i32) -> Option<Self> {
        let err = match status {
            STATUS_OK => return None,
            STATUS_UNDERFLOW => Self::ParcelUnderflow,
            STATUS_NO_MEMORY => Self::OutOfMemory,
            STATUS_BAD_DESCRIPTOR => Self::BadDescriptor,
            STATUS_UNKNOWN_TRANSACTION => Self::UnknownTransaction(detail as u32),
            STATUS_DEAD_OBJECT => Self::DeadObject,
            STATUS_TIMEOUT => Self::Timeout,
            STATUS_PROTOCOL => Self::ProtocolError("remote rejected malformed data".into()),
            STATUS_REMOTE => Self::RemoteError(detail),
            STATUS_NOT_FOUND => Self::ServiceNotFound(detail as u32),
            STATUS_INVALID_OPERATION => Self::InvalidOperation("rejected by remote".into()),
            STATUS_ALREADY_REGISTERED => Self::AlreadyRegistered("remote".into()),
            other => Self::ProtocolError(format!("unknown status {other}")),
        };
        Some(err)
    }

    /// Strips process-local detail, keeping only what survives the wire.
    pub fn across_boundary(&self) -> Self {
        let (status, detail) = self.to_wire();
        Self::from_wire(status, detail)
            .unwrap_or_else(|| Self::ProtocolError("success status carried as error".into()))
    }

    /// Returns `true` for errors that describe the transport or the addressed
    /// endpoint itself rather than the outcome of the method.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::DeadObject | Self::Timeout | Self::BadDescriptor | Self::UnknownTransaction(_)
        )
    }

    /// Returns `true` when re-resolving the service may recover.
    pub fn is_dead_object(&self) -> bool {
        matches!(self, Self::DeadObject)
    }
}
