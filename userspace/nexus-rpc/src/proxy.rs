// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Client-side helper that interface proxies are built on.

use std::time::Duration;

use log::debug;

use crate::error::{Result, RpcError};
use crate::object::RemoteObject;
use crate::parcel::Parcel;
use crate::parcelable::Parcelable;
use crate::stub::{RequestHeader, PING_TRANSACTION};

/// Remote object bound to one interface descriptor.
///
/// Each method of a generated proxy is a [`call`](Self::call) followed by a
/// [`decode`](Self::decode) of the reply.
#[derive(Clone, Debug)]
pub struct RemoteProxy {
    object: RemoteObject,
    descriptor: &'static str,
    timeout: Option<Duration>,
}

impl RemoteProxy {
    /// Binds `object` to `descriptor`.
    pub fn new(object: RemoteObject, descriptor: &'static str) -> Self {
        Self { object, descriptor, timeout: None }
    }

    /// Overrides the synchronous call timeout for this proxy.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Bound remote object.
    pub fn object(&self) -> &RemoteObject {
        &self.object
    }

    /// Interface descriptor written into every request.
    pub fn descriptor(&self) -> &'static str {
        self.descriptor
    }

    fn request<W>(&self, code: u32, write: W) -> Result<Parcel>
    where
        W: FnOnce(&mut Parcel) -> Result<()>,
    {
        let mut request = Parcel::with_max_capacity(self.object.max_parcel_capacity());
        RequestHeader { descriptor: self.descriptor.to_string(), code }.write_to(&mut request)?;
        write(&mut request)?;
        Ok(request)
    }

    /// Sends a synchronous transaction and returns the raw reply.
    pub fn call<W>(&self, code: u32, write: W) -> Result<Parcel>
    where
        W: FnOnce(&mut Parcel) -> Result<()>,
    {
        let request = self.request(code, write)?;
        debug!("{} call {code:#x} ({} bytes)", self.descriptor, request.size());
        match self.timeout {
            Some(timeout) => self.object.send_request_timeout(request, timeout),
            None => self.object.send_request(request),
        }
    }

    /// Sends a one-way transaction.
    pub fn call_oneway<W>(&self, code: u32, write: W) -> Result<()>
    where
        W: FnOnce(&mut Parcel) -> Result<()>,
    {
        let request = self.request(code, write)?;
        self.object.send_oneway(request)
    }

    /// Decodes a reply. Truncated replies become `ProtocolError`.
    pub fn decode<T, R>(&self, mut reply: Parcel, read: R) -> Result<T>
    where
        R: FnOnce(&mut Parcel) -> Result<T>,
    {
        read(&mut reply).map_err(|err| match err {
            RpcError::ParcelUnderflow => {
                RpcError::ProtocolError(format!("malformed reply for {}", self.descriptor))
            }
            other => other,
        })
    }

    /// Checks that the remote object is reachable and hosts this interface.
    pub fn ping(&self) -> Result<()> {
        self.call(PING_TRANSACTION, |_| Ok(())).map(drop)
    }
}
