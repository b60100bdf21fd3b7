// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Seam between the object runtime and a transport.
//!
//! A [`Channel`] moves parcels to objects in other processes and reports their
//! deaths. Inbound traffic is handed to the [`TransactionHandler`] attached by
//! the owning [`IpcContext`](crate::IpcContext).

use std::sync::mpsc::Receiver;
use std::sync::Weak;
use std::time::Duration;

use crate::error::Result;
use crate::object::{Handle, LocalHandle, RemoteObject};
use crate::parcel::Parcel;

/// Transport used by one process.
pub trait Channel: Send + Sync {
    /// Connects inbound traffic to `handler`. The channel keeps only a weak
    /// reference.
    fn attach(&self, handler: Weak<dyn TransactionHandler>);

    /// Disconnects from the transport. In-flight and future sends fail with
    /// `DeadObject`.
    fn detach(&self);

    /// Sends a synchronous transaction and blocks for the reply.
    ///
    /// `None` waits indefinitely.
    fn send(&self, target: Handle, request: Parcel, timeout: Option<Duration>) -> Result<Parcel>;

    /// Queues a one-way transaction.
    fn post(&self, target: Handle, request: Parcel) -> Result<()>;

    /// Takes a strong reference on the object behind `target`.
    fn acquire(&self, target: Handle) -> Result<()>;

    /// Drops a strong reference taken by [`Channel::acquire`].
    fn release(&self, target: Handle);

    /// Stream of handles whose hosting process has died. May be taken once.
    fn death_events(&self) -> Result<DeathEvents>;
}

/// Receiver side of a process, implemented by [`IpcContext`](crate::IpcContext).
pub trait TransactionHandler: Send + Sync {
    /// Dispatches an inbound transaction to a local object.
    fn on_transaction(&self, target: LocalHandle, request: Parcel, oneway: bool)
        -> Result<Option<Parcel>>;

    /// Another process took a reference on a local object.
    fn on_acquire(&self, target: LocalHandle) -> Result<()>;

    /// Another process dropped its reference on a local object.
    fn on_release(&self, target: LocalHandle);

    /// Resolves a local handle arriving in a parcel back to the local object.
    fn import_local(&self, target: LocalHandle) -> Result<RemoteObject>;

    /// Returns the canonical remote reference for `handle`, acquiring the
    /// target when the handle is new to this process.
    fn import_handle(&self, handle: Handle) -> Result<RemoteObject>;
}

/// Death notifications delivered by a channel, one per affected handle.
#[derive(Debug)]
pub struct DeathEvents {
    rx: Receiver<Handle>,
}

impl DeathEvents {
    /// Wraps a receiver fed by the transport.
    pub fn new(rx: Receiver<Handle>) -> Self {
        Self { rx }
    }
}

impl Iterator for DeathEvents {
    type Item = Handle;

    fn next(&mut self) -> Option<Handle> {
        self.rx.recv().ok()
    }
}
