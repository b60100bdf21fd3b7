// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Death notification for remote objects
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests (fire once, cancel, unregister/notify race)
//!
//! Each registration moves `Armed -> Fired` or `Armed -> Cancelled`, exactly
//! once, under the registry lock, and is dropped on that transition: only
//! armed registrations are kept. Recipients run after the lock is released,
//! so a callback may register or unregister other recipients.
//!
//! Registrations and the dead mark of a handle are purged when the process
//! forgets the handle, since nothing can observe its death any more.

use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::{Result, RpcError};
use crate::object::Handle;

/// Callback told when the process hosting a remote object dies.
pub trait DeathRecipient: Send + Sync {
    /// Invoked at most once per registration.
    fn on_remote_died(&self, handle: Handle);
}

impl<F> DeathRecipient for F
where
    F: Fn(Handle) + Send + Sync,
{
    fn on_remote_died(&self, handle: Handle) {
        self(handle)
    }
}

/// Token returned by a registration; pass it back to cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

struct Registration {
    handle: Handle,
    recipient: Arc<dyn DeathRecipient>,
}

#[derive(Default)]
struct Inner {
    armed: HashMap<RegistrationId, Registration>,
    dead: HashSet<Handle>,
}

/// Per-process table of death recipients.
#[derive(Default)]
pub struct DeathRegistry {
    next: AtomicU64,
    inner: Mutex<Inner>,
}

impl DeathRegistry {
    /// Arms `recipient` for `handle`. Fails with `DeadObject` if the death has
    /// already been observed.
    pub fn register(&self, handle: Handle, recipient: Arc<dyn DeathRecipient>) -> Result<RegistrationId> {
        let mut inner = self.inner.lock();
        if inner.dead.contains(&handle) {
            return Err(RpcError::DeadObject);
        }
        let id = RegistrationId(self.next.fetch_add(1, Ordering::Relaxed));
        inner.armed.insert(id, Registration { handle, recipient });
        Ok(id)
    }

    /// Cancels a registration. Returns `true` if it was still armed; after
    /// that the recipient is guaranteed never to run.
    pub fn unregister(&self, id: RegistrationId) -> bool {
        let removed = self.inner.lock().armed.remove(&id);
        removed.is_some()
    }

    /// Returns `true` while the registration can still fire or be cancelled.
    pub fn is_armed(&self, id: RegistrationId) -> bool {
        self.inner.lock().armed.contains_key(&id)
    }

    /// Number of armed registrations.
    pub fn armed_count(&self) -> usize {
        self.inner.lock().armed.len()
    }

    /// Records the death of `handle` and invokes every recipient armed for it.
    /// Returns the number of recipients invoked.
    pub fn notify(&self, handle: Handle) -> usize {
        let fired: Vec<Registration> = {
            let mut inner = self.inner.lock();
            inner.dead.insert(handle);
            Self::take_armed(&mut inner, handle)
        };
        debug!("{handle} died, {} recipient(s)", fired.len());
        for registration in &fired {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                registration.recipient.on_remote_died(handle)
            }));
            if outcome.is_err() {
                warn!("death recipient for {handle} panicked");
            }
        }
        fired.len()
    }

    /// Forgets the death of `handle` so the number can be reused.
    pub fn clear_dead(&self, handle: Handle) {
        self.inner.lock().dead.remove(&handle);
    }

    /// Drops every registration for `handle` and its dead mark without
    /// invoking anything. The recipients are returned so the caller can
    /// release them outside its own locks.
    pub(crate) fn forget_handle(&self, handle: Handle) -> Vec<Arc<dyn DeathRecipient>> {
        let mut inner = self.inner.lock();
        inner.dead.remove(&handle);
        let dropped = Self::take_armed(&mut inner, handle);
        if !dropped.is_empty() {
            debug!("{handle} forgotten, {} registration(s) dropped", dropped.len());
        }
        dropped.into_iter().map(|registration| registration.recipient).collect()
    }

    fn take_armed(inner: &mut Inner, handle: Handle) -> Vec<Registration> {
        let ids: Vec<RegistrationId> = inner
            .armed
            .iter()
            .filter(|(_, registration)| registration.handle == handle)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter().filter_map(|id| inner.armed.remove(&id)).collect()
    }

    /// Returns `true` if the death of `handle` has been observed.
    pub fn is_dead(&self, handle: Handle) -> bool {
        self.inner.lock().dead.contains(&handle)
    }
}
