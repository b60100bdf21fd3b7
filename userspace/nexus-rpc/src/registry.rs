// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Consumer side of the service registry.

use core::fmt;
use std::thread;
use std::time::Duration;

use log::debug;

use crate::error::{Result, RpcError};
use crate::object::RemoteObject;

/// Numeric service identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceId(pub u32);

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service#{}", self.0)
    }
}

/// Bounded retry used by [`ServiceRegistry::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Lookups performed before giving up (at least one is always made).
    pub attempts: u32,
    /// Sleep between lookups.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 5, backoff: Duration::from_millis(50) }
    }
}

/// Maps service ids to remote objects.
pub trait ServiceRegistry: Send + Sync {
    /// Single non-blocking lookup. `Ok(None)` means not (yet) published.
    fn check_service(&self, id: ServiceId) -> Result<Option<RemoteObject>>;

    /// Retry policy applied by [`ServiceRegistry::resolve`].
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    /// Blocks until `id` is published or the retry policy is exhausted.
    ///
    /// Only absence is retried; transport and protocol errors are returned as
    /// they are.
    fn resolve(&self, id: ServiceId) -> Result<RemoteObject> {
        let policy = self.retry_policy();
        let attempts = policy.attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(object) = self.check_service(id)? {
                return Ok(object);
            }
            debug!("{id} not published (attempt {attempt}/{attempts})");
            if attempt < attempts {
                thread::sleep(policy.backoff);
            }
        }
        Err(RpcError::ServiceNotFound(id.0))
    }
}
