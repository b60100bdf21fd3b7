// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Client side of the service manager.

use std::sync::Arc;

use nexus_rpc::{
    IpcContext, Parcel, RemoteObject, RemoteProxy, Result as RpcResult, RetryPolicy, RpcError,
    ServiceId, ServiceRegistry,
};

use crate::{
    Error, Generation, Result, SystemAbilityManager, ADD_SERVICE, CHECK_SERVICE, DESCRIPTOR,
    GET_SERVICE, LIST_SERVICES, REMOVE_SERVICE,
};

/// Talks to a [`crate::SamgrService`] hosted in another process.
#[derive(Clone, Debug)]
pub struct SamgrProxy {
    remote: RemoteProxy,
    policy: RetryPolicy,
}

impl SamgrProxy {
    /// Wraps a reference to the service manager.
    pub fn new(object: RemoteObject) -> Self {
        Self { remote: RemoteProxy::new(object, DESCRIPTOR), policy: RetryPolicy::default() }
    }

    /// Proxy for the context manager of `context`, retrying lookups as
    /// configured.
    pub fn connect(context: &IpcContext) -> RpcResult<Self> {
        let object = context.context_manager()?;
        Ok(Self::new(object).with_retry_policy(context.config().retry_policy()))
    }

    /// Replaces the retry policy used by [`ServiceRegistry::resolve`].
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Underlying RPC proxy.
    pub fn remote(&self) -> &RemoteProxy {
        &self.remote
    }
}

fn read_registration(reply: &mut Parcel) -> RpcResult<(Generation, RemoteObject)> {
    let generation = Generation::from_raw(reply.read_u64()?);
    Ok((generation, reply.read_remote_object()?))
}

impl SystemAbilityManager for SamgrProxy {
    fn add_service(&self, id: ServiceId, object: &RemoteObject) -> Result<Generation> {
        let reply = self.remote.call(ADD_SERVICE, |request| {
            request.write_u32(id.0)?;
            request.write_remote_object(object)
        })?;
        let raw = self.remote.decode(reply, Parcel::read_u64)?;
        Ok(Generation::from_raw(raw))
    }

    fn get_service(&self, id: ServiceId) -> Result<(Generation, RemoteObject)> {
        let reply = self.remote.call(GET_SERVICE, |request| request.write_u32(id.0))?;
        Ok(self.remote.decode(reply, read_registration)?)
    }

    fn find_service(&self, id: ServiceId) -> Result<Option<RemoteObject>> {
        let reply = self.remote.call(CHECK_SERVICE, |request| request.write_u32(id.0))?;
        Ok(self.remote.decode(reply, Parcel::read_nullable_remote_object)?)
    }

    fn remove_service(&self, id: ServiceId, generation: Generation) -> Result<()> {
        self.remote.call(REMOVE_SERVICE, |request| {
            request.write_u32(id.0)?;
            request.write_u64(generation.value())
        })?;
        Ok(())
    }

    fn list_services(&self) -> Result<Vec<ServiceId>> {
        let reply = self.remote.call(LIST_SERVICES, |_| Ok(()))?;
        let ids: Vec<u32> = self.remote.decode(reply, Parcel::read::<Vec<u32>>)?;
        Ok(ids.into_iter().map(ServiceId).collect())
    }
}

impl ServiceRegistry for SamgrProxy {
    fn check_service(&self, id: ServiceId) -> RpcResult<Option<RemoteObject>> {
        self.find_service(id).map_err(RpcError::from)
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.policy
    }
}

/// Installs the [`SamgrProxy`] factory in `context`'s broker registry.
pub fn register_broker(context: &IpcContext) -> RpcResult<()> {
    let policy = context.config().retry_policy();
    context.brokers().register::<dyn SystemAbilityManager, _>(move |object| {
        Arc::new(SamgrProxy::new(object).with_retry_policy(policy)) as Arc<dyn SystemAbilityManager>
    })
}

/// Resolves the service manager of `context` through its broker registry.
/// Requires [`register_broker`].
pub fn system_ability_manager(context: &IpcContext) -> Result<Arc<dyn SystemAbilityManager>> {
    let object = context.context_manager()?;
    context
        .brokers()
        .wrap::<dyn SystemAbilityManager>(&object)
        .ok_or_else(|| Error::Rpc(RpcError::BadDescriptor))
}
