// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! RPC front end of the registry.

use std::sync::Arc;

use log::{info, warn};
use nexus_rpc::{
    Handle, IpcContext, RemoteObject, Result as RpcResult, RpcError, ServiceId, Stub,
    WeakIpcContext,
};

use crate::{
    Error, Generation, Registry, Result, ServiceHandle, SystemAbilityManager, ADD_SERVICE,
    CHECK_SERVICE, DESCRIPTOR, GET_SERVICE, LIST_SERVICES, REMOVE_SERVICE,
};

/// Registry hosted in the service manager process.
pub struct SamgrService {
    registry: Arc<Registry>,
    context: WeakIpcContext,
}

impl SamgrService {
    /// Creates the service and registers its stub with `context`.
    ///
    /// The returned object must be kept alive and is normally installed as
    /// the transport's context manager.
    pub fn publish(context: &IpcContext) -> RpcResult<(Arc<Self>, RemoteObject)> {
        let service =
            Arc::new(Self { registry: Arc::new(Registry::new()), context: context.downgrade() });
        let object = context.register_local(service.stub()?)?;
        info!("samgr: published");
        Ok((service, object))
    }

    /// Underlying table.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn stub(self: &Arc<Self>) -> RpcResult<Stub> {
        let add = Arc::clone(self);
        let get = Arc::clone(self);
        let check = Arc::clone(self);
        let remove = Arc::clone(self);
        let list = Arc::clone(self);
        let local: Arc<dyn SystemAbilityManager> = Arc::<SamgrService>::clone(self);
        Stub::builder(DESCRIPTOR)
            .local(local)
            .handler(ADD_SERVICE, move |request, reply| {
                let id = ServiceId(request.read_u32()?);
                let object = request.read_remote_object()?;
                let generation = add.add_service(id, &object)?;
                reply.write_u64(generation.value())
            })
            .handler(GET_SERVICE, move |request, reply| {
                let id = ServiceId(request.read_u32()?);
                let (generation, object) = get.get_service(id)?;
                reply.write_u64(generation.value())?;
                reply.write_remote_object(&object)
            })
            .handler(CHECK_SERVICE, move |request, reply| {
                let id = ServiceId(request.read_u32()?);
                let object = check.find_service(id)?;
                reply.write_nullable_remote_object(object.as_ref())
            })
            .handler(REMOVE_SERVICE, move |request, _reply| {
                let id = ServiceId(request.read_u32()?);
                let generation = Generation::from_raw(request.read_u64()?);
                remove.remove_service(id, generation).map_err(RpcError::from)
            })
            .handler(LIST_SERVICES, move |_request, reply| {
                let ids: Vec<u32> = list.list_services()?.into_iter().map(|id| id.0).collect();
                reply.write(&ids)
            })
            .build()
    }

    fn watch(&self, handle: ServiceHandle, object: &RemoteObject) -> Result<()> {
        let context = self.context.upgrade().ok_or(Error::Rpc(RpcError::DeadObject))?;
        let registry = Arc::downgrade(&self.registry);
        let recipient = Arc::new(move |died: Handle| {
            let Some(registry) = registry.upgrade() else { return };
            if registry.remove(&handle).is_ok() {
                info!("samgr: {} gen {} removed ({died} died)", handle.id, handle.generation.value());
            }
        });
        match context.register_death_recipient(object, recipient) {
            Ok(watch) => {
                if self.registry.attach_watch(&handle, watch).is_err() {
                    context.unregister_death_recipient(watch);
                }
                Ok(())
            }
            Err(err) => {
                let _ = self.registry.remove(&handle);
                Err(err.into())
            }
        }
    }
}

impl SystemAbilityManager for SamgrService {
    fn add_service(&self, id: ServiceId, object: &RemoteObject) -> Result<Generation> {
        let handle = self.registry.register(id, object.clone()).inspect_err(|err| {
            warn!("samgr: add {id} refused: {err}");
        })?;
        if !object.is_local() {
            self.watch(handle, object)?;
        }
        info!("samgr: added {id} gen {}", handle.generation.value());
        Ok(handle.generation)
    }

    fn get_service(&self, id: ServiceId) -> Result<(Generation, RemoteObject)> {
        let (handle, object) = self.registry.lookup(id)?;
        Ok((handle.generation, object))
    }

    fn find_service(&self, id: ServiceId) -> Result<Option<RemoteObject>> {
        Ok(self.registry.check(id))
    }

    fn remove_service(&self, id: ServiceId, generation: Generation) -> Result<()> {
        let watch = self.registry.remove(&ServiceHandle { id, generation })?;
        if let (Some(watch), Some(context)) = (watch, self.context.upgrade()) {
            context.unregister_death_recipient(watch);
        }
        info!("samgr: removed {id} gen {}", generation.value());
        Ok(())
    }

    fn list_services(&self) -> Result<Vec<ServiceId>> {
        Ok(self.registry.list())
    }
}
