// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Descriptor-keyed proxy factories.
//!
//! `wrap` turns a [`RemoteObject`] into a typed interface. When the object is
//! hosted by this process and was registered with a typed implementation, the
//! implementation itself is returned and no parcel is ever built.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::RwLock;

use crate::error::{Result, RpcError};
use crate::object::RemoteObject;

/// Binds an interface type (usually `dyn Trait`) to its descriptor string.
pub trait InterfaceDescriptor {
    /// Descriptor carried in the header of every request.
    const DESCRIPTOR: &'static str;
}

type Factory<I> = Arc<dyn Fn(RemoteObject) -> Arc<I> + Send + Sync>;

/// Per-context table of proxy factories.
#[derive(Default)]
pub struct BrokerRegistry {
    factories: RwLock<HashMap<&'static str, Box<dyn Any + Send + Sync>>>,
}

impl BrokerRegistry {
    /// Registers the proxy factory for `I`.
    pub fn register<I, F>(&self, factory: F) -> Result<()>
    where
        I: ?Sized + InterfaceDescriptor + 'static,
        F: Fn(RemoteObject) -> Arc<I> + Send + Sync + 'static,
    {
        let mut factories = self.factories.write();
        if factories.contains_key(I::DESCRIPTOR) {
            return Err(RpcError::AlreadyRegistered(I::DESCRIPTOR.to_string()));
        }
        let factory: Factory<I> = Arc::new(factory);
        factories.insert(I::DESCRIPTOR, Box::new(factory));
        debug!("broker registered for {}", I::DESCRIPTOR);
        Ok(())
    }

    /// Removes the factory for `descriptor`.
    pub fn unregister(&self, descriptor: &str) -> bool {
        self.factories.write().remove(descriptor).is_some()
    }

    /// Returns `true` if a factory is registered for `descriptor`.
    pub fn contains(&self, descriptor: &str) -> bool {
        self.factories.read().contains_key(descriptor)
    }

    /// Wraps `object` as `I`.
    ///
    /// A same-process object short-circuits to its local implementation. A
    /// local object hosting a different interface yields `None`.
    pub fn wrap<I>(&self, object: &RemoteObject) -> Option<Arc<I>>
    where
        I: ?Sized + InterfaceDescriptor + 'static,
    {
        if let Some(local) = object.as_local() {
            if local.descriptor() != I::DESCRIPTOR {
                warn!("{} hosts {}, not {}", local.handle(), local.descriptor(), I::DESCRIPTOR);
                return None;
            }
            if let Some(local_impl) = local.local_impl::<I>() {
                return Some(local_impl);
            }
        }
        let factory = {
            let factories = self.factories.read();
            match factories.get(I::DESCRIPTOR)?.downcast_ref::<Factory<I>>() {
                Some(factory) => Arc::clone(factory),
                None => {
                    warn!("broker for {} registered with another type", I::DESCRIPTOR);
                    return None;
                }
            }
        };
        Some(factory(object.clone()))
    }

    /// Local implementation behind `object`, bypassing serialization.
    ///
    /// Succeeds whenever `object` is hosted here under `I`'s descriptor and was
    /// registered with a typed implementation.
    pub fn as_local<I>(&self, object: &RemoteObject) -> Option<Arc<I>>
    where
        I: ?Sized + InterfaceDescriptor + 'static,
    {
        let local = object.as_local()?;
        if local.descriptor() != I::DESCRIPTOR {
            return None;
        }
        local.local_impl::<I>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::LocalObject;
    use crate::parcel::Parcel;
    use crate::proxy::RemoteProxy;
    use crate::stub::{Stub, FIRST_CALL_TRANSACTION};
    use crate::table::LocalTable;

    trait Greeter: Send + Sync {
        fn greet(&self) -> Result<String>;
    }

    impl InterfaceDescriptor for dyn Greeter {
        const DESCRIPTOR: &'static str = "test.IGreeter";
    }

    struct GreeterImpl;

    impl Greeter for GreeterImpl {
        fn greet(&self) -> Result<String> {
            Ok("local".into())
        }
    }

    struct GreeterProxy(RemoteProxy);

    impl Greeter for GreeterProxy {
        fn greet(&self) -> Result<String> {
            let reply = self.0.call(FIRST_CALL_TRANSACTION, |_| Ok(()))?;
            self.0.decode(reply, Parcel::read_string)
        }
    }

    fn registry() -> BrokerRegistry {
        let brokers = BrokerRegistry::default();
        brokers
            .register::<dyn Greeter, _>(|object| {
                Arc::new(GreeterProxy(RemoteProxy::new(object, <dyn Greeter>::DESCRIPTOR)))
            })
            .unwrap();
        brokers
    }

    fn host(table: &Arc<LocalTable>, stub: Stub) -> RemoteObject {
        RemoteObject::Local(table.insert(|handle| LocalObject::new(handle, stub, Arc::downgrade(table))))
    }

    fn greeter_stub() -> crate::stub::StubBuilder {
        Stub::builder(<dyn Greeter>::DESCRIPTOR)
            .handler(FIRST_CALL_TRANSACTION, |_req, reply| reply.write_string("stub"))
    }

    #[test]
    fn duplicate_registration_rejected() {
        let brokers = registry();
        let again = brokers.register::<dyn Greeter, _>(|object| {
            Arc::new(GreeterProxy(RemoteProxy::new(object, "x"))) as Arc<dyn Greeter>
        });
        assert!(matches!(again, Err(RpcError::AlreadyRegistered(_))));
        assert!(brokers.unregister(<dyn Greeter>::DESCRIPTOR));
        assert!(!brokers.contains(<dyn Greeter>::DESCRIPTOR));
    }

    #[test]
    fn local_object_short_circuits() {
        let table = Arc::new(LocalTable::default());
        let implementation: Arc<dyn Greeter> = Arc::new(GreeterImpl);
        let object = host(&table, greeter_stub().local(implementation).build().unwrap());
        let brokers = registry();

        assert_eq!(brokers.wrap::<dyn Greeter>(&object).unwrap().greet().unwrap(), "local");
        assert!(brokers.as_local::<dyn Greeter>(&object).is_some());
    }

    #[test]
    fn local_object_without_impl_goes_through_its_stub() {
        let table = Arc::new(LocalTable::default());
        let object = host(&table, greeter_stub().build().unwrap());
        let brokers = registry();

        assert!(brokers.as_local::<dyn Greeter>(&object).is_none());
        assert_eq!(brokers.wrap::<dyn Greeter>(&object).unwrap().greet().unwrap(), "stub");
    }

    #[test]
    fn mismatched_local_descriptor_is_refused() {
        let table = Arc::new(LocalTable::default());
        let object = host(&table, Stub::builder("test.IOther").build().unwrap());
        let brokers = registry();
        assert!(brokers.wrap::<dyn Greeter>(&object).is_none());
        assert!(brokers.as_local::<dyn Greeter>(&object).is_none());
    }
}
