// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Multi-process calls through samgr, brokers, proxies and stubs
//! TESTS: getTime wire layout, listener callbacks, descriptor checks, local
//!        short-circuit, retired objects

use std::sync::{mpsc, Arc};
use std::time::Duration;

use nexus_rpc::{Parcel, RemoteProxy, RpcError, ServiceId, FIRST_CALL_TRANSACTION};
use parking_lot::Mutex;
use rpc_e2e::{
    time_listener_stub, time_service_stub, Clock, HarnessError, ITimeListener, ITimeService, Node,
    GET_TIME, TIME_LISTENER_DESCRIPTOR, TIME_SERVICE_DESCRIPTOR,
};

const NOW: i64 = 1_700_000_000_123;

struct Recorder {
    seen: Mutex<mpsc::Sender<i64>>,
}

impl ITimeListener for Recorder {
    fn on_time_changed(&self, now: i64) -> nexus_rpc::Result<()> {
        self.seen.lock().send(now).map_err(|_| RpcError::RemoteError(1))
    }
}

#[test]
fn get_time_puts_descriptor_and_code_on_the_wire() {
    let node = Node::start().unwrap();
    let _server = node.start_time_server("timed", NOW).unwrap();
    let (client, tap) = node.spawn_tapped("client").unwrap();

    let time = client.time_service().unwrap();
    tap.clear();
    assert_eq!(time.get_time().unwrap(), NOW);

    let exchanges = tap.exchanges();
    assert_eq!(exchanges.len(), 1);
    let mut expected = Parcel::new();
    expected.write_string("ITimeService").unwrap();
    expected.write_u32(1).unwrap();
    assert_eq!(GET_TIME, 1);
    assert_eq!(exchanges[0].request, expected.as_bytes());

    let mut reply = Parcel::from_bytes(exchanges[0].reply.clone().expect("reply recorded"));
    assert_eq!(reply.read_i64().unwrap(), NOW);
    assert_eq!(reply.data_available(), 0);
}

#[test]
fn listener_passed_by_reference_is_called_back() {
    let node = Node::start().unwrap();
    let server = node.start_time_server("timed", NOW).unwrap();
    let client = node.spawn("client").unwrap();
    let (tx, rx) = mpsc::channel();
    let listener = client
        .context()
        .register_local(time_listener_stub(Arc::new(Recorder { seen: Mutex::new(tx) })).unwrap())
        .unwrap();

    let time = client.time_service().unwrap();
    time.register_listener(&listener).unwrap();
    assert_eq!(server.clock().listener_count(), 1);

    time.set_time(42).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    assert_eq!(time.get_time().unwrap(), 42);
}

#[test]
fn mismatched_descriptor_never_reaches_the_handler() {
    let node = Node::start().unwrap();
    let server = node.start_time_server("timed", NOW).unwrap();
    let client = node.spawn("client").unwrap();
    let object = client.lookup(rpc_e2e::TIME_SERVICE_ID).unwrap();

    let wrong = RemoteProxy::new(object.clone(), TIME_LISTENER_DESCRIPTOR);
    assert_eq!(wrong.call(GET_TIME, |_| Ok(())).unwrap_err(), RpcError::BadDescriptor);
    assert_eq!(wrong.ping().unwrap_err(), RpcError::BadDescriptor);
    assert_eq!(server.clock().get_time().unwrap(), NOW);

    let right = RemoteProxy::new(object, TIME_SERVICE_DESCRIPTOR);
    right.ping().unwrap();
    let unknown = FIRST_CALL_TRANSACTION + 0x100;
    assert_eq!(
        right.call(unknown, |_| Ok(())).unwrap_err(),
        RpcError::UnknownTransaction(unknown)
    );
}

#[test]
fn same_process_wrap_returns_the_implementation() {
    let node = Node::start().unwrap();
    let server = node.start_time_server("timed", NOW).unwrap();

    let local = server.process().wrap::<dyn ITimeService>(server.object()).unwrap();
    assert_eq!(
        Arc::as_ptr(&local) as *const (),
        Arc::as_ptr(server.clock()) as *const (),
    );
    let looked_up = server.process().lookup(rpc_e2e::TIME_SERVICE_ID).unwrap();
    assert!(looked_up.is_local());
    assert_eq!(&looked_up, server.object());

    let wrong = server.process().wrap::<dyn ITimeListener>(server.object());
    assert!(matches!(wrong, Err(HarnessError::Interface("ITimeListener"))));
}

#[test]
fn retired_object_answers_dead_object() {
    let node = Node::start().unwrap();
    let server = node.start_time_server("timed", NOW).unwrap();
    let spare = Clock::new(server.process().context(), 5);
    let object = server
        .process()
        .context()
        .register_local(time_service_stub(spare as Arc<dyn ITimeService>).unwrap())
        .unwrap();
    server.process().publish(ServiceId(8), &object).unwrap();

    let client = node.spawn("client").unwrap();
    let remote = client.lookup(ServiceId(8)).unwrap();
    let spare = client.wrap::<dyn ITimeService>(&remote).unwrap();
    assert_eq!(spare.get_time().unwrap(), 5);

    object.as_local().unwrap().unregister();
    assert_eq!(spare.get_time().unwrap_err(), RpcError::DeadObject);
    assert_eq!(client.time_service().unwrap().get_time().unwrap(), NOW);
}

#[test]
fn dropped_local_object_cannot_be_reached() {
    let node = Node::start().unwrap();
    let process = node.spawn("solo").unwrap();
    let before = process.context().local_object_count();
    let clock = Clock::new(process.context(), 1);
    let object = process
        .context()
        .register_local(time_service_stub(clock as Arc<dyn ITimeService>).unwrap())
        .unwrap();
    let weak = object.downgrade();
    assert_eq!(process.context().local_object_count(), before + 1);

    drop(object);
    assert!(weak.upgrade().is_none());
    assert_eq!(process.context().local_object_count(), before);
}
