// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Death notification across simulated processes
//! TESTS: crash with in-flight call, unregister before death, unregister
//!        racing termination, re-resolve after restart

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;

use nexus_rpc::{DeathRecipient, Handle, RpcError};
use parking_lot::Mutex;
use rpc_e2e::{wait_until, Node, TIME_SERVICE_ID};

fn counting_recipient(count: &Arc<AtomicUsize>) -> Arc<dyn DeathRecipient> {
    let count = Arc::clone(count);
    Arc::new(move |_handle: Handle| {
        count.fetch_add(1, Ordering::SeqCst);
    })
}

#[test]
fn crash_notifies_once_and_fails_the_inflight_call() {
    let node = Node::start().unwrap();
    let server = node.start_time_server("timed", 10).unwrap();
    let client = node.spawn("client").unwrap();
    let object = client.lookup(TIME_SERVICE_ID).unwrap();
    let time = client.wrap::<dyn rpc_e2e::ITimeService>(&object).unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let (died_tx, died_rx) = mpsc::channel();
    let died_tx = Mutex::new(died_tx);
    let recipient = {
        let count = Arc::clone(&count);
        Arc::new(move |handle: Handle| {
            count.fetch_add(1, Ordering::SeqCst);
            let _ = died_tx.lock().send(handle);
        })
    };
    client.context().register_death_recipient(&object, recipient).unwrap();

    let sleeper = {
        let time = Arc::clone(&time);
        thread::spawn(move || time.sleep(10_000))
    };
    assert!(wait_until(|| server.clock().sleeping() == 1));

    assert!(node.bus().terminate(server.process().pid()));
    assert_eq!(sleeper.join().unwrap().unwrap_err(), RpcError::DeadObject);
    let died = died_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(Some(died), object.remote_handle());

    thread::sleep(Duration::from_millis(50));
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(!object.is_alive());
    assert_eq!(time.get_time().unwrap_err(), RpcError::DeadObject);
    assert!(wait_until(|| node.registry().registry().check(TIME_SERVICE_ID).is_none()));
}

#[test]
fn recipient_unregistered_before_death_is_silent() {
    let node = Node::start().unwrap();
    let server = node.start_time_server("timed", 10).unwrap();
    let client = node.spawn("client").unwrap();
    let object = client.lookup(TIME_SERVICE_ID).unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let id = client.context().register_death_recipient(&object, counting_recipient(&count)).unwrap();
    assert!(client.context().unregister_death_recipient(id));

    assert!(node.bus().terminate(server.process().pid()));
    assert!(wait_until(|| !object.is_alive()));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn unregister_racing_termination_never_notifies_twice() {
    for _ in 0..16 {
        let node = Node::start().unwrap();
        let server = node.start_time_server("timed", 10).unwrap();
        let client = node.spawn("client").unwrap();
        let object = client.lookup(TIME_SERVICE_ID).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let id =
            client.context().register_death_recipient(&object, counting_recipient(&count)).unwrap();

        let start = Arc::new(Barrier::new(2));
        let canceller = {
            let start = Arc::clone(&start);
            let context = client.context().clone();
            thread::spawn(move || {
                start.wait();
                context.unregister_death_recipient(id)
            })
        };
        start.wait();
        node.bus().terminate(server.process().pid());
        let cancelled = canceller.join().unwrap();

        assert!(wait_until(|| !object.is_alive()));
        if cancelled {
            thread::sleep(Duration::from_millis(20));
            assert_eq!(count.load(Ordering::SeqCst), 0);
        } else {
            assert!(wait_until(|| count.load(Ordering::SeqCst) == 1));
            thread::sleep(Duration::from_millis(20));
            assert_eq!(count.load(Ordering::SeqCst), 1);
        }
    }
}

#[test]
fn restarted_service_is_found_again() {
    let node = Node::start().unwrap();
    let first = node.start_time_server("timed", 10).unwrap();
    let client = node.spawn("client").unwrap();
    let old = client.time_service().unwrap();
    assert_eq!(old.get_time().unwrap(), 10);

    node.bus().terminate(first.process().pid());
    assert!(wait_until(|| node.registry().registry().check(TIME_SERVICE_ID).is_none()));
    assert_eq!(old.get_time().unwrap_err(), RpcError::DeadObject);

    let _second = node.start_time_server("timed-2", 20).unwrap();
    let fresh = client.time_service().unwrap();
    assert_eq!(fresh.get_time().unwrap(), 20);
}
