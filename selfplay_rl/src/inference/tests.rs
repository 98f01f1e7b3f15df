//! Tests for batching, reply correspondence, weight swaps and shutdown.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use super::*;
use crate::core::Fragment;
use crate::model::Device;
use crate::test_support::{observation, EchoModel};

fn started(model: EchoModel, act_capacity: usize) -> Arc<InferenceServer<EchoModel>> {
    let server = InferenceServer::new("test", Device::cpu(), model);
    server.register(Method::Act, act_capacity).unwrap();
    server.register(Method::ComputePriority, 16).unwrap();
    server.start().unwrap();
    Arc::new(server)
}

fn obs_with(x: f32) -> crate::environment::Observation {
    observation(0, 0, vec![x, 0.0], vec![true, true])
}

// =============================================================================
// REGISTRATION
// =============================================================================

#[test]
fn test_register_rules() {
    let server = InferenceServer::new("reg", Device::cpu(), EchoModel::new());
    assert_eq!(server.start(), Err(InferenceError::NoMethods));
    assert_eq!(
        server.register(Method::Act, 0),
        Err(InferenceError::ZeroCapacity(Method::Act))
    );
    server.register(Method::Act, 4).unwrap();
    assert_eq!(
        server.register(Method::Act, 4),
        Err(InferenceError::AlreadyRegistered(Method::Act))
    );
    server.start().unwrap();
    assert_eq!(
        server.register(Method::ComputePriority, 4),
        Err(InferenceError::Running)
    );
    server.stop();
}

#[test]
fn test_unregistered_method_rejected() {
    let server = InferenceServer::new("act-only", Device::cpu(), EchoModel::new());
    server.register(Method::Act, 4).unwrap();
    server.start().unwrap();
    let frag = Arc::new(Fragment {
        seat: 0,
        features: vec![],
        legal: vec![],
        actions: vec![],
        rewards: vec![],
        terminals: vec![],
        bootstrap: None,
    });
    assert!(matches!(
        server.compute_priority(frag),
        Err(InferenceError::NotRegistered(Method::ComputePriority))
    ));
}

// =============================================================================
// BATCHING
// =============================================================================

#[test]
fn test_each_caller_gets_its_own_reply() {
    let server = started(EchoModel::new(), 64);
    let handles: Vec<_> = (0..32)
        .map(|i| {
            let server = Arc::clone(&server);
            thread::spawn(move || {
                for round in 0..10 {
                    let x = (i * 100 + round) as f32;
                    let values = server.act(obs_with(x)).unwrap();
                    assert_eq!(values[0], x);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    let stats = server.stats(Method::Act);
    assert_eq!(stats.requests, 320);
}

#[test]
fn test_concurrent_requests_are_coalesced() {
    let model = EchoModel::new().with_delay(Duration::from_millis(20));
    let sizes = Arc::clone(&model.batch_sizes);
    let server = started(model, 64);

    let callers = 16;
    let barrier = Arc::new(Barrier::new(callers));
    let handles: Vec<_> = (0..callers)
        .map(|i| {
            let server = Arc::clone(&server);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                server.act(obs_with(i as f32)).unwrap()
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let stats = server.stats(Method::Act);
    assert_eq!(stats.requests, callers as u64);
    assert!(stats.batches < callers as u64, "no coalescing: {:?}", sizes.lock());
    assert!(stats.mean_batch_size() > 1.0);
}

#[test]
fn test_batch_never_exceeds_capacity() {
    let model = EchoModel::new().with_delay(Duration::from_millis(5));
    let sizes = Arc::clone(&model.batch_sizes);
    let server = started(model, 3);

    let pending: Vec<_> = (0..3)
        .map(|i| server.act_async(obs_with(i as f32)).unwrap())
        .collect();
    let handles: Vec<_> = (0..9)
        .map(|i| {
            let server = Arc::clone(&server);
            thread::spawn(move || server.act(obs_with(i as f32)).unwrap())
        })
        .collect();
    for p in pending {
        p.wait().unwrap();
    }
    for h in handles {
        h.join().unwrap();
    }
    assert!(sizes.lock().iter().all(|&n| n <= 3));
}

#[test]
fn test_submit_routes_by_method() {
    let server = started(EchoModel::new(), 8);
    let reply = server.submit(Request::Act(obs_with(4.0))).unwrap();
    assert_eq!(reply, Reply::Act(vec![4.0, 0.0]));

    let frag = Arc::new(Fragment {
        seat: 0,
        features: vec![vec![0.0]; 3],
        legal: vec![vec![true]; 3],
        actions: vec![0; 3],
        rewards: vec![0.0; 3],
        terminals: vec![false, false, true],
        bootstrap: None,
    });
    let reply = server.submit(Request::ComputePriority(frag)).unwrap();
    assert_eq!(reply, Reply::Priority(3.0));
    assert_eq!(server.stats(Method::ComputePriority).requests, 1);
}

#[test]
fn test_submit_async_collects_in_any_order() {
    let server = started(EchoModel::new(), 8);
    let first = server.submit_async(Request::Act(obs_with(1.0))).unwrap();
    let second = server.submit_async(Request::Act(obs_with(2.0))).unwrap();
    assert_eq!(first.method(), Method::Act);
    assert_eq!(second.wait().unwrap(), Reply::Act(vec![2.0, 0.0]));
    assert_eq!(first.wait().unwrap(), Reply::Act(vec![1.0, 0.0]));
}

// =============================================================================
// WEIGHT SWAP
// =============================================================================

#[test]
fn test_replace_weights_affects_new_batches() {
    let server = started(EchoModel::new(), 8);
    assert_eq!(server.act(obs_with(1.0)).unwrap()[0], 1.0);

    let version = server.replace_weights(EchoModel::new().with_bias(10.0));
    assert_eq!(version, 1);
    assert_eq!(server.weights_version(), 1);
    assert_eq!(server.act(obs_with(1.0)).unwrap()[0], 11.0);
}

#[test]
fn test_in_flight_batch_keeps_old_snapshot() {
    let server = started(EchoModel::new().with_delay(Duration::from_millis(100)), 8);
    let pending = server.act_async(obs_with(1.0)).unwrap();
    // Give the dispatcher time to load the snapshot and enter the model.
    thread::sleep(Duration::from_millis(30));
    server.replace_weights(EchoModel::new().with_bias(10.0));
    assert_eq!(pending.wait().unwrap()[0], 1.0);
    assert_eq!(server.act(obs_with(1.0)).unwrap()[0], 11.0);
}

// =============================================================================
// SHUTDOWN
// =============================================================================

#[test]
fn test_submit_to_stopped_server_fails() {
    let server = started(EchoModel::new(), 8);
    server.stop();
    assert!(!server.is_running());
    assert_eq!(server.act(obs_with(1.0)), Err(InferenceError::Stopped));
}

#[test]
fn test_stop_unblocks_waiting_callers() {
    // The first batch occupies the dispatcher long enough for the second
    // caller to be waiting in the queue when stop() lands.
    let server = started(EchoModel::new().with_delay(Duration::from_millis(300)), 1);
    let first = server.act_async(obs_with(1.0)).unwrap();
    thread::sleep(Duration::from_millis(50));

    let waiter = {
        let server = Arc::clone(&server);
        thread::spawn(move || server.act(obs_with(2.0)))
    };
    thread::sleep(Duration::from_millis(50));

    server.stop();
    assert_eq!(waiter.join().unwrap(), Err(InferenceError::Stopped));
    // The batch that was already running completed normally.
    assert_eq!(first.wait().unwrap()[0], 1.0);
}

#[test]
fn test_restart_after_stop() {
    let server = started(EchoModel::new(), 8);
    server.stop();
    server.start().unwrap();
    assert_eq!(server.act(obs_with(3.0)).unwrap()[0], 3.0);
}
