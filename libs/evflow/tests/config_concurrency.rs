// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Concurrency behavior of the configuration tree: the tree is the only
//! structure shared between the plan-builder thread, listeners and status
//! publishers, so these properties are load-bearing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use evflow::config::{AttrFlags, AttrType, AttrValue, AttributeEvent, ConfigTree};

#[test]
fn concurrent_puts_stay_within_range_and_type() {
    let tree = ConfigTree::new();
    let node = tree.node("/device/");
    node.create_int("threshold", 50, 0, 100, AttrFlags::NORMAL, "");

    let stop = Arc::new(AtomicBool::new(false));
    let mut writers = Vec::new();

    for worker in 0..4 {
        let node = Arc::clone(&node);
        let stop = Arc::clone(&stop);

        writers.push(std::thread::spawn(move || {
            let mut value = worker * 10;
            while !stop.load(Ordering::Relaxed) {
                // In-range puts succeed, out-of-range puts are rejected
                // without touching the stored value.
                let _ = node.put_int("threshold", value);
                value = (value + 7) % 150;
            }
        }));
    }

    for _ in 0..1000 {
        // Type stability and range closure under concurrent writers.
        assert_eq!(node.attribute_type("threshold"), Some(AttrType::Int));
        let value = node.get_int("threshold");
        assert!((0..=100).contains(&value));
    }

    stop.store(true, Ordering::Relaxed);
    for writer in writers {
        writer.join().unwrap();
    }
}

#[test]
fn transactions_group_attribute_pairs() {
    let tree = ConfigTree::new();
    let node = tree.node("/device/");
    node.create_int("width", 0, 0, i32::MAX, AttrFlags::NORMAL, "");
    node.create_int("height", 0, 0, i32::MAX, AttrFlags::NORMAL, "");

    let stop = Arc::new(AtomicBool::new(false));

    let writer = {
        let node = Arc::clone(&node);
        let stop = Arc::clone(&stop);

        std::thread::spawn(move || {
            let mut value = 0;
            while !stop.load(Ordering::Relaxed) {
                let _tx = node.transaction();
                node.put_int("width", value).unwrap();
                node.put_int("height", value).unwrap();
                value += 1;
            }
        })
    };

    for _ in 0..1000 {
        let _tx = node.transaction();
        let width = node.get_int("width");
        let height = node.get_int("height");
        assert_eq!(width, height);
    }

    stop.store(true, Ordering::Relaxed);
    writer.join().unwrap();
}

#[test]
fn concurrent_add_child_yields_single_instance() {
    let tree = ConfigTree::new();

    let mut workers = Vec::new();
    for _ in 0..8 {
        let root = Arc::clone(tree.root());
        workers.push(std::thread::spawn(move || {
            for i in 0..50 {
                root.add_child(&format!("node{i}"));
            }
        }));
    }

    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(tree.root().children().len(), 50);
}

#[test]
fn listeners_observe_events_in_order() {
    let tree = ConfigTree::new();
    let node = tree.node("/device/");
    node.create_int("seq", 0, 0, i32::MAX, AttrFlags::NORMAL, "");

    let observed = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&observed);

    node.add_attribute_listener(move |_, event| {
        if let AttributeEvent::Modified {
            value: AttrValue::Int(v),
            ..
        } = event
        {
            sink.lock().push(*v);
        }
    });

    for i in 1..=100 {
        node.put_int("seq", i).unwrap();
    }

    let observed = observed.lock();
    assert_eq!(observed.len(), 100);
    assert!(observed.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn children_snapshot_survives_structural_changes() {
    let tree = ConfigTree::new();
    let parent = tree.node("/modules/");
    let child = parent.add_child("flaky");
    child.create_int("x", 1, 0, 10, AttrFlags::NORMAL, "");

    let snapshot = parent.children();

    // Removal after the snapshot does not invalidate the held nodes.
    child.remove_node();
    assert!(parent.child("flaky").is_none());
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].name(), "flaky");
}
