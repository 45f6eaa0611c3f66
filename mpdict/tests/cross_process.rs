// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

//! Scenarios that fork. They live in their own binary, and run one after the other from a
//! single test, so that no other test thread is around when fork happens.

mod common;

use common::{spawn, unique_name, wait_success};
use mpdict::{ArenaOptions, SharedArena, SharedMap, ShmDictError};
use std::fs::File;
use std::io::{Read, Write};
use std::mem;

const CAPACITY: usize = 1 << 20;

fn writes_cross_the_fork() {
    let arena = unique_name("fork");
    let map = SharedMap::open_or_create("t1", CAPACITY, &arena).unwrap();
    map.set(b"parent", b"before").unwrap();

    let child = spawn(|| {
        let map = SharedMap::open_or_create("t1", CAPACITY, &arena).unwrap();
        assert!(!map.arena().is_owner());
        assert_eq!(map.get(b"parent").unwrap(), Some(b"before".to_vec()));
        map.set(b"child", b"hello").unwrap();
        assert!(map.delete(b"parent").unwrap());
    });
    wait_success(child);

    assert_eq!(map.get(b"child").unwrap(), Some(b"hello".to_vec()));
    assert_eq!(map.get(b"parent").unwrap(), None);
    assert_eq!(map.len(), 1);
}

fn concurrent_writers_lose_nothing() {
    const WRITERS: usize = 4;
    const ITEMS: usize = 500;

    let arena = unique_name("writers");
    let map = SharedMap::open_or_create("bench", CAPACITY, &arena).unwrap();
    let children: Vec<_> = (0..WRITERS)
        .map(|w| {
            let map = &map;
            spawn(move || {
                for i in 0..ITEMS {
                    map.set(format!("{w}-{i:04}").as_bytes(), &[w as u8; 10])
                        .unwrap();
                }
            })
        })
        .collect();
    for i in 0..ITEMS {
        map.set(format!("p-{i:04}").as_bytes(), b"parent").unwrap();
    }
    for child in children {
        wait_success(child);
    }

    assert_eq!(map.len(), (WRITERS + 1) * ITEMS);
    let keys = map.enumerate_keys(usize::MAX).unwrap();
    assert_eq!(keys.len(), map.len());
    assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(map.get(b"3-0499").unwrap(), Some(vec![3; 10]));
}

fn lock_of_exited_process_is_recovered() {
    let name = unique_name("recover");
    let arena = SharedArena::open_or_create(&name, CAPACITY).unwrap();
    assert_eq!(arena.stats().lock_recoveries, 0);

    let (reader, writer) = nix::unistd::pipe().unwrap();
    let (mut reader, mut writer) = (File::from(reader), File::from(writer));
    let child = spawn(|| {
        let arena = SharedArena::open_or_create(&name, CAPACITY).unwrap();
        mem::forget(arena.lock());
        writer.write_all(&[1]).unwrap();
    });
    drop(writer);
    let mut locked = [0u8; 1];
    reader.read_exact(&mut locked).unwrap();

    // Only Linux tells an unreaped child apart from a live one.
    #[cfg(not(target_os = "linux"))]
    wait_success(child);
    drop(arena.lock());
    assert_eq!(arena.stats().lock_recoveries, 1);
    #[cfg(target_os = "linux")]
    wait_success(child);
    drop(arena.lock());
    assert_eq!(arena.stats().lock_recoveries, 1);
}

fn arena_of_crashed_creator_is_not_reused() {
    let arena = unique_name("crashed");
    let child = spawn(|| {
        let map = SharedMap::open_or_create("m", CAPACITY, &arena).unwrap();
        assert!(map.arena().is_owner());
        map.set(b"k", b"from-crashed-run").unwrap();
        // Exits without removing the region.
        mem::forget(map);
    });
    wait_success(child);

    let err = SharedArena::open(&arena, ArenaOptions::default()).unwrap_err();
    assert!(matches!(err, ShmDictError::StaleRegion { .. }), "{err:?}");

    let map = SharedMap::open_or_create("m", CAPACITY, &arena).unwrap();
    assert!(map.arena().is_owner());
    assert!(map.is_empty());
    assert_eq!(map.get(b"k").unwrap(), None);
}

#[test]
#[cfg_attr(miri, ignore)]
fn cross_process_scenarios() {
    writes_cross_the_fork();
    concurrent_writers_lose_nothing();
    lock_of_exited_process_is_recovered();
    arena_of_crashed_creator_is_not_reused();
}
