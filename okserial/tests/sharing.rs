// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sharing-mode arbitration between two opens of the same device.
//!
//! Everything here runs in one process, so the conflicts exercised are the
//! lockfile ones; `fcntl` locks never conflict with their own process by
//! design of the OS API.

mod common;

use common::{open_loopback, test_options};
use okserial::{Connection, Error, SharingMode};
use tempfile::tempdir;

#[test]
fn polite_holder_blocks_polite_and_exclusive_but_not_oblivious() {
    let lock_dir = tempdir().unwrap();
    let loopback = open_loopback();
    let options = test_options(lock_dir.path());

    let holder = Connection::open_path(&loopback.slave_path, &options).unwrap();
    assert!(holder.is_open());

    for mode in [SharingMode::Polite, SharingMode::Exclusive] {
        let mut contender = options.clone();
        contender.sharing = mode;
        assert!(
            matches!(
                Connection::open_path(&loopback.slave_path, &contender),
                Err(Error::SharingConflict { .. })
            ),
            "{mode} should refuse while a lockfile holder is alive"
        );
    }

    let mut oblivious = options.clone();
    oblivious.sharing = SharingMode::Oblivious;
    let second = Connection::open_path(&loopback.slave_path, &oblivious).unwrap();
    assert!(second.is_open());
    second.close();
    holder.close();
}

#[test]
fn stomp_reclaims_a_lock_held_by_this_process() {
    let lock_dir = tempdir().unwrap();
    let loopback = open_loopback();
    let options = test_options(lock_dir.path());

    let holder = Connection::open_path(&loopback.slave_path, &options).unwrap();

    let mut stomp = options.clone();
    stomp.sharing = SharingMode::Stomp;
    let thief = Connection::open_path(&loopback.slave_path, &stomp).unwrap();
    assert!(thief.is_open());

    thief.close();
    holder.close();
}

#[test]
fn open_timeout_retries_until_the_holder_leaves() {
    let lock_dir = tempdir().unwrap();
    let loopback = open_loopback();
    let options = test_options(lock_dir.path());

    let holder = Connection::open_path(&loopback.slave_path, &options).unwrap();

    let mut patient = options.clone();
    patient.open_timeout = Some(std::time::Duration::from_secs(5));
    std::thread::scope(|scope| {
        let opener = scope.spawn(|| Connection::open_path(&loopback.slave_path, &patient));
        std::thread::sleep(std::time::Duration::from_millis(200));
        holder.close();
        let conn = opener.join().unwrap().unwrap();
        assert!(conn.is_open());
        conn.close();
    });
}

#[test]
fn open_timeout_eventually_surfaces_the_conflict() {
    let lock_dir = tempdir().unwrap();
    let loopback = open_loopback();
    let options = test_options(lock_dir.path());

    let holder = Connection::open_path(&loopback.slave_path, &options).unwrap();

    let mut impatient = options.clone();
    impatient.open_timeout = Some(std::time::Duration::from_millis(150));
    assert!(matches!(
        Connection::open_path(&loopback.slave_path, &impatient),
        Err(Error::SharingConflict { .. })
    ));
    holder.close();
}

#[test]
fn rollback_releases_the_lockfile_when_the_device_open_fails() {
    let lock_dir = tempdir().unwrap();
    let options = test_options(lock_dir.path());

    // a regular file passes locking but fails terminal configuration
    let impostor = lock_dir.path().join("ttyFAKE");
    std::fs::write(&impostor, b"").unwrap();
    let err = Connection::open_path(&impostor, &options).unwrap_err();
    assert!(matches!(err, Error::Config(_)));

    // nothing stays behind for the next opener to trip on
    let leftovers: Vec<_> = std::fs::read_dir(lock_dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("LCK.."))
        .collect();
    assert!(leftovers.is_empty(), "open rollback must reap its lockfile");
}
