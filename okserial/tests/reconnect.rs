// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tracker behavior across a simulated unplug/replug.

mod common;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{open_loopback, test_options};
use okserial::{PortAttributes, Scanner, Tracker, TrackerConfig};
use tempfile::tempdir;

/// Scan source whose advertised port the test can swap or remove.
fn switchable() -> (Arc<Mutex<Option<PathBuf>>>, Scanner) {
    let advertised: Arc<Mutex<Option<PathBuf>>> = Arc::new(Mutex::new(None));
    let source = Arc::clone(&advertised);
    let scanner = Scanner::from_source(Arc::new(move || {
        source
            .lock()
            .unwrap()
            .as_ref()
            .map(|path| {
                vec![PortAttributes::new([
                    ("device", path.display().to_string().as_str()),
                    ("manufacturer", "Adafruit"),
                ])]
            })
            .unwrap_or_default()
    }));
    (advertised, scanner)
}

fn fast_config(lock_dir: &std::path::Path) -> TrackerConfig {
    TrackerConfig {
        options: test_options(lock_dir),
        min_poll: Duration::from_millis(20),
        max_poll: Duration::from_millis(100),
    }
}

#[test]
fn tracker_reconnects_with_a_new_generation() {
    let lock_dir = tempdir().unwrap();
    let (advertised, scanner) = switchable();
    let first = open_loopback();
    *advertised.lock().unwrap() = Some(first.slave_path.clone());

    let tracker =
        Tracker::spawn("Adafruit", scanner, fast_config(lock_dir.path())).unwrap();

    let conn = tracker.wait_ready(1, Some(Duration::from_secs(5))).unwrap();
    assert_eq!(conn.device(), first.slave_path.display().to_string());
    assert_eq!(tracker.generation(), 1);

    // unplug: hide the port, then hang up the master side
    *advertised.lock().unwrap() = None;
    drop(first.master);

    // replug as a different device
    let second = open_loopback();
    *advertised.lock().unwrap() = Some(second.slave_path.clone());

    let replacement = tracker.wait_ready(2, Some(Duration::from_secs(5))).unwrap();
    assert_eq!(
        replacement.device(),
        second.slave_path.display().to_string()
    );
    assert_eq!(tracker.generation(), 2);
    assert!(conn.terminal_error().is_some(), "old connection must be dead");

    tracker.shutdown();
}

#[test]
fn ready_future_resolves_on_first_open() {
    let lock_dir = tempdir().unwrap();
    let (advertised, scanner) = switchable();
    let loopback = open_loopback();

    let tracker =
        Tracker::spawn("Adafruit", scanner, fast_config(lock_dir.path())).unwrap();

    // nothing advertised yet; publish from another thread after a delay
    std::thread::scope(|scope| {
        scope.spawn(|| {
            std::thread::sleep(Duration::from_millis(100));
            *advertised.lock().unwrap() = Some(loopback.slave_path.clone());
        });
        let conn = futures::executor::block_on(tracker.ready(1)).unwrap();
        assert!(conn.is_open());
    });
    tracker.shutdown();
}

#[test]
fn tracker_ignores_ambiguous_snapshots() {
    let lock_dir = tempdir().unwrap();
    let a = open_loopback();
    let b = open_loopback();
    let scanner = Scanner::fixed([
        PortAttributes::new([
            ("device", a.slave_path.display().to_string().as_str()),
            ("manufacturer", "Adafruit"),
        ]),
        PortAttributes::new([
            ("device", b.slave_path.display().to_string().as_str()),
            ("manufacturer", "Adafruit"),
        ]),
    ]);

    let tracker =
        Tracker::spawn("Adafruit", scanner, fast_config(lock_dir.path())).unwrap();
    // two matches is not "exactly one": the tracker keeps waiting
    assert!(tracker
        .wait_ready(1, Some(Duration::from_millis(300)))
        .is_err());
    assert_eq!(tracker.generation(), 0);
    tracker.shutdown();
}
