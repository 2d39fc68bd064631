// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pseudo-terminal loopback plumbing shared by the integration tests.

#![allow(dead_code)]

use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use nix::fcntl::OFlag;
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
use okserial::ConnectOptions;

/// One pseudo-terminal pair: the test drives the master, the library
/// opens the slave path like any serial device.
pub struct Loopback {
    pub master: File,
    pub slave_path: PathBuf,
}

pub fn open_loopback() -> Loopback {
    let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).expect("posix_openpt");
    grantpt(&master).expect("grantpt");
    unlockpt(&master).expect("unlockpt");
    let slave_path = PathBuf::from(ptsname_r(&master).expect("ptsname_r"));
    let master = unsafe { File::from_raw_fd(master.into_raw_fd()) };
    set_nonblocking(&master);
    Loopback { master, slave_path }
}

fn set_nonblocking(file: &File) {
    let fd = file.as_raw_fd();
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    assert!(flags >= 0, "F_GETFL failed");
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    assert!(rc >= 0, "F_SETFL failed");
}

/// Reads from the master until `want` bytes arrived or `timeout` elapsed.
pub fn read_master(master: &File, want: usize, timeout: Duration) -> Vec<u8> {
    let deadline = Instant::now() + timeout;
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    while out.len() < want && Instant::now() < deadline {
        match (&*master).read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(2));
            }
            Err(err) => panic!("master read failed: {err}"),
        }
    }
    out
}

/// Connection options pointed at a scratch lock directory.
pub fn test_options(lock_dir: &std::path::Path) -> ConnectOptions {
    ConnectOptions {
        lock_dir: lock_dir.to_path_buf(),
        ..ConnectOptions::default()
    }
}
