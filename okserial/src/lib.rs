// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Serial-port client library.
//!
//! The pieces, bottom up: [`ports`] enumerates present serial devices into
//! open-ended attribute maps, [`matchexpr`] compiles search queries over
//! those maps, [`locking`] arbitrates port sharing between processes,
//! [`engine`] pumps bytes between caller-visible buffers and the device on
//! dedicated worker threads, [`connection`] assembles all of that behind one
//! handle, and [`tracker`] keeps such a handle alive across unplug/replug.

use std::sync::{Mutex, MutexGuard};

pub mod connection;
pub mod engine;
mod error;
pub mod locking;
pub mod matchexpr;
pub mod ports;
pub mod tracker;
pub mod tty;

pub use connection::{ConnectOptions, Connection};
pub use error::{Error, Result};
pub use locking::SharingMode;
pub use matchexpr::CompiledMatcher;
pub use ports::{PortAttributes, ScanSource, Scanner};
pub use tracker::{Tracker, TrackerConfig};
pub use tty::{DataBits, FlowControl, LineSettings, Parity, StopBits};

#[cfg(not(unix))]
compile_error!("okserial drives POSIX terminal devices and supports Unix hosts only");

/// Extension trait for `Mutex` to acquire a lock, panicking if it is
/// poisoned.
///
/// A poisoned monitor means a worker thread panicked while holding it; no
/// consistent recovery exists at that point, so every lock site uses this
/// instead of sprinkling `#[allow(clippy::unwrap_used)]`.
pub(crate) trait MutexExt<T> {
    fn lock_or_panic(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    #[inline(always)]
    #[track_caller]
    fn lock_or_panic(&self) -> MutexGuard<'_, T> {
        #[allow(clippy::unwrap_used)]
        self.lock().unwrap()
    }
}
