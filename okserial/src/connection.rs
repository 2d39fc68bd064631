// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The connection façade: selects a port, arbitrates sharing, opens and
//! configures the OS handle, and runs the I/O engine behind one handle.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::engine::{DrainFuture, IoEngine, ReadFuture, DEFAULT_READ_CHUNK};
use crate::locking::{IoctlPolicy, LockSet, SharingMode, DEFAULT_LOCK_DIR};
use crate::matchexpr::CompiledMatcher;
use crate::ports::{PortAttributes, Scanner};
use crate::tty::{LineSettings, SerialDevice};
use crate::{Error, Result};

/// How long a sharing-conflicted open waits between retries.
const OPEN_RETRY_STEP: Duration = Duration::from_millis(50);

/// Everything an open needs besides the port itself.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub settings: LineSettings,
    pub sharing: SharingMode,
    /// UUCP lockfile directory; tests point this at a scratch directory.
    pub lock_dir: PathBuf,
    /// When set, sharing conflicts are retried until the deadline instead
    /// of surfacing immediately.
    pub open_timeout: Option<Duration>,
    /// Reader request size.
    pub read_chunk: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            settings: LineSettings::default(),
            sharing: SharingMode::default(),
            lock_dir: PathBuf::from(DEFAULT_LOCK_DIR),
            open_timeout: None,
            read_chunk: DEFAULT_READ_CHUNK,
        }
    }
}

/// One open serial connection.
///
/// All operations take `&self`; the handle is safe to share across
/// threads, and every blocking operation can be unblocked from outside
/// via [`Connection::interrupt`].
pub struct Connection {
    engine: IoEngine,
    attrs: PortAttributes,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl Connection {
    /// Enumerates through `scanner`, requires `expr` to select exactly one
    /// port, and opens it. Zero and multiple matches fail with distinct
    /// errors.
    pub fn open_matching(
        expr: &str,
        scanner: &Scanner,
        options: &ConnectOptions,
    ) -> Result<Connection> {
        let matcher = CompiledMatcher::compile(expr)?;
        let mut hits = matcher.filter(scanner.scan());
        match hits.len() {
            0 => Err(Error::NoMatch(expr.to_string())),
            1 => Self::open_attributes(hits.remove(0), options),
            count => Err(Error::AmbiguousMatch {
                expr: expr.to_string(),
                count,
            }),
        }
    }

    /// Opens an explicit device path, skipping enumeration.
    pub fn open_path(path: &Path, options: &ConnectOptions) -> Result<Connection> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let attrs = PortAttributes::new([
            ("device".to_string(), path.display().to_string()),
            ("name".to_string(), name),
        ]);
        Self::open_attributes(attrs, options)
    }

    /// Opens a port already selected from a snapshot. The tracker uses
    /// this directly after its own matching pass.
    pub fn open_attributes(attrs: PortAttributes, options: &ConnectOptions) -> Result<Connection> {
        let device = attrs
            .device()
            .ok_or_else(|| Error::Config("selected port has no device path".into()))?
            .to_string();
        let deadline = options.open_timeout.map(|t| Instant::now() + t);
        loop {
            match Self::try_open(&attrs, Path::new(&device), options) {
                Err(err @ Error::SharingConflict { .. }) => {
                    let retry = deadline.is_some_and(|d| Instant::now() + OPEN_RETRY_STEP < d);
                    if !retry {
                        return Err(err);
                    }
                    debug!(device = %device, "port busy, retrying open");
                    std::thread::sleep(OPEN_RETRY_STEP);
                }
                other => return other,
            }
        }
    }

    /// One open attempt: locks, device, exclusive ioctl, workers. Any
    /// failure releases whatever was already acquired, in reverse.
    fn try_open(
        attrs: &PortAttributes,
        device_path: &Path,
        options: &ConnectOptions,
    ) -> Result<Connection> {
        let mut locks = LockSet::acquire(device_path, options.sharing, &options.lock_dir)?;

        let device = match SerialDevice::open(device_path, &options.settings) {
            Ok(device) => device,
            Err(err) => {
                locks.abandon();
                return Err(err);
            }
        };

        match options.sharing.exclusive_ioctl() {
            IoctlPolicy::Skip => {}
            IoctlPolicy::Required => {
                if let Err(err) = device.set_exclusive(true) {
                    locks.abandon();
                    return Err(Error::locking(device_path, err));
                }
                locks.exclusive_ioctl = true;
            }
            IoctlPolicy::BestEffort => match device.set_exclusive(true) {
                Ok(()) => locks.exclusive_ioctl = true,
                Err(err) => {
                    warn!(device = %device_path.display(), error = %err,
                        "exclusive-use ioctl skipped");
                }
            },
        }

        debug!(device = %device_path.display(), mode = %options.sharing, "port opened");
        Ok(Connection {
            engine: IoEngine::start(device, locks, options.read_chunk.max(1)),
            attrs: attrs.clone(),
        })
    }

    /// The attribute map of the selected port.
    pub fn attributes(&self) -> &PortAttributes {
        &self.attrs
    }

    pub fn device(&self) -> &str {
        self.attrs.device().unwrap_or_default()
    }

    /// Accepts `bytes` into the write buffer without blocking.
    pub fn write(&self, bytes: &[u8]) -> Result<usize> {
        self.engine.write(bytes)
    }

    /// See [`crate::engine::IoEngine::read_sync`]: blocks for the first
    /// byte, returns up to `max` bytes, empty on timeout.
    pub fn read_sync(&self, timeout: Option<Duration>, max: usize) -> Result<Vec<u8>> {
        self.engine.read_sync(timeout, max)
    }

    /// Currently buffered bytes, never blocking.
    pub fn read_nowait(&self, max: usize) -> Result<Vec<u8>> {
        self.engine.read_nowait(max)
    }

    pub fn read_async(&self, max: usize) -> ReadFuture {
        self.engine.read_async(max)
    }

    /// Blocks until everything written so far has left the device.
    pub fn drain_sync(&self, timeout: Option<Duration>) -> Result<()> {
        self.engine.drain_sync(timeout)
    }

    pub fn drain_async(&self) -> DrainFuture {
        self.engine.drain_async()
    }

    /// Idempotent shutdown: joins the workers and releases every lock.
    pub fn close(&self) {
        self.engine.close();
    }

    /// Unblocks all pending waiters with an interrupted error and shuts
    /// down.
    pub fn interrupt(&self) {
        self.engine.interrupt();
    }

    pub fn is_open(&self) -> bool {
        self.engine.is_open()
    }

    /// The sticky terminal error, once the connection has started dying.
    pub fn terminal_error(&self) -> Option<Error> {
        self.engine.terminal_error()
    }

    /// (unread, unwritten) buffered byte counts.
    pub fn buffered(&self) -> (usize, usize) {
        self.engine.buffered()
    }
}
