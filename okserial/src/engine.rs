// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The per-connection I/O engine.
//!
//! Two worker threads pump bytes between the device and a pair of
//! unbounded in-memory queues. One monitor (a mutex plus condition
//! variables) guards the queues, the engine status, the terminal error,
//! and the wakers of pending futures; nobody holds it across an OS call.
//! Workers bound every device wait with a short poll so that close can
//! join them promptly.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Waker};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::locking::LockSet;
use crate::tty::SerialDevice;
use crate::{Error, MutexExt, Result};

/// Upper bound on a worker's stay inside one OS wait.
const POLL_BOUND_MS: u16 = 100;
/// Largest single chunk the writer hands to the device.
const WRITE_CHUNK: usize = 4096;
/// Default reader request size.
pub const DEFAULT_READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Running,
    Closing,
    Closed,
}

struct EngineState {
    status: Status,
    /// Set at most once; replayed to every subsequent operation.
    terminal: Option<Error>,
    read_buf: VecDeque<u8>,
    write_buf: VecDeque<u8>,
    /// Bumped per accepted write; a drain targets the value it saw.
    accepted_epoch: u64,
    /// Every write accepted at or before this epoch has left the device.
    flushed_epoch: u64,
    wakers: HashMap<u64, Waker>,
    next_waiter: u64,
}

impl EngineState {
    fn take_read(&mut self, max: usize) -> Vec<u8> {
        let n = max.min(self.read_buf.len());
        self.read_buf.drain(..n).collect()
    }

    fn register_waker(&mut self, id: &mut Option<u64>, waker: &Waker) {
        let key = *id.get_or_insert_with(|| {
            self.next_waiter += 1;
            self.next_waiter
        });
        self.wakers.insert(key, waker.clone());
    }

    fn drop_waker(&mut self, id: Option<u64>) {
        if let Some(key) = id {
            self.wakers.remove(&key);
        }
    }
}

struct Monitor {
    state: Mutex<EngineState>,
    read_ready: Condvar,
    write_pending: Condvar,
    drained: Condvar,
}

impl Monitor {
    /// Wakes registered futures. They re-register on their next poll, so
    /// draining the set is fine.
    fn wake_futures(state: &mut EngineState) {
        for (_, waker) in state.wakers.drain() {
            waker.wake();
        }
    }

    fn wake_readers(&self, state: &mut EngineState) {
        self.read_ready.notify_all();
        Self::wake_futures(state);
    }

    fn wake_drainers(&self, state: &mut EngineState) {
        self.drained.notify_all();
        Self::wake_futures(state);
    }

    /// Wakes every blocked caller and registered future; used on status
    /// transitions, which can satisfy any waiter.
    fn wake_all(&self, state: &mut EngineState) {
        self.read_ready.notify_all();
        self.write_pending.notify_all();
        self.drained.notify_all();
        Self::wake_futures(state);
    }

    /// Records the first terminal error and moves a running engine to
    /// `closing`. Used by workers; never joins.
    fn fail(&self, err: Error) {
        let mut state = self.state.lock_or_panic();
        if state.terminal.is_none() {
            debug!(error = %err, "engine terminating");
            state.terminal = Some(err);
        }
        if state.status == Status::Running {
            state.status = Status::Closing;
        }
        self.wake_all(&mut state);
    }
}

/// Join handles and lock resources consumed exactly once on the close
/// path; the mutex also serializes concurrent closers.
struct Teardown {
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    locks: Option<LockSet>,
}

pub(crate) struct IoEngine {
    monitor: Arc<Monitor>,
    device: Arc<SerialDevice>,
    teardown: Mutex<Teardown>,
}

impl IoEngine {
    /// Spawns the reader and writer workers over an opened device and
    /// enters `running`.
    pub fn start(device: SerialDevice, locks: LockSet, read_chunk: usize) -> IoEngine {
        let device = Arc::new(device);
        let monitor = Arc::new(Monitor {
            state: Mutex::new(EngineState {
                status: Status::Running,
                terminal: None,
                read_buf: VecDeque::new(),
                write_buf: VecDeque::new(),
                accepted_epoch: 0,
                flushed_epoch: 0,
                wakers: HashMap::new(),
                next_waiter: 0,
            }),
            read_ready: Condvar::new(),
            write_pending: Condvar::new(),
            drained: Condvar::new(),
        });

        let reader = {
            let monitor = Arc::clone(&monitor);
            let device = Arc::clone(&device);
            let chunk = read_chunk.max(1);
            std::thread::spawn(move || reader_loop(&monitor, &device, chunk))
        };
        let writer = {
            let monitor = Arc::clone(&monitor);
            let device = Arc::clone(&device);
            std::thread::spawn(move || writer_loop(&monitor, &device))
        };

        IoEngine {
            monitor,
            device,
            teardown: Mutex::new(Teardown {
                reader: Some(reader),
                writer: Some(writer),
                locks: Some(locks),
            }),
        }
    }

    /// Appends to the write buffer without blocking. Fails with the
    /// terminal error once the engine has left `running`.
    pub fn write(&self, bytes: &[u8]) -> Result<usize> {
        let mut state = self.monitor.state.lock_or_panic();
        if state.status != Status::Running {
            return Err(terminal(&state));
        }
        state.write_buf.extend(bytes);
        state.accepted_epoch += 1;
        self.monitor.write_pending.notify_one();
        Ok(bytes.len())
    }

    /// Blocks until at least one byte is buffered, then returns up to
    /// `max` bytes. A timeout with nothing buffered returns empty; engine
    /// termination with an empty buffer raises the terminal error.
    pub fn read_sync(&self, timeout: Option<Duration>, max: usize) -> Result<Vec<u8>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.monitor.state.lock_or_panic();
        loop {
            if !state.read_buf.is_empty() {
                return Ok(state.take_read(max));
            }
            if state.terminal.is_some() {
                return Err(terminal(&state));
            }
            state = match deadline {
                None => self.monitor.read_ready.wait(state).unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                        return Ok(Vec::new());
                    };
                    let (state, _) = self
                        .monitor
                        .read_ready
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(|e| e.into_inner());
                    state
                }
            };
        }
    }

    /// Returns whatever is buffered right now, possibly nothing. Raises
    /// only when the engine has terminated and the buffer is empty.
    pub fn read_nowait(&self, max: usize) -> Result<Vec<u8>> {
        let mut state = self.monitor.state.lock_or_panic();
        if state.read_buf.is_empty() && state.terminal.is_some() {
            return Err(terminal(&state));
        }
        Ok(state.take_read(max))
    }

    /// Blocks until every write accepted before this call has left the
    /// device, the timeout elapses (`TimeoutError`), or the engine
    /// terminates (terminal error).
    pub fn drain_sync(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.monitor.state.lock_or_panic();
        let target = state.accepted_epoch;
        loop {
            if state.flushed_epoch >= target {
                return Ok(());
            }
            if state.terminal.is_some() {
                return Err(terminal(&state));
            }
            state = match deadline {
                None => self.monitor.drained.wait(state).unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                        return Err(Error::Timeout);
                    };
                    let (state, _) = self
                        .monitor
                        .drained
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(|e| e.into_inner());
                    state
                }
            };
        }
    }

    /// Future form of [`IoEngine::read_sync`] without the timeout;
    /// dropping the future cancels it with no side effects.
    pub fn read_async(&self, max: usize) -> ReadFuture {
        ReadFuture {
            monitor: Arc::clone(&self.monitor),
            max,
            waiter: None,
        }
    }

    /// Future form of [`IoEngine::drain_sync`]; the drain target is the
    /// epoch observed at creation.
    pub fn drain_async(&self) -> DrainFuture {
        let state = self.monitor.state.lock_or_panic();
        DrainFuture {
            monitor: Arc::clone(&self.monitor),
            target: state.accepted_epoch,
            waiter: None,
        }
    }

    /// Terminates the engine with a synthetic closed error, joins both
    /// workers, and releases the lock set. Idempotent.
    pub fn close(&self) {
        self.shutdown(Error::Closed);
    }

    /// [`IoEngine::close`] with an interrupted error; unblocks every
    /// pending waiter from outside.
    pub fn interrupt(&self) {
        self.shutdown(Error::Interrupted);
    }

    fn shutdown(&self, err: Error) {
        {
            let mut state = self.monitor.state.lock_or_panic();
            if state.status == Status::Closed {
                return;
            }
            if state.terminal.is_none() {
                state.terminal = Some(err);
            }
            if state.status == Status::Running {
                state.status = Status::Closing;
            }
            self.monitor.wake_all(&mut state);
        }

        // Workers observe `closing` within one poll bound; joining is
        // bounded by that.
        let mut teardown = self.teardown.lock_or_panic();
        if let Some(handle) = teardown.reader.take() {
            let _ = handle.join();
        }
        if let Some(handle) = teardown.writer.take() {
            let _ = handle.join();
        }
        if let Some(mut locks) = teardown.locks.take() {
            locks.release(Some(&self.device));
        }

        let mut state = self.monitor.state.lock_or_panic();
        state.status = Status::Closed;
        self.monitor.wake_all(&mut state);
    }

    /// The recorded terminal error, if the engine has started dying.
    pub fn terminal_error(&self) -> Option<Error> {
        self.monitor.state.lock_or_panic().terminal.clone()
    }

    pub fn is_open(&self) -> bool {
        self.monitor.state.lock_or_panic().status == Status::Running
    }

    /// (buffered unread bytes, buffered unwritten bytes)
    pub fn buffered(&self) -> (usize, usize) {
        let state = self.monitor.state.lock_or_panic();
        (state.read_buf.len(), state.write_buf.len())
    }
}

impl Drop for IoEngine {
    fn drop(&mut self) {
        self.close();
    }
}

fn terminal(state: &EngineState) -> Error {
    state.terminal.clone().unwrap_or(Error::Closed)
}

fn reader_loop(monitor: &Monitor, device: &SerialDevice, chunk: usize) {
    let mut buf = vec![0u8; chunk];
    loop {
        if monitor.state.lock_or_panic().status != Status::Running {
            return;
        }
        match device.wait_readable(POLL_BOUND_MS) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(err) => {
                monitor.fail(Error::from_device_io(err));
                return;
            }
        }
        match device.read(&mut buf) {
            Ok(0) => {
                monitor.fail(Error::Disconnected);
                return;
            }
            Ok(n) => {
                let mut state = monitor.state.lock_or_panic();
                state.read_buf.extend(&buf[..n]);
                monitor.wake_readers(&mut state);
            }
            Err(err) if retryable(&err) => continue,
            Err(err) => {
                monitor.fail(Error::from_device_io(err));
                return;
            }
        }
    }
}

fn writer_loop(monitor: &Monitor, device: &SerialDevice) {
    loop {
        // wait for work, copying out a chunk but leaving it queued so a
        // failed write loses nothing
        let chunk: Vec<u8> = {
            let state = monitor.state.lock_or_panic();
            let state = monitor
                .write_pending
                .wait_while(state, |s| {
                    s.status == Status::Running && s.write_buf.is_empty()
                })
                .unwrap_or_else(|e| e.into_inner());
            if state.status != Status::Running {
                return;
            }
            let n = WRITE_CHUNK.min(state.write_buf.len());
            state.write_buf.iter().take(n).copied().collect()
        };

        match device.wait_writable(POLL_BOUND_MS) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(err) => {
                monitor.fail(Error::from_device_io(err));
                return;
            }
        }
        let written = match device.write(&chunk) {
            Ok(n) => n,
            Err(err) if retryable(&err) => continue,
            Err(err) => {
                monitor.fail(Error::from_device_io(err));
                return;
            }
        };

        let flush_target = {
            let mut state = monitor.state.lock_or_panic();
            let buf_len = state.write_buf.len();
            state.write_buf.drain(..written.min(buf_len));
            if state.write_buf.is_empty() {
                Some(state.accepted_epoch)
            } else {
                None
            }
        };
        if let Some(target) = flush_target {
            // queue is empty; wait out the driver's own output buffer
            if let Err(err) = device.drain() {
                warn!(error = %err, "tcdrain failed, reporting drain anyway");
            }
            let mut state = monitor.state.lock_or_panic();
            state.flushed_epoch = state.flushed_epoch.max(target);
            monitor.wake_drainers(&mut state);
        }
    }
}

fn retryable(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}

/// Resolves with up to `max` buffered bytes, or the terminal error once
/// the engine dies with nothing buffered. Carries only the monitor handle
/// and its waiter identity, never the engine.
pub struct ReadFuture {
    monitor: Arc<Monitor>,
    max: usize,
    waiter: Option<u64>,
}

impl Future for ReadFuture {
    type Output = Result<Vec<u8>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut state = this.monitor.state.lock_or_panic();
        if !state.read_buf.is_empty() {
            let bytes = state.take_read(this.max);
            state.drop_waker(this.waiter.take());
            return Poll::Ready(Ok(bytes));
        }
        if state.terminal.is_some() {
            let err = terminal(&state);
            state.drop_waker(this.waiter.take());
            return Poll::Ready(Err(err));
        }
        state.register_waker(&mut this.waiter, cx.waker());
        Poll::Pending
    }
}

impl Drop for ReadFuture {
    fn drop(&mut self) {
        if self.waiter.is_some() {
            let mut state = self.monitor.state.lock_or_panic();
            state.drop_waker(self.waiter.take());
        }
    }
}

/// Resolves once every write accepted before its creation has left the
/// device, or fails with the terminal error.
pub struct DrainFuture {
    monitor: Arc<Monitor>,
    target: u64,
    waiter: Option<u64>,
}

impl Future for DrainFuture {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut state = this.monitor.state.lock_or_panic();
        if state.flushed_epoch >= this.target {
            state.drop_waker(this.waiter.take());
            return Poll::Ready(Ok(()));
        }
        if state.terminal.is_some() {
            let err = terminal(&state);
            state.drop_waker(this.waiter.take());
            return Poll::Ready(Err(err));
        }
        state.register_waker(&mut this.waiter, cx.waker());
        Poll::Pending
    }
}

impl Drop for DrainFuture {
    fn drop(&mut self) {
        if self.waiter.is_some() {
            let mut state = self.monitor.state.lock_or_panic();
            state.drop_waker(self.waiter.take());
        }
    }
}
