// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The auto-reconnecting tracker.
//!
//! A control-loop thread periodically enumerates, evaluates the matcher,
//! and opens when exactly one port matches. A connection stays current
//! until its terminal error is set; then the loop releases it and starts
//! hunting again. Each successful open bumps a generation counter, so a
//! client can tell a reconnect from the connection it already had.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Waker};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::connection::{ConnectOptions, Connection};
use crate::matchexpr::CompiledMatcher;
use crate::ports::Scanner;
use crate::{Error, MutexExt, Result};

/// Tracker tuning knobs.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub options: ConnectOptions,
    /// Poll interval while healthy; also the backoff floor.
    pub min_poll: Duration,
    /// Backoff ceiling after consecutive failures.
    pub max_poll: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            options: ConnectOptions::default(),
            min_poll: Duration::from_millis(100),
            max_poll: Duration::from_secs(2),
        }
    }
}

struct TrackerState {
    current: Option<Arc<Connection>>,
    generation: u64,
    last_device: Option<String>,
    /// A non-transient failure; surfaced to every waiter.
    fatal: Option<Error>,
    shutdown: bool,
    wakers: HashMap<u64, Waker>,
    next_waiter: u64,
}

struct Shared {
    state: Mutex<TrackerState>,
    cond: Condvar,
}

impl Shared {
    fn wake_all(&self, state: &mut TrackerState) {
        self.cond.notify_all();
        for (_, waker) in state.wakers.drain() {
            waker.wake();
        }
    }
}

/// Keeps a logical connection alive across unplug/replug.
pub struct Tracker {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Tracker {
    /// Compiles `expr` (a parse failure surfaces here, before any thread
    /// exists) and starts the control loop.
    pub fn spawn(expr: &str, scanner: Scanner, config: TrackerConfig) -> Result<Tracker> {
        let matcher = CompiledMatcher::compile(expr)?;
        let shared = Arc::new(Shared {
            state: Mutex::new(TrackerState {
                current: None,
                generation: 0,
                last_device: None,
                fatal: None,
                shutdown: false,
                wakers: HashMap::new(),
                next_waiter: 0,
            }),
            cond: Condvar::new(),
        });
        let thread = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || control_loop(&shared, &matcher, &scanner, &config))
        };
        Ok(Tracker {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// The live connection, if one is current right now.
    pub fn current(&self) -> Option<Arc<Connection>> {
        self.shared.state.lock_or_panic().current.clone()
    }

    /// Monotonic count of successful opens.
    pub fn generation(&self) -> u64 {
        self.shared.state.lock_or_panic().generation
    }

    /// The device selected by the most recent open, surviving disconnects.
    pub fn last_device(&self) -> Option<String> {
        self.shared.state.lock_or_panic().last_device.clone()
    }

    /// Blocks until a current connection exists with generation ≥
    /// `min_generation`, the tracker records a fatal error, or the timeout
    /// elapses.
    pub fn wait_ready(
        &self,
        min_generation: u64,
        timeout: Option<Duration>,
    ) -> Result<Arc<Connection>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.state.lock_or_panic();
        loop {
            if let Some(err) = ready_outcome(&state, min_generation) {
                return err;
            }
            state = match deadline {
                None => self.shared.cond.wait(state).unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                        return Err(Error::Timeout);
                    };
                    let (state, _) = self
                        .shared
                        .cond
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(|e| e.into_inner());
                    state
                }
            };
        }
    }

    /// Future form of [`Tracker::wait_ready`]; dropping it detaches the
    /// waiter with no side effects.
    pub fn ready(&self, min_generation: u64) -> ReadyFuture {
        ReadyFuture {
            shared: Arc::clone(&self.shared),
            min_generation,
            waiter: None,
        }
    }

    /// Stops the control loop and closes the current connection.
    /// Idempotent.
    pub fn shutdown(&self) {
        let current = {
            let mut state = self.shared.state.lock_or_panic();
            state.shutdown = true;
            self.shared.wake_all(&mut state);
            state.current.take()
        };
        if let Some(conn) = current {
            conn.close();
        }
        if let Some(handle) = self.thread.lock_or_panic().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn ready_outcome(
    state: &TrackerState,
    min_generation: u64,
) -> Option<Result<Arc<Connection>>> {
    if let Some(err) = &state.fatal {
        return Some(Err(err.clone()));
    }
    if state.shutdown {
        return Some(Err(Error::Closed));
    }
    if state.generation >= min_generation {
        if let Some(conn) = &state.current {
            return Some(Ok(Arc::clone(conn)));
        }
    }
    None
}

fn control_loop(
    shared: &Shared,
    matcher: &CompiledMatcher,
    scanner: &Scanner,
    config: &TrackerConfig,
) {
    let min_poll = config.min_poll.max(Duration::from_millis(1));
    let max_poll = config.max_poll.max(min_poll);
    let mut interval = min_poll;

    loop {
        let (dead, hunting) = {
            let mut state = shared.state.lock_or_panic();
            if state.shutdown {
                return;
            }
            let lost = state
                .current
                .as_ref()
                .and_then(|conn| conn.terminal_error());
            let dead = match lost {
                Some(err) => {
                    info!(error = %err, "tracked connection lost");
                    state.current.take()
                }
                None => None,
            };
            (dead, state.current.is_none())
        };
        // join the dead connection's workers outside the state lock
        if let Some(conn) = dead {
            conn.close();
        }

        if hunting {
            match hunt(shared, matcher, scanner, config) {
                Ok(true) => interval = min_poll,
                Ok(false) => interval = (interval * 2).min(max_poll),
                Err(()) => return,
            }
        } else {
            interval = min_poll;
        }

        // interruptible sleep; shutdown cuts it short
        let state = shared.state.lock_or_panic();
        let (state, _) = shared
            .cond
            .wait_timeout_while(state, interval, |s| !s.shutdown)
            .unwrap_or_else(|e| e.into_inner());
        if state.shutdown {
            return;
        }
    }
}

/// One enumerate/select/open pass. `Ok(true)` on a successful open,
/// `Ok(false)` to back off and retry, `Err(())` when the loop must stop
/// (fatal error recorded, or shutdown raced the open).
fn hunt(
    shared: &Shared,
    matcher: &CompiledMatcher,
    scanner: &Scanner,
    config: &TrackerConfig,
) -> std::result::Result<bool, ()> {
    let mut hits = matcher.filter(scanner.scan());
    if hits.len() != 1 {
        debug!(
            matches = hits.len(),
            expr = matcher.expression(),
            "waiting for exactly one match"
        );
        return Ok(false);
    }
    let port = hits.remove(0);
    match Connection::open_attributes(port, &config.options) {
        Ok(conn) => {
            let device = conn.device().to_string();
            let mut state = shared.state.lock_or_panic();
            if state.shutdown {
                drop(state);
                conn.close();
                return Err(());
            }
            info!(device = %device, generation = state.generation + 1, "tracked port opened");
            state.generation += 1;
            state.last_device = Some(device);
            state.current = Some(Arc::new(conn));
            shared.wake_all(&mut state);
            Ok(true)
        }
        Err(err) if err.is_transient() => {
            debug!(error = %err, "open failed, will retry");
            Ok(false)
        }
        Err(err) => {
            warn!(error = %err, "tracker giving up");
            let mut state = shared.state.lock_or_panic();
            state.fatal = Some(err);
            shared.wake_all(&mut state);
            Err(())
        }
    }
}

/// Resolves once a current connection exists with generation ≥ the
/// requested one, or fails with the tracker's fatal error.
pub struct ReadyFuture {
    shared: Arc<Shared>,
    min_generation: u64,
    waiter: Option<u64>,
}

impl Future for ReadyFuture {
    type Output = Result<Arc<Connection>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut state = this.shared.state.lock_or_panic();
        if let Some(outcome) = ready_outcome(&state, this.min_generation) {
            if let Some(key) = this.waiter.take() {
                state.wakers.remove(&key);
            }
            return Poll::Ready(outcome);
        }
        let key = *this.waiter.get_or_insert_with(|| {
            state.next_waiter += 1;
            state.next_waiter
        });
        state.wakers.insert(key, cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for ReadyFuture {
    fn drop(&mut self) {
        if let Some(key) = self.waiter.take() {
            self.shared.state.lock_or_panic().wakers.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::PortAttributes;

    #[test]
    fn parse_errors_surface_at_spawn() {
        let scanner = Scanner::fixed([]);
        assert!(matches!(
            Tracker::spawn("~/(/", scanner, TrackerConfig::default()),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn wait_ready_times_out_while_nothing_matches() {
        let scanner = Scanner::fixed([]);
        let config = TrackerConfig {
            min_poll: Duration::from_millis(5),
            max_poll: Duration::from_millis(20),
            ..TrackerConfig::default()
        };
        let tracker = Tracker::spawn("vid=239a", scanner, config).unwrap();
        assert!(matches!(
            tracker.wait_ready(1, Some(Duration::from_millis(50))),
            Err(Error::Timeout)
        ));
        assert_eq!(tracker.generation(), 0);
        tracker.shutdown();
    }

    #[test]
    fn fatal_open_errors_reach_waiters() {
        // exactly one match, but the port cannot be opened for a
        // non-transient reason (no device attribute at all)
        let scanner = Scanner::fixed([PortAttributes::new([("vid", "239a")])]);
        let config = TrackerConfig {
            min_poll: Duration::from_millis(5),
            max_poll: Duration::from_millis(20),
            ..TrackerConfig::default()
        };
        let tracker = Tracker::spawn("vid=239a", scanner, config).unwrap();
        assert!(matches!(
            tracker.wait_ready(1, Some(Duration::from_secs(2))),
            Err(Error::Config(_))
        ));
        tracker.shutdown();
    }

    #[test]
    fn shutdown_unblocks_waiters() {
        let scanner = Scanner::fixed([]);
        let tracker =
            Tracker::spawn("vid=239a", scanner, TrackerConfig::default()).unwrap();
        std::thread::scope(|scope| {
            let handle = scope.spawn(|| tracker.wait_ready(1, Some(Duration::from_secs(30))));
            std::thread::sleep(Duration::from_millis(50));
            tracker.shutdown();
            assert!(matches!(handle.join().unwrap(), Err(Error::Closed)));
        });
    }
}
