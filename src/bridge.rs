//! Cross-Thread Poll Bridge
//!
//! The native run loop cannot block on arbitrary foreign file
//! descriptors, but the portable event-loop contract promises exactly
//! that. The bridge runs one background thread that performs the
//! blocking multiplexed wait on behalf of the main thread and posts a
//! synthetic wake into the native pump when any descriptor becomes
//! ready.
//!
//! The main thread publishes a descriptor set ("arming" the bridge),
//! then blocks only on the native pump. A dedicated self-pipe lets the
//! main thread force the poll thread out of its blocking wait at any
//! time, so re-arming never races the in-flight syscall.

use std::io::{self, Read, Write};
use std::os::fd::RawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use mio::unix::pipe;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::pump::PumpWaker;

/// Self-pipe token; armed descriptors use `Token(index + 1)`.
const WAKE_TOKEN: Token = Token(0);

/// Interest in one foreign descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdInterest {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
}

impl FdInterest {
    pub fn readable(fd: RawFd) -> Self {
        Self {
            fd,
            readable: true,
            writable: false,
        }
    }
}

/// Readiness reported for one armed descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdReadiness {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BridgeState {
    /// Poll thread parked on the condvar, holding no work.
    Idle,
    /// Main thread has published a fresh descriptor set.
    Armed,
    /// Poll thread is inside (or about to enter) the blocking wait.
    Polling,
    /// Readiness published and not yet collected.
    Ready,
}

struct Shared {
    state: BridgeState,
    fds: Vec<FdInterest>,
    timeout: Option<Duration>,
    results: Vec<FdReadiness>,
    /// True while the self-pipe holds an undrained wake byte. Guards
    /// wake writes so the pipe never accumulates more than one.
    wake_pending: bool,
    shutdown: bool,
}

/// Background thread that blocks on foreign descriptors so the main
/// thread can keep blocking on the native pump.
///
/// The thread is created lazily on the first [`PollBridge::arm`] call
/// and joined by [`PollBridge::shutdown`] (or drop).
pub struct PollBridge {
    shared: Arc<(Mutex<Shared>, Condvar)>,
    waker: Arc<dyn PumpWaker>,
    capacity: usize,
    wake_tx: Option<pipe::Sender>,
    thread: Option<thread::JoinHandle<()>>,
}

impl PollBridge {
    /// `waker` is the native pump's cross-thread wake handle;
    /// `capacity` sizes the readiness event buffer.
    pub fn new(waker: Arc<dyn PumpWaker>, capacity: usize) -> Self {
        Self {
            shared: Arc::new((
                Mutex::new(Shared {
                    state: BridgeState::Idle,
                    fds: Vec::new(),
                    timeout: None,
                    results: Vec::new(),
                    wake_pending: false,
                    shutdown: false,
                }),
                Condvar::new(),
            )),
            waker,
            capacity: capacity.max(4),
            wake_tx: None,
            thread: None,
        }
    }

    /// Publish a fresh descriptor set and timeout for the poll thread.
    ///
    /// If the thread is still blocked on the previous set, it is forced
    /// out through the self-pipe first; the call returns once the new
    /// set is published. Results from a completed previous wait are
    /// retained until [`take_results`](Self::take_results).
    pub fn arm(&mut self, fds: &[FdInterest], timeout: Option<Duration>) -> Result<()> {
        self.ensure_started()?;
        let (lock, cvar) = &*self.shared;
        let mut shared = lock.lock().unwrap();
        if shared.shutdown {
            return Err(Error::Bridge("bridge already shut down".into()));
        }
        if shared.state == BridgeState::Polling {
            Self::write_wake(&mut shared, self.wake_tx.as_mut())?;
            while shared.state == BridgeState::Polling {
                shared = cvar.wait(shared).unwrap();
            }
        }
        shared.fds = fds.to_vec();
        shared.timeout = timeout;
        shared.state = BridgeState::Armed;
        cvar.notify_all();
        Ok(())
    }

    /// Withdraw a pending arm without publishing a new set. Readiness
    /// already reported stays available.
    pub fn cancel(&mut self) {
        let (lock, cvar) = &*self.shared;
        let mut shared = lock.lock().unwrap();
        match shared.state {
            BridgeState::Armed => {
                shared.state = BridgeState::Idle;
            }
            BridgeState::Polling => {
                if Self::write_wake(&mut shared, self.wake_tx.as_mut()).is_ok() {
                    while shared.state == BridgeState::Polling {
                        shared = cvar.wait(shared).unwrap();
                    }
                }
            }
            BridgeState::Idle | BridgeState::Ready => {}
        }
    }

    /// Collect readiness published since the last call. Results persist
    /// across re-arms until collected, so a wakeup observed between
    /// "arm" and "wait" is never lost.
    pub fn take_results(&mut self) -> Vec<FdReadiness> {
        let (lock, cvar) = &*self.shared;
        let mut shared = lock.lock().unwrap();
        let results = std::mem::take(&mut shared.results);
        if shared.state == BridgeState::Ready {
            shared.state = BridgeState::Idle;
            cvar.notify_all();
        }
        results
    }

    /// Whether uncollected readiness is available.
    pub fn has_results(&self) -> bool {
        let (lock, _) = &*self.shared;
        !lock.lock().unwrap().results.is_empty()
    }

    /// Stop and join the poll thread. Idempotent.
    pub fn shutdown(&mut self) {
        let (lock, cvar) = &*self.shared;
        {
            let mut shared = lock.lock().unwrap();
            if shared.shutdown {
                return;
            }
            shared.shutdown = true;
            let _ = Self::write_wake(&mut shared, self.wake_tx.as_mut());
            cvar.notify_all();
        }
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("poll thread panicked during shutdown");
            }
        }
        info!("poll bridge shut down");
    }

    /// Write one wake byte unless one is already pending. Must be
    /// called with the shared lock held.
    fn write_wake(shared: &mut Shared, wake_tx: Option<&mut pipe::Sender>) -> Result<()> {
        if shared.wake_pending {
            return Ok(());
        }
        let Some(tx) = wake_tx else {
            return Err(Error::Bridge("poll thread not started".into()));
        };
        match tx.write(&[1]) {
            Ok(_) => {
                shared.wake_pending = true;
                Ok(())
            }
            Err(e) => Err(Error::Bridge(format!("self-pipe write failed: {e}"))),
        }
    }

    /// Spawn the poll thread on first use.
    fn ensure_started(&mut self) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        {
            let (lock, _) = &*self.shared;
            if lock.lock().unwrap().shutdown {
                return Err(Error::Bridge("bridge already shut down".into()));
            }
        }
        let (wake_tx, wake_rx) = pipe::new()?;
        let shared = Arc::clone(&self.shared);
        let waker = Arc::clone(&self.waker);
        let capacity = self.capacity;
        let handle = thread::Builder::new()
            .name("portico-poll".into())
            .spawn(move || poll_thread(shared, wake_rx, waker, capacity))
            .map_err(|e| Error::Bridge(format!("failed to spawn poll thread: {e}")))?;
        self.wake_tx = Some(wake_tx);
        self.thread = Some(handle);
        info!("poll bridge thread started");
        Ok(())
    }

    #[cfg(test)]
    fn wake_is_pending(&self) -> bool {
        let (lock, _) = &*self.shared;
        lock.lock().unwrap().wake_pending
    }
}

impl Drop for PollBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn poll_thread(
    shared: Arc<(Mutex<Shared>, Condvar)>,
    mut wake_rx: pipe::Receiver,
    waker: Arc<dyn PumpWaker>,
    capacity: usize,
) {
    let mut poll = match Poll::new() {
        Ok(poll) => poll,
        Err(e) => {
            warn!("failed to create poller: {e}");
            return;
        }
    };
    if let Err(e) = poll
        .registry()
        .register(&mut wake_rx, WAKE_TOKEN, Interest::READABLE)
    {
        warn!("failed to register self-pipe: {e}");
        return;
    }
    let mut events = Events::with_capacity(capacity);

    loop {
        // Idle: wait for a published descriptor set.
        let (fds, timeout) = {
            let (lock, cvar) = &*shared;
            let mut s = lock.lock().unwrap();
            loop {
                if s.shutdown {
                    return;
                }
                if s.state == BridgeState::Armed {
                    break;
                }
                s = cvar.wait(s).unwrap();
            }
            s.state = BridgeState::Polling;
            (s.fds.clone(), s.timeout)
        };

        let mut readiness: Vec<FdReadiness> = Vec::new();
        let mut woken_by_pipe = false;

        let mut registered = 0;
        let mut register_failed = false;
        for (index, fi) in fds.iter().enumerate() {
            let interest = match (fi.readable, fi.writable) {
                (true, true) => Interest::READABLE | Interest::WRITABLE,
                (false, true) => Interest::WRITABLE,
                _ => Interest::READABLE,
            };
            let mut source = SourceFd(&fi.fd);
            if let Err(e) = poll
                .registry()
                .register(&mut source, Token(index + 1), interest)
            {
                // Callers validate descriptors before arming; an invalid
                // one fails this whole iteration.
                warn!("failed to register fd {}: {e}", fi.fd);
                register_failed = true;
                break;
            }
            registered += 1;
        }

        if !register_failed {
            loop {
                match poll.poll(&mut events, timeout) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("blocking wait failed: {e}");
                        events.clear();
                    }
                }
                break;
            }
            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    woken_by_pipe = true;
                    continue;
                }
                let index = event.token().0 - 1;
                let fd = fds[index].fd;
                match readiness.iter_mut().find(|r| r.fd == fd) {
                    Some(entry) => {
                        entry.readable |= event.is_readable();
                        entry.writable |= event.is_writable();
                    }
                    None => readiness.push(FdReadiness {
                        fd,
                        readable: event.is_readable(),
                        writable: event.is_writable(),
                    }),
                }
            }
        }

        for fi in fds.iter().take(registered) {
            let mut source = SourceFd(&fi.fd);
            if let Err(e) = poll.registry().deregister(&mut source) {
                debug!("failed to deregister fd {}: {e}", fi.fd);
            }
        }

        let had_readiness = !readiness.is_empty();
        {
            let (lock, cvar) = &*shared;
            let mut s = lock.lock().unwrap();

            // Drain the self-pipe back to empty before going idle: at
            // most one byte is ever in flight, but reads are looped so
            // a missed drain can never accumulate.
            if woken_by_pipe || s.wake_pending {
                let mut buf = [0u8; 8];
                loop {
                    match wake_rx.read(&mut buf) {
                        Ok(0) => break,
                        Ok(_) => continue,
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            warn!("self-pipe drain failed: {e}");
                            break;
                        }
                    }
                }
                s.wake_pending = false;
            }
            if s.shutdown {
                return;
            }

            if woken_by_pipe && !had_readiness {
                // Pure wake: the main thread asked for a re-arm, there
                // is no readiness to report.
                s.state = BridgeState::Idle;
                cvar.notify_all();
                continue;
            }

            for r in readiness {
                match s.results.iter_mut().find(|e| e.fd == r.fd) {
                    Some(entry) => {
                        entry.readable |= r.readable;
                        entry.writable |= r.writable;
                    }
                    None => s.results.push(r),
                }
            }
            s.state = BridgeState::Ready;
            cvar.notify_all();
        }

        // Results are published before the wake is posted, so the main
        // thread observes them strictly after waking.
        debug!(ready = had_readiness, "poll bridge signaling main thread");
        waker.post_wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    struct CountingWaker {
        wakes: AtomicUsize,
        gate: (Mutex<()>, Condvar),
    }

    impl CountingWaker {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                wakes: AtomicUsize::new(0),
                gate: (Mutex::new(()), Condvar::new()),
            })
        }

        fn count(&self) -> usize {
            self.wakes.load(Ordering::SeqCst)
        }

        fn wait_for_wake(&self, timeout: Duration) -> bool {
            let deadline = Instant::now() + timeout;
            let (lock, cvar) = &self.gate;
            let mut guard = lock.lock().unwrap();
            while self.count() == 0 {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                let (g, _) = cvar.wait_timeout(guard, deadline - now).unwrap();
                guard = g;
            }
            true
        }
    }

    impl PumpWaker for CountingWaker {
        fn post_wake(&self) {
            self.wakes.fetch_add(1, Ordering::SeqCst);
            let (lock, cvar) = &self.gate;
            let _guard = lock.lock().unwrap();
            cvar.notify_all();
        }
    }

    fn test_pipe() -> (pipe::Sender, pipe::Receiver) {
        pipe::new().expect("pipe")
    }

    #[test]
    fn test_readiness_wakes_and_reports() {
        use std::os::fd::AsRawFd;

        let waker = CountingWaker::new();
        let mut bridge = PollBridge::new(waker.clone(), 8);
        let (mut tx, rx) = test_pipe();
        let fd = rx.as_raw_fd();

        bridge.arm(&[FdInterest::readable(fd)], None).unwrap();
        tx.write(&[42]).unwrap();

        assert!(waker.wait_for_wake(Duration::from_secs(2)));
        // The poll thread publishes before posting the wake.
        let results = bridge.take_results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].fd, fd);
        assert!(results[0].readable);
    }

    #[test]
    fn test_timeout_reports_empty_and_wakes() {
        let waker = CountingWaker::new();
        let mut bridge = PollBridge::new(waker.clone(), 8);
        let (_tx, rx) = test_pipe();
        use std::os::fd::AsRawFd;
        let fd = rx.as_raw_fd();

        bridge
            .arm(&[FdInterest::readable(fd)], Some(Duration::from_millis(20)))
            .unwrap();
        assert!(waker.wait_for_wake(Duration::from_secs(2)));
        assert!(bridge.take_results().is_empty());
    }

    #[test]
    fn test_rearm_storm_leaves_pipe_empty() {
        use std::os::fd::AsRawFd;

        let waker = CountingWaker::new();
        let mut bridge = PollBridge::new(waker.clone(), 8);
        let (mut tx, rx) = test_pipe();
        let fd = rx.as_raw_fd();

        for _ in 0..1000 {
            bridge.arm(&[FdInterest::readable(fd)], None).unwrap();
            bridge.cancel();
        }
        // Every forced wake has been drained; the pipe is back to its
        // defined empty state.
        assert!(!bridge.wake_is_pending());
        assert_eq!(bridge.take_results(), Vec::new());

        // The bridge still works after the storm.
        bridge.arm(&[FdInterest::readable(fd)], None).unwrap();
        tx.write(&[1]).unwrap();
        assert!(waker.wait_for_wake(Duration::from_secs(2)));
        let results = bridge.take_results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].fd, fd);
    }

    #[test]
    fn test_results_survive_rearm() {
        use std::os::fd::AsRawFd;

        let waker = CountingWaker::new();
        let mut bridge = PollBridge::new(waker.clone(), 8);
        let (mut tx, rx) = test_pipe();
        let fd = rx.as_raw_fd();

        bridge.arm(&[FdInterest::readable(fd)], None).unwrap();
        tx.write(&[1]).unwrap();
        assert!(waker.wait_for_wake(Duration::from_secs(2)));

        // Re-arm before collecting: the earlier readiness must still be
        // visible afterwards.
        bridge.arm(&[FdInterest::readable(fd)], None).unwrap();
        let results = bridge.take_results();
        assert!(results.iter().any(|r| r.fd == fd && r.readable));
        bridge.cancel();
    }

    #[test]
    fn test_shutdown_joins_thread() {
        let waker = CountingWaker::new();
        let mut bridge = PollBridge::new(waker, 8);
        let (_tx, rx) = test_pipe();
        use std::os::fd::AsRawFd;
        bridge
            .arm(&[FdInterest::readable(rx.as_raw_fd())], None)
            .unwrap();
        bridge.shutdown();
        assert!(bridge.arm(&[], None).is_err());
    }
}
