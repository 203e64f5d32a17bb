//! Timed readers/writer lock with writer preference.
//!
//! The configuration store serializes mutations through this lock: any
//! number of readers may hold it concurrently, a writer holds it alone,
//! and queued writers take precedence over newly arriving readers so a
//! steady read stream can never starve a mutation.
//!
//! Every acquisition carries a timeout (default 30 seconds). Guards
//! release on `Drop`, so no code path can leak a held lock across an
//! early return or panic.
//!
//! # Example
//!
//! ```
//! use orbit_lock::TimedRwLock;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let lock = TimedRwLock::new();
//! {
//!     let _r1 = lock.read().await.expect("read");
//!     let _r2 = lock.read().await.expect("read"); // readers share
//! }
//! let _w = lock.write().await.expect("write");
//! assert!(lock.snapshot().writer);
//! # });
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;

/// Default per-acquisition timeout.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors surfaced by lock acquisition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    /// The waiter was removed from the queue after its timeout elapsed.
    /// Lock state is unchanged and the caller may retry.
    #[error("timed out waiting for {mode} lock after {timeout:?}")]
    Timeout {
        /// `"read"` or `"write"`.
        mode: &'static str,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The lock was force-reset while this waiter was queued.
    #[error("lock was reset while waiting for {mode} acquisition")]
    Reset {
        /// `"read"` or `"write"`.
        mode: &'static str,
    },
}

/// Diagnostic snapshot of the lock's admission state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSnapshot {
    /// Number of readers currently holding the lock.
    pub readers: usize,
    /// Whether a writer currently holds the lock.
    pub writer: bool,
    /// Number of queued read acquisitions.
    pub pending_reads: usize,
    /// Number of queued write acquisitions.
    pub pending_writes: usize,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

struct State {
    readers: usize,
    writer: bool,
    pending_reads: VecDeque<Waiter>,
    pending_writes: VecDeque<Waiter>,
    next_id: u64,
    // Bumped by force_reset; guards from an earlier epoch must not
    // mutate post-reset state on release.
    epoch: u64,
}

struct Inner {
    state: Mutex<State>,
}

impl Inner {
    // Poison-recovering lock: the state is a plain counter structure and
    // stays consistent even if a holder panicked mid-update elsewhere.
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admission policy: queued writers first, otherwise drain all
    /// queued readers. Called after every release with the state locked.
    fn admit(state: &mut State) {
        if state.writer {
            return;
        }
        if state.readers == 0 {
            while let Some(w) = state.pending_writes.pop_front() {
                // A waiter whose future was dropped has no receiver; skip it.
                if w.tx.send(()).is_ok() {
                    state.writer = true;
                    return;
                }
            }
        }
        if state.pending_writes.is_empty() {
            let waiters = std::mem::take(&mut state.pending_reads);
            for w in waiters {
                if w.tx.send(()).is_ok() {
                    state.readers += 1;
                }
            }
        }
    }

    fn release_read(&self, epoch: u64) {
        let mut state = self.lock_state();
        if state.epoch != epoch {
            return;
        }
        state.readers = state.readers.saturating_sub(1);
        if state.readers == 0 {
            Self::admit(&mut state);
        }
    }

    fn release_write(&self, epoch: u64) {
        let mut state = self.lock_state();
        if state.epoch != epoch {
            return;
        }
        state.writer = false;
        Self::admit(&mut state);
    }
}

/// Guard for a held read acquisition; releases on drop.
pub struct ReadGuard {
    inner: Arc<Inner>,
    epoch: u64,
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        self.inner.release_read(self.epoch);
    }
}

impl std::fmt::Debug for ReadGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadGuard").finish_non_exhaustive()
    }
}

/// Guard for a held write acquisition; releases on drop.
pub struct WriteGuard {
    inner: Arc<Inner>,
    epoch: u64,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.inner.release_write(self.epoch);
    }
}

impl std::fmt::Debug for WriteGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteGuard").finish_non_exhaustive()
    }
}

/// Single-writer / multiple-reader lock with writer preference and
/// per-acquisition timeouts.
///
/// Cloning is cheap and all clones refer to the same lock.
#[derive(Clone)]
pub struct TimedRwLock {
    inner: Arc<Inner>,
    timeout: Duration,
}

impl Default for TimedRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TimedRwLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.snapshot();
        f.debug_struct("TimedRwLock")
            .field("readers", &snap.readers)
            .field("writer", &snap.writer)
            .field("pending_reads", &snap.pending_reads)
            .field("pending_writes", &snap.pending_writes)
            .finish()
    }
}

enum Mode {
    Read,
    Write,
}

impl TimedRwLock {
    /// Create a lock with the default 30-second acquisition timeout.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_ACQUIRE_TIMEOUT)
    }

    /// Create a lock with a custom default acquisition timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    readers: 0,
                    writer: false,
                    pending_reads: VecDeque::new(),
                    pending_writes: VecDeque::new(),
                    next_id: 0,
                    epoch: 0,
                }),
            }),
            timeout,
        }
    }

    /// Acquire a read lock with the default timeout.
    pub async fn read(&self) -> Result<ReadGuard, LockError> {
        self.read_with_timeout(self.timeout).await
    }

    /// Acquire a write lock with the default timeout.
    pub async fn write(&self) -> Result<WriteGuard, LockError> {
        self.write_with_timeout(self.timeout).await
    }

    /// Acquire a read lock, waiting at most `timeout`.
    ///
    /// Waits while a writer holds the lock or any writer is queued
    /// (writer preference).
    pub async fn read_with_timeout(&self, timeout: Duration) -> Result<ReadGuard, LockError> {
        let epoch = self.acquire(Mode::Read, timeout).await?;
        Ok(ReadGuard {
            inner: Arc::clone(&self.inner),
            epoch,
        })
    }

    /// Acquire a write lock, waiting at most `timeout`.
    ///
    /// Waits until no readers and no writer hold the lock; queued
    /// writers are admitted in FIFO order.
    pub async fn write_with_timeout(&self, timeout: Duration) -> Result<WriteGuard, LockError> {
        let epoch = self.acquire(Mode::Write, timeout).await?;
        Ok(WriteGuard {
            inner: Arc::clone(&self.inner),
            epoch,
        })
    }

    async fn acquire(&self, mode: Mode, timeout: Duration) -> Result<u64, LockError> {
        let mode_name = match mode {
            Mode::Read => "read",
            Mode::Write => "write",
        };

        let (id, mut rx, epoch) = {
            let mut state = self.inner.lock_state();
            match mode {
                Mode::Read => {
                    if !state.writer && state.pending_writes.is_empty() {
                        state.readers += 1;
                        return Ok(state.epoch);
                    }
                }
                Mode::Write => {
                    if !state.writer && state.readers == 0 && state.pending_writes.is_empty() {
                        state.writer = true;
                        return Ok(state.epoch);
                    }
                }
            }

            let (tx, rx) = oneshot::channel();
            let id = state.next_id;
            state.next_id += 1;
            let waiter = Waiter { id, tx };
            match mode {
                Mode::Read => state.pending_reads.push_back(waiter),
                Mode::Write => state.pending_writes.push_back(waiter),
            }
            (id, rx, state.epoch)
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(())) => Ok(epoch),
            // Sender dropped without a grant: the lock was force-reset.
            Ok(Err(_)) => Err(LockError::Reset { mode: mode_name }),
            Err(_) => {
                let mut state = self.inner.lock_state();
                let queue = match mode {
                    Mode::Read => &mut state.pending_reads,
                    Mode::Write => &mut state.pending_writes,
                };
                if let Some(pos) = queue.iter().position(|w| w.id == id) {
                    queue.remove(pos);
                    // Removing a queued writer may unblock queued readers.
                    Inner::admit(&mut state);
                    Err(LockError::Timeout {
                        mode: mode_name,
                        timeout,
                    })
                } else {
                    // The grant was sent in the same instant the timeout
                    // fired; the grant wins and the caller holds the lock.
                    match rx.try_recv() {
                        Ok(()) => Ok(state.epoch),
                        Err(_) => Err(LockError::Reset { mode: mode_name }),
                    }
                }
            }
        }
    }

    /// Diagnostic snapshot for tests and observability.
    pub fn snapshot(&self) -> LockSnapshot {
        let state = self.inner.lock_state();
        LockSnapshot {
            readers: state.readers,
            writer: state.writer,
            pending_reads: state.pending_reads.len(),
            pending_writes: state.pending_writes.len(),
        }
    }

    /// Recovery hatch: drop all holders and fail all queued waiters.
    ///
    /// Guards issued before the reset become inert; queued acquisitions
    /// fail with [`LockError::Reset`]. Not for use on the hot path.
    pub fn force_reset(&self) {
        let mut state = self.inner.lock_state();
        state.epoch += 1;
        state.readers = 0;
        state.writer = false;
        state.pending_reads.clear();
        state.pending_writes.clear();
    }
}
