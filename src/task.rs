/*! Named background tasks with prompt cancellation.

The runtime is plain threads: one long lived thread per concern
(transport reader and writer, discovery, per-session heartbeat) and
short lived one-shots for timeouts. Everything here revolves around
one guarantee the protocol timers need: after [Task::cancel] (or
drop) returns, the task body will not run again.
 */
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::Result;

/// Cooperative cancellation flag, shareable across threads.
///
/// The condvar lets [CancellationToken::sleep] double as the wait
/// primitive for periodic tasks, so cancelling wakes sleepers
/// immediately instead of after their current period.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancellationToken {
    /// New, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the flag and wake all sleepers.
    pub fn cancel(&self) {
        let (lock, cvar) = &*self.inner;
        let mut cancelled = lock.lock().unwrap();
        *cancelled = true;
        cvar.notify_all();
    }

    /// Whether the token is cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap()
    }

    /// Sleep up to `timeout`, returning early when cancelled.
    /// Returns true if the token was cancelled.
    pub fn sleep(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut cancelled = lock.lock().unwrap();
        loop {
            if *cancelled {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = cvar.wait_timeout(cancelled, deadline - now).unwrap();
            cancelled = guard;
        }
    }
}

/// A named worker thread tied to a [CancellationToken].
///
/// Dropping the handle cancels the token and joins the thread, so
/// whoever owns the `Task` owns the lifetime.
pub struct Task {
    name: String,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Task {
    /// Spawn a thread running `f` with the task's token.
    ///
    /// For free-form loops (socket readers and the like); `f` is
    /// expected to return promptly once the token cancels.
    pub fn spawn<F>(name: &str, f: F) -> Result<Self>
    where
        F: FnOnce(CancellationToken) + Send + 'static,
    {
        let token = CancellationToken::new();
        let t = token.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || f(t))?;
        Ok(Self {
            name: name.to_string(),
            token,
            handle: Some(handle),
        })
    }

    /// Run `f` once after `delay`, unless cancelled first.
    pub fn one_shot<F>(name: &str, delay: Duration, f: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::spawn(name, move |token| {
            if !token.sleep(delay) {
                f();
            }
        })
    }

    /// Run `f` every `period` until it returns false or the task is
    /// cancelled. The first run happens one period in.
    pub fn periodic<F>(name: &str, period: Duration, mut f: F) -> Result<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        Self::spawn(name, move |token| {
            loop {
                if token.sleep(period) {
                    return;
                }
                if !f() {
                    debug!("periodic task stopping itself");
                    return;
                }
            }
        })
    }

    /// The token driving this task.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancel and wait for the thread to finish. After this returns
    /// the body is guaranteed not to run again.
    pub fn cancel(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == std::thread::current().id() {
                // A task cancelling itself from inside its own body
                // cannot join; the cancelled token already keeps the
                // body from running again.
                return;
            }
            if handle.join().is_err() {
                warn!("task {} panicked", self.name);
            }
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.cancel();
    }
}
