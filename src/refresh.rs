//! Single-flight coordination of session refreshes
//!
//! When several requests discover an expired access token at once, the first
//! one to [`RefreshCoordinator::join`] becomes the leader and performs the
//! refresh. Everyone arriving while that refresh is in flight becomes a
//! follower and waits for the leader's outcome instead of spending the
//! (single-use) refresh token a second time.
//!
//! Leadership is an owned handle, so the refresh can run on a task of its
//! own while the caller that started it merely waits like everyone else.

use parking_lot::Mutex;
use std::mem;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

/// Result of one refresh cycle, shared by every caller that joined it
///
/// Error type is String because every waiter receives its own copy.
pub type RefreshOutcome = std::result::Result<String, String>;

#[derive(Default)]
struct RefreshCycle {
    refreshing: bool,
    waiters: Vec<oneshot::Sender<RefreshOutcome>>,
}

impl RefreshCycle {
    fn enqueue(&mut self) -> RefreshWaiter {
        let (tx, rx) = oneshot::channel();
        self.waiters.push(tx);
        RefreshWaiter { rx }
    }

    /// End the cycle and hand back everyone who was waiting on it
    fn finish(&mut self) -> Vec<oneshot::Sender<RefreshOutcome>> {
        self.refreshing = false;
        mem::take(&mut self.waiters)
    }
}

/// Owner of the `(refreshing, waiters)` pair
///
/// Both halves only ever change together under one lock: a cycle starts by
/// raising the flag and ends by lowering it and draining the waiters in the
/// same critical section.
#[derive(Default)]
pub struct RefreshCoordinator {
    cycle: Arc<Mutex<RefreshCycle>>,
}

/// What a caller must do after joining
pub enum RefreshRole {
    /// Perform the refresh, then [`RefreshLeader::resolve`] the cycle
    Leader(RefreshLeader),
    /// Wait for the current leader
    Follower(RefreshWaiter),
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lead a new cycle, or queue behind the one in flight
    pub fn join(&self) -> RefreshRole {
        let mut cycle = self.cycle.lock();

        if cycle.refreshing {
            let waiter = cycle.enqueue();
            debug!(waiters = cycle.waiters.len(), "Joined in-flight session refresh");
            return RefreshRole::Follower(waiter);
        }

        debug_assert!(cycle.waiters.is_empty());
        cycle.refreshing = true;
        debug!("Leading session refresh");
        RefreshRole::Leader(RefreshLeader {
            cycle: Arc::clone(&self.cycle),
            resolved: false,
        })
    }

    pub fn is_refreshing(&self) -> bool {
        self.cycle.lock().refreshing
    }

    pub fn waiter_count(&self) -> usize {
        self.cycle.lock().waiters.len()
    }
}

/// Leadership of the in-flight cycle
///
/// `'static` and `Send`, so it can be moved onto the task that performs the
/// refresh. Dropping an unresolved leader (the refresh task panicked)
/// closes the cycle without an outcome; its followers see
/// [`RefreshWaiter::wait`] return `None` and join again.
pub struct RefreshLeader {
    cycle: Arc<Mutex<RefreshCycle>>,
    resolved: bool,
}

impl RefreshLeader {
    /// Queue a wait on this leader's own outcome
    ///
    /// Lets the caller that won the election wait alongside the followers
    /// while the leader itself is handed to another task.
    pub fn follow(&self) -> RefreshWaiter {
        self.cycle.lock().enqueue()
    }

    /// Close the cycle and release every waiter with `outcome`
    ///
    /// Returns the number of waiters released.
    pub fn resolve(mut self, outcome: RefreshOutcome) -> usize {
        self.resolved = true;
        let waiters = self.cycle.lock().finish();
        let released = waiters.len();

        for waiter in waiters {
            // A follower whose caller went away has nobody left to tell
            let _ = waiter.send(outcome.clone());
        }

        debug!(released, success = outcome.is_ok(), "Session refresh cycle resolved");
        released
    }
}

impl Drop for RefreshLeader {
    fn drop(&mut self) {
        if !self.resolved {
            let abandoned = self.cycle.lock().finish();
            debug!(waiters = abandoned.len(), "Session refresh abandoned by its leader");
        }
    }
}

/// A suspended wait on the leader
pub struct RefreshWaiter {
    rx: oneshot::Receiver<RefreshOutcome>,
}

impl RefreshWaiter {
    /// `None` means the leader went away without an outcome
    pub async fn wait(self) -> Option<RefreshOutcome> {
        self.rx.await.ok()
    }
}
