use std::sync::Arc;
use std::thread::{self, ThreadId};

use ahash::AHashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use super::{Bridge, Context};

/// Callback that interrupts a thread blocked outside the execution lock.
pub type UnblockFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Default)]
struct LockState {
    owner: Option<ThreadId>,
    depth: usize,
}

/// The global execution lock: reentrant on its owning thread, exclusive
/// across threads.
#[derive(Default)]
pub(crate) struct ExecutionLock {
    state: Mutex<LockState>,
    released: Condvar,
    blocked: Mutex<AHashMap<ThreadId, UnblockFn>>,
}

impl ExecutionLock {
    /// Blocks until the current thread owns the lock. Returns the new depth.
    pub fn acquire(&self) -> usize {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner == Some(me) {
            state.depth += 1;
            return state.depth;
        }
        while state.owner.is_some() {
            self.released.wait(&mut state);
        }
        state.owner = Some(me);
        state.depth = 1;
        1
    }

    pub fn release(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner != Some(me) {
            return;
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.released.notify_one();
        }
    }

    /// Releases every level held by the current thread, returning the depth
    /// to restore with [`Self::resume`].
    fn suspend(&self) -> usize {
        let mut state = self.state.lock();
        let depth = std::mem::take(&mut state.depth);
        state.owner = None;
        self.released.notify_one();
        depth
    }

    fn resume(&self, depth: usize) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        while state.owner.is_some() {
            self.released.wait(&mut state);
        }
        state.owner = Some(me);
        state.depth = depth;
    }

    pub fn held_by_current(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }
}

/// Re-acquires the lock when the released region ends, however it ends.
struct Reacquire<'a> {
    lock: &'a ExecutionLock,
    depth: usize,
    thread: ThreadId,
}

impl Drop for Reacquire<'_> {
    fn drop(&mut self) {
        self.lock.blocked.lock().remove(&self.thread);
        self.lock.resume(self.depth);
        debug!(depth = self.depth, "execution lock reacquired");
    }
}

impl Context<'_> {
    /// Runs `f` with the execution lock released so other threads may enter
    /// the runtime.
    ///
    /// `f` must be `Send`, so it cannot capture this context or any handle
    /// accessor. `unblock`, if given, is what [`Bridge::interrupt`] invokes
    /// while `f` runs.
    pub fn without_lock<R>(&self, f: impl FnOnce() -> R + Send, unblock: Option<UnblockFn>) -> R {
        let lock = &self.bridge().lock;
        let thread = thread::current().id();
        if let Some(unblock) = unblock {
            lock.blocked.lock().insert(thread, unblock);
        }
        let depth = lock.suspend();
        debug!(depth, "execution lock released");
        let _reacquire = Reacquire {
            lock,
            depth,
            thread,
        };
        f()
    }
}

impl Bridge {
    /// Invokes the unblock callback registered by `thread`. Returns `false`
    /// when that thread is not blocked outside the lock.
    pub fn interrupt(&self, thread: ThreadId) -> bool {
        let unblock = self.lock.blocked.lock().get(&thread).cloned();
        match unblock {
            Some(unblock) => {
                info!(thread = ?thread, "interrupting blocked thread");
                unblock();
                true
            }
            None => false,
        }
    }
}
