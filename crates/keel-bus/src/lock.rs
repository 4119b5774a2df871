// Copyright 2025 the Keel authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-bus locking policies.
//!
//! Each bus selects one of three disciplines at compile time:
//!
//! - [`SingleThreaded`]: no dispatch serialization at all. Using such a bus
//!   from more than one thread gives no cross-thread ordering whatsoever.
//! - [`Serialized`]: a recursive mutex serializes structural mutation
//!   (connect/disconnect) *and* dispatch. Recursive, because a handler
//!   invoked during dispatch may legally re-enter the same bus.
//! - [`LocklessDispatch`]: the mutex covers structural mutation only;
//!   delivery runs without it and revalidates each handler against the
//!   live table immediately before invoking it.
//!
//! The address table itself always sits behind a `parking_lot::RwLock`;
//! a literal no-op mutex over shared mutable state is unsound in Rust.
//! What the policy varies is the serialization layer above it, which is
//! where the observable semantics live: whether a connect on one thread
//! blocks until an in-flight dispatch on another thread completes.

use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

/// Compile-time selection of a bus's locking discipline.
pub trait LockPolicy: Send + Sync + 'static {
    /// Whether the bus carries a real mutex at all.
    const THREAD_SAFE: bool;
    /// Whether delivery runs without holding that mutex.
    const LOCKLESS_DISPATCH: bool;
}

/// No serialization. The null-mutex policy for buses owned by one thread.
pub struct SingleThreaded;

impl LockPolicy for SingleThreaded {
    const THREAD_SAFE: bool = false;
    const LOCKLESS_DISPATCH: bool = false;
}

/// Recursive mutex held across structural mutation and dispatch. The safe
/// default for buses shared between threads.
pub struct Serialized;

impl LockPolicy for Serialized {
    const THREAD_SAFE: bool = true;
    const LOCKLESS_DISPATCH: bool = false;
}

/// Recursive mutex for structural mutation only; delivery does not take it.
///
/// Trades per-handler revalidation cost for connect/disconnect never
/// waiting behind a long-running dispatch on another thread.
pub struct LocklessDispatch;

impl LockPolicy for LocklessDispatch {
    const THREAD_SAFE: bool = true;
    const LOCKLESS_DISPATCH: bool = true;
}

#[derive(Default)]
struct ReentrantState {
    owner: Option<ThreadId>,
    depth: usize,
}

/// A recursive mutex with manual lock/unlock.
///
/// A handler callback running under the bus lock may call back into the
/// same bus (nested dispatch, connect-from-callback), so the structural
/// lock must tolerate re-acquisition by its owning thread.
#[derive(Default)]
pub struct ReentrantMutex {
    state: Mutex<ReentrantState>,
    unlocked: Condvar,
}

impl ReentrantMutex {
    /// Creates an unlocked mutex.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the mutex, blocking unless the calling thread already owns
    /// it, in which case the hold depth is incremented instead.
    pub fn lock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.depth = 1;
                    return;
                }
                Some(owner) if owner == me => {
                    state.depth += 1;
                    return;
                }
                Some(_) => self.unlocked.wait(&mut state),
            }
        }
    }

    /// Releases one level of ownership; wakes a waiter when the depth
    /// reaches zero. Must be called by the owning thread.
    pub fn unlock(&self) {
        let mut state = self.state.lock();
        debug_assert_eq!(
            state.owner,
            Some(thread::current().id()),
            "ReentrantMutex unlocked by a non-owning thread"
        );
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            state.owner = None;
            self.unlocked.notify_one();
        }
    }

    /// Whether the calling thread currently owns the mutex.
    pub fn is_held_by_current_thread(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }
}

/// The serialization lock of one bus context, present only for
/// thread-safe policies.
pub(crate) struct BusLock {
    mutex: Option<ReentrantMutex>,
}

impl BusLock {
    pub(crate) fn for_policy<L: LockPolicy>() -> Self {
        Self {
            mutex: L::THREAD_SAFE.then(ReentrantMutex::new),
        }
    }

    pub(crate) fn acquire(&self) -> BusLockGuard<'_> {
        if let Some(mutex) = &self.mutex {
            mutex.lock();
        }
        BusLockGuard {
            mutex: self.mutex.as_ref(),
        }
    }
}

/// RAII guard over the bus's structural lock.
///
/// Handed to [`ConnectionPolicy::connected`](crate::ConnectionPolicy::connected)
/// so a policy that calls back into user code can release the lock first.
/// Releasing early is an intentional, caller-decided operation: the policy
/// code, not the guard, judges when it is safe.
pub struct BusLockGuard<'a> {
    mutex: Option<&'a ReentrantMutex>,
}

impl BusLockGuard<'_> {
    /// Releases the lock now instead of at scope exit. Idempotent; a no-op
    /// for [`SingleThreaded`] buses.
    pub fn unlock(&mut self) {
        if let Some(mutex) = self.mutex.take() {
            mutex.unlock();
        }
    }
}

impl Drop for BusLockGuard<'_> {
    fn drop(&mut self) {
        self.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn reentrant_lock_nests_on_one_thread() {
        let mutex = ReentrantMutex::new();
        mutex.lock();
        mutex.lock();
        assert!(mutex.is_held_by_current_thread());
        mutex.unlock();
        assert!(mutex.is_held_by_current_thread());
        mutex.unlock();
        assert!(!mutex.is_held_by_current_thread());
    }

    #[test]
    fn reentrant_lock_excludes_other_threads() {
        let mutex = Arc::new(ReentrantMutex::new());
        let entered = Arc::new(AtomicUsize::new(0));

        mutex.lock();
        let thread_mutex = Arc::clone(&mutex);
        let thread_entered = Arc::clone(&entered);
        let waiter = thread::spawn(move || {
            thread_mutex.lock();
            thread_entered.fetch_add(1, Ordering::SeqCst);
            thread_mutex.unlock();
        });

        thread::sleep(Duration::from_millis(20));
        assert_eq!(entered.load(Ordering::SeqCst), 0);

        mutex.unlock();
        waiter.join().unwrap();
        assert_eq!(entered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn guard_unlock_is_idempotent() {
        let lock = BusLock::for_policy::<Serialized>();
        let mut guard = lock.acquire();
        guard.unlock();
        guard.unlock();
        drop(guard);
        // Re-acquire proves the lock was fully released exactly once.
        drop(lock.acquire());
    }

    #[test]
    fn single_threaded_policy_has_no_mutex() {
        let lock = BusLock::for_policy::<SingleThreaded>();
        let first = lock.acquire();
        let second = lock.acquire();
        drop(first);
        drop(second);
    }
}
