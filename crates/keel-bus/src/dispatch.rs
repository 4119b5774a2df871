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

//! Dispatch: immediate fan-out of a call to connected handlers, and the
//! [`BusExt`] trait carrying the whole static API surface of a bus.
//!
//! Delivery snapshots the target slots under a short read lock, then
//! invokes each handler with the table unlocked, revalidating the
//! handler's connection token immediately before its call. That gives the
//! mutation-during-dispatch contract:
//!
//! - a handler connected during a dispatch is not visited by it;
//! - a not-yet-visited handler (or a whole address) disconnected
//!   mid-dispatch is skipped;
//! - removing an already-visited handler has no effect on the pass;
//! - a handler may disconnect itself from its own callback, and the
//!   snapshot's strong reference keeps it alive to the end of that call.
//!
//! Under the [`Serialized`](crate::Serialized) policy the bus lock is
//! additionally held for the whole dispatch, so structural mutation from
//! other threads waits; under
//! [`LocklessDispatch`](crate::LocklessDispatch) delivery proceeds
//! without it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::address::HandlerId;
use crate::connect;
use crate::context::{self, Context};
use crate::error::BusError;
use crate::lock::LockPolicy;
use crate::policy::Bus;
use crate::queue;
use crate::results::ResultCollector;

/// Increments the context's in-flight dispatch counter for its lifetime.
struct DispatchGuard<'a>(&'a AtomicUsize);

impl<'a> DispatchGuard<'a> {
    fn begin(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Delivers `f` to every live handler at `id`. `emit` receives each return
/// value and may stop the pass early by returning `false`.
fn dispatch_at<B, R, F, E>(id: B::Id, reverse: bool, mut f: F, mut emit: E)
where
    B: Bus,
    F: FnMut(&B::Events) -> R,
    E: FnMut(R) -> bool,
{
    let Some(ctx) = Context::<B>::get() else {
        return;
    };
    let _lock = (!<B::Lock as LockPolicy>::LOCKLESS_DISPATCH).then(|| ctx.lock.acquire());
    let snapshot = ctx.table.read().snapshot_at(&id, reverse);
    if snapshot.is_empty() {
        return;
    }
    let _in_flight = DispatchGuard::begin(&ctx.dispatches);
    let _frame = context::push_frame::<B>(id);
    for (token, handler) in snapshot {
        if !ctx.table.read().contains(token) {
            continue;
        }
        if !emit(f(handler.as_ref())) {
            break;
        }
    }
}

/// Delivers `f` to every live handler at every address.
fn dispatch_all<B, R, F, E>(reverse: bool, mut f: F, mut emit: E)
where
    B: Bus,
    F: FnMut(&B::Events) -> R,
    E: FnMut(R) -> bool,
{
    let Some(ctx) = Context::<B>::get() else {
        return;
    };
    let _lock = (!<B::Lock as LockPolicy>::LOCKLESS_DISPATCH).then(|| ctx.lock.acquire());
    let snapshot = ctx.table.read().snapshot_all(reverse);
    if snapshot.is_empty() {
        return;
    }
    let _in_flight = DispatchGuard::begin(&ctx.dispatches);
    'addresses: for (id, slots) in snapshot {
        let _frame = context::push_frame::<B>(id);
        for (token, handler) in slots {
            if !ctx.table.read().contains(token) {
                continue;
            }
            if !emit(f(handler.as_ref())) {
                break 'addresses;
            }
        }
    }
}

/// The full operation surface of a bus, blanket-implemented for every
/// [`Bus`] so operations read as associated functions of the marker type:
/// `MyBus::broadcast(|h| h.on_tick())`.
pub trait BusExt: Bus {
    // --- connection lifecycle ---

    /// Connects `handler` at `id`. Fails only for an occupied
    /// single-handler address.
    fn connect(handler: Arc<Self::Events>, id: Self::Id) -> Result<HandlerId, BusError> {
        connect::connect::<Self>(handler, id, 0)
    }

    /// Connects with a user ordering key; handlers at one address of a
    /// [`HandlerPolicy::MultipleOrdered`](crate::HandlerPolicy::MultipleOrdered)
    /// bus dispatch in ascending key order, ties in insertion order.
    fn connect_ordered(
        handler: Arc<Self::Events>,
        id: Self::Id,
        order: i64,
    ) -> Result<HandlerId, BusError> {
        connect::connect::<Self>(handler, id, order)
    }

    /// Disconnects one connection token. Returns `false` (a no-op) if it
    /// is already disconnected. Safe to call from inside a dispatch,
    /// including from the handler being disconnected.
    fn disconnect(token: HandlerId) -> bool {
        connect::disconnect::<Self>(token)
    }

    /// Disconnects every handler at `id` in one operation, running the
    /// connection policy's disconnect hook for each. Returns the number
    /// of connections severed; 0 for an empty or unknown address.
    fn disconnect_all_at(id: &Self::Id) -> usize {
        connect::disconnect_all_at::<Self>(id)
    }

    /// Whether a connection token is currently connected.
    fn is_connected(token: HandlerId) -> bool {
        connect::is_connected::<Self>(token)
    }

    // --- immediate dispatch ---

    /// Invokes `f` on every handler at every address, addresses in
    /// ascending id order.
    fn broadcast(f: impl FnMut(&Self::Events)) {
        let mut f = f;
        dispatch_all::<Self, (), _, _>(false, |h| f(h), |()| true);
    }

    /// [`broadcast`](Self::broadcast) with address order and per-address
    /// handler order both reversed.
    fn broadcast_reverse(f: impl FnMut(&Self::Events)) {
        let mut f = f;
        dispatch_all::<Self, (), _, _>(true, |h| f(h), |()| true);
    }

    /// Invokes `f` on every handler at `id`; a silent no-op when the
    /// address has no handlers.
    fn event(id: Self::Id, f: impl FnMut(&Self::Events)) {
        let mut f = f;
        dispatch_at::<Self, (), _, _>(id, false, |h| f(h), |()| true);
    }

    /// [`event`](Self::event) in reversed handler order.
    fn event_reverse(id: Self::Id, f: impl FnMut(&Self::Events)) {
        let mut f = f;
        dispatch_at::<Self, (), _, _>(id, true, |h| f(h), |()| true);
    }

    /// Broadcast capturing each handler's return value into `collector`.
    fn broadcast_result<R>(collector: &mut impl ResultCollector<R>, f: impl FnMut(&Self::Events) -> R) {
        let mut f = f;
        dispatch_all::<Self, R, _, _>(false, |h| f(h), |r| {
            collector.combine(r);
            true
        });
    }

    /// Reverse-order [`broadcast_result`](Self::broadcast_result).
    fn broadcast_result_reverse<R>(
        collector: &mut impl ResultCollector<R>,
        f: impl FnMut(&Self::Events) -> R,
    ) {
        let mut f = f;
        dispatch_all::<Self, R, _, _>(true, |h| f(h), |r| {
            collector.combine(r);
            true
        });
    }

    /// Addressed dispatch capturing each handler's return value into
    /// `collector`. Leaves it untouched when the address is empty.
    fn event_result<R>(
        collector: &mut impl ResultCollector<R>,
        id: Self::Id,
        f: impl FnMut(&Self::Events) -> R,
    ) {
        let mut f = f;
        dispatch_at::<Self, R, _, _>(id, false, |h| f(h), |r| {
            collector.combine(r);
            true
        });
    }

    /// Reverse-order [`event_result`](Self::event_result).
    fn event_result_reverse<R>(
        collector: &mut impl ResultCollector<R>,
        id: Self::Id,
        f: impl FnMut(&Self::Events) -> R,
    ) {
        let mut f = f;
        dispatch_at::<Self, R, _, _>(id, true, |h| f(h), |r| {
            collector.combine(r);
            true
        });
    }

    /// Visits every handler without dispatching an event. The visitor
    /// returns `false` to stop early, and may disconnect the handler it
    /// is currently visiting.
    fn enumerate_handlers(visitor: impl FnMut(&Self::Events) -> bool) {
        let mut visitor = visitor;
        dispatch_all::<Self, bool, _, _>(false, |h| visitor(h), |keep_going| keep_going);
    }

    /// [`enumerate_handlers`](Self::enumerate_handlers) restricted to one
    /// address.
    fn enumerate_handlers_at(id: Self::Id, visitor: impl FnMut(&Self::Events) -> bool) {
        let mut visitor = visitor;
        dispatch_at::<Self, bool, _, _>(id, false, |h| visitor(h), |keep_going| keep_going);
    }

    /// The first handler at `id` without invoking it; `None` if the
    /// address is empty.
    fn find_first_handler(id: &Self::Id) -> Option<Arc<Self::Events>> {
        Context::<Self>::get().and_then(|ctx| ctx.table.read().first_at(id))
    }

    // --- existence and count queries ---

    /// Whether any handler is connected anywhere on the bus.
    fn has_handlers() -> bool {
        Context::<Self>::get().is_some_and(|ctx| ctx.table.read().has_any())
    }

    /// Whether any handler is connected at `id`.
    fn has_handlers_at(id: &Self::Id) -> bool {
        Context::<Self>::get().is_some_and(|ctx| ctx.table.read().has_at(id))
    }

    /// Total number of connections across all addresses.
    fn total_handlers() -> usize {
        Context::<Self>::get().map_or(0, |ctx| ctx.table.read().total())
    }

    // --- dispatch-state queries ---

    /// The address id currently being dispatched on this thread; `None`
    /// outside any callback invoked by this bus. Nested dispatches each
    /// see their own id.
    fn current_id() -> Option<Self::Id> {
        context::current_id::<Self>()
    }

    /// Whether any dispatch of this bus is in flight on any thread.
    fn is_in_dispatch() -> bool {
        Context::<Self>::get().is_some_and(|ctx| ctx.dispatches.load(Ordering::Relaxed) > 0)
    }

    /// Whether any dispatch of this bus is active on the calling thread.
    fn is_in_dispatch_this_thread() -> bool {
        context::is_in_dispatch_this_thread::<Self>()
    }

    /// Whether the calling thread is nested inside two dispatches of this
    /// bus targeting the same address id. Nested use on a different id,
    /// or on a different bus type, does not count.
    fn has_reentrant_use_this_thread() -> bool {
        context::has_reentrant_use_this_thread::<Self>()
    }

    // --- deferred delivery ---

    /// Queues a broadcast for the next [`execute_queued`](Self::execute_queued).
    /// Permitted with zero handlers connected.
    fn queue_broadcast(f: impl Fn(&Self::Events) + Send + 'static) {
        queue::queue_call::<Self>(Box::new(move || Self::broadcast(|h| f(h))));
    }

    /// Queues a reverse-order broadcast.
    fn queue_broadcast_reverse(f: impl Fn(&Self::Events) + Send + 'static) {
        queue::queue_call::<Self>(Box::new(move || Self::broadcast_reverse(|h| f(h))));
    }

    /// Queues an addressed dispatch for the next flush.
    fn queue_event(id: Self::Id, f: impl Fn(&Self::Events) + Send + 'static) {
        queue::queue_call::<Self>(Box::new(move || Self::event(id, |h| f(h))));
    }

    /// Queues a reverse-order addressed dispatch.
    fn queue_event_reverse(id: Self::Id, f: impl Fn(&Self::Events) + Send + 'static) {
        queue::queue_call::<Self>(Box::new(move || Self::event_reverse(id, |h| f(h))));
    }

    /// Queues an arbitrary closure on this bus's queue, e.g. a deferred
    /// disconnect. Subject to [`allow_function_queuing`](Self::allow_function_queuing):
    /// when disabled, the call is dropped with a warning instead of queued.
    fn queue_fn(f: impl FnOnce() + Send + 'static) {
        queue::queue_fn::<Self>(Box::new(f));
    }

    /// Enables or disables [`queue_fn`](Self::queue_fn). Typed event and
    /// broadcast queuing is never affected.
    fn allow_function_queuing(allowed: bool) {
        queue::allow_function_queuing::<Self>(allowed);
    }

    /// Whether [`queue_fn`](Self::queue_fn) is currently permitted.
    fn is_function_queuing_allowed() -> bool {
        queue::is_function_queuing_allowed::<Self>()
    }

    /// Executes every call queued strictly before this flush began, in
    /// enqueue order; calls queued during the drain wait for the next
    /// flush.
    fn execute_queued() {
        queue::execute_queued::<Self>();
    }

    /// Discards all queued calls without executing them.
    fn clear_queued() {
        queue::clear_queued::<Self>();
    }

    /// Number of calls currently queued.
    fn queued_count() -> usize {
        queue::queued_count::<Self>()
    }

    // --- teardown ---

    /// Drops the process-wide context of this bus: all connections and
    /// queued calls vanish, and the next operation starts fresh. In-flight
    /// users of the old context finish safely.
    fn reset() {
        Context::<Self>::reset();
    }
}

impl<B: Bus> BusExt for B {}
