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

//! Deferred delivery: a per-context FIFO of bound calls.
//!
//! `queue_broadcast`/`queue_event` capture a dispatch for later;
//! `execute_queued` drains the calls queued strictly before the flush
//! began, in enqueue order, in exactly one pass. A handler that queues
//! further calls during the drain sees them wait for the next flush.
//! Queuing with zero handlers connected is fine; the call flushes as a
//! no-op dispatch.

use std::collections::VecDeque;

use crate::context::Context;
use crate::error::BusError;
use crate::policy::Bus;

pub(crate) type QueuedCall = Box<dyn FnOnce() + Send>;

pub(crate) struct QueueState {
    calls: VecDeque<QueuedCall>,
    allow_functions: bool,
}

impl QueueState {
    pub(crate) fn new() -> Self {
        Self {
            calls: VecDeque::new(),
            allow_functions: true,
        }
    }
}

/// Appends a typed (broadcast/event) call; always permitted.
pub(crate) fn queue_call<B: Bus>(call: QueuedCall) {
    let context = Context::<B>::get_or_create();
    context.queue.lock().calls.push_back(call);
}

/// Appends an arbitrary closure, subject to the function-queuing gate.
///
/// Free-function queuing is a known misuse vector (it bypasses the typed
/// event surface), so it can be switched off per bus; a disallowed call
/// warns and is dropped rather than queued.
pub(crate) fn queue_fn<B: Bus>(call: QueuedCall) {
    let context = Context::<B>::get_or_create();
    let mut queue = context.queue.lock();
    if !queue.allow_functions {
        drop(queue);
        log::warn!(
            "{}; dropping the call",
            BusError::FunctionQueuingDisabled { bus: B::NAME }
        );
        return;
    }
    queue.calls.push_back(call);
}

pub(crate) fn allow_function_queuing<B: Bus>(allowed: bool) {
    Context::<B>::get_or_create().queue.lock().allow_functions = allowed;
}

pub(crate) fn is_function_queuing_allowed<B: Bus>() -> bool {
    Context::<B>::get().map_or(true, |context| context.queue.lock().allow_functions)
}

/// Drains and invokes every call queued before this flush began.
///
/// The queue is swapped out under the lock and executed with the lock
/// released, so handlers may queue, dispatch, connect, and disconnect
/// freely during the drain.
pub(crate) fn execute_queued<B: Bus>() {
    let Some(context) = Context::<B>::get() else {
        return;
    };
    let drained = std::mem::take(&mut context.queue.lock().calls);
    for call in drained {
        call();
    }
}

/// Discards all queued calls without invoking them.
pub(crate) fn clear_queued<B: Bus>() {
    if let Some(context) = Context::<B>::get() {
        let dropped = std::mem::take(&mut context.queue.lock().calls);
        if !dropped.is_empty() {
            log::trace!("{}: cleared {} queued calls", B::NAME, dropped.len());
        }
    }
}

pub(crate) fn queued_count<B: Bus>() -> usize {
    Context::<B>::get().map_or(0, |context| context.queue.lock().calls.len())
}
