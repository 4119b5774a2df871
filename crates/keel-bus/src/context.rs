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

//! Per-bus-type runtime state and the thread-local dispatch callstack.
//!
//! Every bus type owns exactly one [`Context`], created lazily on first
//! connect, dispatch, or queue operation and held in a process-wide
//! registry keyed by the bus's `TypeId`. The context is reference-counted:
//! [`Context::reset`] drops the registry's reference while any in-flight
//! user of the `Arc` finishes safely.
//!
//! The callstack is an explicit thread-local stack of dispatch frames,
//! pushed and popped (RAII, so it unwinds correctly if a handler panics)
//! around each address's delivery. It backs `current_id`,
//! `is_in_dispatch_this_thread`, and reentrancy detection.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};

use crate::address::AddressTable;
use crate::lock::BusLock;
use crate::policy::Bus;
use crate::queue::QueueState;

/// Shared runtime state of one bus type: the address table, the policy
/// lock, the deferred-call queue, and in-flight dispatch bookkeeping.
pub struct Context<B: Bus> {
    pub(crate) table: RwLock<AddressTable<B>>,
    pub(crate) lock: BusLock,
    pub(crate) queue: Mutex<QueueState>,
    /// Dispatches in progress across all threads.
    pub(crate) dispatches: AtomicUsize,
}

impl<B: Bus> Context<B> {
    fn new() -> Self {
        log::trace!(
            "{}: context created ({:?} addressing, {:?} handlers)",
            B::NAME,
            B::ADDRESSING,
            B::HANDLERS
        );
        Self {
            table: RwLock::new(AddressTable::new()),
            lock: BusLock::for_policy::<B::Lock>(),
            queue: Mutex::new(QueueState::new()),
            dispatches: AtomicUsize::new(0),
        }
    }

    /// The context for `B`, if one has been created.
    pub fn get() -> Option<Arc<Self>> {
        registry()
            .read()
            .get(&TypeId::of::<B>())
            .and_then(|slot| slot.downcast_ref::<Arc<Self>>())
            .map(Arc::clone)
    }

    /// The context for `B`, creating it on first use.
    pub fn get_or_create() -> Arc<Self> {
        if let Some(context) = Self::get() {
            return context;
        }
        let mut map = registry().write();
        if let Some(existing) = map
            .get(&TypeId::of::<B>())
            .and_then(|slot| slot.downcast_ref::<Arc<Self>>())
        {
            return Arc::clone(existing);
        }
        let context = Arc::new(Self::new());
        map.insert(TypeId::of::<B>(), Box::new(Arc::clone(&context)));
        context
    }

    /// Tears down `B`'s context. Every connection is severed, subsequent
    /// operations start from a fresh, empty context, and an in-flight
    /// dispatch still holding the old context delivers nothing further.
    pub fn reset() {
        let removed = registry().write().remove(&TypeId::of::<B>());
        if let Some(slot) = removed {
            if let Ok(context) = slot.downcast::<Arc<Self>>() {
                context.table.write().clear_all();
            }
            log::trace!("{}: context reset", B::NAME);
        }
    }
}

type Registry = RwLock<HashMap<TypeId, Box<dyn Any + Send + Sync>>>;

static CONTEXTS: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    CONTEXTS.get_or_init(Registry::default)
}

/// One in-flight address delivery on this thread.
struct Frame {
    bus: TypeId,
    id: Box<dyn Any + Send>,
}

thread_local! {
    static CALLSTACK: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// Pops the frame on drop, including during unwind from a handler panic.
pub(crate) struct FrameGuard(());

impl Drop for FrameGuard {
    fn drop(&mut self) {
        CALLSTACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

pub(crate) fn push_frame<B: Bus>(id: B::Id) -> FrameGuard {
    CALLSTACK.with(|stack| {
        stack.borrow_mut().push(Frame {
            bus: TypeId::of::<B>(),
            id: Box::new(id),
        });
    });
    FrameGuard(())
}

/// The address id currently being dispatched on this thread, innermost
/// frame first. `None` outside any dispatch of `B`.
pub fn current_id<B: Bus>() -> Option<B::Id> {
    CALLSTACK.with(|stack| {
        stack
            .borrow()
            .iter()
            .rev()
            .find(|frame| frame.bus == TypeId::of::<B>())
            .and_then(|frame| frame.id.downcast_ref::<B::Id>())
            .cloned()
    })
}

/// Whether any dispatch of `B` is active on the calling thread.
pub fn is_in_dispatch_this_thread<B: Bus>() -> bool {
    CALLSTACK.with(|stack| {
        stack
            .borrow()
            .iter()
            .any(|frame| frame.bus == TypeId::of::<B>())
    })
}

/// Whether the calling thread is nested inside two dispatches of `B`
/// targeting the same address id.
///
/// Nesting on a *different* id of the same bus does not count; neither
/// does nesting across different bus types.
pub fn has_reentrant_use_this_thread<B: Bus>() -> bool {
    let bus = TypeId::of::<B>();
    CALLSTACK.with(|stack| {
        let stack = stack.borrow();
        let Some(current) = stack
            .iter()
            .rev()
            .find(|frame| frame.bus == bus)
            .and_then(|frame| frame.id.downcast_ref::<B::Id>())
        else {
            return false;
        };
        stack
            .iter()
            .filter(|frame| frame.bus == bus)
            .filter(|frame| frame.id.downcast_ref::<B::Id>() == Some(current))
            .count()
            >= 2
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect::DefaultConnect;
    use crate::lock::SingleThreaded;
    use crate::policy::{AddressPolicy, HandlerPolicy};

    trait Marker: Send + Sync {}

    struct FrameBusA;
    impl Bus for FrameBusA {
        type Events = dyn Marker;
        type Id = u32;
        type Lock = SingleThreaded;
        type Connection = DefaultConnect;
        const ADDRESSING: AddressPolicy = AddressPolicy::ById;
        const HANDLERS: HandlerPolicy = HandlerPolicy::Multiple;
        const NAME: &'static str = "FrameBusA";
    }

    struct FrameBusB;
    impl Bus for FrameBusB {
        type Events = dyn Marker;
        type Id = u32;
        type Lock = SingleThreaded;
        type Connection = DefaultConnect;
        const ADDRESSING: AddressPolicy = AddressPolicy::ById;
        const HANDLERS: HandlerPolicy = HandlerPolicy::Multiple;
        const NAME: &'static str = "FrameBusB";
    }

    #[test]
    fn callstack_tracks_innermost_frame_per_bus() {
        assert_eq!(current_id::<FrameBusA>(), None);
        {
            let _outer = push_frame::<FrameBusA>(1);
            assert_eq!(current_id::<FrameBusA>(), Some(1));
            assert!(is_in_dispatch_this_thread::<FrameBusA>());
            assert!(!is_in_dispatch_this_thread::<FrameBusB>());
            {
                let _other = push_frame::<FrameBusB>(9);
                // Each bus sees its own innermost frame.
                assert_eq!(current_id::<FrameBusA>(), Some(1));
                assert_eq!(current_id::<FrameBusB>(), Some(9));
            }
            let _inner = push_frame::<FrameBusA>(2);
            assert_eq!(current_id::<FrameBusA>(), Some(2));
        }
        assert_eq!(current_id::<FrameBusA>(), None);
        assert!(!is_in_dispatch_this_thread::<FrameBusA>());
    }

    #[test]
    fn reentrancy_requires_same_bus_and_same_id() {
        assert!(!has_reentrant_use_this_thread::<FrameBusA>());
        let _first = push_frame::<FrameBusA>(4);
        assert!(!has_reentrant_use_this_thread::<FrameBusA>());
        {
            let _different_id = push_frame::<FrameBusA>(5);
            assert!(!has_reentrant_use_this_thread::<FrameBusA>());
        }
        {
            let _different_bus = push_frame::<FrameBusB>(4);
            assert!(!has_reentrant_use_this_thread::<FrameBusB>());
        }
        let _same_id = push_frame::<FrameBusA>(4);
        assert!(has_reentrant_use_this_thread::<FrameBusA>());
    }

    #[test]
    fn frame_pops_during_unwind() {
        let result = std::panic::catch_unwind(|| {
            let _frame = push_frame::<FrameBusA>(1);
            panic!("handler panic");
        });
        assert!(result.is_err());
        assert_eq!(current_id::<FrameBusA>(), None);
    }
}
