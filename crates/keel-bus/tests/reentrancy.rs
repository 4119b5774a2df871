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

//! Per-thread dispatch introspection: the callstack behind
//! `current_id`, `is_in_dispatch_this_thread`, and
//! `has_reentrant_use_this_thread`.
//!
//! Reentrancy is scoped to an address: dispatching to id B from inside a
//! dispatch to id A on the same bus is nesting, not reentrancy. Only a
//! second frame for the *same* id trips the detector.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use keel_bus::{AddressPolicy, Bus, BusExt, DefaultConnect, HandlerPolicy, SingleThreaded};

trait DepthEvents: Send + Sync {
    fn probe(&self, depth: u32);
}

struct NestBus;
impl Bus for NestBus {
    type Events = dyn DepthEvents;
    type Id = u32;
    type Lock = SingleThreaded;
    type Connection = DefaultConnect;
    const ADDRESSING: AddressPolicy = AddressPolicy::ById;
    const HANDLERS: HandlerPolicy = HandlerPolicy::Multiple;
    const NAME: &'static str = "ReentryNestBus";
}

#[test]
fn reentrancy_is_false_outside_any_dispatch() {
    struct QuietBus;
    impl Bus for QuietBus {
        type Events = dyn DepthEvents;
        type Id = u32;
        type Lock = SingleThreaded;
        type Connection = DefaultConnect;
        const ADDRESSING: AddressPolicy = AddressPolicy::ById;
        const HANDLERS: HandlerPolicy = HandlerPolicy::Multiple;
        const NAME: &'static str = "QuietBus";
    }

    assert!(!QuietBus::is_in_dispatch_this_thread());
    assert!(!QuietBus::has_reentrant_use_this_thread());
    assert_eq!(QuietBus::current_id(), None);

    QuietBus::reset();
}

#[test]
fn single_level_dispatch_is_not_reentrant() {
    struct FlatBus;
    impl Bus for FlatBus {
        type Events = dyn DepthEvents;
        type Id = u32;
        type Lock = SingleThreaded;
        type Connection = DefaultConnect;
        const ADDRESSING: AddressPolicy = AddressPolicy::ById;
        const HANDLERS: HandlerPolicy = HandlerPolicy::Multiple;
        const NAME: &'static str = "FlatBus";
    }

    struct Flat {
        saw_reentry: AtomicBool,
    }
    impl DepthEvents for Flat {
        fn probe(&self, _depth: u32) {
            assert!(FlatBus::is_in_dispatch_this_thread());
            self.saw_reentry
                .store(FlatBus::has_reentrant_use_this_thread(), Ordering::SeqCst);
        }
    }

    let handler = Arc::new(Flat {
        saw_reentry: AtomicBool::new(false),
    });
    FlatBus::connect(handler.clone(), 5).unwrap();
    FlatBus::event(5, |h| h.probe(0));
    assert!(!handler.saw_reentry.load(Ordering::SeqCst));

    FlatBus::reset();
}

/// Same bus, same id, nested: reentrant. The classic self-call case and
/// the "second event to my own address from inside my handler" case both
/// trip the detector.
#[test]
fn nested_dispatch_to_the_same_id_is_reentrant() {
    struct Nester {
        inner_reentry: AtomicBool,
    }
    impl DepthEvents for Nester {
        fn probe(&self, depth: u32) {
            if depth == 0 {
                assert!(!NestBus::has_reentrant_use_this_thread());
                NestBus::event(7, |h| h.probe(1));
            } else {
                self.inner_reentry
                    .store(NestBus::has_reentrant_use_this_thread(), Ordering::SeqCst);
            }
        }
    }

    let handler = Arc::new(Nester {
        inner_reentry: AtomicBool::new(false),
    });
    NestBus::connect(handler.clone(), 7).unwrap();
    NestBus::event(7, |h| h.probe(0));
    assert!(handler.inner_reentry.load(Ordering::SeqCst));
    assert!(!NestBus::has_reentrant_use_this_thread(), "clears on exit");

    NestBus::reset();
}

/// Same bus, different id, nested: NOT reentrant. Two cooperating
/// addresses calling each other is ordinary layering.
#[test]
fn nested_dispatch_to_a_different_id_is_not_reentrant() {
    struct HopBus;
    impl Bus for HopBus {
        type Events = dyn DepthEvents;
        type Id = u32;
        type Lock = SingleThreaded;
        type Connection = DefaultConnect;
        const ADDRESSING: AddressPolicy = AddressPolicy::ById;
        const HANDLERS: HandlerPolicy = HandlerPolicy::Multiple;
        const NAME: &'static str = "HopBus";
    }

    struct Hopper {
        id: u32,
        inner_reentry: AtomicBool,
    }
    impl DepthEvents for Hopper {
        fn probe(&self, depth: u32) {
            assert_eq!(HopBus::current_id(), Some(self.id));
            if depth == 0 {
                HopBus::event(2, |h| h.probe(1));
            } else {
                self.inner_reentry
                    .store(HopBus::has_reentrant_use_this_thread(), Ordering::SeqCst);
            }
        }
    }

    let outer = Arc::new(Hopper {
        id: 1,
        inner_reentry: AtomicBool::new(false),
    });
    let inner = Arc::new(Hopper {
        id: 2,
        inner_reentry: AtomicBool::new(false),
    });
    HopBus::connect(outer.clone(), 1).unwrap();
    HopBus::connect(inner.clone(), 2).unwrap();

    HopBus::event(1, |h| h.probe(0));
    assert!(!inner.inner_reentry.load(Ordering::SeqCst));

    HopBus::reset();
}

/// Different bus types never see each other's frames, even with identical
/// id values in flight.
#[test]
fn reentrancy_tracking_is_independent_per_bus_type() {
    struct AlphaBus;
    impl Bus for AlphaBus {
        type Events = dyn DepthEvents;
        type Id = u32;
        type Lock = SingleThreaded;
        type Connection = DefaultConnect;
        const ADDRESSING: AddressPolicy = AddressPolicy::ById;
        const HANDLERS: HandlerPolicy = HandlerPolicy::Multiple;
        const NAME: &'static str = "AlphaBus";
    }
    struct BetaBus;
    impl Bus for BetaBus {
        type Events = dyn DepthEvents;
        type Id = u32;
        type Lock = SingleThreaded;
        type Connection = DefaultConnect;
        const ADDRESSING: AddressPolicy = AddressPolicy::ById;
        const HANDLERS: HandlerPolicy = HandlerPolicy::Multiple;
        const NAME: &'static str = "BetaBus";
    }

    struct BetaProbe {
        crossed: AtomicBool,
    }
    impl DepthEvents for BetaProbe {
        fn probe(&self, _depth: u32) {
            assert!(BetaBus::is_in_dispatch_this_thread());
            assert!(!BetaBus::has_reentrant_use_this_thread());
            // Alpha's frame is below us on this thread but belongs to a
            // different bus.
            assert!(AlphaBus::is_in_dispatch_this_thread());
            assert!(!AlphaBus::has_reentrant_use_this_thread());
            self.crossed.store(true, Ordering::SeqCst);
        }
    }

    struct AlphaProbe;
    impl DepthEvents for AlphaProbe {
        fn probe(&self, _depth: u32) {
            BetaBus::event(3, |h| h.probe(1));
        }
    }

    let beta = Arc::new(BetaProbe {
        crossed: AtomicBool::new(false),
    });
    AlphaBus::connect(Arc::new(AlphaProbe), 3).unwrap();
    BetaBus::connect(beta.clone(), 3).unwrap();

    AlphaBus::event(3, |h| h.probe(0));
    assert!(beta.crossed.load(Ordering::SeqCst));

    AlphaBus::reset();
    BetaBus::reset();
}

#[test]
fn current_id_tracks_the_innermost_frame() {
    struct DeepBus;
    impl Bus for DeepBus {
        type Events = dyn DepthEvents;
        type Id = u32;
        type Lock = SingleThreaded;
        type Connection = DefaultConnect;
        const ADDRESSING: AddressPolicy = AddressPolicy::ById;
        const HANDLERS: HandlerPolicy = HandlerPolicy::Multiple;
        const NAME: &'static str = "DeepBus";
    }

    struct Outer;
    impl DepthEvents for Outer {
        fn probe(&self, depth: u32) {
            if depth == 0 {
                assert_eq!(DeepBus::current_id(), Some(10));
                DeepBus::event(20, |h| h.probe(1));
                // The inner frame popped; we are innermost again.
                assert_eq!(DeepBus::current_id(), Some(10));
            } else {
                assert_eq!(DeepBus::current_id(), Some(20));
            }
        }
    }

    let handler = Arc::new(Outer);
    DeepBus::connect(handler.clone(), 10).unwrap();
    DeepBus::connect(handler, 20).unwrap();

    DeepBus::event(10, |h| h.probe(0));
    assert_eq!(DeepBus::current_id(), None);

    DeepBus::reset();
}
