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

//! # Keel Bus
//!
//! A statically-configured event-bus dispatch framework. Decoupled
//! components communicate through typed buses addressed globally or by
//! key, with per-bus compile-time policies for handler multiplicity,
//! ordering, locking discipline, and connection side effects, plus a
//! deferred-delivery queue and reentrancy tracking.
//!
//! A bus owns no threads: every dispatch runs synchronously on the
//! calling thread, and concurrency means multiple caller threads
//! contending on the same bus's shared state. Connect, disconnect, and
//! delete during an in-flight dispatch are supported behaviors with
//! defined outcomes, not errors.
//!
//! ```rust
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use std::sync::Arc;
//! use keel_bus::{AddressPolicy, Bus, BusExt, DefaultConnect, HandlerPolicy, Serialized};
//!
//! trait TickEvents: Send + Sync {
//!     fn on_tick(&self, frame: u32);
//! }
//!
//! struct TickBus;
//! impl Bus for TickBus {
//!     type Events = dyn TickEvents;
//!     type Id = ();
//!     type Lock = Serialized;
//!     type Connection = DefaultConnect;
//!     const ADDRESSING: AddressPolicy = AddressPolicy::Single;
//!     const HANDLERS: HandlerPolicy = HandlerPolicy::Multiple;
//!     const NAME: &'static str = "TickBus";
//! }
//!
//! struct FrameCounter(AtomicU32);
//! impl TickEvents for FrameCounter {
//!     fn on_tick(&self, _frame: u32) {
//!         self.0.fetch_add(1, Ordering::Relaxed);
//!     }
//! }
//!
//! let counter = Arc::new(FrameCounter(AtomicU32::new(0)));
//! let token = TickBus::connect(counter.clone(), ()).unwrap();
//! TickBus::broadcast(|h| h.on_tick(1));
//! assert_eq!(counter.0.load(Ordering::Relaxed), 1);
//! TickBus::disconnect(token);
//! # TickBus::reset();
//! ```

#![warn(missing_docs)]

pub mod address;
pub mod connect;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod lock;
pub mod policy;
pub mod queue;
pub mod results;

pub use address::HandlerId;
pub use connect::{ConnectionPolicy, DefaultConnect};
pub use context::Context;
pub use dispatch::BusExt;
pub use error::BusError;
pub use lock::{BusLockGuard, LockPolicy, LocklessDispatch, ReentrantMutex, Serialized, SingleThreaded};
pub use policy::{AddressPolicy, Bus, BusId, HandlerPolicy};
pub use results::{AndResult, CollectAll, LastValue, OrResult, ReduceValue, ResultCollector};
