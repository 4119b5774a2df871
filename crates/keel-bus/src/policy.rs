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

//! Compile-time bus configuration.
//!
//! A bus is a zero-sized marker type implementing [`Bus`]. The associated
//! types and constants select the address scheme, handler multiplicity,
//! locking discipline, and connection hooks for that bus, so the dispatch
//! hot path is fixed at compile time rather than branched at runtime.
//!
//! # Example
//!
//! ```rust
//! use keel_bus::{AddressPolicy, Bus, DefaultConnect, HandlerPolicy, Serialized};
//!
//! trait DoorEvents: Send + Sync {
//!     fn on_opened(&self);
//! }
//!
//! struct DoorBus;
//!
//! impl Bus for DoorBus {
//!     type Events = dyn DoorEvents;
//!     type Id = u32;
//!     type Lock = Serialized;
//!     type Connection = DefaultConnect;
//!     const ADDRESSING: AddressPolicy = AddressPolicy::ById;
//!     const HANDLERS: HandlerPolicy = HandlerPolicy::Multiple;
//!     const NAME: &'static str = "DoorBus";
//! }
//! ```

use std::fmt;
use std::hash::Hash;

use crate::connect::ConnectionPolicy;
use crate::lock::LockPolicy;

/// Key type selecting which address of a bus a handler listens on.
///
/// `()` is the degenerate id for single-address buses. `Ord` is required so
/// that ordered addressing ([`AddressPolicy::ByIdOrdered`]) can visit
/// addresses in ascending key order during a broadcast.
pub trait BusId: Clone + Eq + Ord + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T: Clone + Eq + Ord + Hash + fmt::Debug + Send + Sync + 'static> BusId for T {}

/// How many addresses a bus exposes, and whether their order is contractual.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressPolicy {
    /// One implicit address shared by every handler; the id type is `()`.
    Single,
    /// Many addresses keyed by [`Bus::Id`]; broadcast visitation order
    /// across addresses is unspecified.
    ///
    /// The shared address container happens to yield ascending id order
    /// here too, which is permitted (any order is); only
    /// [`ByIdOrdered`](Self::ByIdOrdered) makes that order contractual,
    /// so code relying on it under `ById` is relying on an
    /// implementation detail.
    ById,
    /// Many addresses keyed by [`Bus::Id`], visited in ascending id order
    /// by `broadcast` and descending order by `broadcast_reverse`.
    ByIdOrdered,
}

/// How many handlers one address accepts, and whether their order is
/// contractual.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerPolicy {
    /// At most one handler per address; connecting to an occupied address
    /// fails and leaves the original handler in place.
    Single,
    /// Any number of handlers; visitation order is not contractual.
    Multiple,
    /// Any number of handlers, visited in ascending user-supplied order
    /// key. Equal keys dispatch in stable insertion order.
    MultipleOrdered,
}

/// A statically-configured event bus definition.
///
/// Implement this on a zero-sized marker type; all operations are then
/// reached as associated functions through [`BusExt`](crate::BusExt),
/// e.g. `DoorBus::broadcast(|h| h.on_opened())`.
pub trait Bus: Sized + 'static {
    /// The handler interface, typically a trait object (`dyn MyEvents`).
    ///
    /// Event methods take `&self`; handlers use interior mutability for
    /// any state they update during dispatch.
    type Events: ?Sized + Send + Sync;

    /// The address key. Use `()` when `ADDRESSING` is
    /// [`AddressPolicy::Single`].
    type Id: BusId;

    /// The locking discipline for structural mutation and dispatch.
    type Lock: LockPolicy;

    /// Hooks invoked exactly once per connect and disconnect.
    type Connection: ConnectionPolicy<Self>;

    /// Address scheme for this bus.
    const ADDRESSING: AddressPolicy;

    /// Handler multiplicity per address.
    const HANDLERS: HandlerPolicy;

    /// Name used in diagnostics and log output.
    const NAME: &'static str;
}
