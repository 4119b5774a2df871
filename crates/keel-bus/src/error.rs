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

//! Error types for bus misuse.
//!
//! The framework has no failure modes for legitimate "nothing to do" cases:
//! dispatching to an empty address, disconnecting an already-disconnected
//! handler, and flushing an empty queue are all silent no-ops. The variants
//! here cover the programming errors the original design diagnosed with
//! asserts.

use thiserror::Error;

/// A bus misuse diagnosed at the call site.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// A single-handler address already has a handler connected. The
    /// original handler remains the sole responder.
    #[error("bus `{bus}` allows one handler per address and the address is already occupied")]
    AddressOccupied {
        /// The diagnostic name of the bus.
        bus: &'static str,
    },

    /// Free-function queuing was disabled via `allow_function_queuing(false)`.
    #[error("function queuing is disabled on bus `{bus}`")]
    FunctionQueuingDisabled {
        /// The diagnostic name of the bus.
        bus: &'static str,
    },
}
