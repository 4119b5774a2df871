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

//! Connection lifecycle: connect, disconnect, and the pluggable
//! [`ConnectionPolicy`] invoked exactly once on each transition.
//!
//! The state machine per connection token is
//! `Disconnected -> (connect) -> Connected -> (disconnect) -> Disconnected`;
//! disconnecting an already-disconnected token is a no-op.

use std::sync::Arc;

use crate::address::HandlerId;
use crate::context::Context;
use crate::error::BusError;
use crate::lock::BusLockGuard;
use crate::policy::Bus;

/// Hooks customizing a bus's connect/disconnect side effects.
///
/// [`connected`](Self::connected) runs with the bus's structural lock held
/// and may call back into the handler synchronously, e.g. to deliver an
/// immediate "you just connected" notification. A policy whose callback
/// may itself connect handlers, dispatch, or block on another thread's
/// connect should release the guard first via
/// [`BusLockGuard::unlock`]; the policy, not the framework, decides when
/// that is safe.
pub trait ConnectionPolicy<B: Bus>: 'static {
    /// Invoked once after the handler is inserted into the address table.
    ///
    /// `token` is the connection just made; forwarding it to the handler
    /// lets the handler disconnect itself from inside the notification.
    fn connected(
        handler: &Arc<B::Events>,
        token: HandlerId,
        id: &B::Id,
        lock: &mut BusLockGuard<'_>,
    ) {
        let _ = (handler, token, id, lock);
    }

    /// Invoked once after the handler is removed from the address table.
    fn disconnected(handler: &Arc<B::Events>, token: HandlerId, id: &B::Id) {
        let _ = (handler, token, id);
    }
}

/// The no-op policy; connect and disconnect have no side effects beyond
/// the table mutation itself.
pub struct DefaultConnect;

impl<B: Bus> ConnectionPolicy<B> for DefaultConnect {}

pub(crate) fn connect<B: Bus>(
    handler: Arc<B::Events>,
    id: B::Id,
    order: i64,
) -> Result<HandlerId, BusError> {
    let context = Context::<B>::get_or_create();
    let mut guard = context.lock.acquire();
    let token = context.table.write().insert(id.clone(), Arc::clone(&handler), order)?;
    log::trace!("{}: connected {:?} at {:?}", B::NAME, token, id);
    B::Connection::connected(&handler, token, &id, &mut guard);
    Ok(token)
}

pub(crate) fn disconnect<B: Bus>(token: HandlerId) -> bool {
    let Some(context) = Context::<B>::get() else {
        return false;
    };
    let _guard = context.lock.acquire();
    let removed = context.table.write().remove(token);
    match removed {
        Some((id, handler)) => {
            log::trace!("{}: disconnected {:?} from {:?}", B::NAME, token, id);
            B::Connection::disconnected(&handler, token, &id);
            true
        }
        None => false,
    }
}

/// Severs every connection at one address. Returns the number removed.
pub(crate) fn disconnect_all_at<B: Bus>(id: &B::Id) -> usize {
    let Some(context) = Context::<B>::get() else {
        return 0;
    };
    let _guard = context.lock.acquire();
    let removed = context.table.write().clear_at(id);
    if !removed.is_empty() {
        log::trace!("{}: cleared {} handlers at {:?}", B::NAME, removed.len(), id);
    }
    for (token, handler) in &removed {
        B::Connection::disconnected(handler, *token, id);
    }
    removed.len()
}

pub(crate) fn is_connected<B: Bus>(token: HandlerId) -> bool {
    Context::<B>::get().is_some_and(|context| context.table.read().contains(token))
}
