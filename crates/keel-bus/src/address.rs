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

//! Per-bus handler storage: the address table.
//!
//! Each connection is a slot binding one handler reference to one address,
//! identified by a process-unique [`HandlerId`] token. Dispatch never
//! iterates the table directly; it takes a snapshot of `(token, handler)`
//! pairs and revalidates each token against the live table before the
//! call, which is what makes connect/disconnect during dispatch safe.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::BusError;
use crate::policy::{Bus, HandlerPolicy};

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque token for one connection of one handler to one address.
///
/// Returned by [`connect`](crate::BusExt::connect); required to
/// disconnect. A handler connected at several addresses holds one token
/// per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerId(u64);

impl HandlerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// One registration record: a handler bound to an address.
pub(crate) struct HandlerSlot<B: Bus> {
    pub(crate) id: HandlerId,
    pub(crate) handler: Arc<B::Events>,
    /// User-supplied ordering key; 0 unless connected via `connect_ordered`.
    pub(crate) order: i64,
    /// Insertion sequence, the documented tie-break for equal order keys.
    pub(crate) seq: u64,
}

/// The handler set of a single address.
pub(crate) struct AddressEntry<B: Bus> {
    pub(crate) slots: Vec<HandlerSlot<B>>,
}

impl<B: Bus> Default for AddressEntry<B> {
    fn default() -> Self {
        Self { slots: Vec::new() }
    }
}

/// Mapping from address id to its handler set, plus a reverse index from
/// connection token to address for O(1) disconnect and liveness checks.
///
/// A `BTreeMap` keeps addresses in ascending id order, which is the
/// contractual broadcast order for ordered addressing and a harmless
/// deterministic order otherwise.
pub(crate) struct AddressTable<B: Bus> {
    entries: BTreeMap<B::Id, AddressEntry<B>>,
    index: HashMap<HandlerId, B::Id>,
    next_seq: u64,
}

impl<B: Bus> AddressTable<B> {
    pub(crate) fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            index: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Inserts a handler at `id`. Fails for a single-handler address that
    /// is already occupied; the incumbent stays the sole responder.
    pub(crate) fn insert(
        &mut self,
        id: B::Id,
        handler: Arc<B::Events>,
        order: i64,
    ) -> Result<HandlerId, BusError> {
        if B::HANDLERS == HandlerPolicy::Single {
            if let Some(entry) = self.entries.get(&id) {
                if !entry.slots.is_empty() {
                    log::error!(
                        "{}: rejected connect at {:?}: address already has a handler",
                        B::NAME,
                        id
                    );
                    return Err(BusError::AddressOccupied { bus: B::NAME });
                }
            }
        }

        let token = HandlerId::next();
        let seq = self.next_seq;
        self.next_seq += 1;
        let slot = HandlerSlot {
            id: token,
            handler,
            order,
            seq,
        };

        let entry = self.entries.entry(id.clone()).or_default();
        match B::HANDLERS {
            HandlerPolicy::MultipleOrdered => {
                let at = entry
                    .slots
                    .partition_point(|s| (s.order, s.seq) <= (order, seq));
                entry.slots.insert(at, slot);
            }
            _ => entry.slots.push(slot),
        }
        self.index.insert(token, id);
        Ok(token)
    }

    /// Removes one connection. Returns the address and handler it was
    /// bound to, or `None` if the token is not connected.
    pub(crate) fn remove(&mut self, token: HandlerId) -> Option<(B::Id, Arc<B::Events>)> {
        let id = self.index.remove(&token)?;
        let entry = self.entries.get_mut(&id)?;
        let at = entry.slots.iter().position(|s| s.id == token)?;
        let slot = entry.slots.remove(at);
        if entry.slots.is_empty() {
            self.entries.remove(&id);
        }
        Some((id, slot.handler))
    }

    pub(crate) fn contains(&self, token: HandlerId) -> bool {
        self.index.contains_key(&token)
    }

    pub(crate) fn has_any(&self) -> bool {
        !self.index.is_empty()
    }

    pub(crate) fn has_at(&self, id: &B::Id) -> bool {
        self.entries.get(id).is_some_and(|e| !e.slots.is_empty())
    }

    pub(crate) fn total(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn first_at(&self, id: &B::Id) -> Option<Arc<B::Events>> {
        self.entries
            .get(id)
            .and_then(|e| e.slots.first())
            .map(|s| Arc::clone(&s.handler))
    }

    pub(crate) fn clear_all(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    /// Removes every handler at one address, pruning the entry and its
    /// index rows. Returns the severed connections for lifecycle hooks.
    pub(crate) fn clear_at(&mut self, id: &B::Id) -> Vec<(HandlerId, Arc<B::Events>)> {
        let Some(entry) = self.entries.remove(id) else {
            return Vec::new();
        };
        entry
            .slots
            .into_iter()
            .map(|slot| {
                self.index.remove(&slot.id);
                (slot.id, slot.handler)
            })
            .collect()
    }

    /// Snapshot of one address's handlers in dispatch order.
    pub(crate) fn snapshot_at(
        &self,
        id: &B::Id,
        reverse: bool,
    ) -> Vec<(HandlerId, Arc<B::Events>)> {
        let Some(entry) = self.entries.get(id) else {
            return Vec::new();
        };
        let mut slots: Vec<_> = entry
            .slots
            .iter()
            .map(|s| (s.id, Arc::clone(&s.handler)))
            .collect();
        if reverse {
            slots.reverse();
        }
        slots
    }

    /// Snapshot of every address in dispatch order. `reverse` flips both
    /// the address order and the handler order within each address.
    pub(crate) fn snapshot_all(
        &self,
        reverse: bool,
    ) -> Vec<(B::Id, Vec<(HandlerId, Arc<B::Events>)>)> {
        let mut addresses: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.slots.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        if reverse {
            addresses.reverse();
        }
        addresses
            .into_iter()
            .map(|id| {
                let slots = self.snapshot_at(&id, reverse);
                (id, slots)
            })
            .collect()
    }
}
