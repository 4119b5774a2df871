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

//! Return-value aggregation for `broadcast_result` / `event_result`.
//!
//! A [`ResultCollector`] receives each handler's return value in dispatch
//! order. Values arrive by move, so combining can never touch a handler's
//! own stored state: a collector that consumes its input corrupts nothing
//! upstream.

/// Combines the return values of a result-capturing dispatch.
pub trait ResultCollector<T> {
    /// Fold one handler's return value into the collected state.
    fn combine(&mut self, value: T);
}

/// Keeps only the most recent value: the default overwrite-with-last
/// policy. `None` until the first handler responds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastValue<T>(pub Option<T>);

impl<T> LastValue<T> {
    /// An empty collector.
    pub fn new() -> Self {
        Self(None)
    }
}

// Manual impl: the collector starts empty, so `T` itself need not be
// `Default`.
impl<T> Default for LastValue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResultCollector<T> for LastValue<T> {
    fn combine(&mut self, value: T) {
        self.0 = Some(value);
    }
}

/// Logical AND over `bool` results. Seed with `true` for the usual
/// "all handlers agree" query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AndResult(pub bool);

impl ResultCollector<bool> for AndResult {
    fn combine(&mut self, value: bool) {
        self.0 = self.0 && value;
    }
}

/// Logical OR over `bool` results. Seed with `false` for the usual
/// "any handler responded" query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrResult(pub bool);

impl ResultCollector<bool> for OrResult {
    fn combine(&mut self, value: bool) {
        self.0 = self.0 || value;
    }
}

/// A seed value folded with each result through a binary reduction.
#[derive(Debug, Clone)]
pub struct ReduceValue<T, F> {
    /// The accumulated value.
    pub value: T,
    op: F,
}

impl<T, F: FnMut(&mut T, T)> ReduceValue<T, F> {
    /// A collector starting at `seed` and folding with `op`.
    pub fn new(seed: T, op: F) -> Self {
        Self { value: seed, op }
    }
}

impl<T, F: FnMut(&mut T, T)> ResultCollector<T> for ReduceValue<T, F> {
    fn combine(&mut self, value: T) {
        (self.op)(&mut self.value, value);
    }
}

/// Collects every result in dispatch order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectAll<T>(pub Vec<T>);

impl<T> CollectAll<T> {
    /// An empty collector.
    pub fn new() -> Self {
        Self(Vec::new())
    }
}

impl<T> Default for CollectAll<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResultCollector<T> for CollectAll<T> {
    fn combine(&mut self, value: T) {
        self.0.push(value);
    }
}
