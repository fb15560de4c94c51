// Non-blocking network I/O framework with filter-chain pipelines
//
// SPDX-License-Identifier: Apache-2.0
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

use std::sync::Arc;

use parking_lot::RwLock;

use super::{FilterChain, IoFilter};
use crate::Error;

/// Populates the filter chain of every new session of a service.
pub trait FilterChainBuilder: Send + Sync + 'static {
    fn build_chain(&self, chain: &FilterChain) -> Result<(), Error>;
}

/// Shared, mutable template of filters copied into every new session chain,
/// in order. Changes affect only sessions created afterwards.
#[derive(Default)]
pub struct DefaultFilterChainBuilder {
    entries: RwLock<Vec<(String, Arc<dyn IoFilter>)>>,
}

impl DefaultFilterChainBuilder {
    pub fn new() -> Self { default!() }

    fn position(entries: &[(String, Arc<dyn IoFilter>)], name: &str) -> Result<usize, Error> {
        entries
            .iter()
            .position(|(n, _)| n == name)
            .ok_or_else(|| Error::UnknownFilter(name.to_owned()))
    }

    fn insert(
        &self,
        at: impl FnOnce(&[(String, Arc<dyn IoFilter>)]) -> Result<usize, Error>,
        name: String,
        filter: Arc<dyn IoFilter>,
    ) -> Result<(), Error> {
        let mut entries = self.entries.write();
        if entries.iter().any(|(n, _)| *n == name) {
            return Err(Error::DuplicateFilter(name));
        }
        let at = at(&entries)?;
        entries.insert(at, (name, filter));
        Ok(())
    }

    pub fn add_first(&self, name: impl Into<String>, filter: Arc<dyn IoFilter>) -> Result<(), Error> {
        self.insert(|_| Ok(0), name.into(), filter)
    }

    pub fn add_last(&self, name: impl Into<String>, filter: Arc<dyn IoFilter>) -> Result<(), Error> {
        self.insert(|entries| Ok(entries.len()), name.into(), filter)
    }

    pub fn add_before(&self, base: &str, name: impl Into<String>, filter: Arc<dyn IoFilter>) -> Result<(), Error> {
        self.insert(|entries| Self::position(entries, base), name.into(), filter)
    }

    pub fn add_after(&self, base: &str, name: impl Into<String>, filter: Arc<dyn IoFilter>) -> Result<(), Error> {
        self.insert(|entries| Self::position(entries, base).map(|pos| pos + 1), name.into(), filter)
    }

    pub fn remove(&self, name: &str) -> Result<Arc<dyn IoFilter>, Error> {
        let mut entries = self.entries.write();
        let at = Self::position(&entries, name)?;
        Ok(entries.remove(at).1)
    }

    pub fn replace(&self, name: &str, filter: Arc<dyn IoFilter>) -> Result<Arc<dyn IoFilter>, Error> {
        let mut entries = self.entries.write();
        let at = Self::position(&entries, name)?;
        Ok(std::mem::replace(&mut entries[at].1, filter))
    }

    pub fn clear(&self) { self.entries.write().clear() }

    pub fn names(&self) -> Vec<String> { self.entries.read().iter().map(|(name, _)| name.clone()).collect() }

    pub fn contains(&self, name: &str) -> bool { self.entries.read().iter().any(|(n, _)| n == name) }
}

impl FilterChainBuilder for DefaultFilterChainBuilder {
    fn build_chain(&self, chain: &FilterChain) -> Result<(), Error> {
        let entries = self.entries.read().clone();
        for (name, filter) in entries {
            chain.add_last(name, filter)?;
        }
        Ok(())
    }
}

impl<F> FilterChainBuilder for F
where F: Fn(&FilterChain) -> Result<(), Error> + Send + Sync + 'static
{
    fn build_chain(&self, chain: &FilterChain) -> Result<(), Error> { self(chain) }
}
