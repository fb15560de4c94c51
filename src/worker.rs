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

//! Lazily started worker thread slot shared by processors, acceptors and
//! connectors.

use std::io;
use std::thread;

use parking_lot::Mutex;

/// Slot holding the "running" flag of a single worker thread.
///
/// Producers must enqueue their task *before* calling [`WorkerSlot::start`],
/// while the worker checks its queues inside [`WorkerSlot::release`]. Since
/// both operations run under the same lock, a task can't be left behind by a
/// worker which has just decided to exit.
#[derive(Debug)]
pub(crate) struct WorkerSlot {
    name: String,
    running: Mutex<bool>,
}

impl WorkerSlot {
    pub fn new(name: impl Into<String>) -> Self {
        WorkerSlot {
            name: name.into(),
            running: Mutex::new(false),
        }
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn is_running(&self) -> bool { *self.running.lock() }

    /// Spawns the worker thread running `f` unless it is already running.
    pub fn start(&self, f: impl FnOnce() + Send + 'static) -> io::Result<()> {
        let mut running = self.running.lock();
        if *running {
            return Ok(());
        }
        thread::Builder::new().name(self.name.clone()).spawn(f)?;
        *running = true;
        log::debug!(target: "worker", "Worker thread {} started", self.name);
        Ok(())
    }

    /// Marks the worker as stopped if `is_idle` holds. Returns whether the
    /// worker thread must exit.
    pub fn release(&self, is_idle: impl FnOnce() -> bool) -> bool {
        let mut running = self.running.lock();
        if !is_idle() {
            return false;
        }
        *running = false;
        log::debug!(target: "worker", "Worker thread {} released", self.name);
        true
    }
}
