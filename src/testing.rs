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

//! Helpers for unit tests which need sessions without running any worker.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::processor::IoProcessor;
use crate::service::ServiceContext;
use crate::transport::TransportMetadata;
use crate::{IoHandler, IoSession, WriteRequest};

/// Processor which records what it was asked to do.
#[derive(Default)]
pub struct RecordingProcessor {
    pub written: Mutex<Vec<WriteRequest>>,
    pub removed: Mutex<usize>,
}

impl IoProcessor for RecordingProcessor {
    fn write(&self, _session: &Arc<IoSession>, request: WriteRequest) { self.written.lock().push(request) }

    fn flush(&self, _session: &Arc<IoSession>) {}

    fn remove(&self, _session: &Arc<IoSession>) { *self.removed.lock() += 1 }

    fn update_traffic_control(&self, _session: &Arc<IoSession>) {}

    fn dispose(&self) {}

    fn is_disposing(&self) -> bool { false }
}

pub fn context(handler: Arc<dyn IoHandler>) -> Arc<ServiceContext> {
    ServiceContext::new("test", handler, default!(), TransportMetadata {
        name: "test",
        connectionless: false,
        has_fragmentation: false,
    })
}

pub fn session(context: &Arc<ServiceContext>, processor: Arc<RecordingProcessor>, remote: &str) -> Arc<IoSession> {
    let local: SocketAddr = "127.0.0.1:9000".parse().expect("valid address");
    let remote: SocketAddr = remote.parse().expect("valid address");
    IoSession::new(context.clone(), processor, local, remote, None)
}

/// Polls the condition until it holds, failing the test after ten seconds.
pub fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "condition was not met in time");
        thread::sleep(Duration::from_millis(10));
    }
}
