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

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{IoProcessor, Processor};
use crate::transport::Transport;

/// Fixed set of processors sharing the sessions of a service. Sessions are
/// assigned round-robin at creation and stay with their processor for life.
pub struct ProcessorPool<T: Transport> {
    processors: Vec<Arc<Processor<T>>>,
    next: AtomicUsize,
}

impl<T: Transport> ProcessorPool<T> {
    pub fn new(name: &str, count: usize, transport: Arc<T>, select_timeout: Duration) -> io::Result<Self> {
        let processors = (0..count.max(1))
            .map(|no| Processor::new(format!("{name}-processor-{no}"), transport.clone(), select_timeout))
            .collect::<io::Result<Vec<_>>>()?;
        Ok(ProcessorPool {
            processors,
            next: AtomicUsize::new(0),
        })
    }

    /// Picks the processor for a new session.
    pub fn next(&self) -> &Arc<Processor<T>> {
        let no = self.next.fetch_add(1, Ordering::Relaxed) % self.processors.len();
        &self.processors[no]
    }

    pub fn len(&self) -> usize { self.processors.len() }

    pub fn is_empty(&self) -> bool { self.processors.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Processor<T>>> { self.processors.iter() }

    pub fn dispose(&self) {
        for processor in &self.processors {
            processor.dispose();
        }
    }

    pub fn is_disposing(&self) -> bool { self.processors.iter().all(|processor| processor.is_disposing()) }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::TcpTransport;

    #[test]
    fn round_robin() {
        let pool = ProcessorPool::new("test", 3, Arc::new(TcpTransport::new()), Duration::from_secs(1)).unwrap();
        let names = (0..6).map(|_| pool.next().name().to_owned()).collect::<Vec<_>>();
        assert_eq!(names, [
            "test-processor-0",
            "test-processor-1",
            "test-processor-2",
            "test-processor-0",
            "test-processor-1",
            "test-processor-2"
        ]);
        assert!(!pool.is_disposing());
        pool.dispose();
        assert!(pool.is_disposing());
        assert!(pool.iter().all(|processor| !processor.is_running() || processor.is_disposing()));
    }
}
