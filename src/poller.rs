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

//! Readiness polling for the worker threads, built on top of [`popol`].

use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

/// Information about I/O events which has happened for a registered handle.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Default)]
pub struct IoEv {
    /// Specifies whether I/O source has data to read (or is hung up, in which
    /// case the read returns end-of-stream or the pending error).
    pub is_readable: bool,
    /// Specifies whether I/O source is ready for write operations.
    pub is_writable: bool,
}

/// Interest of a worker in the events of a registered handle.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const READ: Interest = Interest {
        read: true,
        write: false,
    };
    pub const WRITE: Interest = Interest {
        read: false,
        write: true,
    };

    fn to_popol(self) -> popol::interest::Interest {
        match (self.read, self.write) {
            (true, true) => popol::interest::ALL,
            (true, false) => popol::interest::READ,
            (false, true) => popol::interest::WRITE,
            (false, false) => popol::interest::NONE,
        }
    }
}

/// Self-pipe used to interrupt a worker blocked inside [`Poller::poll`].
#[derive(Debug)]
pub struct Waker {
    reader: UnixStream,
    writer: UnixStream,
}

impl Waker {
    pub fn new() -> io::Result<Arc<Waker>> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        Ok(Arc::new(Waker { reader, writer }))
    }

    /// Wakes up the poll. Multiple wakes before the next poll collapse into
    /// one.
    pub fn wake(&self) -> io::Result<()> {
        match (&self.writer).write(&[1u8]) {
            Ok(_) => Ok(()),
            // The pipe is full, so the poll is going to wake anyway.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn reset(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.reader).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }
}

#[derive(Clone, Eq, PartialEq, Debug)]
enum Source<K> {
    Waker,
    Io(K),
}

/// Poll set of a single worker thread, keyed by a worker-specific key (a
/// session id, a bound address and so on).
pub struct Poller<K: Clone + Eq> {
    sources: popol::Sources<Source<K>>,
    events: Vec<popol::Event<Source<K>>>,
    waker: Arc<Waker>,
}

impl<K: Clone + Eq> Poller<K> {
    pub fn new(waker: Arc<Waker>) -> Self {
        let mut sources = popol::Sources::new();
        sources.register(Source::Waker, &waker.reader, popol::interest::READ);
        Poller {
            sources,
            events: empty!(),
            waker,
        }
    }

    pub fn register(&mut self, key: K, fd: &impl AsRawFd, interest: Interest) {
        self.sources.register(Source::Io(key), fd, interest.to_popol());
    }

    pub fn unregister(&mut self, key: &K) { self.sources.unregister(&Source::Io(key.clone())); }

    /// Changes the interest set of a registered handle. Returns `false` if the
    /// key is not registered.
    pub fn set_interest(&mut self, key: &K, interest: Interest) -> bool {
        self.sources.set(&Source::Io(key.clone()), interest.to_popol())
    }

    /// Blocks until some of the handles are ready, the poller is woken up or
    /// the timeout expires. Wake-ups are not reported as events.
    pub fn poll(&mut self, timeout: Duration) -> io::Result<Vec<(K, IoEv)>> {
        self.events.clear();
        match self.sources.poll(&mut self.events, popol::Timeout::from(timeout)) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::TimedOut => return Ok(empty!()),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(empty!()),
            Err(err) => return Err(err),
        }

        let mut ready = Vec::with_capacity(self.events.len());
        for event in self.events.drain(..) {
            match &event.key {
                Source::Waker => {
                    log::trace!(target: "poller", "Waked up");
                    self.waker.reset();
                }
                Source::Io(key) => {
                    let io = IoEv {
                        is_readable: event.is_readable()
                            || event.is_hangup()
                            || event.is_error(),
                        is_writable: event.is_writable(),
                    };
                    ready.push((key.clone(), io));
                }
            }
        }
        Ok(ready)
    }
}

#[cfg(test)]
mod test {
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn wake_interrupts_poll() {
        let waker = Waker::new().unwrap();
        let mut poller = Poller::<u32>::new(waker.clone());
        waker.wake().unwrap();
        waker.wake().unwrap();
        let events = poller.poll(Duration::from_secs(5)).unwrap();
        assert!(events.is_empty());
        // Both wakes were drained by the previous poll.
        let events = poller.poll(Duration::from_millis(10)).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn readiness() {
        let waker = Waker::new().unwrap();
        let mut poller = Poller::new(waker);
        let (a, mut b) = UnixStream::pair().unwrap();
        poller.register(7u32, &a, Interest::READ);
        assert!(poller.poll(Duration::from_millis(10)).unwrap().is_empty());

        b.write_all(b"ping").unwrap();
        let events = poller.poll(Duration::from_secs(1)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, 7);
        assert!(events[0].1.is_readable);

        assert!(poller.set_interest(&7, Interest::WRITE));
        let events = poller.poll(Duration::from_secs(1)).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].1.is_writable);

        poller.unregister(&7);
        assert!(!poller.set_interest(&7, Interest::READ));
    }
}
