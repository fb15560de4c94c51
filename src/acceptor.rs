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

//! Connection-oriented acceptor: binds listening handles and turns accepted
//! connections into sessions served by a processor pool.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_channel as chan;
use parking_lot::RwLock;

use crate::future::{BindFuture, UnbindFuture};
use crate::poller::{Interest, Poller, Waker};
use crate::processor::{ProcessorPool, ERROR_BACKOFF};
use crate::service::{IoService, ServiceConfig, ServiceContext};
use crate::transport::Listen;
use crate::worker::WorkerSlot;
use crate::{Error, IoHandler, IoSession};

enum Request {
    Bind(Vec<SocketAddr>, BindFuture),
    Unbind(Vec<SocketAddr>, UnbindFuture),
}

struct Shared<T: Listen> {
    transport: Arc<T>,
    context: Arc<ServiceContext>,
    pool: ProcessorPool<T>,
    requests: (chan::Sender<Request>, chan::Receiver<Request>),
    bound: RwLock<HashSet<SocketAddr>>,
    select_timeout: Duration,
    waker: Arc<Waker>,
    worker: WorkerSlot,
    disposing: AtomicBool,
    me: Weak<Shared<T>>,
}

impl<T: Listen> Shared<T> {
    fn submit(&self, request: Request) -> Result<(), Error> {
        let _ = self.requests.0.send(request);
        if let Some(shared) = self.me.upgrade() {
            self.worker.start(move || AcceptWorker::new(shared).run())?;
        }
        self.waker.wake()?;
        Ok(())
    }
}

/// Acceptor of incoming connections.
///
/// Owns a lazily started worker thread which polls all the bound handles,
/// accepts connections and hands the new sessions to the processor pool. The
/// worker stops once nothing is bound and no requests are pending.
pub struct Acceptor<T: Listen> {
    shared: Arc<Shared<T>>,
}

impl<T: Listen> Acceptor<T> {
    pub fn new(transport: T, handler: impl IoHandler, config: ServiceConfig) -> io::Result<Self> {
        Self::with_handler(transport, Arc::new(handler), config)
    }

    pub fn with_handler(transport: T, handler: Arc<dyn IoHandler>, config: ServiceConfig) -> io::Result<Self> {
        let transport = Arc::new(transport);
        let context = ServiceContext::new(config.name.clone(), handler, config.session, transport.metadata());
        let pool = ProcessorPool::new(&config.name, config.processor_count, transport.clone(), config.select_timeout)?;
        let waker = Waker::new()?;
        let shared = Arc::new_cyclic(|me| Shared {
            transport,
            context,
            pool,
            requests: chan::unbounded(),
            bound: empty!(),
            select_timeout: config.select_timeout,
            waker,
            worker: WorkerSlot::new(format!("{}-acceptor", config.name)),
            disposing: AtomicBool::new(false),
            me: me.clone(),
        });
        Ok(Acceptor { shared })
    }

    /// Binds all the addresses, blocking until the worker has opened them.
    ///
    /// The operation is transactional: if any of the addresses can't be
    /// bound, the handles opened for the others are closed again. Returns the
    /// actually bound addresses, in the order of the request.
    pub fn bind(&self, addrs: &[SocketAddr]) -> Result<Vec<SocketAddr>, Error> {
        if self.is_disposing() {
            return Err(Error::Disposed);
        }
        if addrs.is_empty() {
            return Ok(empty!());
        }
        {
            let bound = self.shared.bound.read();
            if let Some(addr) = addrs.iter().find(|addr| addr.port() != 0 && bound.contains(addr)) {
                return Err(Error::AlreadyBound(*addr));
            }
        }
        let future = BindFuture::new();
        self.shared.submit(Request::Bind(addrs.to_vec(), future.clone()))?;
        future.wait_result()
    }

    /// Unbinds the addresses, blocking until their handles are closed. Sessions
    /// accepted on them stay open.
    pub fn unbind(&self, addrs: &[SocketAddr]) -> Result<(), Error> {
        if addrs.is_empty() {
            return Ok(());
        }
        {
            let bound = self.shared.bound.read();
            if let Some(addr) = addrs.iter().find(|addr| !bound.contains(addr)) {
                return Err(Error::NotBound(*addr));
            }
        }
        let future = UnbindFuture::new();
        self.shared.submit(Request::Unbind(addrs.to_vec(), future.clone()))?;
        future.wait_result()
    }

    pub fn unbind_all(&self) -> Result<(), Error> { self.unbind(&self.local_addresses()) }

    /// Addresses the acceptor is currently bound to.
    pub fn local_addresses(&self) -> Vec<SocketAddr> { self.shared.bound.read().iter().copied().collect() }

    pub fn is_bound(&self) -> bool { !self.shared.bound.read().is_empty() }

    /// Detects whether the acceptor worker thread is alive.
    pub fn is_active(&self) -> bool { self.shared.worker.is_running() }

    pub fn processors(&self) -> &ProcessorPool<T> { &self.shared.pool }
}

impl<T: Listen> IoService for Acceptor<T> {
    fn context(&self) -> &Arc<ServiceContext> { &self.shared.context }

    fn dispose(&self) {
        if self.shared.disposing.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!(target: "acceptor", "Disposing acceptor {}", self.shared.context.name());
        if let Err(err) = self.unbind_all() {
            log::warn!(target: "acceptor", "Unable to unbind on disposal: {}", err);
        }
        self.shared.pool.dispose();
    }

    fn is_disposing(&self) -> bool { self.shared.disposing.load(Ordering::Acquire) }
}

impl<T: Listen> Drop for Acceptor<T> {
    fn drop(&mut self) { self.dispose() }
}

struct AcceptWorker<T: Listen> {
    shared: Arc<Shared<T>>,
    poller: Poller<SocketAddr>,
    servers: HashMap<SocketAddr, T::Server>,
}

impl<T: Listen> AcceptWorker<T> {
    fn new(shared: Arc<Shared<T>>) -> Self {
        AcceptWorker {
            poller: Poller::new(shared.waker.clone()),
            shared,
            servers: empty!(),
        }
    }

    fn run(mut self) {
        loop {
            if let Err(err) = self.iterate() {
                log::error!(target: "acceptor", "Acceptor iteration has failed: {}", err);
                thread::sleep(ERROR_BACKOFF);
            }

            let shared = self.shared.clone();
            let servers = &self.servers;
            if shared
                .worker
                .release(|| servers.is_empty() && shared.requests.1.is_empty())
            {
                break;
            }
        }
    }

    fn iterate(&mut self) -> io::Result<()> {
        self.handle_requests();
        if self.servers.is_empty() {
            return Ok(());
        }
        for (local, io) in self.poller.poll(self.shared.select_timeout)? {
            if io.is_readable {
                self.accept(local);
            }
        }
        Ok(())
    }

    fn handle_requests(&mut self) {
        while let Ok(request) = self.shared.requests.1.try_recv() {
            match request {
                Request::Bind(addrs, future) => self.bind(addrs, future),
                Request::Unbind(addrs, future) => {
                    for addr in addrs {
                        self.unbind(addr);
                    }
                    future.complete(());
                }
            }
        }
    }

    fn bind(&mut self, addrs: Vec<SocketAddr>, future: BindFuture) {
        let transport = &self.shared.transport;
        let mut opened = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let res = transport.open_server(addr).and_then(|server| match transport.server_addr(&server) {
                Ok(local) => Ok((local, server)),
                Err(err) => {
                    let _ = transport.close_server(server);
                    Err(err)
                }
            });
            match res {
                Ok(server) => opened.push(server),
                Err(cause) => {
                    log::debug!(target: "acceptor", "Unable to bind {}: {}", addr, cause);
                    for (_, server) in opened {
                        let _ = transport.close_server(server);
                    }
                    future.fail(Error::Bind {
                        addr,
                        cause: Arc::new(cause),
                    });
                    return;
                }
            }
        }

        let locals = opened.iter().map(|(local, _)| *local).collect::<Vec<_>>();
        for (local, server) in opened {
            log::debug!(target: "acceptor", "Listening on {}", local);
            self.poller.register(local, &server, Interest::READ);
            self.servers.insert(local, server);
        }
        self.shared.bound.write().extend(locals.iter().copied());
        future.complete(locals);
    }

    fn unbind(&mut self, addr: SocketAddr) {
        let Some(server) = self.servers.remove(&addr) else {
            return;
        };
        self.poller.unregister(&addr);
        self.shared.bound.write().remove(&addr);
        if let Err(err) = self.shared.transport.close_server(server) {
            log::warn!(target: "acceptor", "Error closing listener {}: {}", addr, err);
        }
        log::debug!(target: "acceptor", "Unbound {}", addr);
    }

    fn accept(&mut self, local: SocketAddr) {
        let Some(server) = self.servers.get(&local) else {
            return;
        };
        let transport = &self.shared.transport;
        loop {
            let handle = match transport.accept(server) {
                Ok(Some(handle)) => handle,
                Ok(None) => break,
                Err(err) => {
                    log::warn!(target: "acceptor", "Unable to accept connection on {}: {}", local, err);
                    break;
                }
            };
            let addrs = transport
                .local_addr(&handle)
                .and_then(|local| transport.remote_addr(&handle).map(|remote| (local, remote)));
            let (local, remote) = match addrs {
                Ok(addrs) => addrs,
                Err(err) => {
                    log::warn!(target: "acceptor", "Dropping accepted connection: {}", err);
                    let _ = transport.close(handle);
                    continue;
                }
            };
            log::trace!(target: "acceptor", "Accepted connection from {}", remote);

            let processor = self.shared.pool.next().clone();
            let session = IoSession::new(self.shared.context.clone(), processor.clone(), local, remote, None);
            if let Err(err) = processor.add(session, handle) {
                log::debug!(target: "acceptor", "Connection from {} rejected: {}", remote, err);
            }
        }
    }
}
