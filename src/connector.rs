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

//! Connector: initiates non-blocking connections and turns the established
//! ones into sessions served by a processor pool.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel as chan;

use crate::future::ConnectFuture;
use crate::poller::{Interest, Poller, Waker};
use crate::processor::{ProcessorPool, ERROR_BACKOFF};
use crate::service::{IoService, ServiceConfig, ServiceContext};
use crate::transport::Connect;
use crate::worker::WorkerSlot;
use crate::{Error, IoHandler, IoSession};

struct ConnectRequest<H> {
    id: u64,
    handle: H,
    remote: SocketAddr,
    deadline: Instant,
    future: ConnectFuture,
}

struct Shared<T: Connect> {
    transport: Arc<T>,
    context: Arc<ServiceContext>,
    pool: ProcessorPool<T>,
    requests: (chan::Sender<ConnectRequest<T::Handle>>, chan::Receiver<ConnectRequest<T::Handle>>),
    cancels: (chan::Sender<u64>, chan::Receiver<u64>),
    next_request: AtomicU64,
    select_timeout: Duration,
    connect_timeout: Duration,
    waker: Arc<Waker>,
    worker: WorkerSlot,
    disposing: AtomicBool,
    me: Weak<Shared<T>>,
}

impl<T: Connect> Shared<T> {
    fn new_session(&self, handle: T::Handle, remote: SocketAddr, future: ConnectFuture) {
        let local = match self.transport.local_addr(&handle) {
            Ok(local) => local,
            Err(err) => {
                let _ = self.transport.close(handle);
                future.fail(err.into());
                return;
            }
        };
        let processor = self.pool.next().clone();
        let session = IoSession::new(self.context.clone(), processor.clone(), local, remote, Some(future));
        // On failure the processor has already failed the connect future.
        if let Err(err) = processor.add(session, handle) {
            log::debug!(target: "connector", "Connection to {} dropped: {}", remote, err);
        }
    }
}

/// Connector of outgoing connections.
///
/// Connections which can't be established immediately are handed to a
/// lazily started worker thread which waits for them to complete or time out.
pub struct Connector<T: Connect> {
    shared: Arc<Shared<T>>,
}

impl<T: Connect> Connector<T> {
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
            cancels: chan::unbounded(),
            next_request: AtomicU64::new(0),
            select_timeout: config.select_timeout,
            connect_timeout: config.connect_timeout,
            waker,
            worker: WorkerSlot::new(format!("{}-connector", config.name)),
            disposing: AtomicBool::new(false),
            me: me.clone(),
        });
        Ok(Connector { shared })
    }

    /// Connects to the remote address. The returned future completes with the
    /// session once it is created, or fails with the connection error.
    pub fn connect(&self, remote: SocketAddr) -> ConnectFuture { self.connect_from(remote, None) }

    /// Connects to the remote address from the given local address.
    pub fn connect_from(&self, remote: SocketAddr, local: Option<SocketAddr>) -> ConnectFuture {
        if self.is_disposing() {
            return ConnectFuture::failed(Error::Disposed);
        }
        let shared = &self.shared;
        let handle = match shared.transport.open(remote, local) {
            Ok(handle) => handle,
            Err(err) => return ConnectFuture::failed(err.into()),
        };
        let future = ConnectFuture::new();
        match shared.transport.connect(&handle, remote) {
            Ok(true) => {
                log::trace!(target: "connector", "Connected to {} immediately", remote);
                shared.new_session(handle, remote, future.clone());
            }
            Ok(false) => {
                if let Err(err) = self.submit(handle, remote, future.clone()) {
                    future.fail(err);
                }
            }
            Err(err) => {
                let _ = shared.transport.close(handle);
                future.fail(err.into());
            }
        }
        future
    }

    fn submit(&self, handle: T::Handle, remote: SocketAddr, future: ConnectFuture) -> Result<(), Error> {
        let shared = &self.shared;
        let id = shared.next_request.fetch_add(1, Ordering::Relaxed);

        let cancels = shared.cancels.0.clone();
        let waker = shared.waker.clone();
        future.set_cancel_hook(move || {
            let _ = cancels.send(id);
            let _ = waker.wake();
            true
        });

        log::trace!(target: "connector", "Connection to {} is in progress", remote);
        let _ = shared.requests.0.send(ConnectRequest {
            id,
            handle,
            remote,
            deadline: Instant::now() + shared.connect_timeout,
            future,
        });
        let worker = shared.clone();
        shared.worker.start(move || ConnectWorker::new(worker).run())?;
        shared.waker.wake()?;
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration { self.shared.connect_timeout }

    /// Detects whether the connector worker thread is alive.
    pub fn is_active(&self) -> bool { self.shared.worker.is_running() }

    pub fn processors(&self) -> &ProcessorPool<T> { &self.shared.pool }
}

impl<T: Connect> IoService for Connector<T> {
    fn context(&self) -> &Arc<ServiceContext> { &self.shared.context }

    fn dispose(&self) {
        if self.shared.disposing.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!(target: "connector", "Disposing connector {}", self.shared.context.name());
        if let Some(shared) = self.shared.me.upgrade() {
            let worker = shared.clone();
            let _ = shared.worker.start(move || ConnectWorker::new(worker).run());
        }
        let _ = self.shared.waker.wake();
        self.shared.pool.dispose();
    }

    fn is_disposing(&self) -> bool { self.shared.disposing.load(Ordering::Acquire) }
}

impl<T: Connect> Drop for Connector<T> {
    fn drop(&mut self) { self.dispose() }
}

struct ConnectWorker<T: Connect> {
    shared: Arc<Shared<T>>,
    poller: Poller<u64>,
    pending: HashMap<u64, ConnectRequest<T::Handle>>,
}

impl<T: Connect> ConnectWorker<T> {
    fn new(shared: Arc<Shared<T>>) -> Self {
        ConnectWorker {
            poller: Poller::new(shared.waker.clone()),
            shared,
            pending: empty!(),
        }
    }

    fn run(mut self) {
        loop {
            if let Err(err) = self.iterate() {
                log::error!(target: "connector", "Connector iteration has failed: {}", err);
                thread::sleep(ERROR_BACKOFF);
            }

            let shared = self.shared.clone();
            let pending = &self.pending;
            if shared
                .worker
                .release(|| pending.is_empty() && shared.requests.1.is_empty())
            {
                break;
            }
        }
    }

    fn iterate(&mut self) -> io::Result<()> {
        self.register_requests();
        self.cancel_requests();
        if self.shared.disposing.load(Ordering::Acquire) {
            let ids = self.pending.keys().copied().collect::<Vec<_>>();
            for id in ids {
                self.fail(id, Error::Disposed);
            }
        }
        if self.pending.is_empty() {
            return Ok(());
        }

        let now = Instant::now();
        let timeout = self
            .pending
            .values()
            .map(|request| request.deadline.saturating_duration_since(now))
            .min()
            .unwrap_or(self.shared.select_timeout)
            .min(self.shared.select_timeout);
        for (id, io) in self.poller.poll(timeout)? {
            if io.is_writable || io.is_readable {
                self.finish(id);
            }
        }

        self.process_timeouts();
        Ok(())
    }

    fn register_requests(&mut self) {
        while let Ok(request) = self.shared.requests.1.try_recv() {
            self.poller.register(request.id, &request.handle, Interest::WRITE);
            self.pending.insert(request.id, request);
        }
    }

    fn cancel_requests(&mut self) {
        while let Ok(id) = self.shared.cancels.1.try_recv() {
            if let Some(request) = self.take(id) {
                log::debug!(target: "connector", "Connection to {} cancelled", request.remote);
                let _ = self.shared.transport.close(request.handle);
            }
        }
    }

    fn take(&mut self, id: u64) -> Option<ConnectRequest<T::Handle>> {
        let request = self.pending.remove(&id)?;
        self.poller.unregister(&id);
        Some(request)
    }

    fn fail(&mut self, id: u64, err: Error) {
        if let Some(request) = self.take(id) {
            log::debug!(target: "connector", "Connection to {} has failed: {}", request.remote, err);
            let _ = self.shared.transport.close(request.handle);
            request.future.fail(err);
        }
    }

    fn finish(&mut self, id: u64) {
        let Some(request) = self.pending.get(&id) else {
            return;
        };
        match self.shared.transport.finish_connect(&request.handle) {
            Ok(false) => {}
            Ok(true) => {
                if let Some(request) = self.take(id) {
                    log::trace!(target: "connector", "Connected to {}", request.remote);
                    self.shared.new_session(request.handle, request.remote, request.future);
                }
            }
            Err(err) => self.fail(id, err.into()),
        }
    }

    fn process_timeouts(&mut self) {
        let now = Instant::now();
        let expired = self
            .pending
            .values()
            .filter(|request| request.deadline <= now)
            .map(|request| (request.id, request.remote))
            .collect::<Vec<_>>();
        for (id, remote) in expired {
            self.fail(id, Error::ConnectTimeout(remote));
        }
    }
}
