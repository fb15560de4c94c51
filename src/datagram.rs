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

//! Connectionless acceptor: serves many remote peers from bound datagram
//! handles, mapping each peer to a session.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel as chan;
use parking_lot::{Mutex, RwLock};

use crate::future::{BindFuture, ConnectFuture, UnbindFuture};
use crate::poller::{Interest, Poller, Waker};
use crate::processor::{IoProcessor, ERROR_BACKOFF, IDLE_CHECK_INTERVAL, WRITE_SPIN_COUNT};
use crate::service::{IoService, ServiceConfig, ServiceContext};
use crate::session::{SessionId, SessionState};
use crate::transport::Datagram;
use crate::worker::WorkerSlot;
use crate::{Error, IoHandler, IoSession, Message, WriteRequest};

/// Default time-to-live of an idle datagram session.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(60);

/// Registry which maps remote peers to the existing sessions of a datagram
/// acceptor.
pub trait SessionRecycler: Send + Sync + 'static {
    /// Remembers a newly created session.
    fn put(&self, session: Arc<IoSession>);

    /// Returns the session previously created for the pair of addresses.
    fn recycle(&self, local: SocketAddr, remote: SocketAddr) -> Option<Arc<IoSession>>;

    /// Forgets a session which is being closed.
    fn remove(&self, session: &IoSession);

    /// Evicts and returns sessions which have outlived their time-to-live.
    /// The acceptor closes them.
    fn expired(&self, _now: Instant) -> Vec<Arc<IoSession>> { empty!() }
}

/// Recycler which never reuses sessions: every datagram creates a new one.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct NoopSessionRecycler;

impl SessionRecycler for NoopSessionRecycler {
    fn put(&self, _session: Arc<IoSession>) {}

    fn recycle(&self, _local: SocketAddr, _remote: SocketAddr) -> Option<Arc<IoSession>> { None }

    fn remove(&self, _session: &IoSession) {}
}

struct Expiring {
    session: Arc<IoSession>,
    last_access: Instant,
}

/// Recycler which keeps a session for a peer until no datagrams were
/// exchanged with it for the time-to-live.
pub struct ExpiringSessionRecycler {
    time_to_live: Duration,
    sessions: Mutex<HashMap<(SocketAddr, SocketAddr), Expiring>>,
}

impl Default for ExpiringSessionRecycler {
    fn default() -> Self { Self::new(DEFAULT_SESSION_TTL) }
}

impl ExpiringSessionRecycler {
    pub fn new(time_to_live: Duration) -> Self {
        ExpiringSessionRecycler {
            time_to_live,
            sessions: empty!(),
        }
    }

    pub fn time_to_live(&self) -> Duration { self.time_to_live }

    pub fn len(&self) -> usize { self.sessions.lock().len() }

    pub fn is_empty(&self) -> bool { self.sessions.lock().is_empty() }
}

impl SessionRecycler for ExpiringSessionRecycler {
    fn put(&self, session: Arc<IoSession>) {
        let key = (session.local_addr(), session.remote_addr());
        self.sessions.lock().entry(key).or_insert_with(|| Expiring {
            session,
            last_access: Instant::now(),
        });
    }

    fn recycle(&self, local: SocketAddr, remote: SocketAddr) -> Option<Arc<IoSession>> {
        let mut sessions = self.sessions.lock();
        let entry = sessions.get_mut(&(local, remote))?;
        entry.last_access = Instant::now();
        Some(entry.session.clone())
    }

    fn remove(&self, session: &IoSession) {
        let key = (session.local_addr(), session.remote_addr());
        let mut sessions = self.sessions.lock();
        if sessions.get(&key).map(|entry| entry.session.id()) == Some(session.id()) {
            sessions.remove(&key);
        }
    }

    fn expired(&self, now: Instant) -> Vec<Arc<IoSession>> {
        let mut sessions = self.sessions.lock();
        let keys = sessions
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_access) >= self.time_to_live)
            .map(|(key, _)| *key)
            .collect::<Vec<_>>();
        keys.into_iter()
            .filter_map(|key| sessions.remove(&key))
            .map(|entry| entry.session)
            .collect()
    }
}

enum Request {
    Bind(Vec<SocketAddr>, BindFuture),
    Unbind(Vec<SocketAddr>, UnbindFuture),
    NewSession {
        remote: SocketAddr,
        local: SocketAddr,
        future: ConnectFuture,
    },
}

struct Shared<T: Datagram> {
    transport: Arc<T>,
    context: Arc<ServiceContext>,
    recycler: RwLock<Arc<dyn SessionRecycler>>,
    requests: (chan::Sender<Request>, chan::Receiver<Request>),
    removing: (chan::Sender<Arc<IoSession>>, chan::Receiver<Arc<IoSession>>),
    flushing: (chan::Sender<Arc<IoSession>>, chan::Receiver<Arc<IoSession>>),
    bound: RwLock<HashSet<SocketAddr>>,
    select_timeout: Duration,
    waker: Arc<Waker>,
    worker: WorkerSlot,
    disposing: AtomicBool,
    me: Weak<Shared<T>>,
}

impl<T: Datagram> Shared<T> {
    fn start_worker(&self) -> Result<(), Error> {
        if let Some(shared) = self.me.upgrade() {
            self.worker.start(move || DatagramWorker::new(shared).run())?;
        }
        self.waker.wake()?;
        Ok(())
    }

    fn submit(&self, request: Request) -> Result<(), Error> {
        let _ = self.requests.0.send(request);
        self.start_worker()
    }

    fn recycler(&self) -> Arc<dyn SessionRecycler> { self.recycler.read().clone() }
}

/// The acceptor is also the processor of its sessions: they all share the
/// handle bound to their local address.
impl<T: Datagram> IoProcessor for Shared<T> {
    fn write(&self, session: &Arc<IoSession>, request: WriteRequest) {
        session.write_queue().push(request);
        if !session.is_write_suspended() {
            self.flush(session);
        }
    }

    fn flush(&self, session: &Arc<IoSession>) {
        if session.schedule_for_flush() {
            let _ = self.flushing.0.send(session.clone());
            if let Err(err) = self.start_worker() {
                log::error!(target: "datagram", "Unable to start datagram worker: {}", err);
            }
        }
    }

    fn remove(&self, session: &Arc<IoSession>) {
        let _ = self.removing.0.send(session.clone());
        if let Err(err) = self.start_worker() {
            log::error!(target: "datagram", "Unable to start datagram worker: {}", err);
        }
    }

    // All the sessions of a bound handle share its interest set, so read
    // suspension doesn't apply and write resumption just flushes the session.
    fn update_traffic_control(&self, _session: &Arc<IoSession>) {}

    fn dispose(&self) {
        if !self.disposing.swap(true, Ordering::AcqRel) {
            if let Err(err) = self.start_worker() {
                log::error!(target: "datagram", "Unable to start datagram worker: {}", err);
            }
        }
    }

    fn is_disposing(&self) -> bool { self.disposing.load(Ordering::Acquire) }
}

/// Acceptor of datagrams. A datagram from a peer without a session creates one
/// through the [`SessionRecycler`]; writes go to the explicit destination of
/// a request or to the session's remote address.
pub struct DatagramAcceptor<T: Datagram> {
    shared: Arc<Shared<T>>,
}

impl<T: Datagram> DatagramAcceptor<T> {
    pub fn new(transport: T, handler: impl IoHandler, config: ServiceConfig) -> io::Result<Self> {
        Self::with_handler(transport, Arc::new(handler), config)
    }

    pub fn with_handler(transport: T, handler: Arc<dyn IoHandler>, config: ServiceConfig) -> io::Result<Self> {
        let transport = Arc::new(transport);
        let context = ServiceContext::new(config.name.clone(), handler, config.session, transport.metadata());
        let waker = Waker::new()?;
        let shared = Arc::new_cyclic(|me| Shared {
            transport,
            context,
            recycler: RwLock::new(Arc::new(ExpiringSessionRecycler::default())),
            requests: chan::unbounded(),
            removing: chan::unbounded(),
            flushing: chan::unbounded(),
            bound: empty!(),
            select_timeout: config.select_timeout,
            waker,
            worker: WorkerSlot::new(format!("{}-datagram", config.name)),
            disposing: AtomicBool::new(false),
            me: me.clone(),
        });
        Ok(DatagramAcceptor { shared })
    }

    pub fn session_recycler(&self) -> Arc<dyn SessionRecycler> { self.shared.recycler() }

    /// Replaces the session recycler. Must be called before binding.
    pub fn set_session_recycler(&self, recycler: Arc<dyn SessionRecycler>) {
        *self.shared.recycler.write() = recycler;
    }

    /// Binds all the addresses, transactionally. See [`crate::Acceptor::bind`].
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

    /// Unbinds the addresses, closing the sessions served by them.
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

    pub fn local_addresses(&self) -> Vec<SocketAddr> { self.shared.bound.read().iter().copied().collect() }

    /// Detects whether the worker thread is alive.
    pub fn is_active(&self) -> bool { self.shared.worker.is_running() }

    /// Creates (or recycles) a session for sending datagrams to `remote` from
    /// the bound `local` address.
    pub fn new_session(&self, remote: SocketAddr, local: SocketAddr) -> ConnectFuture {
        if self.is_disposing() {
            return ConnectFuture::failed(Error::Disposed);
        }
        if !self.shared.bound.read().contains(&local) {
            return ConnectFuture::failed(Error::NotBound(local));
        }
        let future = ConnectFuture::new();
        if let Err(err) = self.shared.submit(Request::NewSession {
            remote,
            local,
            future: future.clone(),
        }) {
            future.fail(err);
        }
        future
    }
}

impl<T: Datagram> IoService for DatagramAcceptor<T> {
    fn context(&self) -> &Arc<ServiceContext> { &self.shared.context }

    fn dispose(&self) {
        if self.is_disposing() {
            return;
        }
        log::debug!(target: "datagram", "Disposing datagram acceptor {}", self.shared.context.name());
        if let Err(err) = self.unbind_all() {
            log::warn!(target: "datagram", "Unable to unbind on disposal: {}", err);
        }
        IoProcessor::dispose(&*self.shared);
    }

    fn is_disposing(&self) -> bool { IoProcessor::is_disposing(&*self.shared) }
}

impl<T: Datagram> Drop for DatagramAcceptor<T> {
    fn drop(&mut self) { IoService::dispose(self) }
}

struct Server<S> {
    socket: S,
    blocked: bool,
}

struct Entry {
    session: Arc<IoSession>,
    current: Option<WriteRequest>,
    blocked_since: Option<Instant>,
}

enum Flushed {
    Done,
    Blocked,
    Exhausted,
}

struct DatagramWorker<T: Datagram> {
    shared: Arc<Shared<T>>,
    poller: Poller<SocketAddr>,
    servers: HashMap<SocketAddr, Server<T::Server>>,
    sessions: HashMap<SessionId, Entry>,
    last_idle_check: Instant,
    disposal_started: bool,
}

impl<T: Datagram> DatagramWorker<T> {
    fn new(shared: Arc<Shared<T>>) -> Self {
        DatagramWorker {
            poller: Poller::new(shared.waker.clone()),
            shared,
            servers: empty!(),
            sessions: empty!(),
            last_idle_check: Instant::now(),
            disposal_started: false,
        }
    }

    fn run(mut self) {
        log::debug!(target: "datagram", "Datagram worker {} is running", self.shared.worker.name());
        loop {
            if let Err(err) = self.iterate() {
                log::error!(target: "datagram", "Datagram worker iteration has failed: {}", err);
                thread::sleep(ERROR_BACKOFF);
            }

            let shared = self.shared.clone();
            let (servers, sessions) = (&self.servers, &self.sessions);
            if shared
                .worker
                .release(|| servers.is_empty() && sessions.is_empty() && shared.requests.1.is_empty())
            {
                break;
            }
        }
    }

    fn iterate(&mut self) -> io::Result<()> {
        self.handle_requests();

        // With sessions but no servers the poll blocks on the waker alone.
        if !self.servers.is_empty() || !self.sessions.is_empty() {
            for (local, io) in self.poller.poll(self.shared.select_timeout)? {
                if io.is_readable {
                    self.receive(local);
                }
                if io.is_writable {
                    self.unblock(local);
                }
            }
        }

        self.flush();
        self.remove_sessions();

        let now = Instant::now();
        if now.duration_since(self.last_idle_check) >= IDLE_CHECK_INTERVAL {
            self.last_idle_check = now;
            self.notify_idleness(now);
        }

        if self.shared.is_disposing() && !self.disposal_started {
            self.disposal_started = true;
            for entry in self.sessions.values() {
                self.shared.remove(&entry.session);
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
                Request::NewSession { remote, local, future } => {
                    if !self.servers.contains_key(&local) {
                        future.fail(Error::NotBound(local));
                    } else if let Some(session) = self.recycle(local, remote) {
                        future.complete(session);
                    } else {
                        self.open_session(local, remote, Some(future));
                    }
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
                    log::debug!(target: "datagram", "Unable to bind {}: {}", addr, cause);
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
        for (local, socket) in opened {
            log::debug!(target: "datagram", "Bound to {}", local);
            self.poller.register(local, &socket, Interest::READ);
            self.servers.insert(local, Server {
                socket,
                blocked: false,
            });
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
        if let Err(err) = self.shared.transport.close_server(server.socket) {
            log::warn!(target: "datagram", "Error closing datagram handle {}: {}", addr, err);
        }
        for entry in self.sessions.values() {
            if entry.session.local_addr() == addr {
                entry.session.close_now();
            }
        }
        log::debug!(target: "datagram", "Unbound {}", addr);
    }

    fn recycle(&self, local: SocketAddr, remote: SocketAddr) -> Option<Arc<IoSession>> {
        self.shared
            .recycler()
            .recycle(local, remote)
            .filter(|session| session.state() == SessionState::Open && !session.is_closing())
    }

    fn open_session(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        future: Option<ConnectFuture>,
    ) -> Option<Arc<IoSession>> {
        let session = IoSession::new(self.shared.context.clone(), self.shared.clone(), local, remote, future);
        let recycler = self.shared.recycler();
        recycler.put(session.clone());
        self.sessions.insert(session.id(), Entry {
            session: session.clone(),
            current: None,
            blocked_since: None,
        });

        if let Err(err) = self.shared.context.activate(&session) {
            log::warn!(target: "datagram", "Unable to initialize session for {}: {}", remote, err);
            self.sessions.remove(&session.id());
            recycler.remove(&session);
            session.set_state(SessionState::Closed);
            if let Some(future) = session.take_connect_future() {
                future.fail(err);
            }
            return None;
        }
        Some(session)
    }

    fn receive(&mut self, local: SocketAddr) {
        loop {
            let Some(server) = self.servers.get(&local) else {
                return;
            };
            let mut buf = vec![0u8; self.shared.context.session_config().read_buffer_size];
            let (len, remote) = match self.shared.transport.recv_from(&server.socket, &mut buf) {
                Ok(Some(received)) => received,
                Ok(None) => break,
                Err(err) => {
                    log::warn!(target: "datagram", "Unable to receive datagram on {}: {}", local, err);
                    break;
                }
            };
            buf.truncate(len);

            let session = match self.recycle(local, remote) {
                Some(session) => session,
                None => match self.open_session(local, remote, None) {
                    Some(session) => session,
                    None => continue,
                },
            };
            log::trace!(target: "datagram", "Received {} bytes from {}", len, remote);
            session.record_read_bytes(len, Instant::now());
            session.filter_chain().fire_message_received(Message::from(buf));
        }
    }

    fn unblock(&mut self, local: SocketAddr) {
        if let Some(server) = self.servers.get_mut(&local) {
            server.blocked = false;
            self.poller.set_interest(&local, Interest::READ);
        }
        for entry in self.sessions.values() {
            if entry.session.local_addr() == local && entry.blocked_since.is_some() {
                self.shared.flush(&entry.session);
            }
        }
    }

    fn flush(&mut self) {
        let count = self.shared.flushing.1.len();
        for _ in 0..count {
            let Ok(session) = self.shared.flushing.1.try_recv() else {
                break;
            };
            session.unschedule_for_flush();
            match session.state() {
                SessionState::Preparing => {
                    self.shared.flush(&session);
                    continue;
                }
                SessionState::Closed => continue,
                SessionState::Open => {}
            }
            let Some(entry) = self.sessions.get_mut(&session.id()) else {
                continue;
            };
            let Some(server) = self.servers.get_mut(&session.local_addr()) else {
                continue;
            };

            match Self::flush_now(&self.shared, &server.socket, entry) {
                Ok(Flushed::Done) => {}
                Ok(Flushed::Blocked) => {
                    if !server.blocked {
                        server.blocked = true;
                        self.poller.set_interest(&session.local_addr(), Interest {
                            read: true,
                            write: true,
                        });
                    }
                }
                Ok(Flushed::Exhausted) => self.shared.flush(&session),
                Err(err) => {
                    self.shared.remove(&session);
                    session.filter_chain().fire_exception_caught(err.into());
                }
            }
        }
    }

    fn flush_now(shared: &Shared<T>, socket: &T::Server, entry: &mut Entry) -> io::Result<Flushed> {
        let session = entry.session.clone();
        let quota = session.config().max_written_per_flush();
        let mut written = 0usize;

        loop {
            if session.is_write_suspended() {
                return Ok(Flushed::Done);
            }
            let Some(request) = entry.current.take().or_else(|| session.write_queue().poll()) else {
                entry.blocked_since = None;
                return Ok(Flushed::Done);
            };
            if request.is_close_marker() {
                request.future().complete(());
                session.close_now();
                return Ok(Flushed::Done);
            }
            let Some(bytes) = request.message().as_bytes().cloned() else {
                session.record_discarded(&request, 0);
                request.future().fail(Error::UnsupportedMessage);
                session.filter_chain().fire_exception_caught(Error::UnsupportedMessage);
                continue;
            };

            let destination = request.destination().unwrap_or_else(|| session.remote_addr());
            let mut len = 0;
            if !bytes.is_empty() {
                for _ in 0..WRITE_SPIN_COUNT {
                    match shared.transport.send_to(socket, &bytes, destination) {
                        Ok(0) => continue,
                        Ok(n) => {
                            len = n;
                            break;
                        }
                        Err(err) => {
                            entry.current = Some(request);
                            return Err(err);
                        }
                    }
                }
                if len == 0 {
                    entry.current = Some(request);
                    entry.blocked_since.get_or_insert_with(Instant::now);
                    return Ok(Flushed::Blocked);
                }
            }

            entry.blocked_since = None;
            written += len;
            session.record_written_bytes(len, Instant::now());
            log::trace!(target: "datagram", "Sent {} bytes to {}", len, destination);
            session.filter_chain().fire_message_sent(request);
            if written >= quota {
                return Ok(Flushed::Exhausted);
            }
        }
    }

    fn remove_sessions(&mut self) {
        let count = self.shared.removing.1.len();
        for _ in 0..count {
            let Ok(session) = self.shared.removing.1.try_recv() else {
                break;
            };
            match session.state() {
                SessionState::Preparing => {
                    let _ = self.shared.removing.0.send(session);
                }
                SessionState::Closed => {}
                SessionState::Open => self.remove_session(&session),
            }
        }
    }

    fn remove_session(&mut self, session: &Arc<IoSession>) {
        let Some(entry) = self.sessions.remove(&session.id()) else {
            return;
        };
        let err = Error::WriteToClosedSession(session.id());
        let mut failed = 0usize;
        let pending = entry
            .current
            .into_iter()
            .chain(std::iter::from_fn(|| session.write_queue().poll()));
        for request in pending {
            session.record_discarded(&request, 0);
            request.future().fail(err.clone());
            if !request.is_close_marker() {
                failed += 1;
            }
        }
        if failed > 0 {
            session.filter_chain().fire_exception_caught(err);
        }
        self.shared.recycler().remove(session);
        session.service().deactivate(session);
    }

    fn notify_idleness(&mut self, now: Instant) {
        for session in self.shared.recycler().expired(now) {
            log::debug!(target: "datagram", "Session {} with {} has expired", session.id(), session.remote_addr());
            session.close_now();
        }

        for entry in self.sessions.values_mut() {
            let session = entry.session.clone();
            session.notify_idleness(now);

            let (Some(since), Some(timeout)) = (entry.blocked_since, session.config().write_timeout) else {
                continue;
            };
            if now.saturating_duration_since(since) < timeout {
                continue;
            }
            let err = Error::WriteTimeout(session.id());
            if let Some(request) = entry.current.take() {
                session.record_discarded(&request, 0);
                request.future().fail(err.clone());
            }
            entry.blocked_since = None;
            session.filter_chain().fire_exception_caught(err);
            session.close_now();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{self, RecordingProcessor};
    use crate::NoopHandler;

    fn session(context: &Arc<ServiceContext>, remote: &str) -> Arc<IoSession> {
        testing::session(context, Arc::new(RecordingProcessor::default()), remote)
    }

    #[test]
    fn expiring_recycler() {
        let context = testing::context(Arc::new(NoopHandler));
        let recycler = ExpiringSessionRecycler::new(Duration::from_secs(10));
        let first = session(&context, "127.0.0.1:1001");
        let second = session(&context, "127.0.0.1:1002");
        let local = first.local_addr();
        recycler.put(first.clone());
        recycler.put(second.clone());
        assert_eq!(recycler.len(), 2);

        let recycled = recycler.recycle(local, first.remote_addr()).unwrap();
        assert_eq!(recycled.id(), first.id());
        assert!(recycler.recycle(local, "127.0.0.1:1003".parse().unwrap()).is_none());

        assert!(recycler.expired(Instant::now()).is_empty());
        let expired = recycler.expired(Instant::now() + Duration::from_secs(11));
        assert_eq!(expired.len(), 2);
        assert!(recycler.is_empty());

        recycler.put(second.clone());
        recycler.remove(&first);
        assert_eq!(recycler.len(), 1);
        recycler.remove(&second);
        assert!(recycler.is_empty());
    }

    #[test]
    fn noop_recycler() {
        let context = testing::context(Arc::new(NoopHandler));
        let recycler = NoopSessionRecycler;
        let session = session(&context, "127.0.0.1:1001");
        recycler.put(session.clone());
        assert!(recycler.recycle(session.local_addr(), session.remote_addr()).is_none());
    }
}
