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

//! Polling reactor driving the I/O of a set of sessions on a single worker
//! thread.

mod pool;

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel as chan;

pub use self::pool::ProcessorPool;
use crate::poller::{Interest, IoEv, Poller, Waker};
use crate::session::{SessionId, SessionState};
use crate::transport::{ReadResult, Transport};
use crate::worker::WorkerSlot;
use crate::{Error, IoSession, Message, WriteRequest};

/// Number of attempts to write a buffer which doesn't accept data before the
/// processor waits for the handle to become writable.
pub const WRITE_SPIN_COUNT: usize = 256;
/// Granularity of the idle and write timeout checks.
pub const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(1);
/// Pause after a failed iteration of a worker loop.
pub const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Processor operations available to the sessions it owns.
pub trait IoProcessor: Send + Sync + 'static {
    /// Queues the request into the session and schedules a flush.
    fn write(&self, session: &Arc<IoSession>, request: WriteRequest);

    /// Schedules the session for flushing its write queue. Repeated calls
    /// before the flush happens are collapsed.
    fn flush(&self, session: &Arc<IoSession>);

    /// Schedules the session removal: its handle gets closed, pending writes
    /// fail and `session_closed` is fired.
    fn remove(&self, session: &Arc<IoSession>);

    /// Applies the read/write suspension flags of the session.
    fn update_traffic_control(&self, session: &Arc<IoSession>);

    /// Removes all the sessions and rejects new ones.
    fn dispose(&self);

    fn is_disposing(&self) -> bool;
}

/// Reactor owning the handles of its sessions. A worker thread is started
/// when the first session is added and stops once no sessions are left.
pub struct Processor<T: Transport> {
    name: String,
    transport: Arc<T>,
    select_timeout: Duration,
    new_sessions: (chan::Sender<(Arc<IoSession>, T::Handle)>, chan::Receiver<(Arc<IoSession>, T::Handle)>),
    removing: (chan::Sender<Arc<IoSession>>, chan::Receiver<Arc<IoSession>>),
    flushing: (chan::Sender<Arc<IoSession>>, chan::Receiver<Arc<IoSession>>),
    traffic: (chan::Sender<Arc<IoSession>>, chan::Receiver<Arc<IoSession>>),
    waker: Arc<Waker>,
    worker: WorkerSlot,
    disposing: AtomicBool,
    me: Weak<Processor<T>>,
}

impl<T: Transport> Processor<T> {
    pub fn new(name: impl Into<String>, transport: Arc<T>, select_timeout: Duration) -> io::Result<Arc<Self>> {
        let name = name.into();
        let waker = Waker::new()?;
        Ok(Arc::new_cyclic(|me| Processor {
            worker: WorkerSlot::new(name.clone()),
            name,
            transport,
            select_timeout,
            new_sessions: chan::unbounded(),
            removing: chan::unbounded(),
            flushing: chan::unbounded(),
            traffic: chan::unbounded(),
            waker,
            disposing: AtomicBool::new(false),
            me: me.clone(),
        }))
    }

    pub fn name(&self) -> &str { &self.name }

    /// Detects whether the worker thread is alive.
    pub fn is_running(&self) -> bool { self.worker.is_running() }

    /// Hands a new session with its handle to the processor. The session
    /// becomes open and its creation events fire on the worker thread.
    ///
    /// Once the processor is disposing the handle is closed, the connect
    /// future (if any) fails and [`Error::Disposed`] is returned.
    pub fn add(&self, session: Arc<IoSession>, handle: T::Handle) -> Result<(), Error> {
        if self.is_disposing() {
            let _ = self.transport.close(handle);
            if let Some(future) = session.take_connect_future() {
                future.fail(Error::Disposed);
            }
            return Err(Error::Disposed);
        }
        log::trace!(target: "processor", "Adding session {} to {}", session.id(), self.name);
        let _ = self.new_sessions.0.send((session, handle));
        self.start_worker();
        Ok(())
    }

    fn start_worker(&self) {
        if let Some(processor) = self.me.upgrade() {
            if let Err(err) = self.worker.start(move || Worker::new(processor).run()) {
                log::error!(target: "processor", "Unable to spawn worker {}: {}", self.name, err);
            }
        }
        self.wake();
    }

    fn wake(&self) {
        if let Err(err) = self.waker.wake() {
            log::warn!(target: "processor", "Unable to wake {}: {}", self.name, err);
        }
    }
}

impl<T: Transport> IoProcessor for Processor<T> {
    fn write(&self, session: &Arc<IoSession>, request: WriteRequest) {
        session.write_queue().push(request);
        if !session.is_write_suspended() {
            self.flush(session);
        }
    }

    fn flush(&self, session: &Arc<IoSession>) {
        if session.schedule_for_flush() {
            let _ = self.flushing.0.send(session.clone());
            self.start_worker();
        }
    }

    fn remove(&self, session: &Arc<IoSession>) {
        let _ = self.removing.0.send(session.clone());
        self.start_worker();
    }

    fn update_traffic_control(&self, session: &Arc<IoSession>) {
        let _ = self.traffic.0.send(session.clone());
        self.wake();
    }

    fn dispose(&self) {
        if !self.disposing.swap(true, Ordering::AcqRel) {
            log::debug!(target: "processor", "Disposing {}", self.name);
            self.start_worker();
        }
    }

    fn is_disposing(&self) -> bool { self.disposing.load(Ordering::Acquire) }
}

struct InFlight {
    request: WriteRequest,
    written: usize,
}

struct Managed<H> {
    session: Arc<IoSession>,
    handle: H,
    current: Option<InFlight>,
    blocked_since: Option<Instant>,
    input_closed: bool,
    interest: Interest,
}

impl<H> Managed<H> {
    fn required_interest(&self) -> Interest {
        Interest {
            read: !self.session.is_read_suspended() && !self.input_closed,
            write: self.blocked_since.is_some() && !self.session.is_write_suspended(),
        }
    }
}

enum Flushed {
    /// Nothing is left to write.
    Done,
    /// The handle doesn't accept more data.
    Blocked,
    /// The per-pass write quota is exhausted.
    Exhausted,
}

struct Worker<T: Transport> {
    processor: Arc<Processor<T>>,
    poller: Poller<SessionId>,
    sessions: HashMap<SessionId, Managed<T::Handle>>,
    last_idle_check: Instant,
    disposal_started: bool,
}

impl<T: Transport> Worker<T> {
    fn new(processor: Arc<Processor<T>>) -> Self {
        Worker {
            poller: Poller::new(processor.waker.clone()),
            processor,
            sessions: empty!(),
            last_idle_check: Instant::now(),
            disposal_started: false,
        }
    }

    fn run(mut self) {
        log::debug!(target: "processor", "Processor {} is running", self.processor.name);
        loop {
            if let Err(err) = self.iterate() {
                log::error!(target: "processor", "Processor {} iteration has failed: {}", self.processor.name, err);
                thread::sleep(ERROR_BACKOFF);
            }

            let processor = self.processor.clone();
            let sessions = &self.sessions;
            if processor
                .worker
                .release(|| sessions.is_empty() && processor.new_sessions.1.is_empty())
            {
                break;
            }
        }
        log::debug!(target: "processor", "Processor {} has no more sessions and stops", self.processor.name);
    }

    fn iterate(&mut self) -> io::Result<()> {
        let events = self.poller.poll(self.processor.select_timeout)?;

        self.handle_new_sessions();
        self.update_traffic_masks();
        for (id, io) in events {
            self.process(id, io);
        }
        self.flush();
        self.remove_sessions();

        let now = Instant::now();
        if now.duration_since(self.last_idle_check) >= IDLE_CHECK_INTERVAL {
            self.last_idle_check = now;
            self.notify_idleness(now);
        }

        if self.processor.is_disposing() && !self.disposal_started {
            self.disposal_started = true;
            for managed in self.sessions.values() {
                self.processor.remove(&managed.session);
            }
        }
        Ok(())
    }

    fn handle_new_sessions(&mut self) {
        while let Ok((session, handle)) = self.processor.new_sessions.1.try_recv() {
            if self.processor.is_disposing() {
                let _ = self.processor.transport.close(handle);
                session.set_state(SessionState::Closed);
                if let Some(future) = session.take_connect_future() {
                    future.fail(Error::Disposed);
                }
                continue;
            }
            self.add_session(session, handle);
        }
    }

    fn add_session(&mut self, session: Arc<IoSession>, handle: T::Handle) {
        let id = session.id();
        let interest = Interest {
            read: !session.is_read_suspended(),
            write: false,
        };
        self.poller.register(id, &handle, interest);
        self.sessions.insert(id, Managed {
            session: session.clone(),
            handle,
            current: None,
            blocked_since: None,
            input_closed: false,
            interest,
        });

        if let Err(err) = session.service().activate(&session) {
            log::warn!(target: "processor", "Unable to initialize session {}: {}", id, err);
            self.poller.unregister(&id);
            if let Some(managed) = self.sessions.remove(&id) {
                let _ = self.processor.transport.close(managed.handle);
            }
            session.set_state(SessionState::Closed);
            if let Some(future) = session.take_connect_future() {
                future.fail(err);
            }
        }
    }

    fn update_interest(poller: &mut Poller<SessionId>, managed: &mut Managed<T::Handle>) {
        let interest = managed.required_interest();
        if interest != managed.interest {
            managed.interest = interest;
            if !poller.set_interest(&managed.session.id(), interest) {
                log::warn!(target: "processor", "Interest update for unknown session {}", managed.session.id());
            }
        }
    }

    fn update_traffic_masks(&mut self) {
        while let Ok(session) = self.processor.traffic.1.try_recv() {
            match self.sessions.get_mut(&session.id()) {
                Some(managed) => Self::update_interest(&mut self.poller, managed),
                // Preparing sessions get their flags applied on registration.
                None => log::trace!(target: "processor", "Traffic update for unmanaged session {}", session.id()),
            }
        }
    }

    fn process(&mut self, id: SessionId, io: IoEv) {
        let Some(managed) = self.sessions.get_mut(&id) else {
            return;
        };
        if io.is_readable && !managed.session.is_read_suspended() && !managed.input_closed {
            Self::read(&self.processor, managed);
        }
        if io.is_writable {
            self.processor.flush(&managed.session);
        }
        Self::update_interest(&mut self.poller, managed);
    }

    fn read(processor: &Processor<T>, managed: &mut Managed<T::Handle>) {
        let session = managed.session.clone();
        let fragmenting = processor.transport.metadata().has_fragmentation;
        let size = session.config().read_buffer_size;
        let mut buf = vec![0u8; size];
        let mut read = 0usize;
        let mut eof = false;

        let res = loop {
            match processor.transport.read(&mut managed.handle, &mut buf[read..]) {
                Ok(ReadResult::Bytes(len)) => {
                    read += len;
                    if len == 0 || !fragmenting || read == size {
                        break Ok(());
                    }
                }
                Ok(ReadResult::Empty) => break Ok(()),
                Ok(ReadResult::Eof) => {
                    eof = true;
                    break Ok(());
                }
                Err(err) => break Err(err),
            }
        };

        if read > 0 {
            buf.truncate(read);
            session.record_read_bytes(read, Instant::now());
            if fragmenting {
                session.adapt_read_buffer(read);
            }
            log::trace!(target: "processor", "Received {} bytes from session {}", read, session.id());
            session.filter_chain().fire_message_received(Message::from(buf));
        }
        if eof {
            log::trace!(target: "processor", "Input of session {} is closed", session.id());
            managed.input_closed = true;
            session.filter_chain().fire_input_closed();
        }
        if let Err(err) = res {
            processor.remove(&session);
            session.filter_chain().fire_exception_caught(err.into());
        }
    }

    fn flush(&mut self) {
        // Sessions rescheduled during this pass are served on the next one.
        let count = self.processor.flushing.1.len();
        for _ in 0..count {
            let Ok(session) = self.processor.flushing.1.try_recv() else {
                break;
            };
            session.unschedule_for_flush();
            match session.state() {
                SessionState::Preparing => {
                    self.processor.flush(&session);
                    continue;
                }
                SessionState::Closed => continue,
                SessionState::Open => {}
            }
            let Some(managed) = self.sessions.get_mut(&session.id()) else {
                continue;
            };

            match Self::flush_now(&self.processor, managed) {
                Ok(Flushed::Done) | Ok(Flushed::Blocked) => {}
                Ok(Flushed::Exhausted) => self.processor.flush(&session),
                Err(err) => {
                    self.processor.remove(&session);
                    session.filter_chain().fire_exception_caught(err.into());
                }
            }
            Self::update_interest(&mut self.poller, managed);
        }
    }

    fn flush_now(processor: &Processor<T>, managed: &mut Managed<T::Handle>) -> io::Result<Flushed> {
        let session = managed.session.clone();
        let fragmenting = processor.transport.metadata().has_fragmentation;
        let quota = session.config().max_written_per_flush();
        let mut written = 0usize;

        loop {
            if session.is_write_suspended() {
                return Ok(Flushed::Done);
            }
            let mut current = match managed.current.take() {
                Some(current) => current,
                None => match session.write_queue().poll() {
                    Some(request) => InFlight { request, written: 0 },
                    None => {
                        managed.blocked_since = None;
                        return Ok(Flushed::Done);
                    }
                },
            };

            if current.request.is_close_marker() {
                current.request.future().complete(());
                session.close_now();
                return Ok(Flushed::Done);
            }
            let Some(bytes) = current.request.message().as_bytes().cloned() else {
                session.record_discarded(&current.request, 0);
                current.request.future().fail(Error::UnsupportedMessage);
                session.filter_chain().fire_exception_caught(Error::UnsupportedMessage);
                continue;
            };

            let mut len = 0;
            if current.written < bytes.len() {
                for _ in 0..WRITE_SPIN_COUNT {
                    match processor.transport.write(
                        &mut managed.handle,
                        &bytes[current.written..],
                        current.request.destination(),
                    ) {
                        Ok(0) => continue,
                        Ok(n) => {
                            len = n;
                            break;
                        }
                        Err(err) => {
                            managed.current = Some(current);
                            return Err(err);
                        }
                    }
                }
                if len == 0 {
                    managed.current = Some(current);
                    managed.blocked_since.get_or_insert_with(Instant::now);
                    return Ok(Flushed::Blocked);
                }
            }

            let now = Instant::now();
            managed.blocked_since = None;
            current.written += len;
            written += len;
            session.record_written_bytes(len, now);
            if current.written >= bytes.len() || !fragmenting {
                log::trace!(target: "processor", "Message of {} bytes sent to session {}", bytes.len(), session.id());
                session.filter_chain().fire_message_sent(current.request);
            } else {
                managed.current = Some(current);
            }

            if written >= quota {
                return Ok(Flushed::Exhausted);
            }
        }
    }

    fn remove_sessions(&mut self) {
        let count = self.processor.removing.1.len();
        for _ in 0..count {
            let Ok(session) = self.processor.removing.1.try_recv() else {
                break;
            };
            match session.state() {
                SessionState::Preparing => {
                    let _ = self.processor.removing.0.send(session);
                }
                SessionState::Closed => {}
                SessionState::Open => self.remove_session(&session),
            }
        }
    }

    fn remove_session(&mut self, session: &Arc<IoSession>) {
        let id = session.id();
        let Some(managed) = self.sessions.remove(&id) else {
            return;
        };
        self.poller.unregister(&id);

        let err = Error::WriteToClosedSession(id);
        let mut failed = 0usize;
        let pending = managed
            .current
            .into_iter()
            .map(|current| (current.request, current.written))
            .chain(std::iter::from_fn(|| session.write_queue().poll().map(|request| (request, 0))));
        for (request, written) in pending {
            session.record_discarded(&request, written);
            request.future().fail(err.clone());
            if !request.is_close_marker() {
                failed += 1;
            }
        }
        if failed > 0 {
            session.filter_chain().fire_exception_caught(err);
        }

        if let Err(err) = self.processor.transport.close(managed.handle) {
            log::warn!(target: "processor", "Error closing handle of session {}: {}", id, err);
        }
        log::debug!(target: "processor", "Session {} removed from {}", id, self.processor.name);
        session.service().deactivate(session);
    }

    fn notify_idleness(&mut self, now: Instant) {
        for managed in self.sessions.values_mut() {
            let session = managed.session.clone();
            session.notify_idleness(now);

            let (Some(since), Some(timeout)) = (managed.blocked_since, session.config().write_timeout) else {
                continue;
            };
            if now.saturating_duration_since(since) < timeout {
                continue;
            }
            let err = Error::WriteTimeout(session.id());
            if let Some(current) = managed.current.take() {
                session.record_discarded(&current.request, current.written);
                current.request.future().fail(err.clone());
            }
            managed.blocked_since = None;
            log::debug!(target: "processor", "Write to session {} has timed out", session.id());
            session.filter_chain().fire_exception_caught(err);
            session.close_now();
        }
    }
}
