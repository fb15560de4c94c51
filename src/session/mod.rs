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

//! Sessions: logical connections managed by a processor.

mod config;
mod write;

use std::collections::VecDeque;
use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

pub use self::config::{
    IdleStatus, SessionConfig, DEFAULT_MAX_READ_BUFFER_SIZE, DEFAULT_MIN_READ_BUFFER_SIZE,
    DEFAULT_READ_BUFFER_SIZE, DEFAULT_WRITE_TIMEOUT,
};
pub(crate) use self::write::WriteQueue;
pub use self::write::WriteRequest;
use crate::future::{CloseFuture, ConnectFuture, Outcome, ReadFuture, ReadOutcome, WriteFuture};
use crate::processor::IoProcessor;
use crate::service::ServiceContext;
use crate::{Error, FilterChain, IoHandler, Message};

/// Session identifier, unique within a service.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display)]
#[display("#{0}")]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn new(id: u64) -> Self { SessionId(id) }

    pub fn as_u64(self) -> u64 { self.0 }
}

/// Lifecycle state of a session.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display)]
#[display(lowercase)]
#[repr(u8)]
pub enum SessionState {
    /// The session is queued for the processor and not yet registered.
    Preparing = 0,
    /// The session is registered and its events are delivered.
    Open = 1,
    /// The session is removed from its processor.
    Closed = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Preparing,
            1 => SessionState::Open,
            _ => SessionState::Closed,
        }
    }
}

#[derive(Default)]
struct ReadQueues {
    ready: VecDeque<ReadFuture>,
    waiting: VecDeque<ReadFuture>,
}

#[derive(Default)]
struct Stats {
    read_bytes: AtomicU64,
    written_bytes: AtomicU64,
    read_messages: AtomicU64,
    written_messages: AtomicU64,
    scheduled_write_bytes: AtomicU64,
    scheduled_write_messages: AtomicU64,
    // Times are kept as milliseconds since the session creation.
    last_read_time: AtomicU64,
    last_write_time: AtomicU64,
    last_idle_time: [AtomicU64; 3],
    idle_count: [AtomicUsize; 3],
}

/// Logical connection: a transport handle owned by a processor, together with
/// its filter chain, write queue and statistics.
///
/// Sessions are always shared as `Arc<IoSession>` and never migrate between
/// processors.
pub struct IoSession {
    id: SessionId,
    state: AtomicU8,
    closing: AtomicBool,
    created: Instant,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,

    config: RwLock<SessionConfig>,
    chain: FilterChain,
    service: Arc<ServiceContext>,
    processor: Arc<dyn IoProcessor>,

    write_queue: WriteQueue,
    scheduled_for_flush: AtomicBool,
    read_suspended: AtomicBool,
    write_suspended: AtomicBool,

    close_future: CloseFuture,
    connect_future: Mutex<Option<ConnectFuture>>,
    reads: Mutex<ReadQueues>,
    stats: Stats,
}

impl Debug for IoSession {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("closing", &self.is_closing())
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("scheduled_for_flush", &self.is_scheduled_for_flush())
            .finish()
    }
}

impl IoSession {
    pub(crate) fn new(
        service: Arc<ServiceContext>,
        processor: Arc<dyn IoProcessor>,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        connect_future: Option<ConnectFuture>,
    ) -> Arc<IoSession> {
        let id = service.next_session_id();
        let config = service.session_config();
        Arc::new_cyclic(|me| IoSession {
            id,
            state: AtomicU8::new(SessionState::Preparing as u8),
            closing: AtomicBool::new(false),
            created: Instant::now(),
            local_addr,
            remote_addr,
            config: RwLock::new(config),
            chain: FilterChain::new(me.clone()),
            service,
            processor,
            write_queue: WriteQueue::new(),
            scheduled_for_flush: AtomicBool::new(false),
            read_suspended: AtomicBool::new(false),
            write_suspended: AtomicBool::new(false),
            close_future: CloseFuture::new(),
            connect_future: Mutex::new(connect_future),
            reads: Mutex::new(default!()),
            stats: default!(),
        })
    }

    pub fn id(&self) -> SessionId { self.id }

    pub fn state(&self) -> SessionState { SessionState::from_u8(self.state.load(Ordering::Acquire)) }

    pub(crate) fn set_state(&self, state: SessionState) {
        log::trace!(target: "session", "Session {} is {}", self.id, state);
        self.state.store(state as u8, Ordering::Release);
    }

    /// Detects whether the session is open and no close was requested.
    pub fn is_connected(&self) -> bool { self.state() == SessionState::Open && !self.is_closing() }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire) || self.state() == SessionState::Closed
    }

    pub fn local_addr(&self) -> SocketAddr { self.local_addr }

    pub fn remote_addr(&self) -> SocketAddr { self.remote_addr }

    pub fn creation_time(&self) -> Instant { self.created }

    pub fn filter_chain(&self) -> &FilterChain { &self.chain }

    pub fn handler(&self) -> &Arc<dyn IoHandler> { self.service.handler() }

    pub(crate) fn service(&self) -> &Arc<ServiceContext> { &self.service }

    pub(crate) fn processor(&self) -> &Arc<dyn IoProcessor> { &self.processor }

    /// Returns a copy of the current session configuration.
    pub fn config(&self) -> SessionConfig { self.config.read().clone() }

    /// Updates session configuration in place.
    pub fn update_config(&self, f: impl FnOnce(&mut SessionConfig)) { f(&mut self.config.write()) }

    pub(crate) fn adapt_read_buffer(&self, read: usize) -> usize {
        let mut config = self.config.write();
        config.adapt_read_buffer(read);
        config.read_buffer_size
    }

    /// Writes a message into the session. The message passes the filter chain
    /// from the tail to the head and is then flushed by the processor.
    pub fn write(self: &Arc<Self>, message: impl Into<Message>) -> WriteFuture {
        self.write_to(message, None)
    }

    /// Writes a message to an explicit destination. Used with connectionless
    /// transports; other transports ignore the destination.
    pub fn write_to(self: &Arc<Self>, message: impl Into<Message>, destination: Option<SocketAddr>) -> WriteFuture {
        if self.is_closing() {
            return WriteFuture::failed(Error::WriteToClosedSession(self.id));
        }
        let request = WriteRequest::new(message, destination);
        let future = request.future().clone();
        self.chain.fire_filter_write(request);
        future
    }

    /// Closes the session immediately, discarding all pending writes.
    /// Subsequent calls return the same close future.
    pub fn close_now(self: &Arc<Self>) -> CloseFuture {
        if self.closing.swap(true, Ordering::AcqRel) {
            return self.close_future.clone();
        }
        log::debug!(target: "session", "Closing session {}", self.id);
        self.chain.fire_filter_close();
        self.close_future.clone()
    }

    /// Closes the session once all writes queued so far are flushed.
    pub fn close_on_flush(self: &Arc<Self>) -> CloseFuture {
        if !self.is_closing() {
            self.write_queue.push(WriteRequest::close_marker());
            self.processor.flush(self);
        }
        self.close_future.clone()
    }

    pub fn close_future(&self) -> &CloseFuture { &self.close_future }

    pub fn suspend_read(self: &Arc<Self>) {
        self.read_suspended.store(true, Ordering::Release);
        self.processor.update_traffic_control(self);
    }

    pub fn resume_read(self: &Arc<Self>) {
        self.read_suspended.store(false, Ordering::Release);
        self.processor.update_traffic_control(self);
    }

    pub fn suspend_write(self: &Arc<Self>) {
        self.write_suspended.store(true, Ordering::Release);
        self.processor.update_traffic_control(self);
    }

    pub fn resume_write(self: &Arc<Self>) {
        self.write_suspended.store(false, Ordering::Release);
        self.processor.update_traffic_control(self);
        if !self.write_queue.is_empty() {
            self.processor.flush(self);
        }
    }

    pub fn is_read_suspended(&self) -> bool { self.read_suspended.load(Ordering::Acquire) }

    pub fn is_write_suspended(&self) -> bool { self.write_suspended.load(Ordering::Acquire) }

    /// Reads the next received message. Requires
    /// [`SessionConfig::use_read_operation`]; messages are still delivered to
    /// the handler as well.
    pub fn read(&self) -> ReadFuture {
        if !self.config.read().use_read_operation {
            return ReadFuture::failed(Error::ReadDisabled(self.id));
        }
        let mut queues = self.reads.lock();
        if let Some(future) = queues.ready.pop_front() {
            if let Some(Outcome::Done(ReadOutcome::Closed)) = future.outcome() {
                // Closed marker stays for all subsequent reads.
                queues.ready.push_front(future.clone());
            }
            return future;
        }
        let future = ReadFuture::new();
        queues.waiting.push_back(future.clone());
        future
    }

    pub(crate) fn offer_read(&self, outcome: Result<Message, Error>) {
        let waiting = {
            let mut queues = self.reads.lock();
            match queues.waiting.pop_front() {
                Some(future) => future,
                None => {
                    let future = ReadFuture::new();
                    Self::resolve_read(&future, outcome);
                    queues.ready.push_back(future);
                    return;
                }
            }
        };
        Self::resolve_read(&waiting, outcome);
    }

    pub(crate) fn offer_read_closed(&self) {
        let waiting = {
            let mut queues = self.reads.lock();
            if queues.waiting.is_empty() {
                queues.ready.push_back(ReadFuture::ready(ReadOutcome::Closed));
            }
            std::mem::take(&mut queues.waiting)
        };
        for future in waiting {
            future.complete(ReadOutcome::Closed);
        }
    }

    fn resolve_read(future: &ReadFuture, outcome: Result<Message, Error>) {
        match outcome {
            Ok(message) => future.complete(ReadOutcome::Message(message)),
            Err(err) => future.fail(err),
        };
    }

    /// Takes the connect future which is still waiting for the session to be
    /// created.
    pub(crate) fn take_connect_future(&self) -> Option<ConnectFuture> { self.connect_future.lock().take() }

    pub(crate) fn write_queue(&self) -> &WriteQueue { &self.write_queue }

    /// Marks the session as queued for flushing. Returns `false` if it was
    /// already queued.
    pub(crate) fn schedule_for_flush(&self) -> bool {
        self.scheduled_for_flush
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn unschedule_for_flush(&self) { self.scheduled_for_flush.store(false, Ordering::Release); }

    pub(crate) fn is_scheduled_for_flush(&self) -> bool { self.scheduled_for_flush.load(Ordering::Acquire) }

    fn millis(&self, time: Instant) -> u64 {
        time.saturating_duration_since(self.created).as_millis() as u64
    }

    fn instant(&self, millis: u64) -> Instant { self.created + Duration::from_millis(millis) }

    pub(crate) fn record_read_bytes(&self, count: usize, now: Instant) {
        if count == 0 {
            return;
        }
        self.stats.read_bytes.fetch_add(count as u64, Ordering::Relaxed);
        self.stats.last_read_time.store(self.millis(now), Ordering::Relaxed);
        self.stats.idle_count[IdleStatus::ReaderIdle.index()].store(0, Ordering::Relaxed);
        self.stats.idle_count[IdleStatus::BothIdle.index()].store(0, Ordering::Relaxed);
    }

    pub(crate) fn record_written_bytes(&self, count: usize, now: Instant) {
        if count == 0 {
            return;
        }
        self.stats.written_bytes.fetch_add(count as u64, Ordering::Relaxed);
        self.decrease_scheduled(count as u64, 0);
        self.stats.last_write_time.store(self.millis(now), Ordering::Relaxed);
        self.stats.idle_count[IdleStatus::WriterIdle.index()].store(0, Ordering::Relaxed);
        self.stats.idle_count[IdleStatus::BothIdle.index()].store(0, Ordering::Relaxed);
    }

    pub(crate) fn record_read_message(&self) { self.stats.read_messages.fetch_add(1, Ordering::Relaxed); }

    pub(crate) fn record_written_message(&self) {
        self.stats.written_messages.fetch_add(1, Ordering::Relaxed);
        self.decrease_scheduled(0, 1);
    }

    pub(crate) fn record_scheduled(&self, bytes: usize) {
        self.stats.scheduled_write_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.stats.scheduled_write_messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Discounts a request which was dropped without being written.
    pub(crate) fn record_discarded(&self, request: &WriteRequest, written: usize) {
        let bytes = request.message().len().unwrap_or_default().saturating_sub(written);
        self.decrease_scheduled(bytes as u64, 1);
    }

    fn decrease_scheduled(&self, bytes: u64, messages: u64) {
        let _ = self.stats.scheduled_write_bytes.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(bytes))
        });
        let _ = self.stats.scheduled_write_messages.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(messages))
        });
    }

    pub fn read_bytes(&self) -> u64 { self.stats.read_bytes.load(Ordering::Relaxed) }

    pub fn written_bytes(&self) -> u64 { self.stats.written_bytes.load(Ordering::Relaxed) }

    pub fn read_messages(&self) -> u64 { self.stats.read_messages.load(Ordering::Relaxed) }

    pub fn written_messages(&self) -> u64 { self.stats.written_messages.load(Ordering::Relaxed) }

    pub fn scheduled_write_bytes(&self) -> u64 { self.stats.scheduled_write_bytes.load(Ordering::Relaxed) }

    pub fn scheduled_write_messages(&self) -> u64 {
        self.stats.scheduled_write_messages.load(Ordering::Relaxed)
    }

    pub fn last_read_time(&self) -> Instant { self.instant(self.stats.last_read_time.load(Ordering::Relaxed)) }

    pub fn last_write_time(&self) -> Instant { self.instant(self.stats.last_write_time.load(Ordering::Relaxed)) }

    pub fn last_io_time(&self) -> Instant { self.last_read_time().max(self.last_write_time()) }

    /// Number of consecutive idle notifications of the given status since the
    /// last I/O in the corresponding direction.
    pub fn idle_count(&self, status: IdleStatus) -> usize {
        self.stats.idle_count[status.index()].load(Ordering::Relaxed)
    }

    pub fn is_idle(&self, status: IdleStatus) -> bool { self.idle_count(status) > 0 }

    /// Fires `session_idle` events for every idle status whose idle time has
    /// elapsed since the last I/O (or the last notification).
    pub(crate) fn notify_idleness(self: &Arc<Self>, now: Instant) {
        let config = self.config.read().clone();
        let now_ms = self.millis(now);
        for status in IdleStatus::ALL {
            let Some(idle_time) = config.idle_time(status) else {
                continue;
            };
            let last_read = self.stats.last_read_time.load(Ordering::Relaxed);
            let last_write = self.stats.last_write_time.load(Ordering::Relaxed);
            let last_io = match status {
                IdleStatus::ReaderIdle => last_read,
                IdleStatus::WriterIdle => last_write,
                IdleStatus::BothIdle => last_read.max(last_write),
            };
            let last_idle = &self.stats.last_idle_time[status.index()];
            let since = last_io.max(last_idle.load(Ordering::Relaxed));
            if now_ms.saturating_sub(since) >= idle_time.as_millis() as u64 {
                last_idle.store(now_ms, Ordering::Relaxed);
                self.stats.idle_count[status.index()].fetch_add(1, Ordering::Relaxed);
                self.chain.fire_session_idle(status);
            }
        }
    }
}
