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

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use iochain::{
    Acceptor, Connect, Connector, Error, IdleStatus, IoHandler, IoService, IoSession, Message, NoopHandler,
    ReadOutcome, ReadResult, ServiceConfig, SessionConfig, SessionId, TcpTransport, Transport, TransportMetadata,
};
use parking_lot::Mutex;

const TIMEOUT: Duration = Duration::from_secs(10);

fn config(name: &str) -> ServiceConfig {
    ServiceConfig::named(name)
        .with_processor_count(2)
        .with_select_timeout(Duration::from_millis(100))
}

fn client(name: &str) -> Connector<TcpTransport> {
    let config = config(name).with_session_config(SessionConfig::default().with_read_operation(true));
    Connector::new(TcpTransport::new(), NoopHandler, config).unwrap()
}

fn loopback() -> SocketAddr { "127.0.0.1:0".parse().unwrap() }

/// Address which nobody listens on (at least for a moment).
fn free_addr() -> SocketAddr { TcpListener::bind(loopback()).unwrap().local_addr().unwrap() }

fn read_bytes(session: &Arc<IoSession>, len: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(len);
    while data.len() < len {
        let outcome = session.read().wait_timeout(TIMEOUT).expect("read has timed out");
        match outcome.into_result().unwrap() {
            ReadOutcome::Message(message) => data.extend_from_slice(message.as_bytes().unwrap()),
            ReadOutcome::Closed => panic!("session was closed after {} bytes", data.len()),
        }
    }
    data
}

fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition was not met in time");
        thread::sleep(Duration::from_millis(10));
    }
}

#[derive(Default)]
struct Echo {
    events: Mutex<HashMap<SessionId, Vec<&'static str>>>,
    sent: AtomicUsize,
}

impl Echo {
    fn record(&self, session: &IoSession, event: &'static str) {
        self.events.lock().entry(session.id()).or_default().push(event);
    }
}

impl IoHandler for Echo {
    fn session_created(&self, session: &Arc<IoSession>) -> Result<(), Error> {
        self.record(session, "created");
        Ok(())
    }

    fn session_opened(&self, session: &Arc<IoSession>) -> Result<(), Error> {
        self.record(session, "opened");
        Ok(())
    }

    fn session_closed(&self, session: &Arc<IoSession>) -> Result<(), Error> {
        self.record(session, "closed");
        Ok(())
    }

    fn message_received(&self, session: &Arc<IoSession>, message: Message) -> Result<(), Error> {
        self.record(session, "received");
        session.write(message);
        Ok(())
    }

    fn message_sent(&self, _session: &Arc<IoSession>, _message: Message) -> Result<(), Error> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn concurrent_echo() {
    let handler = Arc::new(Echo::default());
    let acceptor = Acceptor::with_handler(TcpTransport::new(), handler.clone(), config("echo")).unwrap();
    let addr = acceptor.bind(&[loopback()]).unwrap()[0];
    assert!(acceptor.is_bound());

    let connector = Arc::new(client("echo-client"));
    let clients = (0..8u8)
        .map(|no| {
            let connector = connector.clone();
            thread::spawn(move || {
                let session = connector.connect(addr).wait_result().unwrap();
                let payload = format!("hello from client #{no}");
                assert!(session.write(payload.clone()).wait_timeout(TIMEOUT).unwrap().is_done());
                assert_eq!(read_bytes(&session, payload.len()), payload.as_bytes());
                session.close_now().wait_timeout(TIMEOUT).unwrap();
                assert!(!session.is_connected());
            })
        })
        .collect::<Vec<_>>();
    for client in clients {
        client.join().unwrap();
    }

    wait_for(|| acceptor.managed_session_count() == 0);
    let events = handler.events.lock();
    assert_eq!(events.len(), 8);
    for log in events.values() {
        assert_eq!(&log[..2], &["created", "opened"]);
        assert_eq!(log.last(), Some(&"closed"));
        assert_eq!(log.iter().filter(|event| **event == "closed").count(), 1);
    }

    acceptor.unbind_all().unwrap();
    assert!(acceptor.local_addresses().is_empty());
    wait_for(|| !acceptor.is_active());
}

struct Bulk {
    payload: Bytes,
    sent: AtomicUsize,
}

impl IoHandler for Bulk {
    fn session_opened(&self, session: &Arc<IoSession>) -> Result<(), Error> {
        session.write(self.payload.clone());
        Ok(())
    }

    fn message_sent(&self, _session: &Arc<IoSession>, message: Message) -> Result<(), Error> {
        assert_eq!(message.len(), Some(self.payload.len()));
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn large_write_is_sent_once() {
    let payload = Bytes::from((0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect::<Vec<_>>());
    let handler = Arc::new(Bulk {
        payload: payload.clone(),
        sent: AtomicUsize::new(0),
    });
    let acceptor = Acceptor::with_handler(TcpTransport::new(), handler.clone(), config("bulk")).unwrap();
    let addr = acceptor.bind(&[loopback()]).unwrap()[0];

    let connector = client("bulk-client");
    let session = connector.connect(addr).wait_result().unwrap();
    let received = read_bytes(&session, payload.len());
    assert_eq!(received.len(), payload.len());
    assert!(received == payload[..]);

    wait_for(|| handler.sent.load(Ordering::SeqCst) == 1);
    thread::sleep(Duration::from_millis(200));
    assert_eq!(handler.sent.load(Ordering::SeqCst), 1);
    let server_session = acceptor.managed_sessions().pop().unwrap();
    assert_eq!(server_session.written_bytes(), payload.len() as u64);
    assert_eq!(server_session.scheduled_write_bytes(), 0);
}

#[test]
fn bind_is_transactional() {
    let taken = TcpListener::bind(loopback()).unwrap();
    let busy = taken.local_addr().unwrap();
    let free = free_addr();

    let acceptor = Acceptor::new(TcpTransport::new(), NoopHandler, config("bind")).unwrap();
    match acceptor.bind(&[free, busy]) {
        Err(Error::Bind { addr, .. }) => assert_eq!(addr, busy),
        other => panic!("unexpected bind result {other:?}"),
    }
    assert!(acceptor.local_addresses().is_empty());
    // The first address must have been released again.
    TcpListener::bind(free).unwrap();

    let bound = acceptor.bind(&[loopback()]).unwrap();
    assert!(matches!(acceptor.bind(&bound), Err(Error::AlreadyBound(addr)) if addr == bound[0]));
    assert!(matches!(acceptor.unbind(&[busy]), Err(Error::NotBound(_))));
    acceptor.dispose();
    assert!(matches!(acceptor.bind(&[loopback()]), Err(Error::Disposed)));
}

#[test]
fn refused_connection_fails() {
    let connector = client("refused");
    let started = Instant::now();
    let outcome = connector.connect(free_addr()).wait_timeout(TIMEOUT).unwrap();
    assert!(matches!(outcome.into_result(), Err(err) if err.is_io()));
    assert!(started.elapsed() < TIMEOUT);
}

/// TCP transport whose connections never complete.
struct Stalled(TcpTransport);

impl Transport for Stalled {
    type Handle = TcpStream;

    fn metadata(&self) -> TransportMetadata { self.0.metadata() }

    fn read(&self, handle: &mut TcpStream, buf: &mut [u8]) -> io::Result<ReadResult> { self.0.read(handle, buf) }

    fn write(&self, handle: &mut TcpStream, buf: &[u8], destination: Option<SocketAddr>) -> io::Result<usize> {
        self.0.write(handle, buf, destination)
    }

    fn close(&self, handle: TcpStream) -> io::Result<()> { self.0.close(handle) }

    fn local_addr(&self, handle: &TcpStream) -> io::Result<SocketAddr> { self.0.local_addr(handle) }

    fn remote_addr(&self, handle: &TcpStream) -> io::Result<SocketAddr> { self.0.remote_addr(handle) }
}

impl Connect for Stalled {
    fn open(&self, remote: SocketAddr, local: Option<SocketAddr>) -> io::Result<TcpStream> {
        self.0.open(remote, local)
    }

    fn connect(&self, _handle: &TcpStream, _remote: SocketAddr) -> io::Result<bool> { Ok(false) }

    fn finish_connect(&self, _handle: &TcpStream) -> io::Result<bool> { Ok(false) }
}

#[test]
fn connect_deadline() {
    let connect_timeout = Duration::from_millis(300);
    let select_timeout = Duration::from_millis(100);
    let config = ServiceConfig::named("deadline")
        .with_select_timeout(select_timeout)
        .with_connect_timeout(connect_timeout);
    let connector = Connector::new(Stalled(TcpTransport::new()), NoopHandler, config).unwrap();
    let remote = free_addr();

    let started = Instant::now();
    let outcome = connector.connect(remote).wait_timeout(TIMEOUT).unwrap();
    let elapsed = started.elapsed();
    assert!(matches!(outcome.into_result(), Err(Error::ConnectTimeout(addr)) if addr == remote));
    assert!(elapsed >= connect_timeout);
    // Some slack for thread scheduling on top of the deadline scan period.
    assert!(elapsed < connect_timeout + select_timeout + Duration::from_millis(200), "took {elapsed:?}");
    wait_for(|| !connector.is_active());
}

#[test]
fn cancelled_connection() {
    let config = config("cancel").with_connect_timeout(Duration::from_secs(30));
    let connector = Connector::new(TcpTransport::new(), NoopHandler, config).unwrap();
    let future = connector.connect("10.255.255.1:9".parse().unwrap());
    if future.cancel() {
        assert!(future.is_cancelled());
        assert!(matches!(future.wait_result(), Err(Error::Cancelled)));
    } else {
        assert!(matches!(future.wait_result(), Err(_)));
    }
    wait_for(|| !connector.is_active());
}

struct Reply;

impl IoHandler for Reply {
    fn message_received(&self, session: &Arc<IoSession>, _message: Message) -> Result<(), Error> {
        session.write("bye");
        session.close_on_flush();
        Ok(())
    }
}

#[test]
fn close_on_flush_delivers_pending_writes() {
    let acceptor = Acceptor::new(TcpTransport::new(), Reply, config("reply")).unwrap();
    let addr = acceptor.bind(&[loopback()]).unwrap()[0];

    let connector = client("reply-client");
    let session = connector.connect(addr).wait_result().unwrap();
    session.write("hi");
    assert_eq!(read_bytes(&session, 3), b"bye");
    let outcome = session.read().wait_timeout(TIMEOUT).unwrap();
    assert!(matches!(outcome.into_result(), Ok(ReadOutcome::Closed)));
    // Closed result is sticky.
    assert!(matches!(session.read().wait_result(), Ok(ReadOutcome::Closed)));
    assert!(session.close_future().wait_timeout(TIMEOUT).is_some());
    assert!(matches!(session.write("late").wait_result(), Err(Error::WriteToClosedSession(_))));
}

#[derive(Default)]
struct Idle(Mutex<Vec<IdleStatus>>);

impl IoHandler for Idle {
    fn session_idle(&self, _session: &Arc<IoSession>, status: IdleStatus) -> Result<(), Error> {
        self.0.lock().push(status);
        Ok(())
    }
}

#[test]
fn idle_notification() {
    let handler = Arc::new(Idle::default());
    let session_config = SessionConfig::default().with_idle_time(IdleStatus::ReaderIdle, Duration::from_secs(1));
    let config = config("idle").with_session_config(session_config);
    let acceptor = Acceptor::with_handler(TcpTransport::new(), handler.clone(), config).unwrap();
    let addr = acceptor.bind(&[loopback()]).unwrap()[0];

    let connector = client("idle-client");
    let _session = connector.connect(addr).wait_result().unwrap();
    wait_for(|| !handler.0.lock().is_empty());
    assert!(handler.0.lock().iter().all(|status| *status == IdleStatus::ReaderIdle));
    let server_session = acceptor.managed_sessions().pop().unwrap();
    assert!(server_session.is_idle(IdleStatus::ReaderIdle));
    assert!(!server_session.is_idle(IdleStatus::WriterIdle));
}

#[test]
fn read_operation_is_opt_in() {
    let acceptor = Acceptor::new(TcpTransport::new(), NoopHandler, config("no-read")).unwrap();
    let addr = acceptor.bind(&[loopback()]).unwrap()[0];
    let connector = Connector::new(TcpTransport::new(), NoopHandler, config("no-read-client")).unwrap();
    let session = connector.connect(addr).wait_result().unwrap();
    assert!(matches!(session.read().wait_result(), Err(Error::ReadDisabled(id)) if id == session.id()));
}
