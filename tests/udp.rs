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

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use iochain::{
    Connector, DatagramAcceptor, Error, ExpiringSessionRecycler, IoFilter, IoHandler, IoService, IoSession, Message,
    NextFilter, NoopHandler, ReadOutcome, ServiceConfig, SessionConfig, UdpTransport,
};

const TIMEOUT: Duration = Duration::from_secs(10);

struct Echo;

impl IoHandler for Echo {
    fn message_received(&self, session: &Arc<IoSession>, message: Message) -> Result<(), Error> {
        session.write(message);
        Ok(())
    }
}

fn config(name: &str) -> ServiceConfig {
    ServiceConfig::named(name).with_select_timeout(Duration::from_millis(100))
}

fn loopback() -> SocketAddr { "127.0.0.1:0".parse().unwrap() }

fn peer() -> UdpSocket {
    let socket = UdpSocket::bind(loopback()).unwrap();
    socket.set_read_timeout(Some(TIMEOUT)).unwrap();
    socket
}

fn exchange(socket: &UdpSocket, addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
    socket.send_to(payload, addr).unwrap();
    let mut buf = [0u8; 1024];
    let (len, from) = socket.recv_from(&mut buf).unwrap();
    assert_eq!(from, addr);
    buf[..len].to_vec()
}

fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition was not met in time");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn sessions_per_peer() {
    let acceptor = DatagramAcceptor::new(UdpTransport::new(), Echo, config("udp-echo")).unwrap();
    acceptor.set_session_recycler(Arc::new(ExpiringSessionRecycler::new(Duration::from_secs(1))));
    let addr = acceptor.bind(&[loopback()]).unwrap()[0];

    let first = peer();
    let second = peer();
    assert_eq!(exchange(&first, addr, b"ping"), b"ping");
    assert_eq!(exchange(&first, addr, b"again"), b"again");
    assert_eq!(acceptor.managed_session_count(), 1);
    assert_eq!(exchange(&second, addr, b"pong"), b"pong");
    assert_eq!(acceptor.managed_session_count(), 2);

    let session = acceptor
        .managed_sessions()
        .into_iter()
        .find(|session| session.remote_addr() == first.local_addr().unwrap())
        .unwrap();
    assert_eq!(session.read_messages(), 2);
    wait_for(|| session.written_bytes() == 9);

    // Both sessions expire after a second without traffic.
    wait_for(|| acceptor.managed_session_count() == 0);
    assert!(session.close_future().is_done());

    acceptor.unbind_all().unwrap();
    wait_for(|| !acceptor.is_active());
}

#[test]
fn outgoing_session() {
    let acceptor = DatagramAcceptor::new(UdpTransport::new(), NoopHandler, config("udp-out")).unwrap();
    let local = acceptor.bind(&[loopback()]).unwrap()[0];
    let remote = peer();
    let remote_addr = remote.local_addr().unwrap();

    let session = acceptor.new_session(remote_addr, local).wait_result().unwrap();
    assert_eq!(session.local_addr(), local);
    assert!(session.write("hello").wait_timeout(TIMEOUT).unwrap().is_done());
    let mut buf = [0u8; 16];
    let (len, from) = remote.recv_from(&mut buf).unwrap();
    assert_eq!((&buf[..len], from), (&b"hello"[..], local));

    // The same peer maps to the same session.
    let again = acceptor.new_session(remote_addr, local).wait_result().unwrap();
    assert_eq!(again.id(), session.id());

    // Explicit destination overrides the session peer.
    let other = peer();
    session
        .write_to("there", Some(other.local_addr().unwrap()))
        .wait_timeout(TIMEOUT)
        .unwrap();
    let (len, _) = other.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..len], b"there");

    let unbound = acceptor.new_session(remote_addr, loopback());
    assert!(matches!(unbound.wait_result(), Err(Error::NotBound(_))));

    acceptor.unbind(&[local]).unwrap();
    wait_for(|| session.close_future().is_done());
    acceptor.dispose();
    assert!(matches!(acceptor.new_session(remote_addr, local).wait_result(), Err(Error::Disposed)));
}

#[test]
fn connected_datagrams() {
    let acceptor = DatagramAcceptor::new(UdpTransport::new(), Echo, config("udp-server")).unwrap();
    let addr = acceptor.bind(&[loopback()]).unwrap()[0];

    let config = config("udp-client").with_session_config(SessionConfig::default().with_read_operation(true));
    let connector = Connector::new(UdpTransport::new(), NoopHandler, config).unwrap();
    let session = connector.connect(addr).wait_result().unwrap();
    assert_eq!(session.remote_addr(), addr);

    session.write("datagram");
    match session.read().wait_timeout(TIMEOUT).unwrap().into_result().unwrap() {
        ReadOutcome::Message(message) => assert_eq!(message.as_bytes().unwrap().as_ref(), b"datagram"),
        ReadOutcome::Closed => panic!("session was closed"),
    }
    session.close_now().wait_timeout(TIMEOUT).unwrap();
}

/// Filter which never lets a close request reach the head of the chain.
struct KeepOpen;

impl IoFilter for KeepOpen {
    fn filter_close(&self, _next: NextFilter, _session: &Arc<IoSession>) -> Result<(), Error> { Ok(()) }
}

/// CPU ticks consumed so far by the thread with the given name.
#[cfg(target_os = "linux")]
fn thread_cpu_ticks(name: &str) -> Option<u64> {
    for task in std::fs::read_dir("/proc/self/task").ok()? {
        let path = task.ok()?.path();
        if std::fs::read_to_string(path.join("comm")).ok()?.trim() != name {
            continue;
        }
        let stat = std::fs::read_to_string(path.join("stat")).ok()?;
        let fields = stat.rsplit_once(") ")?.1.split_whitespace().collect::<Vec<_>>();
        // utime and stime are fields 14 and 15 of the stat line.
        return Some(fields[11].parse::<u64>().ok()? + fields[12].parse::<u64>().ok()?);
    }
    None
}

#[test]
#[cfg(target_os = "linux")]
fn unbound_sessions_do_not_spin() {
    let acceptor = DatagramAcceptor::new(UdpTransport::new(), Echo, config("keep")).unwrap();
    acceptor.filter_chain().add_last("keep-open", Arc::new(KeepOpen)).unwrap();
    let addr = acceptor.bind(&[loopback()]).unwrap()[0];
    let socket = peer();
    assert_eq!(exchange(&socket, addr, b"ping"), b"ping");

    // The close request issued by unbind is swallowed, so the session stays.
    acceptor.unbind_all().unwrap();
    assert!(acceptor.local_addresses().is_empty());
    assert_eq!(acceptor.managed_session_count(), 1);
    assert!(acceptor.is_active());

    let before = thread_cpu_ticks("keep-datagram").unwrap();
    thread::sleep(Duration::from_secs(1));
    let after = thread_cpu_ticks("keep-datagram").unwrap();
    assert!(after - before < 20, "datagram worker is busy looping: {} ticks", after - before);

    acceptor.dispose();
    wait_for(|| acceptor.managed_session_count() == 0);
    wait_for(|| !acceptor.is_active());
}
