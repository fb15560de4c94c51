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
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use super::{would_block, Connect, Datagram, ReadResult, Transport, TransportMetadata};

/// UDP transport. Connected sockets serve connector sessions, bound sockets
/// serve the sessions of a datagram acceptor.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct UdpTransport;

impl UdpTransport {
    pub fn new() -> Self { UdpTransport }

    fn bind(addr: SocketAddr) -> io::Result<UdpSocket> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(socket)
    }
}

impl Transport for UdpTransport {
    type Handle = UdpSocket;

    fn metadata(&self) -> TransportMetadata {
        TransportMetadata {
            name: "udp",
            connectionless: true,
            has_fragmentation: false,
        }
    }

    fn read(&self, handle: &mut UdpSocket, buf: &mut [u8]) -> io::Result<ReadResult> {
        match handle.recv(buf) {
            Ok(len) => Ok(ReadResult::Bytes(len)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(ReadResult::Empty),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(ReadResult::Empty),
            Err(err) => Err(err),
        }
    }

    fn write(&self, handle: &mut UdpSocket, buf: &[u8], _destination: Option<SocketAddr>) -> io::Result<usize> {
        // The socket is connected, so the destination is always the peer.
        would_block(handle.send(buf))
    }

    fn close(&self, handle: UdpSocket) -> io::Result<()> {
        drop(handle);
        Ok(())
    }

    fn local_addr(&self, handle: &UdpSocket) -> io::Result<SocketAddr> { handle.local_addr() }

    fn remote_addr(&self, handle: &UdpSocket) -> io::Result<SocketAddr> { handle.peer_addr() }
}

impl Connect for UdpTransport {
    fn open(&self, remote: SocketAddr, local: Option<SocketAddr>) -> io::Result<UdpSocket> {
        let local = local.unwrap_or_else(|| match remote {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        });
        Self::bind(local)
    }

    fn connect(&self, handle: &UdpSocket, remote: SocketAddr) -> io::Result<bool> {
        handle.connect(remote)?;
        Ok(true)
    }

    fn finish_connect(&self, _handle: &UdpSocket) -> io::Result<bool> { Ok(true) }
}

impl Datagram for UdpTransport {
    type Server = UdpSocket;

    fn open_server(&self, addr: SocketAddr) -> io::Result<UdpSocket> { Self::bind(addr) }

    fn server_addr(&self, server: &UdpSocket) -> io::Result<SocketAddr> { server.local_addr() }

    fn recv_from(&self, server: &UdpSocket, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match server.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn send_to(&self, server: &UdpSocket, buf: &[u8], destination: SocketAddr) -> io::Result<usize> {
        would_block(server.send_to(buf, destination))
    }

    fn close_server(&self, server: UdpSocket) -> io::Result<()> {
        drop(server);
        Ok(())
    }
}
