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

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};

use socket2::{Domain, Protocol, SockRef, Socket, Type};

use super::{would_block, Connect, Listen, ReadResult, Transport, TransportMetadata};

/// Backlog of listening sockets.
const LISTEN_BACKLOG: i32 = 128;

/// TCP transport over std sockets set into non-blocking mode.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct TcpTransport {
    /// Whether to disable Nagle's algorithm on accepted and connected streams.
    pub no_delay: bool,
}

impl Default for TcpTransport {
    fn default() -> Self { TcpTransport { no_delay: true } }
}

impl TcpTransport {
    pub fn new() -> Self { default!() }
}

impl Transport for TcpTransport {
    type Handle = TcpStream;

    fn metadata(&self) -> TransportMetadata {
        TransportMetadata {
            name: "tcp",
            connectionless: false,
            has_fragmentation: true,
        }
    }

    fn read(&self, handle: &mut TcpStream, buf: &mut [u8]) -> io::Result<ReadResult> {
        match handle.read(buf) {
            Ok(0) if !buf.is_empty() => Ok(ReadResult::Eof),
            Ok(len) => Ok(ReadResult::Bytes(len)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(ReadResult::Empty),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(ReadResult::Empty),
            Err(err) => Err(err),
        }
    }

    fn write(&self, handle: &mut TcpStream, buf: &[u8], _destination: Option<SocketAddr>) -> io::Result<usize> {
        would_block(handle.write(buf))
    }

    fn close(&self, handle: TcpStream) -> io::Result<()> {
        match handle.shutdown(Shutdown::Both) {
            Err(err) if err.kind() != io::ErrorKind::NotConnected => Err(err),
            _ => Ok(()),
        }
    }

    fn local_addr(&self, handle: &TcpStream) -> io::Result<SocketAddr> { handle.local_addr() }

    fn remote_addr(&self, handle: &TcpStream) -> io::Result<SocketAddr> { handle.peer_addr() }
}

impl Listen for TcpTransport {
    type Server = TcpListener;

    fn open_server(&self, addr: SocketAddr) -> io::Result<TcpListener> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    }

    fn server_addr(&self, server: &TcpListener) -> io::Result<SocketAddr> { server.local_addr() }

    fn accept(&self, server: &TcpListener) -> io::Result<Option<TcpStream>> {
        match server.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(true)?;
                stream.set_nodelay(self.no_delay)?;
                Ok(Some(stream))
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn close_server(&self, server: TcpListener) -> io::Result<()> {
        drop(server);
        Ok(())
    }
}

impl Connect for TcpTransport {
    fn open(&self, remote: SocketAddr, local: Option<SocketAddr>) -> io::Result<TcpStream> {
        let socket = Socket::new(Domain::for_address(remote), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_nodelay(self.no_delay)?;
        if let Some(local) = local {
            socket.set_reuse_address(true)?;
            socket.bind(&local.into())?;
        }
        Ok(socket.into())
    }

    fn connect(&self, handle: &TcpStream, remote: SocketAddr) -> io::Result<bool> {
        match SockRef::from(handle).connect(&remote.into()) {
            Ok(()) => Ok(true),
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(false),
            Err(e) if e.raw_os_error() == Some(libc::EALREADY) => Err(io::Error::from(io::ErrorKind::AlreadyExists)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn finish_connect(&self, handle: &TcpStream) -> io::Result<bool> {
        if let Some(err) = handle.take_error()? {
            return Err(err);
        }
        match handle.peer_addr() {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(err) => Err(err),
        }
    }
}
