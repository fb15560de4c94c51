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

//! Abstraction over socket kinds driven by the processors.

mod tcp;
mod udp;

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;

pub use self::tcp::TcpTransport;
pub use self::udp::UdpTransport;

/// Static properties of a transport.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct TransportMetadata {
    /// Transport name used in logs.
    pub name: &'static str,
    /// Whether the transport has no notion of a connection (datagrams).
    pub connectionless: bool,
    /// Whether a single message may arrive split into several reads, so
    /// readers must keep reading until the handle is drained.
    pub has_fragmentation: bool,
}

/// Outcome of a non-blocking read.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum ReadResult {
    /// Number of bytes read into the buffer.
    Bytes(usize),
    /// No data is available at this moment.
    Empty,
    /// The remote peer has shut down its side of the connection.
    Eof,
}

/// Transport operating on the handles of established sessions.
///
/// All the operations are non-blocking: a write which can't make progress
/// returns `Ok(0)`, a read with no data returns [`ReadResult::Empty`].
pub trait Transport: Send + Sync + 'static {
    type Handle: AsRawFd + Send + 'static;

    fn metadata(&self) -> TransportMetadata;

    fn read(&self, handle: &mut Self::Handle, buf: &mut [u8]) -> io::Result<ReadResult>;

    fn write(&self, handle: &mut Self::Handle, buf: &[u8], destination: Option<SocketAddr>) -> io::Result<usize>;

    fn close(&self, handle: Self::Handle) -> io::Result<()>;

    fn local_addr(&self, handle: &Self::Handle) -> io::Result<SocketAddr>;

    fn remote_addr(&self, handle: &Self::Handle) -> io::Result<SocketAddr>;
}

/// Transport able to accept incoming connections.
pub trait Listen: Transport {
    type Server: AsRawFd + Send + 'static;

    /// Binds a non-blocking listening handle to the address.
    fn open_server(&self, addr: SocketAddr) -> io::Result<Self::Server>;

    fn server_addr(&self, server: &Self::Server) -> io::Result<SocketAddr>;

    /// Accepts a pending connection, returning `None` when there is none.
    fn accept(&self, server: &Self::Server) -> io::Result<Option<Self::Handle>>;

    fn close_server(&self, server: Self::Server) -> io::Result<()>;
}

/// Transport able to initiate connections.
pub trait Connect: Transport {
    /// Creates a non-blocking handle, optionally bound to a local address.
    /// `remote` is the address the handle is going to connect to.
    fn open(&self, remote: SocketAddr, local: Option<SocketAddr>) -> io::Result<Self::Handle>;

    /// Starts connecting the handle. Returns `true` if the connection was
    /// established immediately.
    fn connect(&self, handle: &Self::Handle, remote: SocketAddr) -> io::Result<bool>;

    /// Completes a pending connection after the handle became writable.
    /// Returns `false` if the connection is still in progress.
    fn finish_connect(&self, handle: &Self::Handle) -> io::Result<bool>;
}

/// Connectionless transport serving many remote peers from a single bound
/// handle.
pub trait Datagram: Transport {
    type Server: AsRawFd + Send + 'static;

    fn open_server(&self, addr: SocketAddr) -> io::Result<Self::Server>;

    fn server_addr(&self, server: &Self::Server) -> io::Result<SocketAddr>;

    /// Receives a single datagram, returning `None` when there is none.
    fn recv_from(&self, server: &Self::Server, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    /// Sends a single datagram; returns `Ok(0)` if the socket buffer is full.
    fn send_to(&self, server: &Self::Server, buf: &[u8], destination: SocketAddr) -> io::Result<usize>;

    fn close_server(&self, server: Self::Server) -> io::Result<()>;
}

pub(crate) fn would_block<T: Default>(res: io::Result<T>) -> io::Result<T> {
    match res {
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(T::default()),
        Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(T::default()),
        res => res,
    }
}
