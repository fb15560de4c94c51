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

//! Non-blocking network I/O framework.
//!
//! Sessions are driven by a small set of worker threads, each owning a
//! readiness poller:
//! - [`Processor`]s perform reads, writes and idle detection for the sessions
//!   assigned to them;
//! - an [`Acceptor`] binds listening handles and hands accepted connections
//!   to its [`ProcessorPool`];
//! - a [`Connector`] completes outgoing connections, enforcing their
//!   deadlines;
//! - a [`DatagramAcceptor`] serves connectionless transports, mapping remote
//!   peers to sessions.
//!
//! Every event of a session travels through its [`FilterChain`] before
//! reaching the application [`IoHandler`]. Operations crossing threads
//! return an [`IoFuture`].
//!
//! Worker threads are started lazily when there is work and exit when they
//! become idle.

#[macro_use]
extern crate amplify;

mod error;
pub mod future;
mod message;
mod poller;
mod worker;

pub mod chain;
pub mod filters;
mod handler;
pub mod session;

pub mod processor;
mod service;
pub mod transport;

mod acceptor;
mod connector;
mod datagram;

#[cfg(test)]
mod testing;

pub use acceptor::Acceptor;
pub use chain::{DefaultFilterChainBuilder, FilterChain, FilterChainBuilder, IoFilter, NextFilter};
pub use connector::Connector;
pub use datagram::{
    DatagramAcceptor, ExpiringSessionRecycler, NoopSessionRecycler, SessionRecycler, DEFAULT_SESSION_TTL,
};
pub use error::{Error, LifecycleHook};
pub use filters::LoggingFilter;
pub use future::{
    BindFuture, CloseFuture, ConnectFuture, IoFuture, Outcome, ReadFuture, ReadOutcome, UnbindFuture, WriteFuture,
};
pub use handler::{IoHandler, NoopHandler};
pub use message::Message;
pub use processor::{IoProcessor, Processor, ProcessorPool};
pub use service::{IoService, ServiceConfig, ServiceContext, DEFAULT_CONNECT_TIMEOUT, DEFAULT_SELECT_TIMEOUT};
pub use session::{IdleStatus, IoSession, SessionConfig, SessionId, SessionState, WriteRequest};
pub use transport::{
    Connect, Datagram, Listen, ReadResult, TcpTransport, Transport, TransportMetadata, UdpTransport,
};
