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

use std::error::Error as StdError;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::session::SessionId;

/// Filter lifecycle hook which may fail during a structural change of a
/// [`crate::FilterChain`].
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display)]
#[display(doc_comments)]
pub enum LifecycleHook {
    /// on_pre_add
    PreAdd,

    /// on_post_add
    PostAdd,

    /// on_pre_remove
    PreRemove,

    /// on_post_remove
    PostRemove,
}

/// Errors produced by the framework and delivered either as a direct return
/// value, through an [`crate::IoFuture`] or via
/// [`crate::IoHandler::exception_caught`].
///
/// The error is cheaply clonable since a future replays its result to every
/// registered listener.
#[derive(Clone, Debug, Display, Error)]
#[display(doc_comments)]
pub enum Error {
    /// I/O error: {0}
    Io(Arc<io::Error>),

    /// the service has been disposed and can't accept new work
    Disposed,

    /// unable to bind {addr}: {cause}
    Bind { addr: SocketAddr, cause: Arc<io::Error> },

    /// address {0} is already bound
    AlreadyBound(SocketAddr),

    /// address {0} is not bound
    NotBound(SocketAddr),

    /// connection attempt to {0} has timed out
    ConnectTimeout(SocketAddr),

    /// the operation was cancelled
    Cancelled,

    /// write request was discarded since session {0} is closed
    WriteToClosedSession(SessionId),

    /// write request for session {0} has timed out
    WriteTimeout(SessionId),

    /// read operation is not enabled for session {0}
    ReadDisabled(SessionId),

    /// message reached the head of the filter chain without being encoded into bytes
    UnsupportedMessage,

    /// filter named '{0}' is already present in the chain
    DuplicateFilter(String),

    /// filter named '{0}' is not present in the chain
    UnknownFilter(String),

    /// {hook} hook of filter '{name}' has failed: {cause}
    FilterLifecycle {
        hook: LifecycleHook,
        name: String,
        cause: Box<Error>,
    },

    /// {0}
    Application(Arc<dyn StdError + Send + Sync>),
}

impl Error {
    /// Wraps any application-level error, so it can travel through the filter
    /// chain.
    pub fn application(err: impl StdError + Send + Sync + 'static) -> Self {
        Error::Application(Arc::new(err))
    }

    pub(crate) fn lifecycle(hook: LifecycleHook, name: &str, cause: Error) -> Self {
        Error::FilterLifecycle {
            hook,
            name: name.to_owned(),
            cause: Box::new(cause),
        }
    }

    /// Returns kind of the underlying I/O error, if the error originates from
    /// the OS.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Error::Io(err) | Error::Bind { cause: err, .. } => Some(err.kind()),
            _ => None,
        }
    }

    /// Detects errors which mean that the transport is no longer usable.
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io(_) | Error::WriteTimeout(_) | Error::WriteToClosedSession(_))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<io::ErrorKind> for Error {
    fn from(kind: io::ErrorKind) -> Self {
        Error::Io(Arc::new(kind.into()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display() {
        let err = Error::lifecycle(LifecycleHook::PostAdd, "codec", Error::Cancelled);
        let msg = err.to_string();
        assert!(msg.contains("on_post_add hook of filter 'codec' has failed"));
        assert!(msg.ends_with("the operation was cancelled"));
        assert_eq!(Error::from(io::ErrorKind::BrokenPipe).io_kind(), Some(io::ErrorKind::BrokenPipe));
    }
}
