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

use std::sync::Arc;

use crate::{Error, IdleStatus, IoSession, Message};

/// Application callbacks invoked by the tail of a filter chain.
///
/// All the callbacks for a given session run in the thread of the processor
/// owning the session, one at a time. Returning an error from a callback
/// redirects it to [`IoHandler::exception_caught`] through the chain.
pub trait IoHandler: Send + Sync + 'static {
    fn session_created(&self, _session: &Arc<IoSession>) -> Result<(), Error> { Ok(()) }

    fn session_opened(&self, _session: &Arc<IoSession>) -> Result<(), Error> { Ok(()) }

    fn session_closed(&self, _session: &Arc<IoSession>) -> Result<(), Error> { Ok(()) }

    fn session_idle(&self, _session: &Arc<IoSession>, _status: IdleStatus) -> Result<(), Error> { Ok(()) }

    fn message_received(&self, _session: &Arc<IoSession>, _message: Message) -> Result<(), Error> { Ok(()) }

    /// Called once the message written by the application is fully handed to
    /// the transport.
    fn message_sent(&self, _session: &Arc<IoSession>, _message: Message) -> Result<(), Error> { Ok(()) }

    /// Called when the remote side has shut down its output. Closes the
    /// session by default.
    fn input_closed(&self, session: &Arc<IoSession>) -> Result<(), Error> {
        session.close_now();
        Ok(())
    }

    fn exception_caught(&self, session: &Arc<IoSession>, error: &Error) {
        log::debug!(target: "session", "Unhandled error in session {}: {}", session.id(), error);
    }
}

/// Handler ignoring all events.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct NoopHandler;

impl IoHandler for NoopHandler {}
