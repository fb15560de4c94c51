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

use log::Level;

use crate::chain::NextFilter;
use crate::{Error, IdleStatus, IoFilter, IoSession, Message, WriteRequest};

/// Chain event kinds which may be logged by a [`LoggingFilter`].
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display)]
#[display(lowercase)]
pub enum FilterEvent {
    SessionCreated,
    SessionOpened,
    SessionClosed,
    SessionIdle,
    MessageReceived,
    MessageSent,
    ExceptionCaught,
    InputClosed,
    FilterWrite,
    FilterClose,
}

impl FilterEvent {
    pub const ALL: [FilterEvent; 10] = [
        FilterEvent::SessionCreated,
        FilterEvent::SessionOpened,
        FilterEvent::SessionClosed,
        FilterEvent::SessionIdle,
        FilterEvent::MessageReceived,
        FilterEvent::MessageSent,
        FilterEvent::ExceptionCaught,
        FilterEvent::InputClosed,
        FilterEvent::FilterWrite,
        FilterEvent::FilterClose,
    ];

    fn index(self) -> usize { self as usize }
}

/// Filter logging every event which passes through it with the `log`
/// facade, then forwarding it unchanged.
///
/// Each event kind has its own level; `None` disables logging of that kind.
/// By default exceptions are logged at `warn` and everything else at `info`.
#[derive(Clone, Debug)]
pub struct LoggingFilter {
    target: String,
    levels: [Option<Level>; 10],
}

impl Default for LoggingFilter {
    fn default() -> Self { LoggingFilter::new("iochain") }
}

impl LoggingFilter {
    /// Constructs filter logging with the provided `log` target.
    pub fn new(target: impl Into<String>) -> Self {
        let mut levels = [Some(Level::Info); 10];
        levels[FilterEvent::ExceptionCaught.index()] = Some(Level::Warn);
        LoggingFilter {
            target: target.into(),
            levels,
        }
    }

    pub fn target(&self) -> &str { &self.target }

    pub fn level(&self, event: FilterEvent) -> Option<Level> { self.levels[event.index()] }

    pub fn set_level(&mut self, event: FilterEvent, level: Option<Level>) { self.levels[event.index()] = level }

    pub fn with_level(mut self, event: FilterEvent, level: Option<Level>) -> Self {
        self.set_level(event, level);
        self
    }

    fn log(&self, event: FilterEvent, session: &IoSession, details: std::fmt::Arguments) {
        if let Some(level) = self.level(event) {
            log::log!(target: self.target.as_str(), level, "[{} {}] {}: {}", session.id(), session.remote_addr(), event, details);
        }
    }
}

impl IoFilter for LoggingFilter {
    fn session_created(&self, next: NextFilter, session: &Arc<IoSession>) -> Result<(), Error> {
        self.log(FilterEvent::SessionCreated, session, format_args!("local {}", session.local_addr()));
        next.session_created();
        Ok(())
    }

    fn session_opened(&self, next: NextFilter, session: &Arc<IoSession>) -> Result<(), Error> {
        self.log(FilterEvent::SessionOpened, session, format_args!("opened"));
        next.session_opened();
        Ok(())
    }

    fn session_closed(&self, next: NextFilter, session: &Arc<IoSession>) -> Result<(), Error> {
        self.log(
            FilterEvent::SessionClosed,
            session,
            format_args!("read {} bytes, written {} bytes", session.read_bytes(), session.written_bytes()),
        );
        next.session_closed();
        Ok(())
    }

    fn session_idle(&self, next: NextFilter, session: &Arc<IoSession>, status: IdleStatus) -> Result<(), Error> {
        self.log(FilterEvent::SessionIdle, session, format_args!("{status}"));
        next.session_idle(status);
        Ok(())
    }

    fn message_received(&self, next: NextFilter, session: &Arc<IoSession>, message: Message) -> Result<(), Error> {
        self.log(FilterEvent::MessageReceived, session, format_args!("{message:?}"));
        next.message_received(message);
        Ok(())
    }

    fn message_sent(&self, next: NextFilter, session: &Arc<IoSession>, request: WriteRequest) -> Result<(), Error> {
        self.log(FilterEvent::MessageSent, session, format_args!("{:?}", request.original_message()));
        next.message_sent(request);
        Ok(())
    }

    fn exception_caught(&self, next: NextFilter, session: &Arc<IoSession>, error: Error) -> Result<(), Error> {
        self.log(FilterEvent::ExceptionCaught, session, format_args!("{error}"));
        next.exception_caught(error);
        Ok(())
    }

    fn input_closed(&self, next: NextFilter, session: &Arc<IoSession>) -> Result<(), Error> {
        self.log(FilterEvent::InputClosed, session, format_args!("remote has shut down its output"));
        next.input_closed();
        Ok(())
    }

    fn filter_write(&self, next: NextFilter, session: &Arc<IoSession>, request: WriteRequest) -> Result<(), Error> {
        self.log(FilterEvent::FilterWrite, session, format_args!("{:?}", request.message()));
        next.filter_write(request);
        Ok(())
    }

    fn filter_close(&self, next: NextFilter, session: &Arc<IoSession>) -> Result<(), Error> {
        self.log(FilterEvent::FilterClose, session, format_args!("closing"));
        next.filter_close();
        Ok(())
    }
}
