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

use super::{FilterChain, Inbound, Links, Outbound};
use crate::{Error, IdleStatus, IoSession, Message, WriteRequest};

/// Interceptor of session events placed into a [`FilterChain`].
///
/// Every event method receives a [`NextFilter`] which must be used to pass the
/// (possibly transformed) event further; not calling it swallows the event.
/// Inbound events travel from the head to the tail of the chain, outbound
/// ones (`filter_write`, `filter_close`) from the tail to the head.
///
/// A filter instance may be shared by the chains of many sessions.
pub trait IoFilter: Send + Sync + 'static {
    /// Called before the filter is added to a chain. An error aborts the
    /// addition.
    fn on_pre_add(&self, _parent: &FilterChain, _name: &str) -> Result<(), Error> { Ok(()) }

    /// Called after the filter is added to a chain. An error unlinks the
    /// filter again.
    fn on_post_add(&self, _parent: &FilterChain, _name: &str) -> Result<(), Error> { Ok(()) }

    fn on_pre_remove(&self, _parent: &FilterChain, _name: &str) -> Result<(), Error> { Ok(()) }

    fn on_post_remove(&self, _parent: &FilterChain, _name: &str) -> Result<(), Error> { Ok(()) }

    fn session_created(&self, next: NextFilter, _session: &Arc<IoSession>) -> Result<(), Error> {
        next.session_created();
        Ok(())
    }

    fn session_opened(&self, next: NextFilter, _session: &Arc<IoSession>) -> Result<(), Error> {
        next.session_opened();
        Ok(())
    }

    fn session_closed(&self, next: NextFilter, _session: &Arc<IoSession>) -> Result<(), Error> {
        next.session_closed();
        Ok(())
    }

    fn session_idle(&self, next: NextFilter, _session: &Arc<IoSession>, status: IdleStatus) -> Result<(), Error> {
        next.session_idle(status);
        Ok(())
    }

    fn message_received(&self, next: NextFilter, _session: &Arc<IoSession>, message: Message) -> Result<(), Error> {
        next.message_received(message);
        Ok(())
    }

    fn message_sent(&self, next: NextFilter, _session: &Arc<IoSession>, request: WriteRequest) -> Result<(), Error> {
        next.message_sent(request);
        Ok(())
    }

    fn exception_caught(&self, next: NextFilter, _session: &Arc<IoSession>, error: Error) -> Result<(), Error> {
        next.exception_caught(error);
        Ok(())
    }

    fn input_closed(&self, next: NextFilter, _session: &Arc<IoSession>) -> Result<(), Error> {
        next.input_closed();
        Ok(())
    }

    fn filter_write(&self, next: NextFilter, _session: &Arc<IoSession>, request: WriteRequest) -> Result<(), Error> {
        next.filter_write(request);
        Ok(())
    }

    fn filter_close(&self, next: NextFilter, _session: &Arc<IoSession>) -> Result<(), Error> {
        next.filter_close();
        Ok(())
    }
}

/// Continuation handed to a filter: dispatches an event to the filter which
/// follows the current one in the direction of the event.
///
/// The continuation is bound to the chain snapshot taken when the event was
/// fired, so structural changes made meanwhile apply to later events only.
pub struct NextFilter<'chain> {
    pub(super) chain: &'chain FilterChain,
    pub(super) links: &'chain Arc<Links>,
    pub(super) session: &'chain Arc<IoSession>,
    pub(super) position: usize,
}

impl<'chain> NextFilter<'chain> {
    fn forward(&self, event: Inbound) {
        self.chain.forward(self.links, self.session, self.position + 1, event)
    }

    fn backward(&self, event: Outbound) {
        self.chain.backward(self.links, self.session, self.position.checked_sub(1), event)
    }

    pub fn session_created(&self) { self.forward(Inbound::Created) }

    pub fn session_opened(&self) { self.forward(Inbound::Opened) }

    pub fn session_closed(&self) { self.forward(Inbound::Closed) }

    pub fn session_idle(&self, status: IdleStatus) { self.forward(Inbound::Idle(status)) }

    pub fn message_received(&self, message: Message) { self.forward(Inbound::Received(message)) }

    pub fn message_sent(&self, request: WriteRequest) { self.forward(Inbound::Sent(request)) }

    pub fn exception_caught(&self, error: Error) { self.forward(Inbound::Exception(error)) }

    pub fn input_closed(&self) { self.forward(Inbound::InputClosed) }

    pub fn filter_write(&self, request: WriteRequest) { self.backward(Outbound::Write(request)) }

    pub fn filter_close(&self) { self.backward(Outbound::Close) }
}
