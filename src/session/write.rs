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

use std::net::SocketAddr;

use crossbeam_channel as chan;

use crate::{Error, Message, WriteFuture};

/// Request to write a message into a session, travelling from the tail of
/// the filter chain to the processor.
#[derive(Clone, Debug)]
pub struct WriteRequest {
    message: Message,
    original: Option<Message>,
    destination: Option<SocketAddr>,
    future: WriteFuture,
    close_marker: bool,
}

impl WriteRequest {
    pub fn new(message: impl Into<Message>, destination: Option<SocketAddr>) -> Self {
        WriteRequest {
            message: message.into(),
            original: None,
            destination,
            future: WriteFuture::new(),
            close_marker: false,
        }
    }

    /// Marker request which closes the session once all writes queued before
    /// it are flushed.
    pub(crate) fn close_marker() -> Self {
        WriteRequest {
            message: Message::new(()),
            original: None,
            destination: None,
            future: WriteFuture::new(),
            close_marker: true,
        }
    }

    /// Message in its current (possibly encoded) form.
    pub fn message(&self) -> &Message { &self.message }

    /// Message as it was originally written by the application.
    pub fn original_message(&self) -> &Message { self.original.as_ref().unwrap_or(&self.message) }

    /// Replaces the message with its transformed form, remembering the
    /// original one. Used by encoding filters.
    pub fn encode(mut self, message: impl Into<Message>) -> Self {
        let message = message.into();
        if self.original.is_none() {
            self.original = Some(self.message);
        }
        self.message = message;
        self
    }

    pub fn destination(&self) -> Option<SocketAddr> { self.destination }

    pub fn future(&self) -> &WriteFuture { &self.future }

    pub fn is_close_marker(&self) -> bool { self.close_marker }
}

/// FIFO queue of write requests of a single session, fed by any thread and
/// drained by the owning processor.
#[derive(Debug)]
pub(crate) struct WriteQueue {
    send: chan::Sender<WriteRequest>,
    recv: chan::Receiver<WriteRequest>,
}

impl WriteQueue {
    pub fn new() -> Self {
        let (send, recv) = chan::unbounded();
        WriteQueue { send, recv }
    }

    pub fn push(&self, request: WriteRequest) {
        // Both sides are owned by the queue, so the channel can't be
        // disconnected.
        let _ = self.send.send(request);
    }

    pub fn poll(&self) -> Option<WriteRequest> { self.recv.try_recv().ok() }

    pub fn is_empty(&self) -> bool { self.recv.is_empty() }

    /// Fails all queued requests, returning how many of them there were.
    pub fn dispose(&self, err: &Error) -> usize {
        let mut count = 0;
        while let Some(request) = self.poll() {
            request.future.fail(err.clone());
            count += 1;
        }
        count
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn encoding_keeps_original() {
        let request = WriteRequest::new("hello", None).encode(Bytes::from_static(b"\x05hello"));
        let request = request.encode(Bytes::from_static(b"\x00\x05hello"));
        assert_eq!(request.message().len(), Some(7));
        assert_eq!(request.original_message().len(), Some(5));
    }

    #[test]
    fn queue_order_and_disposal() {
        let queue = WriteQueue::new();
        let first = WriteRequest::new("a", None);
        let second = WriteRequest::new("b", None);
        let futures = [first.future().clone(), second.future().clone()];
        queue.push(first);
        queue.push(second);
        assert!(!queue.is_empty());
        assert_eq!(queue.poll().and_then(|r| r.message().len()), Some(1));
        assert_eq!(queue.dispose(&Error::Cancelled), 1);
        assert!(queue.is_empty());
        assert!(!futures[0].is_done());
        assert!(futures[1].wait_result().is_err());
    }
}
