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

//! Ordered, mutable pipeline of event interceptors attached to each session.

mod builder;
mod filter;

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Weak};

use parking_lot::{ReentrantMutex, RwLock};

pub use self::builder::{DefaultFilterChainBuilder, FilterChainBuilder};
pub use self::filter::{IoFilter, NextFilter};
use crate::error::LifecycleHook;
use crate::{Error, IdleStatus, IoSession, Message, WriteRequest};

/// Events travelling from the head to the tail.
pub(crate) enum Inbound {
    Created,
    Opened,
    Closed,
    Idle(IdleStatus),
    Received(Message),
    Sent(WriteRequest),
    Exception(Error),
    InputClosed,
}

/// Events travelling from the tail to the head.
pub(crate) enum Outbound {
    Write(WriteRequest),
    Close,
}

#[derive(Clone)]
pub(crate) struct Entry {
    name: String,
    filter: Arc<dyn IoFilter>,
}

/// Immutable snapshot of the chain entries between the head and the tail.
#[derive(Clone, Default)]
pub(crate) struct Links {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl Links {
    fn position(&self, name: &str) -> Result<usize, Error> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownFilter(name.to_owned()))
    }

    fn reindex(&mut self) {
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(pos, entry)| (entry.name.clone(), pos))
            .collect();
    }

    fn inserted(&self, at: usize, entry: Entry) -> Links {
        let mut links = self.clone();
        links.entries.insert(at, entry);
        links.reindex();
        links
    }

    fn removed(&self, at: usize) -> Links {
        let mut links = self.clone();
        links.entries.remove(at);
        links.reindex();
        links
    }

    fn replaced(&self, at: usize, filter: Arc<dyn IoFilter>) -> Links {
        let mut links = self.clone();
        links.entries[at].filter = filter;
        links
    }
}

#[derive(Copy, Clone, Debug)]
enum Placement<'a> {
    First,
    Last,
    Before(&'a str),
    After(&'a str),
}

/// Filter chain of a single session.
///
/// Structural changes are serialized and publish a new snapshot of the
/// entries; events are dispatched over the snapshot current at the time they
/// were fired, so mutations never block the dispatch.
pub struct FilterChain {
    session: Weak<IoSession>,
    links: RwLock<Arc<Links>>,
    mutator: ReentrantMutex<()>,
}

impl Debug for FilterChain {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl FilterChain {
    pub(crate) fn new(session: Weak<IoSession>) -> Self {
        FilterChain {
            session,
            links: RwLock::new(default!()),
            mutator: ReentrantMutex::new(()),
        }
    }

    /// Session owning the chain, unless it was already dropped.
    pub fn session(&self) -> Option<Arc<IoSession>> { self.session.upgrade() }

    fn snapshot(&self) -> Arc<Links> { self.links.read().clone() }

    pub fn names(&self) -> Vec<String> {
        self.snapshot()
            .entries
            .iter()
            .map(|entry| entry.name.clone())
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn IoFilter>> {
        let links = self.snapshot();
        links
            .index
            .get(name)
            .map(|pos| links.entries[*pos].filter.clone())
    }

    pub fn contains(&self, name: &str) -> bool { self.snapshot().index.contains_key(name) }

    pub fn len(&self) -> usize { self.snapshot().entries.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn add_first(&self, name: impl Into<String>, filter: Arc<dyn IoFilter>) -> Result<(), Error> {
        self.insert(Placement::First, name.into(), filter)
    }

    pub fn add_last(&self, name: impl Into<String>, filter: Arc<dyn IoFilter>) -> Result<(), Error> {
        self.insert(Placement::Last, name.into(), filter)
    }

    pub fn add_before(&self, base: &str, name: impl Into<String>, filter: Arc<dyn IoFilter>) -> Result<(), Error> {
        self.insert(Placement::Before(base), name.into(), filter)
    }

    pub fn add_after(&self, base: &str, name: impl Into<String>, filter: Arc<dyn IoFilter>) -> Result<(), Error> {
        self.insert(Placement::After(base), name.into(), filter)
    }

    fn insert(&self, placement: Placement, name: String, filter: Arc<dyn IoFilter>) -> Result<(), Error> {
        let _guard = self.mutator.lock();
        let current = self.snapshot();
        if current.index.contains_key(&name) {
            return Err(Error::DuplicateFilter(name));
        }
        let at = match placement {
            Placement::First => 0,
            Placement::Last => current.entries.len(),
            Placement::Before(base) => current.position(base)?,
            Placement::After(base) => current.position(base)? + 1,
        };

        filter
            .on_pre_add(self, &name)
            .map_err(|err| Error::lifecycle(LifecycleHook::PreAdd, &name, err))?;
        let entry = Entry {
            name: name.clone(),
            filter: filter.clone(),
        };
        *self.links.write() = Arc::new(current.inserted(at, entry));
        if let Err(err) = filter.on_post_add(self, &name) {
            *self.links.write() = current;
            return Err(Error::lifecycle(LifecycleHook::PostAdd, &name, err));
        }
        log::trace!(target: "chain", "Filter '{}' added at position {}", name, at);
        Ok(())
    }

    /// Removes the named filter and returns it.
    ///
    /// If the post-remove hook fails the filter stays removed and the error is
    /// returned.
    pub fn remove(&self, name: &str) -> Result<Arc<dyn IoFilter>, Error> {
        let _guard = self.mutator.lock();
        let current = self.snapshot();
        let at = current.position(name)?;
        let filter = current.entries[at].filter.clone();

        filter
            .on_pre_remove(self, name)
            .map_err(|err| Error::lifecycle(LifecycleHook::PreRemove, name, err))?;
        *self.links.write() = Arc::new(current.removed(at));
        filter
            .on_post_remove(self, name)
            .map_err(|err| Error::lifecycle(LifecycleHook::PostRemove, name, err))?;
        log::trace!(target: "chain", "Filter '{}' removed", name);
        Ok(filter)
    }

    /// Replaces the named filter with a new one, returning the old filter.
    /// Only the add hooks of the new filter are invoked; if its post-add hook
    /// fails the old filter is restored.
    pub fn replace(&self, name: &str, filter: Arc<dyn IoFilter>) -> Result<Arc<dyn IoFilter>, Error> {
        let _guard = self.mutator.lock();
        let current = self.snapshot();
        let at = current.position(name)?;
        let old = current.entries[at].filter.clone();

        filter
            .on_pre_add(self, name)
            .map_err(|err| Error::lifecycle(LifecycleHook::PreAdd, name, err))?;
        *self.links.write() = Arc::new(current.replaced(at, filter.clone()));
        if let Err(err) = filter.on_post_add(self, name) {
            *self.links.write() = current;
            return Err(Error::lifecycle(LifecycleHook::PostAdd, name, err));
        }
        Ok(old)
    }

    /// Removes all filters, head to tail. Keeps going on hook failures and
    /// returns the first of them.
    pub fn clear(&self) -> Result<(), Error> {
        let _guard = self.mutator.lock();
        let mut result = Ok(());
        for name in self.names() {
            if let Err(err) = self.remove(&name) {
                log::warn!(target: "chain", "Unable to remove filter '{}': {}", name, err);
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    pub fn fire_session_created(&self) { self.fire(Inbound::Created) }

    pub fn fire_session_opened(&self) { self.fire(Inbound::Opened) }

    pub fn fire_session_closed(&self) { self.fire(Inbound::Closed) }

    pub fn fire_session_idle(&self, status: IdleStatus) { self.fire(Inbound::Idle(status)) }

    pub fn fire_message_received(&self, message: Message) { self.fire(Inbound::Received(message)) }

    /// Notifies the chain that the request was fully written. Completes the
    /// request future before the event is propagated.
    pub fn fire_message_sent(&self, request: WriteRequest) {
        request.future().complete(());
        self.fire(Inbound::Sent(request))
    }

    pub fn fire_exception_caught(&self, error: Error) { self.fire(Inbound::Exception(error)) }

    pub fn fire_input_closed(&self) { self.fire(Inbound::InputClosed) }

    pub fn fire_filter_write(&self, request: WriteRequest) {
        let Some(session) = self.session.upgrade() else {
            request.future().fail(Error::Disposed);
            return;
        };
        let links = self.snapshot();
        self.backward(&links, &session, links.entries.len().checked_sub(1), Outbound::Write(request))
    }

    pub fn fire_filter_close(&self) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let links = self.snapshot();
        self.backward(&links, &session, links.entries.len().checked_sub(1), Outbound::Close)
    }

    fn fire(&self, event: Inbound) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let links = self.snapshot();
        self.forward(&links, &session, 0, event)
    }

    pub(crate) fn forward(&self, links: &Arc<Links>, session: &Arc<IoSession>, position: usize, event: Inbound) {
        let is_exception = matches!(event, Inbound::Exception(_));
        let Some(entry) = links.entries.get(position) else {
            if let Err(err) = self.tail(session, event) {
                self.handle_error(session, err, is_exception);
            }
            return;
        };

        let next = NextFilter {
            chain: self,
            links,
            session,
            position,
        };
        let filter = &entry.filter;
        let res = match event {
            Inbound::Created => filter.session_created(next, session),
            Inbound::Opened => filter.session_opened(next, session),
            Inbound::Closed => filter.session_closed(next, session),
            Inbound::Idle(status) => filter.session_idle(next, session, status),
            Inbound::Received(message) => filter.message_received(next, session, message),
            Inbound::Sent(request) => filter.message_sent(next, session, request),
            Inbound::Exception(error) => filter.exception_caught(next, session, error),
            Inbound::InputClosed => filter.input_closed(next, session),
        };
        if let Err(err) = res {
            log::trace!(target: "chain", "Filter '{}' of session {} has failed: {}", entry.name, session.id(), err);
            self.handle_error(session, err, is_exception);
        }
    }

    pub(crate) fn backward(
        &self,
        links: &Arc<Links>,
        session: &Arc<IoSession>,
        position: Option<usize>,
        event: Outbound,
    ) {
        let Some((position, entry)) = position.and_then(|pos| links.entries.get(pos).map(|entry| (pos, entry)))
        else {
            if let Err(err) = self.head(session, event) {
                self.handle_error(session, err, false);
            }
            return;
        };

        let next = NextFilter {
            chain: self,
            links,
            session,
            position,
        };
        let res = match event {
            Outbound::Write(request) => entry.filter.filter_write(next, session, request),
            Outbound::Close => entry.filter.filter_close(next, session),
        };
        if let Err(err) = res {
            log::trace!(target: "chain", "Filter '{}' of session {} has failed: {}", entry.name, session.id(), err);
            self.handle_error(session, err, false);
        }
    }

    fn handle_error(&self, session: &Arc<IoSession>, err: Error, during_exception: bool) {
        if during_exception {
            log::warn!(target: "chain", "Error while handling an exception in session {}: {}", session.id(), err);
            return;
        }
        if let Some(future) = session.take_connect_future() {
            session.close_now();
            future.fail(err);
            return;
        }
        self.fire_exception_caught(err);
    }

    fn head(&self, session: &Arc<IoSession>, event: Outbound) -> Result<(), Error> {
        match event {
            Outbound::Write(request) => {
                let Some(len) = request.message().len() else {
                    request.future().fail(Error::UnsupportedMessage);
                    return Err(Error::UnsupportedMessage);
                };
                if session.is_closing() {
                    request.future().fail(Error::WriteToClosedSession(session.id()));
                    return Ok(());
                }
                session.record_scheduled(len);
                session.processor().write(session, request);
            }
            Outbound::Close => session.processor().remove(session),
        }
        Ok(())
    }

    fn tail(&self, session: &Arc<IoSession>, event: Inbound) -> Result<(), Error> {
        let handler = session.handler();
        match event {
            Inbound::Created => {
                handler.session_created(session)?;
                if let Some(future) = session.take_connect_future() {
                    if !future.complete(session.clone()) {
                        log::debug!(target: "chain", "Connect future of session {} was cancelled", session.id());
                        session.close_now();
                    }
                }
                Ok(())
            }
            Inbound::Opened => handler.session_opened(session),
            Inbound::Closed => {
                let res = handler.session_closed(session);
                let discarded = session
                    .write_queue()
                    .dispose(&Error::WriteToClosedSession(session.id()));
                if discarded > 0 {
                    log::trace!(target: "chain", "{} pending writes of session {} discarded", discarded, session.id());
                }
                if let Err(err) = self.clear() {
                    log::warn!(target: "chain", "Filter chain of session {} was not cleared: {}", session.id(), err);
                }
                session.offer_read_closed();
                res
            }
            Inbound::Idle(status) => handler.session_idle(session, status),
            Inbound::Received(message) => {
                session.record_read_message();
                if session.config().use_read_operation {
                    session.offer_read(Ok(message.clone()));
                }
                handler.message_received(session, message)
            }
            Inbound::Sent(request) => {
                session.record_written_message();
                handler.message_sent(session, request.original_message().clone())
            }
            Inbound::Exception(error) => {
                if session.config().use_read_operation {
                    session.offer_read(Err(error.clone()));
                }
                handler.exception_caught(session, &error);
                Ok(())
            }
            Inbound::InputClosed => handler.input_closed(session),
        }
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;
    use parking_lot::Mutex;
    use quickcheck_macros::quickcheck;

    use super::*;
    use crate::testing::{self, RecordingProcessor};
    use crate::{IoHandler, NoopHandler};

    type Log = Arc<Mutex<Vec<String>>>;

    struct Nop;
    impl IoFilter for Nop {}

    struct Tracer {
        name: &'static str,
        log: Log,
    }

    impl IoFilter for Tracer {
        fn message_received(&self, next: NextFilter, _: &Arc<IoSession>, message: Message) -> Result<(), Error> {
            self.log.lock().push(format!("{}:received", self.name));
            next.message_received(message);
            Ok(())
        }

        fn filter_write(&self, next: NextFilter, _: &Arc<IoSession>, request: WriteRequest) -> Result<(), Error> {
            self.log.lock().push(format!("{}:write", self.name));
            next.filter_write(request);
            Ok(())
        }
    }

    struct Faulty(LifecycleHook);

    impl Faulty {
        fn check(&self, hook: LifecycleHook) -> Result<(), Error> {
            if self.0 == hook {
                return Err(Error::Cancelled);
            }
            Ok(())
        }
    }

    impl IoFilter for Faulty {
        fn on_pre_add(&self, _: &FilterChain, _: &str) -> Result<(), Error> { self.check(LifecycleHook::PreAdd) }
        fn on_post_add(&self, _: &FilterChain, _: &str) -> Result<(), Error> { self.check(LifecycleHook::PostAdd) }
        fn on_pre_remove(&self, _: &FilterChain, _: &str) -> Result<(), Error> {
            self.check(LifecycleHook::PreRemove)
        }
        fn on_post_remove(&self, _: &FilterChain, _: &str) -> Result<(), Error> {
            self.check(LifecycleHook::PostRemove)
        }
    }

    struct U32Encoder;

    impl IoFilter for U32Encoder {
        fn filter_write(&self, next: NextFilter, _: &Arc<IoSession>, request: WriteRequest) -> Result<(), Error> {
            match request.message().downcast_ref::<u32>().copied() {
                Some(value) => next.filter_write(request.encode(Bytes::copy_from_slice(&value.to_be_bytes()))),
                None => next.filter_write(request),
            }
            Ok(())
        }
    }

    struct Recorder(Log);

    impl IoHandler for Recorder {
        fn message_received(&self, _: &Arc<IoSession>, _: Message) -> Result<(), Error> {
            self.0.lock().push(s!("handler:received"));
            Ok(())
        }

        fn message_sent(&self, _: &Arc<IoSession>, message: Message) -> Result<(), Error> {
            self.0.lock().push(format!("handler:sent:{}", message.downcast_ref::<u32>().copied().unwrap_or(0)));
            Ok(())
        }

        fn exception_caught(&self, _: &Arc<IoSession>, error: &Error) {
            self.0.lock().push(format!("handler:exception:{error}"));
        }
    }

    fn setup(log: &Log) -> (Arc<IoSession>, Arc<RecordingProcessor>) {
        let context = testing::context(Arc::new(Recorder(log.clone())));
        let processor = Arc::new(RecordingProcessor::default());
        let session = testing::session(&context, processor.clone(), "127.0.0.1:1000");
        (session, processor)
    }

    #[test]
    fn placement() {
        let (session, _) = setup(&default!());
        let chain = session.filter_chain();
        chain.add_last("a", Arc::new(Nop)).unwrap();
        chain.add_last("c", Arc::new(Nop)).unwrap();
        chain.add_before("c", "b", Arc::new(Nop)).unwrap();
        chain.add_first("z", Arc::new(Nop)).unwrap();
        chain.add_after("c", "d", Arc::new(Nop)).unwrap();
        assert_eq!(chain.names(), vec!["z", "a", "b", "c", "d"]);

        assert!(matches!(chain.add_last("a", Arc::new(Nop)), Err(Error::DuplicateFilter(name)) if name == "a"));
        assert!(matches!(chain.add_before("x", "y", Arc::new(Nop)), Err(Error::UnknownFilter(name)) if name == "x"));
        assert!(matches!(chain.remove("x"), Err(Error::UnknownFilter(_))));
        assert_eq!(chain.len(), 5);

        chain.remove("b").unwrap();
        assert_eq!(chain.names(), vec!["z", "a", "c", "d"]);
        chain.replace("c", Arc::new(U32Encoder)).unwrap();
        assert_eq!(chain.names(), vec!["z", "a", "c", "d"]);
        chain.clear().unwrap();
        assert!(chain.is_empty());
    }

    #[test]
    fn lifecycle_failures() {
        let (session, _) = setup(&default!());
        let chain = session.filter_chain();
        chain.add_last("base", Arc::new(Nop)).unwrap();

        let err = chain.add_last("f", Arc::new(Faulty(LifecycleHook::PreAdd))).unwrap_err();
        assert!(matches!(err, Error::FilterLifecycle { hook: LifecycleHook::PreAdd, .. }));
        assert!(!chain.contains("f"));

        let err = chain.add_first("f", Arc::new(Faulty(LifecycleHook::PostAdd))).unwrap_err();
        assert!(matches!(err, Error::FilterLifecycle { hook: LifecycleHook::PostAdd, .. }));
        assert_eq!(chain.names(), vec!["base"]);

        chain.add_last("f", Arc::new(Faulty(LifecycleHook::PreRemove))).unwrap();
        assert!(chain.remove("f").is_err());
        assert!(chain.contains("f"));

        chain.replace("f", Arc::new(Faulty(LifecycleHook::PostRemove))).unwrap();
        let err = chain.remove("f").err().unwrap();
        assert!(matches!(err, Error::FilterLifecycle { hook: LifecycleHook::PostRemove, .. }));
        assert_eq!(chain.names(), vec!["base"]);

        let err = chain.replace("base", Arc::new(Faulty(LifecycleHook::PostAdd))).err().unwrap();
        assert!(matches!(err, Error::FilterLifecycle { hook: LifecycleHook::PostAdd, .. }));
        assert!(chain.get("base").is_some());
    }

    #[test]
    fn mutation_from_hook() {
        struct Spawner;
        impl IoFilter for Spawner {
            fn on_post_add(&self, parent: &FilterChain, _: &str) -> Result<(), Error> {
                parent.add_last("spawned", Arc::new(Nop))
            }
        }

        let (session, _) = setup(&default!());
        let chain = session.filter_chain();
        chain.add_last("spawner", Arc::new(Spawner)).unwrap();
        assert_eq!(chain.names(), vec!["spawner", "spawned"]);
    }

    #[test]
    fn dispatch_order() {
        let log = Log::default();
        let (session, processor) = setup(&log);
        let chain = session.filter_chain();
        chain
            .add_last("a", Arc::new(Tracer {
                name: "a",
                log: log.clone(),
            }))
            .unwrap();
        chain
            .add_last("b", Arc::new(Tracer {
                name: "b",
                log: log.clone(),
            }))
            .unwrap();
        chain.add_last("codec", Arc::new(U32Encoder)).unwrap();

        chain.fire_message_received(Message::from("ping"));
        let future = session.write(Message::new(7u32));
        assert_eq!(*log.lock(), vec!["a:received", "b:received", "handler:received", "b:write", "a:write"]);
        assert_eq!(session.read_messages(), 1);

        let request = processor.written.lock().pop().unwrap();
        assert_eq!(request.message().as_bytes().unwrap().as_ref(), &[0, 0, 0, 7]);
        assert_eq!(session.scheduled_write_bytes(), 4);
        assert!(!future.is_done());

        chain.fire_message_sent(request);
        assert!(future.is_done());
        assert_eq!(log.lock().last().unwrap(), "handler:sent:7");
        assert_eq!(session.written_messages(), 1);
    }

    #[test]
    fn unencoded_message() {
        let log = Log::default();
        let (session, processor) = setup(&log);
        let future = session.write(Message::new(7u32));
        assert!(matches!(future.wait_result(), Err(Error::UnsupportedMessage)));
        assert!(processor.written.lock().is_empty());
        assert!(log.lock()[0].starts_with("handler:exception:"));
    }

    #[test]
    fn close_reaches_processor() {
        let (session, processor) = setup(&default!());
        session.filter_chain().add_last("nop", Arc::new(Nop)).unwrap();
        session.close_now();
        session.close_now();
        assert_eq!(*processor.removed.lock(), 1);
        assert!(matches!(session.write("late").wait_result(), Err(Error::WriteToClosedSession(_))));
    }

    #[quickcheck]
    fn mutations_follow_model(ops: Vec<(u8, u8)>) -> bool {
        let context = testing::context(Arc::new(NoopHandler));
        let session = testing::session(&context, Arc::new(RecordingProcessor::default()), "127.0.0.1:1000");
        let chain = session.filter_chain();
        let mut model = Vec::<String>::new();

        for (op, no) in ops {
            let name = format!("f{}", no % 5);
            let present = model.contains(&name);
            let ok = match op % 3 {
                0 => {
                    let res = chain.add_first(name.clone(), Arc::new(Nop));
                    if !present {
                        model.insert(0, name);
                    }
                    res.is_ok() != present
                }
                1 => {
                    let res = chain.add_last(name.clone(), Arc::new(Nop));
                    if !present {
                        model.push(name);
                    }
                    res.is_ok() != present
                }
                _ => {
                    let res = chain.remove(&name);
                    model.retain(|n| *n != name);
                    res.is_ok() == present
                }
            };
            if !ok || chain.names() != model {
                return false;
            }
        }
        true
    }
}
