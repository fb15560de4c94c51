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

//! Single-assignment asynchronous results bridging reactor threads and
//! external callers.
//!
//! An [`IoFuture`] is completed exactly once by the worker thread which owns
//! the operation (a processor, an acceptor or a connector). Callers may block
//! on it with [`IoFuture::wait`] or register listeners, which are always
//! invoked outside of the internal lock: a listener is free to call back into
//! the future, the session or the service which completed it.

use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::{Error, IoSession, Message};

/// Final state of an [`IoFuture`].
#[derive(Clone, Debug)]
pub enum Outcome<T> {
    /// The operation has completed successfully.
    Done(T),

    /// The operation has failed.
    Failed(Error),

    /// The operation was cancelled before its completion.
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn is_done(&self) -> bool { matches!(self, Outcome::Done(_)) }

    pub fn into_result(self) -> Result<T, Error> {
        match self {
            Outcome::Done(value) => Ok(value),
            Outcome::Failed(err) => Err(err),
            Outcome::Cancelled => Err(Error::Cancelled),
        }
    }
}

/// Result of a [`crate::IoSession::read`] operation.
#[derive(Clone, Debug)]
pub enum ReadOutcome {
    Message(Message),
    Closed,
}

pub type ConnectFuture = IoFuture<Arc<IoSession>>;
pub type WriteFuture = IoFuture<()>;
pub type CloseFuture = IoFuture<()>;
pub type ReadFuture = IoFuture<ReadOutcome>;
pub type BindFuture = IoFuture<Vec<SocketAddr>>;
pub type UnbindFuture = IoFuture<()>;

type Listener<T> = Box<dyn FnOnce(&Outcome<T>) + Send>;
type CancelHook = Box<dyn FnMut() -> bool + Send>;

struct State<T> {
    outcome: Option<Outcome<T>>,
    listeners: Vec<Listener<T>>,
    cancel_hook: Option<CancelHook>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

/// Single-slot asynchronous result with blocking wait and replay-safe
/// listener notification.
pub struct IoFuture<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for IoFuture<T> {
    fn clone(&self) -> Self {
        IoFuture {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Debug for IoFuture<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        let status = match state.outcome {
            None => "pending",
            Some(Outcome::Done(_)) => "done",
            Some(Outcome::Failed(_)) => "failed",
            Some(Outcome::Cancelled) => "cancelled",
        };
        f.debug_struct("IoFuture")
            .field("status", &status)
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Default for IoFuture<T> {
    fn default() -> Self { Self::new() }
}

impl<T: Clone + Send + 'static> IoFuture<T> {
    pub fn new() -> Self {
        IoFuture {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    outcome: None,
                    listeners: empty!(),
                    cancel_hook: None,
                }),
                ready: Condvar::new(),
            }),
        }
    }

    /// Constructs already completed future.
    pub fn ready(value: T) -> Self {
        let future = Self::new();
        future.complete(value);
        future
    }

    /// Constructs already failed future.
    pub fn failed(err: Error) -> Self {
        let future = Self::new();
        future.fail(err);
        future
    }

    pub fn is_done(&self) -> bool { self.inner.state.lock().outcome.is_some() }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.inner.state.lock().outcome, Some(Outcome::Cancelled))
    }

    /// Returns a copy of the outcome if the future has completed.
    pub fn outcome(&self) -> Option<Outcome<T>> { self.inner.state.lock().outcome.clone() }

    /// Completes the future with a value. Returns `false` if the future was
    /// already completed, in which case the value is dropped.
    pub fn complete(&self, value: T) -> bool { self.set(Outcome::Done(value)) }

    /// Completes the future with an error. Returns `false` if the future was
    /// already completed.
    pub fn fail(&self, err: Error) -> bool { self.set(Outcome::Failed(err)) }

    fn set(&self, outcome: Outcome<T>) -> bool {
        let listeners = {
            let mut state = self.inner.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome.clone());
            state.cancel_hook = None;
            self.inner.ready.notify_all();
            std::mem::take(&mut state.listeners)
        };
        for listener in listeners {
            listener(&outcome);
        }
        true
    }

    /// Registers a listener invoked exactly once with the outcome.
    ///
    /// If the future is already complete the listener is invoked synchronously
    /// in the calling thread; otherwise it runs in the thread completing the
    /// future, after all previously registered listeners.
    pub fn add_listener(&self, listener: impl FnOnce(&Outcome<T>) + Send + 'static) {
        let outcome = {
            let mut state = self.inner.state.lock();
            match &state.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    state.listeners.push(Box::new(listener));
                    return;
                }
            }
        };
        listener(&outcome);
    }

    /// Installs the hook run by [`IoFuture::cancel`]. The hook aborts the
    /// underlying operation and reports whether it has succeeded. A refusing
    /// hook stays installed and is asked again on the next cancellation.
    pub fn set_cancel_hook(&self, hook: impl FnMut() -> bool + Send + 'static) {
        let mut state = self.inner.state.lock();
        if state.outcome.is_none() {
            state.cancel_hook = Some(Box::new(hook));
        }
    }

    /// Cancels the operation. Returns `false` if the future has already
    /// completed or the owner refused the cancellation.
    pub fn cancel(&self) -> bool {
        let hook = {
            let mut state = self.inner.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.cancel_hook.take()
        };
        // The hook runs unlocked since it usually talks to a worker thread
        // which may complete this very future.
        let Some(mut hook) = hook else {
            return self.set(Outcome::Cancelled);
        };
        if hook() {
            return self.set(Outcome::Cancelled);
        }
        // Refused: keep the hook for the next attempt.
        let mut state = self.inner.state.lock();
        if state.outcome.is_none() && state.cancel_hook.is_none() {
            state.cancel_hook = Some(hook);
        }
        false
    }

    /// Blocks the calling thread until the future completes.
    pub fn wait(&self) -> Outcome<T> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            self.inner.ready.wait(&mut state);
        }
    }

    /// Blocks the calling thread until the future completes or the timeout
    /// expires, returning `None` in the latter case.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Outcome<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return Some(outcome.clone());
            }
            if self.inner.ready.wait_until(&mut state, deadline).timed_out() {
                return state.outcome.clone();
            }
        }
    }

    /// Waits for the completion and converts the outcome into a [`Result`].
    pub fn wait_result(&self) -> Result<T, Error> { self.wait().into_result() }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use quickcheck_macros::quickcheck;

    use super::*;

    #[test]
    fn single_assignment() {
        let future = IoFuture::<u32>::new();
        assert!(!future.is_done());
        assert!(future.complete(1));
        assert!(!future.complete(2));
        assert!(!future.fail(Error::Cancelled));
        assert!(matches!(future.wait(), Outcome::Done(1)));
    }

    #[test]
    fn late_listener_is_replayed() {
        let future = IoFuture::<&'static str>::ready("value");
        let (sender, receiver) = crossbeam_channel::bounded(1);
        let caller = thread::current().id();
        future.add_listener(move |outcome| {
            sender
                .send((thread::current().id(), outcome.clone().into_result().ok()))
                .unwrap();
        });
        // Synchronous delivery: the message is already in the channel.
        let (thread_id, value) = receiver.try_recv().unwrap();
        assert_eq!(thread_id, caller);
        assert_eq!(value, Some("value"));
    }

    #[test]
    fn listener_may_reenter() {
        let future = IoFuture::<u8>::new();
        let clone = future.clone();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        future.add_listener(move |_| {
            // Would deadlock if listeners were run under the lock.
            assert!(clone.is_done());
            let c2 = c.clone();
            clone.add_listener(move |_| {
                c2.fetch_add(1, Ordering::SeqCst);
            });
            c.fetch_add(1, Ordering::SeqCst);
        });
        future.complete(0);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cancel() {
        let future = IoFuture::<()>::new();
        future.set_cancel_hook(|| false);
        assert!(!future.cancel());
        assert!(!future.is_done());

        let (sender, receiver) = crossbeam_channel::unbounded();
        future.add_listener(move |outcome| {
            sender.send(matches!(outcome, Outcome::Cancelled)).unwrap();
        });
        future.set_cancel_hook(|| true);
        assert!(future.cancel());
        assert!(future.is_cancelled());
        assert_eq!(receiver.try_recv(), Ok(true));
        assert!(!future.cancel());

        let done = IoFuture::ready(());
        assert!(!done.cancel());
        assert!(matches!(done.wait_result(), Ok(())));
    }

    #[test]
    fn refused_cancel_keeps_hook() {
        let future = IoFuture::<()>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let aborted = Arc::new(AtomicUsize::new(0));
        let (c, a) = (calls.clone(), aborted.clone());
        future.set_cancel_hook(move || {
            // Refuses the first request only.
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                return false;
            }
            a.fetch_add(1, Ordering::SeqCst);
            true
        });

        assert!(!future.cancel());
        assert!(!future.is_done());
        assert!(future.cancel());
        assert!(future.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(aborted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wait_across_threads() {
        let future = IoFuture::<u64>::new();
        assert!(future.wait_timeout(Duration::from_millis(10)).is_none());
        let clone = future.clone();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            clone.complete(42);
        });
        assert!(matches!(future.wait(), Outcome::Done(42)));
        worker.join().unwrap();
    }

    #[quickcheck]
    fn listeners_run_in_registration_order(before: u8, after: u8) -> bool {
        let future = IoFuture::<()>::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let total = before as usize + after as usize;
        for no in 0..before as usize {
            let order = order.clone();
            future.add_listener(move |_| order.lock().push(no));
        }
        future.complete(());
        for no in before as usize..total {
            let order = order.clone();
            future.add_listener(move |_| order.lock().push(no));
        }
        let order = order.lock();
        order.len() == total && order.iter().enumerate().all(|(i, no)| i == *no)
    }
}
