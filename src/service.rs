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

//! State shared by all the sessions of an acceptor, a connector or a
//! datagram acceptor.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;

use crate::session::{SessionId, SessionState};
use crate::transport::TransportMetadata;
use crate::{DefaultFilterChainBuilder, Error, FilterChainBuilder, IoHandler, IoSession, SessionConfig};

/// Maximum time a worker thread blocks in a poll.
pub const DEFAULT_SELECT_TIMEOUT: Duration = Duration::from_secs(1);
/// Time after which a pending connection attempt fails.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Service configuration.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct ServiceConfig {
    /// Service name, used as a prefix of the worker thread names.
    pub name: String,
    /// Number of processors in the pool of a connection-oriented service.
    pub processor_count: usize,
    pub select_timeout: Duration,
    pub connect_timeout: Duration,
    /// Configuration cloned into every new session.
    pub session: SessionConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let cpus = thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1);
        ServiceConfig {
            name: s!("iochain"),
            processor_count: cpus + 1,
            select_timeout: DEFAULT_SELECT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            session: default!(),
        }
    }
}

impl ServiceConfig {
    pub fn named(name: impl Into<String>) -> Self {
        ServiceConfig {
            name: name.into(),
            ..default!()
        }
    }

    pub fn with_processor_count(mut self, count: usize) -> Self {
        self.processor_count = count.max(1);
        self
    }

    pub fn with_select_timeout(mut self, timeout: Duration) -> Self {
        self.select_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session = config;
        self
    }
}

/// Per-service state: application handler, filter chain builder, session
/// defaults, id counter and registry of the managed sessions.
pub struct ServiceContext {
    name: String,
    handler: Arc<dyn IoHandler>,
    template: Arc<DefaultFilterChainBuilder>,
    builder: RwLock<Arc<dyn FilterChainBuilder>>,
    session_config: RwLock<SessionConfig>,
    next_id: AtomicU64,
    sessions: RwLock<HashMap<SessionId, Arc<IoSession>>>,
    metadata: TransportMetadata,
}

impl ServiceContext {
    pub(crate) fn new(
        name: impl Into<String>,
        handler: Arc<dyn IoHandler>,
        session_config: SessionConfig,
        metadata: TransportMetadata,
    ) -> Arc<Self> {
        let template = Arc::new(DefaultFilterChainBuilder::new());
        Arc::new(ServiceContext {
            name: name.into(),
            handler,
            builder: RwLock::new(template.clone()),
            template,
            session_config: RwLock::new(session_config),
            next_id: AtomicU64::new(1),
            sessions: empty!(),
            metadata,
        })
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn handler(&self) -> &Arc<dyn IoHandler> { &self.handler }

    pub fn metadata(&self) -> TransportMetadata { self.metadata }

    pub(crate) fn next_session_id(&self) -> SessionId {
        SessionId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn session_config(&self) -> SessionConfig { self.session_config.read().clone() }

    /// Sets the configuration for sessions created afterwards.
    pub fn set_session_config(&self, config: SessionConfig) { *self.session_config.write() = config }

    /// Default filter chain template. Ignored once a custom builder is set
    /// with [`ServiceContext::set_filter_chain_builder`].
    pub fn filter_chain(&self) -> &DefaultFilterChainBuilder { &self.template }

    pub fn set_filter_chain_builder(&self, builder: Arc<dyn FilterChainBuilder>) { *self.builder.write() = builder }

    pub fn managed_sessions(&self) -> Vec<Arc<IoSession>> { self.sessions.read().values().cloned().collect() }

    pub fn managed_session(&self, id: SessionId) -> Option<Arc<IoSession>> { self.sessions.read().get(&id).cloned() }

    pub fn managed_session_count(&self) -> usize { self.sessions.read().len() }

    /// Builds the session chain, opens the session and fires its creation
    /// events. On error the session stays unexposed and must be destroyed by
    /// the caller.
    pub(crate) fn activate(&self, session: &Arc<IoSession>) -> Result<(), Error> {
        let builder = self.builder.read().clone();
        builder.build_chain(session.filter_chain())?;
        session.set_state(SessionState::Open);
        self.sessions.write().insert(session.id(), session.clone());
        log::debug!(target: "session", "Session {} with {} is open", session.id(), session.remote_addr());

        let chain = session.filter_chain();
        chain.fire_session_created();
        chain.fire_session_opened();
        Ok(())
    }

    /// Marks the session closed after its handle has been released and fires
    /// the closing events.
    pub(crate) fn deactivate(&self, session: &Arc<IoSession>) {
        session.set_state(SessionState::Closed);
        session.filter_chain().fire_session_closed();
        session.close_future().complete(());
        self.sessions.write().remove(&session.id());
        log::debug!(target: "session", "Session {} is closed", session.id());
    }
}

/// Common interface of acceptors and connectors.
pub trait IoService {
    fn context(&self) -> &Arc<ServiceContext>;

    /// Releases all the resources of the service, closing its sessions.
    fn dispose(&self);

    fn is_disposing(&self) -> bool;

    fn handler(&self) -> &Arc<dyn IoHandler> { self.context().handler() }

    fn filter_chain(&self) -> &DefaultFilterChainBuilder { self.context().filter_chain() }

    fn set_filter_chain_builder(&self, builder: Arc<dyn FilterChainBuilder>) {
        self.context().set_filter_chain_builder(builder)
    }

    fn session_config(&self) -> SessionConfig { self.context().session_config() }

    fn set_session_config(&self, config: SessionConfig) { self.context().set_session_config(config) }

    fn managed_sessions(&self) -> Vec<Arc<IoSession>> { self.context().managed_sessions() }

    fn managed_session_count(&self) -> usize { self.context().managed_session_count() }
}
