//! The master agent.
//!
//! Owns the directories, accepts subagent connections on TCP and Unix-domain
//! listeners, answers administrative PDUs and hands management requests to
//! the [`Coordinator`].

mod peer;

use std::{
    future::Future,
    io,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use tokio::{
    net::{TcpListener, UnixListener},
    sync::{mpsc, Semaphore},
    time::interval,
};

use crate::{
    access::{AccessControl, AddressFilter, AllowAll, AllowList, LogSink, NoPersistence, NotificationSink, Persistence},
    capabilities::CapabilityDirectory,
    codec::CodecError,
    dispatch::Dispatcher,
    index::{AllocationMode, IndexDirectory},
    local::{LocalHandle, MibStore},
    pdu::{CloseReason, ErrorStatus, Payload, Pdu, PduType, DEFAULT_PRIORITY},
    region::{Region, RegionError},
    registry::{Owner, OwnerKey, RegEntry, Registry, RegistrationError},
    session::{PeerAddress, Session, SessionError, SessionManager},
    status::{bump, Counters, RegistrationInfo, StatusReport},
    transaction::{Coordinator, ManagementRequest, ManagementResponse},
};

#[derive(Debug, thiserror::Error)]
pub enum MasterError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Registration failed: {0}")]
    Registration(#[from] RegistrationError),
    #[error("Invalid region: {0}")]
    Region(#[from] RegionError),
    #[error("No listener configured")]
    NoListener,
}

/// Runtime settings of a master.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub tcp_addr: Option<SocketAddr>,
    pub unix_path: Option<PathBuf>,
    pub max_sessions: usize,
    pub workers: usize,
    /// Sub-request deadline when neither registration nor session sets one.
    pub default_timeout: Duration,
    /// Consecutive sub-request timeouts after which a session is closed.
    pub max_timeouts: u32,
    /// How long a connection may stay without an open session.
    pub open_timeout: Duration,
    pub sweep_interval: Duration,
    pub max_response_size: usize,
    /// Non-default contexts accepted from subagents; `None` accepts any.
    pub contexts: Option<Vec<Vec<u8>>>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig {
            tcp_addr: Some(SocketAddr::from(([127, 0, 0, 1], 705))),
            unix_path: None,
            max_sessions: 256,
            workers: 16,
            default_timeout: Duration::from_secs(5),
            max_timeouts: 3,
            open_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            max_response_size: 1472,
            contexts: None,
        }
    }
}

/// Pluggable policy objects consulted by the master.
#[derive(Clone)]
pub struct Collaborators {
    pub access: Arc<dyn AccessControl>,
    pub address_filter: Arc<dyn AddressFilter>,
    pub notifications: Arc<dyn NotificationSink>,
    pub persistence: Arc<dyn Persistence>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Collaborators {
            access: Arc::new(AllowAll),
            address_filter: Arc::new(AllowList::default()),
            notifications: Arc::new(LogSink),
            persistence: Arc::new(NoPersistence),
        }
    }
}

/// Sockets a master serves, bound ahead of [`Master::serve`] so callers can
/// learn the actual addresses.
pub struct Listeners {
    tcp: Option<TcpListener>,
    unix: Option<(UnixListener, PathBuf)>,
}

impl Listeners {
    pub async fn bind(config: &MasterConfig) -> Result<Self, MasterError> {
        let tcp = match config.tcp_addr {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };
        let unix = match &config.unix_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                Some((UnixListener::bind(path)?, path.clone()))
            }
            None => None,
        };
        if tcp.is_none() && unix.is_none() {
            return Err(MasterError::NoListener);
        }
        Ok(Listeners { tcp, unix })
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().and_then(|l| l.local_addr().ok())
    }
}

pub struct Master {
    config: MasterConfig,
    registry: Arc<Registry>,
    sessions: Arc<SessionManager>,
    indexes: IndexDirectory,
    capabilities: CapabilityDirectory,
    dispatcher: Arc<Dispatcher>,
    coordinator: Coordinator,
    collaborators: Collaborators,
    workers: Arc<Semaphore>,
    counters: Counters,
    started: Instant,
    started_at: DateTime<Utc>,
    next_local_id: AtomicU32,
}

impl Master {
    pub fn new(config: MasterConfig) -> Self {
        Self::with_collaborators(config, Collaborators::default())
    }

    pub fn with_collaborators(config: MasterConfig, collaborators: Collaborators) -> Self {
        let registry = Arc::new(Registry::new());
        let sessions = Arc::new(SessionManager::new(config.max_sessions));
        let dispatcher = Arc::new(Dispatcher::new());
        let coordinator = Coordinator::new(
            registry.clone(),
            sessions.clone(),
            dispatcher.clone(),
            collaborators.access.clone(),
            config.default_timeout,
            config.max_response_size,
        );
        Master {
            workers: Arc::new(Semaphore::new(config.workers.max(1))),
            config,
            registry,
            sessions,
            indexes: IndexDirectory::new(),
            capabilities: CapabilityDirectory::new(),
            dispatcher,
            coordinator,
            collaborators,
            counters: Counters::default(),
            started: Instant::now(),
            started_at: Utc::now(),
            next_local_id: AtomicU32::new(1),
        }
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn indexes(&self) -> &IndexDirectory {
        &self.indexes
    }

    pub fn capabilities(&self) -> &CapabilityDirectory {
        &self.capabilities
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Time since start in hundredths of a second.
    pub fn sys_uptime(&self) -> u32 {
        (self.started.elapsed().as_millis() / 10) as u32
    }

    /// Runs one management request under a worker permit.
    pub async fn process(&self, request: &ManagementRequest) -> ManagementResponse {
        let _permit = self.workers.acquire().await;
        bump(&self.counters.requests_processed);
        self.coordinator.process(request).await
    }

    /// Serves `subtrees` from an in-process store at default priority.
    /// Either all regions are registered or none.
    pub fn register_local(
        &self,
        name: &str,
        store: Arc<dyn MibStore>,
        context: &[u8],
        subtrees: Vec<Region>,
    ) -> Result<u32, MasterError> {
        let id = self.next_local_id.fetch_add(1, Ordering::Relaxed);
        let handle = LocalHandle::new(id, name, store);
        for region in subtrees {
            let entry = RegEntry::new(
                region,
                Owner::Local(handle.clone()),
                DEFAULT_PRIORITY,
                context.to_vec(),
                0,
            );
            if let Err(e) = self.registry.register(entry) {
                self.registry.remove_local(id);
                return Err(e.into());
            }
        }
        log::info!("Local store '{}' registered as {}", name, id);
        Ok(id)
    }

    pub fn unregister_local(&self, id: u32) -> usize {
        self.registry.remove_local(id).len()
    }

    fn context_supported(&self, context: &[u8]) -> bool {
        context.is_empty()
            || self
                .config
                .contexts
                .as_ref()
                .map_or(true, |allowed| allowed.iter().any(|c| c == context))
    }

    /// Admits a new connection unless the address filter refuses it.
    pub fn attach_peer(&self, address: PeerAddress, outbound: mpsc::Sender<Pdu>) -> Option<u64> {
        if !self.collaborators.address_filter.is_peer_address_allowed(&address) {
            log::warn!("Refusing connection from {}", address);
            return None;
        }
        let connection_id = self.sessions.add_peer(address.clone(), outbound);
        log::info!("Accepted connection {} from {}", connection_id, address);
        Some(connection_id)
    }

    /// Drops a connection together with every session it carried.
    pub fn detach_peer(&self, connection_id: u64) {
        self.sessions.mark_closing(connection_id);
        for session_id in self.sessions.remove_peer(connection_id) {
            self.release_session(session_id);
        }
        self.registry.remove_connection(connection_id);
        log::info!("Connection {} released", connection_id);
    }

    /// Removes everything a session owned and fails its pending sub-requests.
    fn release_session(&self, session_id: u32) {
        let registrations = self.registry.remove_session(session_id).len();
        let indexes = self.indexes.release_all(session_id);
        let capabilities = self.capabilities.release_all(session_id);
        let pending = self.dispatcher.fail_session(session_id);
        bump(&self.counters.sessions_closed);
        log::info!(
            "Session {} closed: {} registrations, {} indexes, {} capabilities released, {} requests failed",
            session_id,
            registrations,
            indexes,
            capabilities,
            pending
        );
    }

    /// Checks that `session_id` is still open after something was added on
    /// its behalf. A close may have run its cascade in between; whatever the
    /// session added since then is removed again.
    fn session_still_open(&self, session_id: u32, connection_id: u64) -> bool {
        if self.sessions.verify(session_id, connection_id).is_ok() {
            return true;
        }
        let registrations = self.registry.remove_session(session_id).len();
        let indexes = self.indexes.release_all(session_id);
        let capabilities = self.capabilities.release_all(session_id);
        log::debug!(
            "Session {} closed while adding: dropped {} registrations, {} indexes, {} capabilities",
            session_id,
            registrations,
            indexes,
            capabilities
        );
        false
    }

    /// Registers `entry` for the session that owns it, unless the session
    /// closes meanwhile.
    fn add_registration(&self, connection_id: u64, entry: RegEntry) -> Result<RegEntry, ErrorStatus> {
        let session_id = entry.owner.session_id().unwrap_or_default();
        let entry = self.registry.register(entry).map_err(|e| {
            log::info!("Session {} registration refused: {}", session_id, e);
            e.status()
        })?;
        if !self.session_still_open(session_id, connection_id) {
            return Err(ErrorStatus::NotOpen);
        }
        Ok(entry)
    }

    pub fn close_session(&self, session_id: u32) -> Result<Session, SessionError> {
        let session = self.sessions.close(session_id)?;
        self.release_session(session_id);
        Ok(session)
    }

    /// Tells the subagent its session is being closed, then closes it.
    pub async fn expel_session(&self, session_id: u32, reason: CloseReason) {
        if let Ok(route) = self.sessions.route(session_id) {
            let mut close = Pdu::new(session_id, 0, 0, Payload::Close { reason });
            close.byte_order = route.byte_order;
            if route.outbound.send(close).await.is_ok() {
                bump(&self.counters.pdus_sent);
            }
        }
        if self.close_session(session_id).is_ok() {
            log::warn!("Session {} expelled ({:?})", session_id, reason);
        }
    }

    /// Closes sessions that keep timing out and connections that never
    /// opened a session.
    pub async fn sweep(&self) {
        let stale = self.sessions.stale(Utc::now(), self.config.max_timeouts, self.config.open_timeout);
        for session_id in stale.sessions {
            self.expel_session(session_id, CloseReason::Timeouts).await;
        }
        for connection_id in stale.peers {
            log::warn!("Connection {} opened no session in time", connection_id);
            self.detach_peer(connection_id);
        }
    }

    /// Routes one inbound PDU. Responses go straight to the dispatcher;
    /// everything else is answered under a worker permit.
    pub(crate) async fn dispatch_inbound(&self, connection_id: u64, pdu: Pdu) {
        bump(&self.counters.pdus_received);
        if pdu.pdu_type() == PduType::Response {
            if !self.dispatcher.deliver(pdu) {
                log::debug!("Dropping late or unsolicited response on connection {}", connection_id);
            }
            return;
        }
        let response = {
            let _permit = self.workers.acquire().await;
            self.handle_pdu(connection_id, &pdu)
        };
        if let Some(response) = response {
            self.send(connection_id, response).await;
        }
    }

    pub(crate) async fn send(&self, connection_id: u64, pdu: Pdu) {
        let Some(outbound) = self.sessions.peer_outbound(connection_id) else {
            return;
        };
        if outbound.send(pdu).await.is_ok() {
            bump(&self.counters.pdus_sent);
        }
    }

    pub(crate) fn count_parse_error(&self) {
        bump(&self.counters.parse_errors);
    }

    /// Answers an administrative PDU received on `connection_id`.
    pub fn handle_pdu(&self, connection_id: u64, pdu: &Pdu) -> Option<Pdu> {
        let respond = |error: ErrorStatus, index: u16, varbinds| {
            Some(pdu.response(self.sys_uptime(), error, index, varbinds))
        };

        match &pdu.payload {
            Payload::Open {
                timeout,
                id,
                description,
            } => {
                let description = String::from_utf8_lossy(description).into_owned();
                return match self.sessions.open(connection_id, *timeout, id.clone(), description, pdu.byte_order) {
                    Ok(session_id) => {
                        bump(&self.counters.sessions_opened);
                        log::info!("Session {} opened by {} on connection {}", session_id, id, connection_id);
                        let mut response = pdu.response(self.sys_uptime(), ErrorStatus::NoError, 0, Vec::new());
                        response.session_id = session_id;
                        Some(response)
                    }
                    Err(e) => {
                        log::warn!("Open on connection {} refused: {}", connection_id, e);
                        respond(e.status(), 0, Vec::new())
                    }
                };
            }
            Payload::Response { .. } => return None,
            Payload::Get { .. }
            | Payload::GetNext { .. }
            | Payload::GetBulk { .. }
            | Payload::TestSet { .. }
            | Payload::CommitSet
            | Payload::UndoSet
            | Payload::CleanupSet => {
                log::warn!(
                    "Connection {} sent {:?}, which only a master may send",
                    connection_id,
                    pdu.pdu_type()
                );
                return respond(ErrorStatus::ProcessingError, 0, Vec::new());
            }
            _ => {}
        }

        let session_id = pdu.session_id;
        if let Err(e) = self.sessions.verify(session_id, connection_id) {
            log::debug!("{:?} rejected: {}", pdu.pdu_type(), e);
            return respond(e.status(), 0, Vec::new());
        }
        let context = pdu.payload.context().unwrap_or_default();
        if !self.context_supported(context) {
            return respond(ErrorStatus::UnsupportedContext, 0, Vec::new());
        }

        match &pdu.payload {
            Payload::Close { reason } => {
                log::info!("Session {} closing ({:?})", session_id, reason);
                match self.close_session(session_id) {
                    Ok(_) => respond(ErrorStatus::NoError, 0, Vec::new()),
                    Err(e) => respond(e.status(), 0, Vec::new()),
                }
            }
            Payload::Ping { .. } => respond(ErrorStatus::NoError, 0, Vec::new()),
            Payload::Register {
                timeout,
                priority,
                range_subid,
                subtree,
                upper_bound,
                instance,
                ..
            } => {
                if *priority == 0 {
                    log::warn!("Session {} sent a registration with priority 0", session_id);
                    return respond(ErrorStatus::ParseError, 0, Vec::new());
                }
                let region = match Region::from_wire(subtree.clone(), *range_subid, *upper_bound, *instance) {
                    Ok(region) => region,
                    Err(e) => {
                        log::warn!("Session {} sent a bad region: {}", session_id, e);
                        return respond(ErrorStatus::ParseError, 0, Vec::new());
                    }
                };
                let owner = Owner::Remote {
                    session_id,
                    connection_id,
                };
                let entry = RegEntry::new(region, owner, *priority, context.to_vec(), *timeout);
                match self.add_registration(connection_id, entry) {
                    Ok(entry) => {
                        log::info!("Session {} registered {} at priority {}", session_id, entry.region, entry.priority);
                        respond(ErrorStatus::NoError, 0, Vec::new())
                    }
                    Err(status) => respond(status, 0, Vec::new()),
                }
            }
            Payload::Unregister {
                priority,
                range_subid,
                subtree,
                upper_bound,
                ..
            } => {
                let region = match Region::from_wire(subtree.clone(), *range_subid, *upper_bound, false) {
                    Ok(region) => region,
                    Err(e) => {
                        log::warn!("Session {} sent a bad region: {}", session_id, e);
                        return respond(ErrorStatus::ParseError, 0, Vec::new());
                    }
                };
                // Instance registrations are matched either way.
                let removed = self
                    .registry
                    .unregister(context, &region, *priority, OwnerKey::Session(session_id))
                    .or_else(|_| {
                        let instance = Region::from_wire(subtree.clone(), *range_subid, *upper_bound, true)?;
                        self.registry
                            .unregister(context, &instance, *priority, OwnerKey::Session(session_id))
                            .map_err(MasterError::from)
                    });
                match removed {
                    Ok(entry) => {
                        log::info!("Session {} unregistered {}", session_id, entry.region);
                        respond(ErrorStatus::NoError, 0, Vec::new())
                    }
                    Err(_) => respond(ErrorStatus::UnknownRegistration, 0, Vec::new()),
                }
            }
            Payload::Notify { varbinds, .. } => {
                self.collaborators.notifications.notify(session_id, context, varbinds);
                respond(ErrorStatus::NoError, 0, Vec::new())
            }
            Payload::IndexAllocate {
                new_index,
                any_index,
                varbinds,
                ..
            } => {
                let mode = AllocationMode::from_flags(*new_index, *any_index);
                match self.indexes.allocate(context, mode, varbinds, session_id) {
                    Ok(_) if !self.session_still_open(session_id, connection_id) => {
                        respond(ErrorStatus::NotOpen, 0, Vec::new())
                    }
                    Ok(allocated) => respond(ErrorStatus::NoError, 0, allocated),
                    Err(e) => respond(e.status(), e.index(), varbinds.clone()),
                }
            }
            Payload::IndexDeallocate { varbinds, .. } => {
                match self.indexes.deallocate(context, varbinds, session_id) {
                    Ok(()) => respond(ErrorStatus::NoError, 0, varbinds.clone()),
                    Err(e) => respond(e.status(), e.index(), varbinds.clone()),
                }
            }
            Payload::AddAgentCaps { id, description, .. } => {
                let description = String::from_utf8_lossy(description).into_owned();
                self.capabilities.add(context, id.clone(), description, session_id);
                if !self.session_still_open(session_id, connection_id) {
                    return respond(ErrorStatus::NotOpen, 0, Vec::new());
                }
                respond(ErrorStatus::NoError, 0, Vec::new())
            }
            Payload::RemoveAgentCaps { id, .. } => match self.capabilities.remove(context, id, session_id) {
                Ok(_) => respond(ErrorStatus::NoError, 0, Vec::new()),
                Err(e) => respond(e.status(), 0, Vec::new()),
            },
            _ => None,
        }
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            started_at: self.started_at,
            uptime_seconds: self.started.elapsed().as_secs_f64(),
            peers: self.sessions.peer_count(),
            sessions: self.sessions.sessions(),
            registrations: self.registry.all_entries().iter().map(RegistrationInfo::from).collect(),
            index_allocations: self.indexes.allocations(),
            capabilities: self.capabilities.all(),
            counters: self.counters.snapshot(),
        }
    }

    /// Sends Close(shutdown) to every session and releases every peer.
    pub async fn shutdown(&self) {
        for session_id in self.sessions.session_ids() {
            self.expel_session(session_id, CloseReason::Shutdown).await;
        }
        let failed = self.dispatcher.fail_all();
        if failed > 0 {
            log::debug!("{} pending sub-requests failed at shutdown", failed);
        }
        for connection_id in self.sessions.connection_ids() {
            self.detach_peer(connection_id);
        }
        if let Err(e) = self.collaborators.persistence.save() {
            log::error!("Failed to save state: {}", e);
        }
    }

    /// Binds the configured listeners and serves until Ctrl-C.
    pub async fn run(self: Arc<Self>) -> Result<(), MasterError> {
        let listeners = Listeners::bind(&self.config).await?;
        self.serve(listeners, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Accepts connections on `listeners` until `shutdown` completes.
    pub async fn serve(
        self: Arc<Self>,
        listeners: Listeners,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), MasterError> {
        if let Err(e) = self.collaborators.persistence.load() {
            log::error!("Failed to load state: {}", e);
        }
        if let Some(addr) = listeners.tcp_addr() {
            log::info!("AgentX master listening on tcp:{}", addr);
        }
        if let Some((_, path)) = &listeners.unix {
            log::info!("AgentX master listening on unix:{}", path.display());
        }

        let mut sweep_timer = interval(self.config.sweep_interval);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = async {
                    match &listeners.tcp {
                        Some(listener) => listener.accept().await,
                        None => std::future::pending().await,
                    }
                } => match accepted {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            log::debug!("Cannot set TCP_NODELAY for {}: {}", addr, e);
                        }
                        tokio::spawn(peer::serve_connection(self.clone(), stream, PeerAddress::Tcp(addr)));
                    }
                    Err(e) => log::warn!("TCP accept failed: {}", e),
                },

                accepted = async {
                    match &listeners.unix {
                        Some((listener, _)) => listener.accept().await,
                        None => std::future::pending().await,
                    }
                } => match accepted {
                    Ok((stream, _)) => {
                        let path = listeners.unix.as_ref().map(|(_, p)| p.clone()).unwrap_or_default();
                        tokio::spawn(peer::serve_connection(self.clone(), stream, PeerAddress::Local(path)));
                    }
                    Err(e) => log::warn!("Unix accept failed: {}", e),
                },

                _ = sweep_timer.tick() => self.sweep().await,

                _ = &mut shutdown => break,
            }
        }

        log::info!("Shutting down");
        self.shutdown().await;
        if let Some((_, path)) = &listeners.unix {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }
}
