//! Subagent connections (peers) and the AgentX sessions multiplexed over
//! them.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    net::SocketAddr,
    path::PathBuf,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::{
    oid::Oid,
    pdu::{ByteOrder, ErrorStatus, Pdu},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PeerAddress {
    Tcp(SocketAddr),
    Local(PathBuf),
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddress::Tcp(addr) => write!(f, "tcp:{}", addr),
            PeerAddress::Local(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("no such peer connection {0}")]
    NoSuchPeer(u64),
    #[error("peer connection {0} is closing")]
    PeerClosing(u64),
    #[error("session limit of {0} reached")]
    TooManySessions(usize),
    #[error("session {0} is not open")]
    NotOpen(u32),
    #[error("session {session_id} does not belong to connection {connection_id}")]
    WrongConnection { session_id: u32, connection_id: u64 },
}

impl SessionError {
    pub fn status(&self) -> ErrorStatus {
        match self {
            SessionError::NoSuchPeer(_)
            | SessionError::PeerClosing(_)
            | SessionError::TooManySessions(_) => ErrorStatus::OpenFailed,
            SessionError::NotOpen(_) | SessionError::WrongConnection { .. } => ErrorStatus::NotOpen,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Opening,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: u32,
    pub connection_id: u64,
    pub byte_order: ByteOrder,
    /// Seconds; 0 defers to the master default.
    pub timeout: u8,
    pub state: SessionState,
    pub subagent_id: Oid,
    pub description: String,
    pub opened_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub consecutive_timeouts: u32,
}

#[derive(Debug)]
pub struct Peer {
    pub connection_id: u64,
    pub address: PeerAddress,
    pub connect_time: DateTime<Utc>,
    pub closing: bool,
    pub sessions: Vec<u32>,
    outbound: mpsc::Sender<Pdu>,
}

/// What the dispatcher needs to reach a session.
#[derive(Debug, Clone)]
pub struct SessionRoute {
    pub session_id: u32,
    pub connection_id: u64,
    pub byte_order: ByteOrder,
    pub timeout: Option<Duration>,
    pub outbound: mpsc::Sender<Pdu>,
}

/// Status-report view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: u32,
    pub connection_id: u64,
    pub peer: String,
    pub state: SessionState,
    pub subagent_id: String,
    pub description: String,
    pub opened_at: DateTime<Utc>,
    pub consecutive_timeouts: u32,
}

/// Sessions and peers due for removal by the periodic sweep.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct StaleReport {
    pub sessions: Vec<u32>,
    pub peers: Vec<u64>,
}

struct SessionInner {
    peers: HashMap<u64, Peer>,
    sessions: BTreeMap<u32, Session>,
    next_session_id: u32,
    next_connection_id: u64,
}

pub struct SessionManager {
    inner: Mutex<SessionInner>,
    max_sessions: usize,
}

impl SessionManager {
    pub fn new(max_sessions: usize) -> Self {
        SessionManager {
            inner: Mutex::new(SessionInner {
                peers: HashMap::new(),
                sessions: BTreeMap::new(),
                next_session_id: 1,
                next_connection_id: 1,
            }),
            max_sessions,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records an accepted connection and returns its id.
    pub fn add_peer(&self, address: PeerAddress, outbound: mpsc::Sender<Pdu>) -> u64 {
        let mut inner = self.lock();
        let connection_id = inner.next_connection_id;
        inner.next_connection_id += 1;
        inner.peers.insert(
            connection_id,
            Peer {
                connection_id,
                address,
                connect_time: Utc::now(),
                closing: false,
                sessions: Vec::new(),
                outbound,
            },
        );
        connection_id
    }

    /// Opens a session on `connection_id` and returns its id.
    pub fn open(
        &self,
        connection_id: u64,
        timeout: u8,
        subagent_id: Oid,
        description: String,
        byte_order: ByteOrder,
    ) -> Result<u32, SessionError> {
        let mut inner = self.lock();
        if inner.sessions.len() >= self.max_sessions {
            return Err(SessionError::TooManySessions(self.max_sessions));
        }
        match inner.peers.get(&connection_id) {
            None => return Err(SessionError::NoSuchPeer(connection_id)),
            Some(peer) if peer.closing => return Err(SessionError::PeerClosing(connection_id)),
            Some(_) => {}
        }

        let mut id = inner.next_session_id;
        while id == 0 || inner.sessions.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        inner.next_session_id = id.wrapping_add(1);

        let now = Utc::now();
        let session = Session {
            id,
            connection_id,
            byte_order,
            timeout,
            state: SessionState::Open,
            subagent_id,
            description,
            opened_at: now,
            last_activity: now,
            consecutive_timeouts: 0,
        };
        inner.sessions.insert(id, session);
        if let Some(peer) = inner.peers.get_mut(&connection_id) {
            peer.sessions.push(id);
        }
        Ok(id)
    }

    /// Removes a session and returns its final state.
    pub fn close(&self, session_id: u32) -> Result<Session, SessionError> {
        let mut inner = self.lock();
        let mut session = inner
            .sessions
            .remove(&session_id)
            .ok_or(SessionError::NotOpen(session_id))?;
        if let Some(peer) = inner.peers.get_mut(&session.connection_id) {
            peer.sessions.retain(|s| *s != session_id);
        }
        session.state = SessionState::Closed;
        Ok(session)
    }

    /// Succeeds iff the session is open.
    pub fn ping(&self, session_id: u32) -> Result<(), SessionError> {
        let inner = self.lock();
        match inner.sessions.get(&session_id) {
            Some(s) if s.state == SessionState::Open => Ok(()),
            _ => Err(SessionError::NotOpen(session_id)),
        }
    }

    /// Checks that `session_id` is open on `connection_id` and records
    /// activity on it.
    pub fn verify(&self, session_id: u32, connection_id: u64) -> Result<(), SessionError> {
        let mut inner = self.lock();
        match inner.sessions.get_mut(&session_id) {
            Some(s) if s.state != SessionState::Open => Err(SessionError::NotOpen(session_id)),
            Some(s) if s.connection_id != connection_id => Err(SessionError::WrongConnection {
                session_id,
                connection_id,
            }),
            Some(s) => {
                s.last_activity = Utc::now();
                Ok(())
            }
            None => Err(SessionError::NotOpen(session_id)),
        }
    }

    pub fn route(&self, session_id: u32) -> Result<SessionRoute, SessionError> {
        let inner = self.lock();
        let session = inner
            .sessions
            .get(&session_id)
            .filter(|s| s.state == SessionState::Open)
            .ok_or(SessionError::NotOpen(session_id))?;
        let peer = inner
            .peers
            .get(&session.connection_id)
            .ok_or(SessionError::NoSuchPeer(session.connection_id))?;
        Ok(SessionRoute {
            session_id,
            connection_id: session.connection_id,
            byte_order: session.byte_order,
            timeout: (session.timeout > 0).then(|| Duration::from_secs(session.timeout as u64)),
            outbound: peer.outbound.clone(),
        })
    }

    /// Outbound channel of a connection, for PDUs not tied to a session.
    pub fn peer_outbound(&self, connection_id: u64) -> Option<mpsc::Sender<Pdu>> {
        self.lock()
            .peers
            .get(&connection_id)
            .map(|p| p.outbound.clone())
    }

    /// Stops new sessions on a connection and moves its sessions to Closing.
    pub fn mark_closing(&self, connection_id: u64) {
        let mut inner = self.lock();
        let ids = match inner.peers.get_mut(&connection_id) {
            Some(peer) => {
                peer.closing = true;
                peer.sessions.clone()
            }
            None => return,
        };
        for id in ids {
            if let Some(s) = inner.sessions.get_mut(&id) {
                s.state = SessionState::Closing;
            }
        }
    }

    /// Drops a connection and returns the sessions it still carried, which
    /// are removed as well.
    pub fn remove_peer(&self, connection_id: u64) -> Vec<u32> {
        let mut inner = self.lock();
        let Some(peer) = inner.peers.remove(&connection_id) else {
            return Vec::new();
        };
        for id in &peer.sessions {
            inner.sessions.remove(id);
        }
        peer.sessions
    }

    /// Counts a sub-request timeout against a session and returns the
    /// consecutive total.
    pub fn record_timeout(&self, session_id: u32) -> u32 {
        let mut inner = self.lock();
        match inner.sessions.get_mut(&session_id) {
            Some(s) => {
                s.consecutive_timeouts += 1;
                s.consecutive_timeouts
            }
            None => 0,
        }
    }

    pub fn record_success(&self, session_id: u32) {
        if let Some(s) = self.lock().sessions.get_mut(&session_id) {
            s.consecutive_timeouts = 0;
            s.last_activity = Utc::now();
        }
    }

    /// Sessions with at least `max_timeouts` consecutive timeouts, and peers
    /// that opened nothing within `open_timeout` of connecting.
    pub fn stale(&self, now: DateTime<Utc>, max_timeouts: u32, open_timeout: Duration) -> StaleReport {
        let inner = self.lock();
        let grace = chrono::Duration::from_std(open_timeout).unwrap_or_else(|_| chrono::Duration::days(3650));
        let sessions = inner
            .sessions
            .values()
            .filter(|s| max_timeouts > 0 && s.consecutive_timeouts >= max_timeouts)
            .map(|s| s.id)
            .collect();
        let mut peers: Vec<u64> = inner
            .peers
            .values()
            .filter(|p| p.sessions.is_empty() && !p.closing && now - p.connect_time > grace)
            .map(|p| p.connection_id)
            .collect();
        peers.sort_unstable();
        StaleReport { sessions, peers }
    }

    pub fn session(&self, session_id: u32) -> Option<Session> {
        self.lock().sessions.get(&session_id).cloned()
    }

    pub fn session_ids(&self) -> Vec<u32> {
        self.lock().sessions.keys().copied().collect()
    }

    pub fn connection_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.lock().peers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let inner = self.lock();
        inner
            .sessions
            .values()
            .map(|s| SessionInfo {
                id: s.id,
                connection_id: s.connection_id,
                peer: inner
                    .peers
                    .get(&s.connection_id)
                    .map(|p| p.address.to_string())
                    .unwrap_or_default(),
                state: s.state,
                subagent_id: s.subagent_id.to_string(),
                description: s.description.clone(),
                opened_at: s.opened_at,
                consecutive_timeouts: s.consecutive_timeouts,
            })
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn peer_count(&self) -> usize {
        self.lock().peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max: usize) -> (SessionManager, u64, mpsc::Receiver<Pdu>) {
        let manager = SessionManager::new(max);
        let (tx, rx) = mpsc::channel(8);
        let conn = manager.add_peer(PeerAddress::Tcp("127.0.0.1:40000".parse().unwrap()), tx);
        (manager, conn, rx)
    }

    fn open(manager: &SessionManager, conn: u64) -> Result<u32, SessionError> {
        manager.open(
            conn,
            0,
            Oid::from_slice(&[1, 3, 6, 1, 4, 1, 8072]),
            "test subagent".to_string(),
            ByteOrder::BigEndian,
        )
    }

    #[test]
    fn test_open_assigns_fresh_ids() {
        let (m, conn, _rx) = manager(10);
        let a = open(&m, conn).unwrap();
        let b = open(&m, conn).unwrap();
        assert_ne!(a, 0);
        assert_ne!(a, b);
        m.close(a).unwrap();
        let c = open(&m, conn).unwrap();
        assert_ne!(c, a);
        assert_eq!(m.session_count(), 2);
    }

    #[test]
    fn test_open_limits() {
        let (m, conn, _rx) = manager(1);
        open(&m, conn).unwrap();
        let err = open(&m, conn).unwrap_err();
        assert_eq!(err, SessionError::TooManySessions(1));
        assert_eq!(err.status(), ErrorStatus::OpenFailed);
        assert_eq!(open(&m, 99), Err(SessionError::TooManySessions(1)));

        let (m, conn, _rx) = manager(4);
        assert_eq!(open(&m, 99), Err(SessionError::NoSuchPeer(99)));
        m.mark_closing(conn);
        assert_eq!(open(&m, conn), Err(SessionError::PeerClosing(conn)));
    }

    #[test]
    fn test_ping_and_close() {
        let (m, conn, _rx) = manager(4);
        let id = open(&m, conn).unwrap();
        assert!(m.ping(id).is_ok());
        let closed = m.close(id).unwrap();
        assert_eq!(closed.state, SessionState::Closed);
        assert_eq!(m.ping(id), Err(SessionError::NotOpen(id)));
        assert_eq!(m.close(id).unwrap_err().status(), ErrorStatus::NotOpen);
    }

    #[test]
    fn test_verify_checks_connection() {
        let (m, conn, _rx) = manager(4);
        let id = open(&m, conn).unwrap();
        assert!(m.verify(id, conn).is_ok());
        assert!(matches!(
            m.verify(id, conn + 1),
            Err(SessionError::WrongConnection { .. })
        ));
        assert_eq!(m.verify(id + 10, conn), Err(SessionError::NotOpen(id + 10)));
    }

    #[test]
    fn test_route_snapshot() {
        let (m, conn, _rx) = manager(4);
        let id = m
            .open(conn, 5, Oid::null(), String::new(), ByteOrder::LittleEndian)
            .unwrap();
        let route = m.route(id).unwrap();
        assert_eq!(route.connection_id, conn);
        assert_eq!(route.byte_order, ByteOrder::LittleEndian);
        assert_eq!(route.timeout, Some(Duration::from_secs(5)));
        m.mark_closing(conn);
        assert!(m.route(id).is_err());
    }

    #[test]
    fn test_remove_peer_returns_sessions() {
        let (m, conn, _rx) = manager(4);
        let a = open(&m, conn).unwrap();
        let b = open(&m, conn).unwrap();
        let mut removed = m.remove_peer(conn);
        removed.sort_unstable();
        assert_eq!(removed, vec![a, b]);
        assert_eq!(m.session_count(), 0);
        assert_eq!(m.peer_count(), 0);
        assert!(m.remove_peer(conn).is_empty());
    }

    #[test]
    fn test_stale_sweep() {
        let (m, conn, _rx) = manager(4);
        let (tx, _rx2) = mpsc::channel(1);
        let idle = m.add_peer(PeerAddress::Local(PathBuf::from("/tmp/agentx")), tx);
        let id = open(&m, conn).unwrap();
        assert_eq!(m.record_timeout(id), 1);
        assert_eq!(m.record_timeout(id), 2);

        let later = Utc::now() + chrono::Duration::seconds(60);
        let report = m.stale(later, 2, Duration::from_secs(30));
        assert_eq!(report.sessions, vec![id]);
        assert_eq!(report.peers, vec![idle]);

        m.record_success(id);
        let report = m.stale(Utc::now(), 2, Duration::from_secs(30));
        assert_eq!(report, StaleReport::default());
    }
}
