//! Outstanding sub-requests to subagent sessions.
//!
//! Each request sent to a session is parked under its
//! `(session id, transaction id, packet id)` until the matching Response
//! arrives, the deadline passes, or the session goes away.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use tokio::sync::oneshot;

use crate::{
    pdu::{ErrorStatus, Payload, Pdu, VarBind},
    session::SessionRoute,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("session {0} is unreachable")]
    Unreachable(u32),
    #[error("no response from session {0} in time")]
    Timeout(u32),
    #[error("sub-request was abandoned")]
    Cancelled,
}

impl DispatchError {
    pub fn status(&self) -> ErrorStatus {
        ErrorStatus::ResourceUnavailable
    }
}

/// The parts of a Response PDU the coordinator works with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubResponse {
    pub error: ErrorStatus,
    pub index: u16,
    pub varbinds: Vec<VarBind>,
}

type PendingKey = (u32, u32, u32);
type Reply = Result<SubResponse, DispatchError>;

/// Removes its pending entry when the waiting request finishes or is
/// dropped mid-await.
struct PendingGuard<'a> {
    dispatcher: &'a Dispatcher,
    key: PendingKey,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.dispatcher.lock().remove(&self.key);
    }
}

pub struct Dispatcher {
    pending: Mutex<HashMap<PendingKey, oneshot::Sender<Reply>>>,
    next_packet: AtomicU32,
    next_transaction: AtomicU32,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher {
            pending: Mutex::new(HashMap::new()),
            next_packet: AtomicU32::new(1),
            next_transaction: AtomicU32::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PendingKey, oneshot::Sender<Reply>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn generate_transaction_id(&self) -> u32 {
        self.next_transaction.fetch_add(1, Ordering::Relaxed)
    }

    fn generate_packet_id(&self) -> u32 {
        self.next_packet.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends `payload` to the session behind `route` and waits for its
    /// Response, at most `timeout`.
    pub async fn request(
        &self,
        route: &SessionRoute,
        transaction_id: u32,
        payload: Payload,
        timeout: Duration,
    ) -> Reply {
        let packet_id = self.generate_packet_id();
        let key = (route.session_id, transaction_id, packet_id);
        let (tx, rx) = oneshot::channel();
        self.lock().insert(key, tx);
        let _guard = PendingGuard { dispatcher: self, key };

        let pdu = Pdu {
            session_id: route.session_id,
            transaction_id,
            packet_id,
            byte_order: route.byte_order,
            payload,
        };
        log::debug!(
            "Sending {:?} to session {} (transaction {}, packet {})",
            pdu.pdu_type(),
            route.session_id,
            transaction_id,
            packet_id
        );

        let exchange = async {
            if route.outbound.send(pdu).await.is_err() {
                return Err(DispatchError::Unreachable(route.session_id));
            }
            rx.await
                .unwrap_or(Err(DispatchError::Unreachable(route.session_id)))
        };
        match tokio::time::timeout(timeout, exchange).await {
            Ok(reply) => reply,
            Err(_) => Err(DispatchError::Timeout(route.session_id)),
        }
    }

    /// Sends `payload` without waiting for an answer. Used for CleanupSet,
    /// which subagents do not acknowledge.
    pub async fn post(&self, route: &SessionRoute, transaction_id: u32, payload: Payload) -> Result<(), DispatchError> {
        let pdu = Pdu {
            session_id: route.session_id,
            transaction_id,
            packet_id: self.generate_packet_id(),
            byte_order: route.byte_order,
            payload,
        };
        route
            .outbound
            .send(pdu)
            .await
            .map_err(|_| DispatchError::Unreachable(route.session_id))
    }

    /// Hands a Response PDU to whoever waits for it. Returns false when
    /// nothing was waiting (late or unsolicited response).
    pub fn deliver(&self, pdu: Pdu) -> bool {
        let key = (pdu.session_id, pdu.transaction_id, pdu.packet_id);
        let Payload::Response {
            error,
            index,
            varbinds,
            ..
        } = pdu.payload
        else {
            return false;
        };
        match self.lock().remove(&key) {
            Some(tx) => tx
                .send(Ok(SubResponse {
                    error,
                    index,
                    varbinds,
                }))
                .is_ok(),
            None => false,
        }
    }

    /// Resolves every request pending on `session_id` as unreachable.
    pub fn fail_session(&self, session_id: u32) -> usize {
        let mut pending = self.lock();
        let keys: Vec<PendingKey> = pending
            .keys()
            .filter(|(s, _, _)| *s == session_id)
            .copied()
            .collect();
        for key in &keys {
            if let Some(tx) = pending.remove(key) {
                let _ = tx.send(Err(DispatchError::Unreachable(session_id)));
            }
        }
        keys.len()
    }

    pub fn fail_all(&self) -> usize {
        let mut pending = self.lock();
        let count = pending.len();
        for ((session_id, _, _), tx) in pending.drain() {
            let _ = tx.send(Err(DispatchError::Unreachable(session_id)));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }
}
