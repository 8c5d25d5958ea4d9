//! Collaborators the master consults but does not implement: access
//! control, peer address filtering, notification delivery and persistence.

use std::{io, net::IpAddr};

use crate::{
    oid::Oid,
    pdu::VarBind,
    session::PeerAddress,
};

/// Security model identifiers (RFC 3411).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityModel {
    V1 = 1,
    V2c = 2,
    Usm = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SecurityLevel {
    NoAuthNoPriv,
    AuthNoPriv,
    AuthPriv,
}

/// Who is asking, as established by the SNMP message layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityParams {
    pub model: SecurityModel,
    pub name: Vec<u8>,
    pub level: SecurityLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewType {
    Read,
    Write,
    Notify,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Allowed,
    NotInView,
    Denied(String),
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AccessDecision::Allowed)
    }
}

pub trait AccessControl: Send + Sync {
    fn is_access_allowed(
        &self,
        params: &SecurityParams,
        view_type: ViewType,
        context: &[u8],
        oid: &Oid,
    ) -> AccessDecision;

    fn is_access_allowed_in_view(&self, view_name: &str, oid: &Oid) -> AccessDecision;
}

/// Grants every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn is_access_allowed(&self, _: &SecurityParams, _: ViewType, _: &[u8], _: &Oid) -> AccessDecision {
        AccessDecision::Allowed
    }

    fn is_access_allowed_in_view(&self, _: &str, _: &Oid) -> AccessDecision {
        AccessDecision::Allowed
    }
}

/// A fixed set of included and excluded subtrees applied to every
/// principal. Writes are refused unless enabled.
#[derive(Debug, Clone, Default)]
pub struct SubtreeView {
    included: Vec<Oid>,
    excluded: Vec<Oid>,
    writable: bool,
}

impl SubtreeView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include(mut self, oid: Oid) -> Self {
        self.included.push(oid);
        self
    }

    pub fn exclude(mut self, oid: Oid) -> Self {
        self.excluded.push(oid);
        self
    }

    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }

    fn contains(&self, oid: &Oid) -> bool {
        self.included.iter().any(|p| oid.starts_with(p))
            && !self.excluded.iter().any(|p| oid.starts_with(p))
    }
}

impl AccessControl for SubtreeView {
    fn is_access_allowed(
        &self,
        _params: &SecurityParams,
        view_type: ViewType,
        _context: &[u8],
        oid: &Oid,
    ) -> AccessDecision {
        if view_type == ViewType::Write && !self.writable {
            return AccessDecision::Denied("view is read-only".to_string());
        }
        if self.contains(oid) {
            AccessDecision::Allowed
        } else {
            AccessDecision::NotInView
        }
    }

    fn is_access_allowed_in_view(&self, _view_name: &str, oid: &Oid) -> AccessDecision {
        if self.contains(oid) {
            AccessDecision::Allowed
        } else {
            AccessDecision::NotInView
        }
    }
}

pub trait AddressFilter: Send + Sync {
    fn is_peer_address_allowed(&self, address: &PeerAddress) -> bool;
}

/// Admits TCP peers from listed addresses; an empty list admits everyone.
/// Unix-domain peers are always admitted.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    addresses: Vec<IpAddr>,
}

impl AllowList {
    pub fn new(addresses: Vec<IpAddr>) -> Self {
        AllowList { addresses }
    }
}

impl AddressFilter for AllowList {
    fn is_peer_address_allowed(&self, address: &PeerAddress) -> bool {
        match address {
            PeerAddress::Tcp(addr) => {
                self.addresses.is_empty() || self.addresses.contains(&addr.ip())
            }
            PeerAddress::Local(_) => true,
        }
    }
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, session_id: u32, context: &[u8], varbinds: &[VarBind]);
}

/// Writes forwarded notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, session_id: u32, context: &[u8], varbinds: &[VarBind]) {
        let trap = varbinds
            .get(1)
            .map(|vb| format!("{:?}", vb.value))
            .unwrap_or_default();
        log::info!(
            "Notification from session {} (context '{}', {} varbinds) {}",
            session_id,
            String::from_utf8_lossy(context),
            varbinds.len(),
            trap
        );
    }
}

/// Hooks for saving master state across restarts. The format is the
/// implementor's business.
pub trait Persistence: Send + Sync {
    fn load(&self) -> io::Result<()>;
    fn save(&self) -> io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoPersistence;

impl Persistence for NoPersistence {
    fn load(&self) -> io::Result<()> {
        Ok(())
    }

    fn save(&self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn params() -> SecurityParams {
        SecurityParams {
            model: SecurityModel::V2c,
            name: b"public".to_vec(),
            level: SecurityLevel::NoAuthNoPriv,
        }
    }

    #[test]
    fn test_subtree_view() {
        let view = SubtreeView::new()
            .include(Oid::from_slice(&[1, 3, 6, 1, 2, 1]))
            .exclude(Oid::from_slice(&[1, 3, 6, 1, 2, 1, 4]));
        let sys = Oid::from_slice(&[1, 3, 6, 1, 2, 1, 1, 1, 0]);
        let ip = Oid::from_slice(&[1, 3, 6, 1, 2, 1, 4, 1, 0]);
        assert!(view.is_access_allowed(&params(), ViewType::Read, b"", &sys).is_allowed());
        assert_eq!(
            view.is_access_allowed(&params(), ViewType::Read, b"", &ip),
            AccessDecision::NotInView
        );
        assert!(matches!(
            view.is_access_allowed(&params(), ViewType::Write, b"", &sys),
            AccessDecision::Denied(_)
        ));
    }

    #[test]
    fn test_allow_list() {
        let filter = AllowList::new(vec!["127.0.0.1".parse().unwrap()]);
        assert!(filter.is_peer_address_allowed(&PeerAddress::Tcp("127.0.0.1:4000".parse().unwrap())));
        assert!(!filter.is_peer_address_allowed(&PeerAddress::Tcp("10.0.0.1:4000".parse().unwrap())));
        assert!(filter.is_peer_address_allowed(&PeerAddress::Local(PathBuf::from("/var/agentx/master"))));
        assert!(AllowList::default()
            .is_peer_address_allowed(&PeerAddress::Tcp("10.0.0.1:4000".parse().unwrap())));
    }
}
