//! Agent capabilities advertised by subagents (AddAgentCaps /
//! RemoveAgentCaps), the source of sysORTable.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{oid::Oid, pdu::ErrorStatus};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityError {
    #[error("no capabilities {0} registered by this session")]
    Unknown(Oid),
}

impl CapabilityError {
    pub fn status(&self) -> ErrorStatus {
        ErrorStatus::UnknownAgentCaps
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capability {
    pub context: String,
    pub id: Oid,
    pub description: String,
    pub session_id: u32,
    pub added_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct CapabilityDirectory {
    entries: Mutex<Vec<Capability>>,
}

impl CapabilityDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Capability>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds or, for an id the session already advertised, replaces the
    /// description.
    pub fn add(&self, context: &[u8], id: Oid, description: String, session_id: u32) {
        let context = String::from_utf8_lossy(context).into_owned();
        let mut entries = self.lock();
        if let Some(existing) = entries
            .iter_mut()
            .find(|c| c.context == context && c.id == id && c.session_id == session_id)
        {
            existing.description = description;
            return;
        }
        entries.push(Capability {
            context,
            id,
            description,
            session_id,
            added_at: Utc::now(),
        });
    }

    pub fn remove(&self, context: &[u8], id: &Oid, session_id: u32) -> Result<Capability, CapabilityError> {
        let context = String::from_utf8_lossy(context);
        let mut entries = self.lock();
        let pos = entries
            .iter()
            .position(|c| c.context == context && c.id == *id && c.session_id == session_id)
            .ok_or_else(|| CapabilityError::Unknown(id.clone()))?;
        Ok(entries.remove(pos))
    }

    pub fn release_all(&self, session_id: u32) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|c| c.session_id != session_id);
        before - entries.len()
    }

    pub fn list(&self, context: &[u8]) -> Vec<Capability> {
        let context = String::from_utf8_lossy(context);
        self.lock()
            .iter()
            .filter(|c| c.context == context)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Capability> {
        self.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps_oid() -> Oid {
        Oid::from_slice(&[1, 3, 6, 1, 4, 1, 8072, 3, 2])
    }

    #[test]
    fn test_add_replaces_description() {
        let dir = CapabilityDirectory::new();
        dir.add(b"", caps_oid(), "first".to_string(), 1);
        dir.add(b"", caps_oid(), "second".to_string(), 1);
        dir.add(b"", caps_oid(), "other session".to_string(), 2);
        let list = dir.list(b"");
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].description, "second");
        assert!(dir.list(b"ctx").is_empty());
    }

    #[test]
    fn test_remove() {
        let dir = CapabilityDirectory::new();
        dir.add(b"", caps_oid(), "caps".to_string(), 1);
        let err = dir.remove(b"", &caps_oid(), 2).unwrap_err();
        assert_eq!(err.status(), ErrorStatus::UnknownAgentCaps);
        assert!(dir.remove(b"", &caps_oid(), 1).is_ok());
        assert!(dir.remove(b"", &caps_oid(), 1).is_err());
    }

    #[test]
    fn test_release_all() {
        let dir = CapabilityDirectory::new();
        dir.add(b"", caps_oid(), "a".to_string(), 1);
        dir.add(b"ctx", caps_oid(), "b".to_string(), 1);
        dir.add(b"", Oid::from_slice(&[1, 3, 6, 1, 4, 1, 1]), "c".to_string(), 2);
        assert_eq!(dir.release_all(1), 2);
        assert_eq!(dir.all().len(), 1);
    }
}
