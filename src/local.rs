//! MIB objects served inside the master process.
//!
//! A [`MibStore`] answers the same questions a subagent session would
//! (Get, GetNext within a search range, and the four Set phases), so the
//! transaction coordinator can treat local and remote owners alike.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{
    oid::Oid,
    pdu::{ErrorStatus, SearchRange, VarBind, VarBindValue},
};

/// A failed Set phase: the status and the 1-based varbind index it refers to
/// (0 when it applies to the whole request).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreError {
    pub status: ErrorStatus,
    pub index: u16,
}

impl StoreError {
    pub fn new(status: ErrorStatus, index: u16) -> Self {
        StoreError { status, index }
    }
}

pub trait MibStore: Send + Sync {
    /// Value of exactly `oid`, or one of the exception values.
    fn get(&self, oid: &Oid) -> VarBindValue;

    /// First object admitted by `range`, if any.
    fn get_next(&self, range: &SearchRange) -> Option<VarBind>;

    /// Validates and stages `varbinds` under `transaction`.
    fn test_set(&self, transaction: u32, varbinds: &[VarBind]) -> Result<(), StoreError>;

    fn commit_set(&self, transaction: u32) -> Result<(), StoreError>;

    fn undo_set(&self, transaction: u32) -> Result<(), StoreError>;

    /// Releases everything staged for `transaction`. Always succeeds.
    fn cleanup_set(&self, transaction: u32);
}

/// Shared handle to a registered local store.
#[derive(Clone)]
pub struct LocalHandle {
    id: u32,
    name: String,
    store: Arc<dyn MibStore>,
}

impl LocalHandle {
    pub fn new(id: u32, name: impl Into<String>, store: Arc<dyn MibStore>) -> Self {
        LocalHandle {
            id,
            name: name.into(),
            store,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &dyn MibStore {
        self.store.as_ref()
    }
}

impl fmt::Debug for LocalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl PartialEq for LocalHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for LocalHandle {}

#[derive(Debug, Clone)]
struct Object {
    value: VarBindValue,
    writable: bool,
}

#[derive(Default)]
struct MemoryInner {
    objects: BTreeMap<Oid, Object>,
    staged: HashMap<u32, Vec<VarBind>>,
    /// Previous values of committed objects, `None` for created ones.
    undo: HashMap<u32, Vec<(Oid, Option<Object>)>>,
}

/// An in-memory [`MibStore`] backed by an ordered map.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    allow_create: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lets Set create objects that do not exist yet.
    pub fn with_creation(mut self) -> Self {
        self.allow_create = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, oid: Oid, value: VarBindValue, writable: bool) {
        self.lock().objects.insert(oid, Object { value, writable });
    }

    pub fn value(&self, oid: &Oid) -> Option<VarBindValue> {
        self.lock().objects.get(oid).map(|o| o.value.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MibStore for MemoryStore {
    fn get(&self, oid: &Oid) -> VarBindValue {
        let inner = self.lock();
        if let Some(object) = inner.objects.get(oid) {
            return object.value.clone();
        }
        // A sibling instance under the same parent means the object exists.
        let parent = Oid::from_slice(&oid.0[..oid.len().saturating_sub(1)]);
        let parent_exists = !parent.is_empty()
            && inner
                .objects
                .range(parent.clone()..)
                .next()
                .map_or(false, |(k, _)| k.starts_with(&parent));
        if parent_exists {
            VarBindValue::NoSuchInstance
        } else {
            VarBindValue::NoSuchObject
        }
    }

    fn get_next(&self, range: &SearchRange) -> Option<VarBind> {
        let inner = self.lock();
        inner
            .objects
            .range(range.start.clone()..)
            .find(|(oid, _)| range.include || **oid != range.start)
            .filter(|(oid, _)| range.admits(oid))
            .map(|(oid, object)| VarBind::new(oid.clone(), object.value.clone()))
    }

    fn test_set(&self, transaction: u32, varbinds: &[VarBind]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        for (i, vb) in varbinds.iter().enumerate() {
            let index = i as u16 + 1;
            match inner.objects.get(&vb.oid) {
                Some(object) if !object.writable => {
                    return Err(StoreError::new(ErrorStatus::NotWritable, index))
                }
                Some(object) if object.value.type_tag() != vb.value.type_tag() => {
                    return Err(StoreError::new(ErrorStatus::WrongType, index))
                }
                Some(_) => {}
                None if self.allow_create => {}
                None => return Err(StoreError::new(ErrorStatus::NoCreation, index)),
            }
        }
        inner.staged.insert(transaction, varbinds.to_vec());
        Ok(())
    }

    fn commit_set(&self, transaction: u32) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let staged = inner
            .staged
            .remove(&transaction)
            .ok_or(StoreError::new(ErrorStatus::CommitFailed, 0))?;
        let mut previous = Vec::with_capacity(staged.len());
        for vb in staged {
            let old = inner.objects.insert(
                vb.oid.clone(),
                Object {
                    value: vb.value,
                    writable: true,
                },
            );
            previous.push((vb.oid, old));
        }
        inner.undo.insert(transaction, previous);
        Ok(())
    }

    fn undo_set(&self, transaction: u32) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.staged.remove(&transaction);
        if let Some(previous) = inner.undo.remove(&transaction) {
            for (oid, old) in previous.into_iter().rev() {
                match old {
                    Some(object) => {
                        inner.objects.insert(oid, object);
                    }
                    None => {
                        inner.objects.remove(&oid);
                    }
                }
            }
        }
        Ok(())
    }

    fn cleanup_set(&self, transaction: u32) {
        let mut inner = self.lock();
        inner.staged.remove(&transaction);
        inner.undo.remove(&transaction);
    }
}
