//! Index allocation directory (RFC 2741 §7.1.4).
//!
//! Subagents sharing a table reserve index values here before creating rows.
//! Each `(context, index object)` pair has its own table; the first
//! allocation fixes the value type for that table.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Mutex, MutexGuard, PoisonError},
};

use serde::Serialize;

use crate::{
    oid::Oid,
    pdu::{ErrorStatus, VarBind, VarBindValue},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationMode {
    /// The value given in the request.
    Specific,
    /// A value never handed out before.
    NewIndex,
    /// Any unused value, preferring one the caller already holds.
    AnyIndex,
}

impl AllocationMode {
    pub fn from_flags(new_index: bool, any_index: bool) -> Self {
        if new_index {
            AllocationMode::NewIndex
        } else if any_index {
            AllocationMode::AnyIndex
        } else {
            AllocationMode::Specific
        }
    }
}

/// Failures carry the 1-based position of the offending varbind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IndexError {
    #[error("index value of wrong type at varbind {0}")]
    WrongType(u16),
    #[error("index value already allocated at varbind {0}")]
    AlreadyAllocated(u16),
    #[error("no index value available at varbind {0}")]
    NoneAvailable(u16),
    #[error("index value not allocated at varbind {0}")]
    NotAllocated(u16),
}

impl IndexError {
    pub fn status(&self) -> ErrorStatus {
        match self {
            IndexError::WrongType(_) => ErrorStatus::IndexWrongType,
            IndexError::AlreadyAllocated(_) => ErrorStatus::IndexAlreadyAllocated,
            IndexError::NoneAvailable(_) => ErrorStatus::IndexNoneAvailable,
            IndexError::NotAllocated(_) => ErrorStatus::IndexNotAllocated,
        }
    }

    pub fn index(&self) -> u16 {
        match self {
            IndexError::WrongType(i)
            | IndexError::AlreadyAllocated(i)
            | IndexError::NoneAvailable(i)
            | IndexError::NotAllocated(i) => *i,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum IndexValue {
    Integer(i32),
    Gauge32(u32),
    OctetString(Vec<u8>),
    IpAddress([u8; 4]),
    ObjectIdentifier(Oid),
}

impl IndexValue {
    fn from_value(value: &VarBindValue) -> Option<IndexValue> {
        match value {
            VarBindValue::Integer(v) => Some(IndexValue::Integer(*v)),
            VarBindValue::Gauge32(v) => Some(IndexValue::Gauge32(*v)),
            VarBindValue::OctetString(v) => Some(IndexValue::OctetString(v.clone())),
            VarBindValue::IpAddress(v) => Some(IndexValue::IpAddress(*v)),
            VarBindValue::ObjectIdentifier(v) => Some(IndexValue::ObjectIdentifier(v.clone())),
            _ => None,
        }
    }

    fn to_value(&self) -> VarBindValue {
        match self {
            IndexValue::Integer(v) => VarBindValue::Integer(*v),
            IndexValue::Gauge32(v) => VarBindValue::Gauge32(*v),
            IndexValue::OctetString(v) => VarBindValue::OctetString(v.clone()),
            IndexValue::IpAddress(v) => VarBindValue::IpAddress(*v),
            IndexValue::ObjectIdentifier(v) => VarBindValue::ObjectIdentifier(v.clone()),
        }
    }

    fn same_type(&self, other: &IndexValue) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Where generation starts: 1 for integers, the caller's value
    /// otherwise.
    fn seed(&self) -> IndexValue {
        match self {
            IndexValue::Integer(_) => IndexValue::Integer(1),
            IndexValue::Gauge32(_) => IndexValue::Gauge32(1),
            IndexValue::OctetString(v) if v.is_empty() => IndexValue::OctetString(vec![1]),
            IndexValue::ObjectIdentifier(v) if v.is_empty() => {
                IndexValue::ObjectIdentifier(Oid::from_slice(&[1]))
            }
            other => other.clone(),
        }
    }

    /// Next candidate: +1 for integers, the last octet or sub-identifier
    /// bumped otherwise.
    fn successor(&self) -> Option<IndexValue> {
        match self {
            IndexValue::Integer(v) => v.checked_add(1).map(IndexValue::Integer),
            IndexValue::Gauge32(v) => v.checked_add(1).map(IndexValue::Gauge32),
            IndexValue::OctetString(v) => {
                let mut v = v.clone();
                let last = v.last_mut()?;
                *last = last.checked_add(1)?;
                Some(IndexValue::OctetString(v))
            }
            IndexValue::IpAddress(v) => {
                let mut v = *v;
                v[3] = v[3].checked_add(1)?;
                Some(IndexValue::IpAddress(v))
            }
            IndexValue::ObjectIdentifier(oid) => {
                let mut subs = oid.0.clone();
                let last = subs.last_mut()?;
                *last = last.checked_add(1)?;
                Some(IndexValue::ObjectIdentifier(Oid(subs)))
            }
        }
    }

    fn is_integer(&self) -> bool {
        matches!(self, IndexValue::Integer(_) | IndexValue::Gauge32(_))
    }
}

#[derive(Debug, Default)]
struct IndexTable {
    allocated: BTreeMap<IndexValue, u32>,
    /// Every value ever allocated, for NewIndex.
    used: BTreeSet<IndexValue>,
}

impl IndexTable {
    fn kind(&self) -> Option<&IndexValue> {
        self.used.iter().next()
    }

    fn first_free(&self, seed: IndexValue, taken: impl Fn(&IndexValue) -> bool) -> Option<IndexValue> {
        let mut candidate = Some(seed);
        while let Some(value) = candidate {
            if !taken(&value) {
                return Some(value);
            }
            candidate = value.successor();
        }
        None
    }

    fn generate(&self, mode: AllocationMode, requested: &IndexValue, owner: u32) -> Option<IndexValue> {
        match mode {
            AllocationMode::NewIndex => {
                let seed = match self.used.iter().next_back() {
                    Some(max) if requested.is_integer() => max.successor()?,
                    _ => requested.seed(),
                };
                self.first_free(seed, |v| self.used.contains(v))
            }
            AllocationMode::AnyIndex => {
                if let Some((held, _)) = self.allocated.iter().find(|(_, o)| **o == owner) {
                    return Some(held.clone());
                }
                self.first_free(requested.seed(), |v| self.allocated.contains_key(v))
            }
            AllocationMode::Specific => Some(requested.clone()),
        }
    }
}

/// Status-report view of one allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexAllocation {
    pub context: String,
    pub index_name: String,
    pub value: IndexValue,
    pub owner: u32,
}

type TableKey = (Vec<u8>, Oid);

#[derive(Default)]
pub struct IndexDirectory {
    tables: Mutex<BTreeMap<TableKey, IndexTable>>,
}

impl IndexDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<TableKey, IndexTable>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates one value per varbind, all or nothing. Each varbind names
    /// the index object and carries a value of the wanted type; the result
    /// carries the values actually allocated.
    pub fn allocate(
        &self,
        context: &[u8],
        mode: AllocationMode,
        varbinds: &[VarBind],
        owner: u32,
    ) -> Result<Vec<VarBind>, IndexError> {
        let mut tables = self.lock();
        // (key, value, newly used) for rollback
        let mut done: Vec<(TableKey, IndexValue, bool)> = Vec::new();
        let mut result = Vec::with_capacity(varbinds.len());

        let mut outcome = Ok(());
        for (i, vb) in varbinds.iter().enumerate() {
            let position = i as u16 + 1;
            match allocate_one(&mut tables, context, mode, vb, owner, position) {
                Ok((key, value, fresh, created)) => {
                    result.push(VarBind::new(vb.oid.clone(), value.to_value()));
                    if created {
                        done.push((key, value, fresh));
                    }
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        if let Err(e) = outcome {
            for (key, value, fresh) in done.into_iter().rev() {
                if let Some(table) = tables.get_mut(&key) {
                    table.allocated.remove(&value);
                    if fresh {
                        table.used.remove(&value);
                    }
                    if table.used.is_empty() {
                        tables.remove(&key);
                    }
                }
            }
            return Err(e);
        }
        Ok(result)
    }

    /// Releases one value per varbind, all or nothing.
    pub fn deallocate(&self, context: &[u8], varbinds: &[VarBind], owner: u32) -> Result<(), IndexError> {
        let mut tables = self.lock();
        let mut targets = Vec::with_capacity(varbinds.len());
        for (i, vb) in varbinds.iter().enumerate() {
            let position = i as u16 + 1;
            let key = (context.to_vec(), vb.oid.clone());
            let value = IndexValue::from_value(&vb.value).ok_or(IndexError::WrongType(position))?;
            let table = tables.get(&key).ok_or(IndexError::NotAllocated(position))?;
            if table.kind().map_or(false, |k| !k.same_type(&value)) {
                return Err(IndexError::WrongType(position));
            }
            if table.allocated.get(&value) != Some(&owner) {
                return Err(IndexError::NotAllocated(position));
            }
            targets.push((key, value));
        }
        for (key, value) in targets {
            if let Some(table) = tables.get_mut(&key) {
                table.allocated.remove(&value);
            }
        }
        Ok(())
    }

    /// Releases every value held by `owner`. Returns how many were freed.
    pub fn release_all(&self, owner: u32) -> usize {
        let mut tables = self.lock();
        let mut released = 0;
        for table in tables.values_mut() {
            let before = table.allocated.len();
            table.allocated.retain(|_, o| *o != owner);
            released += before - table.allocated.len();
        }
        released
    }

    pub fn allocations(&self) -> Vec<IndexAllocation> {
        let tables = self.lock();
        tables
            .iter()
            .flat_map(|((context, name), table)| {
                table.allocated.iter().map(move |(value, owner)| IndexAllocation {
                    context: String::from_utf8_lossy(context).into_owned(),
                    index_name: name.to_string(),
                    value: value.clone(),
                    owner: *owner,
                })
            })
            .collect()
    }
}

/// Returns the table key, the value, whether it was never used before, and
/// whether a new allocation was made (false when AnyIndex reused one).
fn allocate_one(
    tables: &mut BTreeMap<TableKey, IndexTable>,
    context: &[u8],
    mode: AllocationMode,
    vb: &VarBind,
    owner: u32,
    position: u16,
) -> Result<(TableKey, IndexValue, bool, bool), IndexError> {
    let requested = IndexValue::from_value(&vb.value).ok_or(IndexError::WrongType(position))?;
    let key = (context.to_vec(), vb.oid.clone());
    let table = tables.entry(key.clone()).or_default();
    if table.kind().map_or(false, |k| !k.same_type(&requested)) {
        return Err(IndexError::WrongType(position));
    }

    let value = table
        .generate(mode, &requested, owner)
        .ok_or(IndexError::NoneAvailable(position))?;
    match table.allocated.get(&value) {
        Some(holder) if mode == AllocationMode::AnyIndex && *holder == owner => {
            return Ok((key, value, false, false));
        }
        Some(_) => return Err(IndexError::AlreadyAllocated(position)),
        None => {}
    }
    table.allocated.insert(value.clone(), owner);
    let fresh = table.used.insert(value.clone());
    Ok((key, value, fresh, true))
}
