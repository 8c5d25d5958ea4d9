//! MIB registration directory.
//!
//! Holds every region registered by subagent sessions and local stores, per
//! context, sorted by `(lower, priority, sequence)`. All operations take the
//! directory lock for their own duration only and hand out cloned entries.

use std::{
    cmp::Ordering,
    collections::BTreeMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use serde::Serialize;

use crate::{
    local::LocalHandle,
    oid::Oid,
    pdu::ErrorStatus,
    region::{cmp_end, end_after, Region},
};

/// Non-trailing ranges with more values than this are routed by their span.
const MAX_ROUTING_PIECES: u32 = 256;

/// Who serves a registered region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    /// An AgentX session on a subagent connection.
    Remote { session_id: u32, connection_id: u64 },
    /// A store served inside the master process.
    Local(LocalHandle),
}

impl Owner {
    pub fn session_id(&self) -> Option<u32> {
        match self {
            Owner::Remote { session_id, .. } => Some(*session_id),
            Owner::Local(_) => None,
        }
    }

    /// Identity used to group requests: one per session or local store.
    pub fn key(&self) -> OwnerKey {
        match self {
            Owner::Remote { session_id, .. } => OwnerKey::Session(*session_id),
            Owner::Local(handle) => OwnerKey::Local(handle.id()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum OwnerKey {
    Session(u32),
    Local(u32),
}

/// One registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegEntry {
    pub region: Region,
    pub owner: Owner,
    pub priority: u8,
    pub context: Vec<u8>,
    /// Per-region timeout in seconds; 0 defers to the session's.
    pub timeout: u8,
    sequence: u64,
}

impl RegEntry {
    pub fn new(region: Region, owner: Owner, priority: u8, context: Vec<u8>, timeout: u8) -> Self {
        RegEntry {
            region,
            owner,
            priority,
            context,
            timeout,
            sequence: 0,
        }
    }

    /// Registration order within the directory.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    fn sort_key(&self) -> (&Oid, u8, u64) {
        (self.region.lower(), self.priority, self.sequence)
    }

    /// Dispatch precedence: lower priority value, then the more specific
    /// region, then the earlier registration.
    fn precedence(&self, other: &RegEntry) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.region.specificity().cmp(&self.region.specificity()))
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("duplicate registration of {0}")]
    Duplicate(Region),
    #[error("registration conflicts with {existing} at priority {priority}")]
    Conflict { existing: Region, priority: u8 },
    #[error("no matching registration")]
    NotFound,
}

impl RegistrationError {
    pub fn status(&self) -> ErrorStatus {
        match self {
            RegistrationError::Duplicate(_) => ErrorStatus::DuplicateRegistration,
            RegistrationError::Conflict { .. } => ErrorStatus::RequestDenied,
            RegistrationError::NotFound => ErrorStatus::UnknownRegistration,
        }
    }
}

/// A stretch of OID space one owner can be asked to walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub entry: RegEntry,
    /// Where the search starts.
    pub start: Oid,
    pub include: bool,
    /// Exclusive end; `None` runs to the end of the MIB.
    pub end: Option<Oid>,
}

#[derive(Default)]
struct RegistryInner {
    contexts: BTreeMap<Vec<u8>, Vec<RegEntry>>,
    next_sequence: u64,
}

#[derive(Default)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a registration.
    ///
    /// Rejects exact duplicates of `(region, priority, context)`, and
    /// overlaps where the candidate does not strictly out-rank a foreign
    /// owner, or shares a priority with an overlapping entry of its own.
    pub fn register(&self, mut entry: RegEntry) -> Result<RegEntry, RegistrationError> {
        let mut inner = self.lock();
        let sequence = inner.next_sequence;
        let table = inner.contexts.entry(entry.context.clone()).or_default();

        if table
            .iter()
            .any(|e| e.region == entry.region && e.priority == entry.priority)
        {
            return Err(RegistrationError::Duplicate(entry.region));
        }

        for existing in table.iter().filter(|e| e.region.overlaps(&entry.region)) {
            let same_owner = existing.owner.key() == entry.owner.key();
            let blocked = if same_owner {
                existing.priority == entry.priority
            } else {
                entry.priority >= existing.priority
            };
            if blocked {
                return Err(RegistrationError::Conflict {
                    existing: existing.region.clone(),
                    priority: existing.priority,
                });
            }
        }

        entry.sequence = sequence;
        let pos = table.partition_point(|e| e.sort_key() < entry.sort_key());
        table.insert(pos, entry.clone());
        inner.next_sequence += 1;
        Ok(entry)
    }

    /// Removes the registration matching `(context, region, priority, owner)`.
    pub fn unregister(
        &self,
        context: &[u8],
        region: &Region,
        priority: u8,
        owner: OwnerKey,
    ) -> Result<RegEntry, RegistrationError> {
        let mut inner = self.lock();
        let table = inner
            .contexts
            .get_mut(context)
            .ok_or(RegistrationError::NotFound)?;
        let pos = table
            .iter()
            .position(|e| &e.region == region && e.priority == priority && e.owner.key() == owner)
            .ok_or(RegistrationError::NotFound)?;
        let removed = table.remove(pos);
        if table.is_empty() {
            inner.contexts.remove(context);
        }
        Ok(removed)
    }

    /// Entry currently responsible for `oid`.
    pub fn owner_of(&self, context: &[u8], oid: &Oid) -> Option<RegEntry> {
        let inner = self.lock();
        let table = inner.contexts.get(context)?;
        let candidates = table.partition_point(|e| e.region.lower() <= oid);
        table[..candidates]
            .iter()
            .filter(|e| e.region.contains(oid))
            .min_by(|a, b| a.precedence(b))
            .cloned()
    }

    /// Entries whose regions overlap `region`.
    pub fn affected_by(&self, context: &[u8], region: &Region) -> Vec<RegEntry> {
        let inner = self.lock();
        inner
            .contexts
            .get(context)
            .map(|table| {
                table
                    .iter()
                    .filter(|e| e.region.overlaps(region))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// End of the run of contiguous registrations held by `start`'s session,
    /// beginning at `start`. `None` means the run reaches the end of the MIB.
    pub fn upper_session_boundary(&self, context: &[u8], start: &RegEntry) -> Option<Oid> {
        let inner = self.lock();
        let fallback = start.region.span_end();
        let Some(table) = inner.contexts.get(context) else {
            return fallback;
        };
        let Some(pos) = table.iter().position(|e| e == start) else {
            return fallback;
        };
        session_boundary(table, pos)
    }

    /// Finds the first owned stretch of OID space at or after `oid`
    /// (strictly after unless `include`), bounded so that a single owner can
    /// be asked to search it.
    pub fn route_next(&self, context: &[u8], oid: &Oid, include: bool) -> Option<Route> {
        let inner = self.lock();
        let table = inner.contexts.get(context)?;
        let search_from = if include { oid.clone() } else { oid.child(0) };

        let pieces: Vec<Piece> = table
            .iter()
            .enumerate()
            .flat_map(|(idx, e)| routing_pieces(idx, &e.region))
            .filter(|p| end_after(p.end.as_ref(), &search_from))
            .collect();
        if pieces.is_empty() {
            return None;
        }

        let mut points: Vec<Oid> = pieces
            .iter()
            .flat_map(|p| std::iter::once(p.start.clone()).chain(p.end.clone()))
            .filter(|p| *p > search_from)
            .collect();
        points.push(search_from.clone());
        points.sort();
        points.dedup();

        let winner_at = |at: &Oid| -> Option<usize> {
            pieces
                .iter()
                .filter(|p| p.start <= *at && end_after(p.end.as_ref(), at))
                .map(|p| p.entry)
                .min_by(|a, b| table[*a].precedence(&table[*b]))
        };

        for (i, seg_start) in points.iter().enumerate() {
            let Some(winner) = winner_at(seg_start) else {
                continue;
            };
            let owner = table[winner].owner.key();

            let mut end = None;
            for next in &points[i + 1..] {
                match winner_at(next) {
                    Some(w) if table[w].owner.key() == owner => continue,
                    _ => {
                        end = Some(next.clone());
                        break;
                    }
                }
            }
            let boundary = session_boundary(table, winner);
            if cmp_end(boundary.as_ref(), end.as_ref()) == Ordering::Less {
                end = boundary;
            }

            let (start, include) = if *seg_start == search_from {
                (oid.clone(), include)
            } else {
                (seg_start.clone(), true)
            };
            return Some(Route {
                entry: table[winner].clone(),
                start,
                include,
                end,
            });
        }
        None
    }

    /// Removes every registration owned by `session_id`.
    pub fn remove_session(&self, session_id: u32) -> Vec<RegEntry> {
        self.remove_where(|e| e.owner.session_id() == Some(session_id))
    }

    /// Removes every registration made over `connection_id`.
    pub fn remove_connection(&self, connection_id: u64) -> Vec<RegEntry> {
        self.remove_where(|e| {
            matches!(e.owner, Owner::Remote { connection_id: c, .. } if c == connection_id)
        })
    }

    /// Removes every registration of the local store `id`.
    pub fn remove_local(&self, id: u32) -> Vec<RegEntry> {
        self.remove_where(|e| e.owner.key() == OwnerKey::Local(id))
    }

    fn remove_where(&self, pred: impl Fn(&RegEntry) -> bool) -> Vec<RegEntry> {
        let mut inner = self.lock();
        let mut removed = Vec::new();
        for table in inner.contexts.values_mut() {
            let (gone, kept): (Vec<RegEntry>, Vec<RegEntry>) =
                std::mem::take(table).into_iter().partition(|e| pred(e));
            *table = kept;
            removed.extend(gone);
        }
        inner.contexts.retain(|_, table| !table.is_empty());
        removed
    }

    /// Snapshot of the registrations in `context`, in directory order.
    pub fn entries(&self, context: &[u8]) -> Vec<RegEntry> {
        self.lock()
            .contexts
            .get(context)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of every registration in every context.
    pub fn all_entries(&self) -> Vec<RegEntry> {
        self.lock()
            .contexts
            .values()
            .flat_map(|t| t.iter().cloned())
            .collect()
    }

    pub fn contexts(&self) -> Vec<Vec<u8>> {
        self.lock().contexts.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().contexts.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn session_boundary(table: &[RegEntry], pos: usize) -> Option<Oid> {
    let start = &table[pos];
    let Some(session) = start.owner.session_id() else {
        return start.region.span_end();
    };
    let mut end = start.region.span_end();
    for next in &table[pos + 1..] {
        let contiguous = end.as_ref().map_or(true, |e| next.region.lower() <= e);
        if next.owner.session_id() != Some(session) || !contiguous {
            break;
        }
        let next_end = next.region.span_end();
        if cmp_end(next_end.as_ref(), end.as_ref()) == Ordering::Greater {
            end = next_end;
        }
    }
    end
}

/// A contiguous interval `[start, end)` of one entry's region.
struct Piece {
    entry: usize,
    start: Oid,
    end: Option<Oid>,
}

fn routing_pieces(entry: usize, region: &Region) -> Vec<Piece> {
    let span = || Piece {
        entry,
        start: region.lower().clone(),
        end: region.span_end(),
    };
    let Some(range_subid) = region.range_subid() else {
        return vec![span()];
    };
    let pos = range_subid as usize - 1;
    if pos + 1 == region.lower().len() {
        return vec![span()];
    }
    let lo = region.lower().0[pos];
    let hi = region.upper().0[pos];
    if hi - lo >= MAX_ROUTING_PIECES {
        return vec![span()];
    }
    (lo..=hi)
        .map(|v| {
            let mut start = region.lower().clone();
            start.0[pos] = v;
            let end = if region.is_single_instance() {
                Some(start.child(0))
            } else {
                start.next_sibling()
            };
            Piece { entry, start, end }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(subs: &[u32]) -> Oid {
        Oid::from_slice(subs)
    }

    fn remote(session_id: u32) -> Owner {
        Owner::Remote {
            session_id,
            connection_id: session_id as u64 + 100,
        }
    }

    fn subtree_entry(subs: &[u32], session: u32, priority: u8) -> RegEntry {
        RegEntry::new(
            Region::subtree(oid(subs)).unwrap(),
            remote(session),
            priority,
            Vec::new(),
            0,
        )
    }

    #[test]
    fn test_register_and_owner_of() {
        let reg = Registry::new();
        reg.register(subtree_entry(&[1, 3, 6, 1, 2, 1, 1], 1, 127))
            .unwrap();
        reg.register(subtree_entry(&[1, 3, 6, 1, 2, 1, 1, 3], 2, 1))
            .unwrap();

        let owner = reg.owner_of(b"", &oid(&[1, 3, 6, 1, 2, 1, 1, 3, 0])).unwrap();
        assert_eq!(owner.owner.session_id(), Some(2));
        let owner = reg.owner_of(b"", &oid(&[1, 3, 6, 1, 2, 1, 1, 1, 0])).unwrap();
        assert_eq!(owner.owner.session_id(), Some(1));
        assert!(reg.owner_of(b"", &oid(&[1, 3, 6, 1, 2, 1, 2])).is_none());
        assert!(reg.owner_of(b"other", &oid(&[1, 3, 6, 1, 2, 1, 1, 1])).is_none());
    }

    #[test]
    fn test_duplicate_rejected() {
        let reg = Registry::new();
        reg.register(subtree_entry(&[1, 3, 6, 1, 4, 1, 8072], 1, 127))
            .unwrap();
        let err = reg
            .register(subtree_entry(&[1, 3, 6, 1, 4, 1, 8072], 2, 127))
            .unwrap_err();
        assert!(matches!(err, RegistrationError::Duplicate(_)));
        assert_eq!(err.status(), ErrorStatus::DuplicateRegistration);
        assert_eq!(reg.len(), 1);

        // Same region at another priority is not a duplicate.
        reg.register(subtree_entry(&[1, 3, 6, 1, 4, 1, 8072], 2, 100))
            .unwrap();
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_conflicts() {
        let reg = Registry::new();
        reg.register(subtree_entry(&[1, 3, 6, 1, 2, 1, 1, 3], 1, 1))
            .unwrap();

        // Foreign overlap with worse or equal precedence is refused.
        let err = reg
            .register(subtree_entry(&[1, 3, 6, 1, 2, 1, 1], 2, 127))
            .unwrap_err();
        assert!(matches!(err, RegistrationError::Conflict { priority: 1, .. }));
        assert!(reg
            .register(subtree_entry(&[1, 3, 6, 1, 2, 1, 1], 2, 1))
            .is_err());

        // Same-session overlap needs a distinct priority.
        assert!(reg
            .register(subtree_entry(&[1, 3, 6, 1, 2, 1, 1, 3, 0], 1, 1))
            .is_err());
        reg.register(subtree_entry(&[1, 3, 6, 1, 2, 1, 1, 3, 0], 1, 5))
            .unwrap();
    }

    #[test]
    fn test_overlapping_entries_have_distinct_priorities() {
        let reg = Registry::new();
        let attempts = [
            (&[1u32, 3, 6, 1, 2, 1][..], 1u32, 127u8),
            (&[1, 3, 6, 1, 2, 1, 1][..], 2, 50),
            (&[1, 3, 6, 1, 2, 1, 1][..], 3, 50),
            (&[1, 3, 6, 1, 2, 1, 1, 1][..], 1, 127),
            (&[1, 3, 6, 1, 2, 1, 1, 1][..], 4, 10),
            (&[1, 3, 6, 1, 2][..], 5, 200),
            (&[1, 3, 6, 1, 2, 1, 2][..], 1, 127),
        ];
        for (subs, session, priority) in attempts {
            let _ = reg.register(subtree_entry(subs, session, priority));
        }
        let entries = reg.entries(b"");
        for (i, a) in entries.iter().enumerate() {
            for b in &entries[i + 1..] {
                if a.region.overlaps(&b.region) {
                    assert_ne!(a.priority, b.priority, "{} / {}", a.region, b.region);
                }
            }
        }
    }

    #[test]
    fn test_unregister() {
        let reg = Registry::new();
        let entry = reg
            .register(subtree_entry(&[1, 3, 6, 1, 4, 1, 1], 1, 127))
            .unwrap();
        assert_eq!(
            reg.unregister(b"", &entry.region, 127, OwnerKey::Session(2)),
            Err(RegistrationError::NotFound)
        );
        assert_eq!(
            reg.unregister(b"", &entry.region, 100, OwnerKey::Session(1)),
            Err(RegistrationError::NotFound)
        );
        reg.unregister(b"", &entry.region, 127, OwnerKey::Session(1))
            .unwrap();
        assert!(reg.is_empty());
        assert_eq!(
            reg.unregister(b"", &entry.region, 127, OwnerKey::Session(1)),
            Err(RegistrationError::NotFound)
        );
    }

    #[test]
    fn test_bulk_removal() {
        let reg = Registry::new();
        reg.register(subtree_entry(&[1, 3, 6, 1, 4, 1, 1], 1, 127))
            .unwrap();
        reg.register(RegEntry::new(
            Region::subtree(oid(&[1, 3, 6, 1, 4, 1, 2])).unwrap(),
            remote(1),
            127,
            b"ctx".to_vec(),
            0,
        ))
        .unwrap();
        reg.register(subtree_entry(&[1, 3, 6, 1, 4, 1, 3], 2, 127))
            .unwrap();

        let removed = reg.remove_session(1);
        assert_eq!(removed.len(), 2);
        assert!(reg.owner_of(b"", &oid(&[1, 3, 6, 1, 4, 1, 1, 0])).is_none());
        assert!(reg.owner_of(b"ctx", &oid(&[1, 3, 6, 1, 4, 1, 2, 0])).is_none());
        assert!(reg.owner_of(b"", &oid(&[1, 3, 6, 1, 4, 1, 3, 0])).is_some());
        assert_eq!(reg.contexts(), vec![Vec::<u8>::new()]);

        assert_eq!(reg.remove_connection(102).len(), 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_affected_by() {
        let reg = Registry::new();
        reg.register(subtree_entry(&[1, 3, 6, 1, 4, 1, 1], 1, 127))
            .unwrap();
        reg.register(subtree_entry(&[1, 3, 6, 1, 4, 1, 2], 2, 127))
            .unwrap();
        let query = Region::subtree(oid(&[1, 3, 6, 1, 4, 1])).unwrap();
        assert_eq!(reg.affected_by(b"", &query).len(), 2);
        let query = Region::subtree(oid(&[1, 3, 6, 1, 4, 1, 2, 5])).unwrap();
        assert_eq!(reg.affected_by(b"", &query).len(), 1);
    }

    #[test]
    fn test_upper_session_boundary() {
        let reg = Registry::new();
        let first = reg
            .register(subtree_entry(&[1, 3, 6, 1, 4, 1, 1], 1, 127))
            .unwrap();
        reg.register(subtree_entry(&[1, 3, 6, 1, 4, 1, 2], 1, 127))
            .unwrap();
        reg.register(subtree_entry(&[1, 3, 6, 1, 4, 1, 3], 2, 127))
            .unwrap();
        let lone = reg
            .register(subtree_entry(&[1, 3, 6, 1, 4, 1, 5], 1, 127))
            .unwrap();

        assert_eq!(
            reg.upper_session_boundary(b"", &first),
            Some(oid(&[1, 3, 6, 1, 4, 1, 3]))
        );
        assert_eq!(
            reg.upper_session_boundary(b"", &lone),
            Some(oid(&[1, 3, 6, 1, 4, 1, 6]))
        );
    }

    #[test]
    fn test_route_next_walks_across_owners() {
        let reg = Registry::new();
        reg.register(subtree_entry(&[1, 3, 6, 1, 2, 1, 1], 1, 127))
            .unwrap();
        reg.register(subtree_entry(&[1, 3, 6, 1, 2, 1, 1, 3], 2, 1))
            .unwrap();
        reg.register(subtree_entry(&[1, 3, 6, 1, 2, 1, 4], 3, 127))
            .unwrap();

        // From before everything: session 1 up to where session 2 takes over.
        let route = reg.route_next(b"", &oid(&[1, 3, 6]), false).unwrap();
        assert_eq!(route.entry.owner.session_id(), Some(1));
        assert_eq!(route.start, oid(&[1, 3, 6, 1, 2, 1, 1]));
        assert!(route.include);
        assert_eq!(route.end, Some(oid(&[1, 3, 6, 1, 2, 1, 1, 3])));

        // Inside session 2's subtree.
        let route = reg
            .route_next(b"", &oid(&[1, 3, 6, 1, 2, 1, 1, 3, 0]), false)
            .unwrap();
        assert_eq!(route.entry.owner.session_id(), Some(2));
        assert_eq!(route.start, oid(&[1, 3, 6, 1, 2, 1, 1, 3, 0]));
        assert!(!route.include);
        assert_eq!(route.end, Some(oid(&[1, 3, 6, 1, 2, 1, 1, 4])));

        // Back to session 1 for the remainder of its subtree.
        let route = reg
            .route_next(b"", &oid(&[1, 3, 6, 1, 2, 1, 1, 4]), true)
            .unwrap();
        assert_eq!(route.entry.owner.session_id(), Some(1));
        assert_eq!(route.end, Some(oid(&[1, 3, 6, 1, 2, 1, 2])));

        // The gap is skipped.
        let route = reg
            .route_next(b"", &oid(&[1, 3, 6, 1, 2, 1, 2]), true)
            .unwrap();
        assert_eq!(route.entry.owner.session_id(), Some(3));
        assert_eq!(route.start, oid(&[1, 3, 6, 1, 2, 1, 4]));

        assert!(reg
            .route_next(b"", &oid(&[1, 3, 6, 1, 2, 1, 5]), true)
            .is_none());
    }

    #[test]
    fn test_route_next_non_trailing_range() {
        let reg = Registry::new();
        let row7 = Region::from_wire(oid(&[1, 3, 6, 1, 4, 1, 9, 1, 7]), 8, Some(3), false).unwrap();
        let row8 = Region::from_wire(oid(&[1, 3, 6, 1, 4, 1, 9, 1, 8]), 8, Some(3), false).unwrap();
        reg.register(RegEntry::new(row7, remote(1), 127, Vec::new(), 0))
            .unwrap();
        reg.register(RegEntry::new(row8, remote(2), 127, Vec::new(), 0))
            .unwrap();

        let route = reg
            .route_next(b"", &oid(&[1, 3, 6, 1, 4, 1, 9, 1, 7, 5]), false)
            .unwrap();
        assert_eq!(route.entry.owner.session_id(), Some(1));
        assert_eq!(route.end, Some(oid(&[1, 3, 6, 1, 4, 1, 9, 1, 8])));

        let route = reg
            .route_next(b"", &oid(&[1, 3, 6, 1, 4, 1, 9, 1, 8]), true)
            .unwrap();
        assert_eq!(route.entry.owner.session_id(), Some(2));
    }
}
