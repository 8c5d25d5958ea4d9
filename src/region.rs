//! Registered MIB regions.
//!
//! A region is an OID subtree, optionally with one sub-identifier widened to
//! a closed interval (RFC 2741 §6.2.3 `range_subid`/`upper_bound`), or a
//! single fully-qualified instance. Each region is treated as a pattern: one
//! interval per position of `lower`; an OID matches when it is at least as
//! long as the pattern (exactly as long for instances) and every leading
//! component falls in its interval.

use std::cmp::Ordering;

use serde::Serialize;

use crate::oid::{Oid, MAX_SUBIDS};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegionError {
    #[error("cannot register the null OID")]
    NullSubtree,
    #[error("subtree has {0} sub-identifiers (max 128)")]
    TooLong(usize),
    #[error("range sub-identifier {range_subid} outside subtree of length {len}")]
    RangeOutOfBounds { range_subid: u8, len: usize },
    #[error("empty range: lower bound {lower} exceeds upper bound {upper}")]
    Empty { lower: u32, upper: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Region {
    lower: Oid,
    upper: Oid,
    /// 1-based position of the ranged sub-identifier.
    range_subid: Option<u8>,
    single_instance: bool,
}

impl Region {
    /// A plain subtree registration.
    pub fn subtree(oid: Oid) -> Result<Region, RegionError> {
        Region::from_wire(oid, 0, None, false)
    }

    /// A registration of exactly one instance.
    pub fn instance(oid: Oid) -> Result<Region, RegionError> {
        Region::from_wire(oid, 0, None, true)
    }

    /// Builds a region from the fields of a Register/Unregister PDU.
    pub fn from_wire(
        subtree: Oid,
        range_subid: u8,
        upper_bound: Option<u32>,
        single_instance: bool,
    ) -> Result<Region, RegionError> {
        if subtree.is_empty() {
            return Err(RegionError::NullSubtree);
        }
        if subtree.len() > MAX_SUBIDS {
            return Err(RegionError::TooLong(subtree.len()));
        }
        if range_subid == 0 {
            return Ok(Region {
                upper: subtree.clone(),
                lower: subtree,
                range_subid: None,
                single_instance,
            });
        }

        let pos = range_subid as usize;
        if pos > subtree.len() {
            return Err(RegionError::RangeOutOfBounds {
                range_subid,
                len: subtree.len(),
            });
        }
        let lower_value = subtree.0[pos - 1];
        let upper_value = upper_bound.unwrap_or(lower_value);
        if lower_value > upper_value {
            return Err(RegionError::Empty {
                lower: lower_value,
                upper: upper_value,
            });
        }

        let mut upper = subtree.clone();
        upper.0[pos - 1] = upper_value;
        Ok(Region {
            lower: subtree,
            upper,
            range_subid: Some(range_subid),
            single_instance,
        })
    }

    pub fn lower(&self) -> &Oid {
        &self.lower
    }

    pub fn upper(&self) -> &Oid {
        &self.upper
    }

    pub fn range_subid(&self) -> Option<u8> {
        self.range_subid
    }

    /// Upper bound of the ranged sub-identifier, as carried on the wire.
    pub fn upper_bound(&self) -> Option<u32> {
        self.range_subid
            .map(|pos| self.upper.0[pos as usize - 1])
    }

    pub fn is_single_instance(&self) -> bool {
        self.single_instance
    }

    /// Pattern length; longer regions are more specific.
    pub fn specificity(&self) -> usize {
        self.lower.len()
    }

    fn bounds(&self, i: usize) -> (u32, u32) {
        (self.lower.0[i], self.upper.0[i])
    }

    /// Returns true if `oid` falls inside the region.
    pub fn contains(&self, oid: &Oid) -> bool {
        let len = self.lower.len();
        if oid.len() < len || (self.single_instance && oid.len() != len) {
            return false;
        }
        (0..len).all(|i| {
            let (lo, hi) = self.bounds(i);
            (lo..=hi).contains(&oid.0[i])
        })
    }

    /// Returns true if some OID lies in both regions.
    pub fn overlaps(&self, other: &Region) -> bool {
        let (len_a, len_b) = (self.lower.len(), other.lower.len());
        if self.single_instance && len_b > len_a {
            return false;
        }
        if other.single_instance && len_a > len_b {
            return false;
        }
        (0..len_a.min(len_b)).all(|i| {
            let (a_lo, a_hi) = self.bounds(i);
            let (b_lo, b_hi) = other.bounds(i);
            a_lo <= b_hi && b_lo <= a_hi
        })
    }

    /// Returns true if every OID in `other` is also in `self`.
    pub fn covers(&self, other: &Region) -> bool {
        let (len_a, len_b) = (self.lower.len(), other.lower.len());
        if len_a > len_b {
            return false;
        }
        if self.single_instance && !(other.single_instance && len_a == len_b) {
            return false;
        }
        (0..len_a).all(|i| {
            let (a_lo, a_hi) = self.bounds(i);
            let (b_lo, b_hi) = other.bounds(i);
            a_lo <= b_lo && b_hi <= a_hi
        })
    }

    /// Exclusive end of the region's span `[lower, end)`. `None` means the
    /// span runs to the end of the OID space.
    pub fn span_end(&self) -> Option<Oid> {
        if self.single_instance {
            Some(self.upper.child(0))
        } else {
            self.upper.next_sibling()
        }
    }

    /// Returns true if `oid` lies within `[lower, span_end)`.
    pub fn span_contains(&self, oid: &Oid) -> bool {
        *oid >= self.lower && end_after(self.span_end().as_ref(), oid)
    }
}

/// Returns true if `oid` is strictly below the exclusive bound `end`
/// (`None` = unbounded).
pub(crate) fn end_after(end: Option<&Oid>, oid: &Oid) -> bool {
    end.map_or(true, |e| oid < e)
}

/// Orders exclusive span ends, with `None` (unbounded) last.
pub(crate) fn cmp_end(a: Option<&Oid>, b: Option<&Oid>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) => x.cmp(y),
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.range_subid {
            Some(pos) => write!(
                f,
                "{} [{}..={} @ {}]",
                self.lower,
                self.lower.0[pos as usize - 1],
                self.upper.0[pos as usize - 1],
                pos
            )?,
            None => write!(f, "{}", self.lower)?,
        }
        if self.single_instance {
            write!(f, " (instance)")?;
        }
        Ok(())
    }
}
