//! Frame identifiers and the immutable id sets frames carry around.
//!
//! Normal frames receive even ids and speculative frames odd ones, so the
//! parity of an id is enough to tell whether a record was written by a
//! speculative frame.

use std::fmt;
use std::sync::Arc;

/// Identifier of a frame. Monotonically increasing for the lifetime of a
/// [`FrameDirectory`](crate::FrameDirectory).
pub type FrameId = usize;

/// Placeholder id of a record that was never initialised. Never valid.
pub const INVALID_FRAME_ID: FrameId = 0;

/// Id stamped on records built outside of any frame. Visible to every frame.
pub const CREATION_FRAME_ID: FrameId = 2;

/// Sentinel stamped on a record while its payload is being initialised so
/// that no frame can select it.
pub const FRAME_ID_MAX: FrameId = usize::MAX;

/// Returns `true` if `id` belongs to a speculative frame.
#[inline]
pub fn is_speculative(id: FrameId) -> bool {
    id & 1 == 1 && id != FRAME_ID_MAX
}

const WORD_BITS: usize = 64;

/// An immutable set of frame ids.
///
/// Every mutating operation returns a new set, so a clone captured by a
/// frame when it opened keeps describing exactly that moment.
///
/// Recent ids live in two bit words covering `[base, base + 128)`. Ids
/// older than `base` sit in a sorted slice shared between clones, which is
/// only copied when the window slides over set bits or an old id changes.
/// Open frames are recent and the aborted ids only accumulate below the
/// window, so opening, closing and aborting frames stays cheap however many
/// aborts a directory has seen.
#[derive(Clone)]
pub struct FrameIdSet {
    lower: u64,
    upper: u64,
    base: FrameId,
    // Sorted, deduplicated, every id below `base`.
    below: Option<Arc<[FrameId]>>,
}

impl FrameIdSet {
    /// Create an empty set.
    pub const fn new() -> Self {
        Self {
            lower: 0,
            upper: 0,
            base: 0,
            below: None,
        }
    }

    fn below(&self) -> &[FrameId] {
        self.below.as_deref().unwrap_or(&[])
    }

    fn with_words(&self, lower: u64, upper: u64) -> FrameIdSet {
        FrameIdSet {
            lower,
            upper,
            base: self.base,
            below: self.below.clone(),
        }
    }

    fn with_below(&self, below: Vec<FrameId>) -> FrameIdSet {
        FrameIdSet {
            lower: self.lower,
            upper: self.upper,
            base: self.base,
            below: (!below.is_empty()).then(|| below.into()),
        }
    }

    /// Returns `true` if `id` is a member.
    #[inline]
    pub fn get(&self, id: FrameId) -> bool {
        if id < self.base {
            return self.below().binary_search(&id).is_ok();
        }
        match id - self.base {
            offset if offset < WORD_BITS => self.lower & (1 << offset) != 0,
            offset if offset < 2 * WORD_BITS => self.upper & (1 << (offset - WORD_BITS)) != 0,
            _ => false,
        }
    }

    /// Returns a set that also contains `id`.
    pub fn set(&self, id: FrameId) -> FrameIdSet {
        if self.get(id) {
            return self.clone();
        }
        if id < self.base {
            let below = self.below();
            let pos = below.partition_point(|&member| member < id);
            let mut ids = Vec::with_capacity(below.len() + 1);
            ids.extend_from_slice(&below[..pos]);
            ids.push(id);
            ids.extend_from_slice(&below[pos..]);
            return self.with_below(ids);
        }
        match id - self.base {
            offset if offset < WORD_BITS => self.with_words(self.lower | 1 << offset, self.upper),
            offset if offset < 2 * WORD_BITS => {
                self.with_words(self.lower, self.upper | 1 << (offset - WORD_BITS))
            }
            _ => self.slide_to(id).set(id),
        }
    }

    /// Move the window up until `id` falls into the upper word, spilling
    /// set bits that drop out of it into the sorted slice.
    fn slide_to(&self, id: FrameId) -> FrameIdSet {
        let target = (id / WORD_BITS).saturating_sub(1) * WORD_BITS;
        let mut spilled: Vec<FrameId> = Vec::new();
        let (mut lower, mut upper, mut base) = (self.lower, self.upper, self.base);
        while base < target {
            let mut word = lower;
            while word != 0 {
                spilled.push(base + word.trailing_zeros() as usize);
                word &= word - 1;
            }
            if upper == 0 {
                lower = 0;
                base = target;
                break;
            }
            lower = upper;
            upper = 0;
            base += WORD_BITS;
        }

        let below = if spilled.is_empty() {
            self.below.clone()
        } else {
            let mut ids = self.below().to_vec();
            ids.extend(spilled);
            Some(ids.into())
        };
        FrameIdSet {
            lower,
            upper,
            base,
            below,
        }
    }

    /// Returns a set without `id`.
    pub fn clear(&self, id: FrameId) -> FrameIdSet {
        if !self.get(id) {
            return self.clone();
        }
        if id < self.base {
            let below = self.below();
            let ids = below.iter().copied().filter(|&member| member != id).collect();
            return self.with_below(ids);
        }
        match id - self.base {
            offset if offset < WORD_BITS => self.with_words(self.lower & !(1 << offset), self.upper),
            offset => self.with_words(self.lower, self.upper & !(1 << (offset - WORD_BITS))),
        }
    }

    /// Union of `self` and `other`.
    pub fn or(&self, other: &FrameIdSet) -> FrameIdSet {
        if other.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }
        if self.base == other.base && self.below() == other.below() {
            return self.with_words(self.lower | other.lower, self.upper | other.upper);
        }
        other.iter().fold(self.clone(), |set, id| set.set(id))
    }

    /// The lowest member, or `default` if the set is empty or every member
    /// is above it.
    pub fn lowest(&self, default: FrameId) -> FrameId {
        match self.iter().next() {
            Some(lowest) if lowest < default => lowest,
            _ => default,
        }
    }

    pub fn len(&self) -> usize {
        self.below().len() + (self.lower.count_ones() + self.upper.count_ones()) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.lower == 0 && self.upper == 0 && self.below.is_none()
    }

    /// Iterate members in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = FrameId> + '_ {
        let window = [(self.lower, self.base), (self.upper, self.base + WORD_BITS)]
            .into_iter()
            .flat_map(|(word, start)| Bits(word).map(move |offset| start + offset));
        self.below().iter().copied().chain(window)
    }
}

/// Offsets of the set bits of a word, lowest first.
struct Bits(u64);

impl Iterator for Bits {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.0 == 0 {
            return None;
        }
        let offset = self.0.trailing_zeros() as usize;
        self.0 &= self.0 - 1;
        Some(offset)
    }
}

impl Default for FrameIdSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for FrameIdSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().eq(other.iter())
    }
}

impl Eq for FrameIdSet {}

impl fmt::Debug for FrameIdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<FrameId> for FrameIdSet {
    fn from_iter<I: IntoIterator<Item = FrameId>>(iter: I) -> Self {
        iter.into_iter().fold(FrameIdSet::new(), |set, id| set.set(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_clear_leave_the_original_untouched() {
        let empty = FrameIdSet::new();
        let one = empty.set(4);
        let two = one.set(8);

        assert!(!empty.get(4));
        assert!(one.get(4));
        assert!(!one.get(8));
        assert!(two.get(4) && two.get(8));

        let cleared = two.clear(4);
        assert!(!cleared.get(4));
        assert!(two.get(4), "clear must not touch the source set");
    }

    #[test]
    fn set_is_idempotent() {
        let set = FrameIdSet::new().set(6).set(6).set(6);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn or_merges_without_duplicates() {
        let a: FrameIdSet = [2, 6, 10].into_iter().collect();
        let b: FrameIdSet = [4, 6, 12].into_iter().collect();

        let union = a.or(&b);
        assert_eq!(union.iter().collect::<Vec<_>>(), vec![2, 4, 6, 10, 12]);
        assert_eq!(a.or(&FrameIdSet::new()), a);
        assert_eq!(FrameIdSet::new().or(&b), b);
    }

    #[test]
    fn lowest_falls_back_to_default() {
        let set: FrameIdSet = [8, 12].into_iter().collect();
        assert_eq!(set.lowest(20), 8);
        assert_eq!(set.lowest(6), 6);
        assert_eq!(FrameIdSet::new().lowest(14), 14);
    }

    #[test]
    fn window_slides_over_old_members() {
        let set: FrameIdSet = [2, 4, 70, 130].into_iter().collect();
        let slid = set.set(1_000).set(1_002);

        assert_eq!(slid.iter().collect::<Vec<_>>(), vec![2, 4, 70, 130, 1_000, 1_002]);
        assert_eq!(slid.len(), 6);
        assert!(slid.get(70) && slid.get(1_000) && !slid.get(72));
        assert_eq!(slid.lowest(FRAME_ID_MAX), 2);

        let cleared = slid.clear(4).clear(1_000);
        assert_eq!(cleared.iter().collect::<Vec<_>>(), vec![2, 70, 130, 1_002]);
        assert_eq!(cleared, [1_002, 130, 70, 2].into_iter().collect::<FrameIdSet>());
        assert!(set.get(4), "sliding must not touch the source set");
    }

    #[test]
    fn many_aborted_ids_keep_recent_sets_small() {
        let aborted: FrameIdSet = (1..=500).map(|n| n * 2).collect();
        assert_eq!(aborted.len(), 500);

        let with_open = aborted.set(1_002).set(1_004).clear(1_002);
        assert!(with_open.get(1_004) && !with_open.get(1_002));
        assert!(with_open.get(2) && with_open.get(1_000));
        assert_eq!(with_open.len(), 501);
        assert_eq!(with_open.clear(1_004), aborted);
    }

    #[test]
    fn parity_marks_speculative_ids() {
        assert!(!is_speculative(CREATION_FRAME_ID));
        assert!(!is_speculative(4));
        assert!(is_speculative(5));
        assert!(!is_speculative(FRAME_ID_MAX));
    }
}
