//! Per-frame records and the chains framed objects keep them in.
//!
//! A chain is a singly linked list of [`FrameRecord`]s, newest first. Each
//! record owns its successor; the head is owned by the [`RecordChain`]
//! embedded in the framed object. Records are never unlinked. Once no
//! frame can select a record any more it is recycled in place by the write
//! path (see [`used`]).

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::frame;
use crate::frame_id_set::{
    is_speculative, FrameId, FrameIdSet, CREATION_FRAME_ID, FRAME_ID_MAX, INVALID_FRAME_ID,
};
use crate::framed::ObjectId;

/// Payload capability every record type implements.
pub trait Record: Sized + Send + Sync + 'static {
    /// Copy the payload of `other` into `self`.
    fn assign(&mut self, other: &Self);

    /// Allocate a new record of the same kind, used when a chain has to grow.
    fn create(&self) -> Self;
}

/// A fresh payload equal to `source`.
pub(crate) fn copy_payload<R: Record>(source: &R) -> R {
    let mut copy = source.create();
    copy.assign(source);
    copy
}

/// Record holding a single cloneable value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValueRecord<T> {
    pub value: T,
}

impl<T> ValueRecord<T> {
    pub fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T: Clone + Send + Sync + 'static> Record for ValueRecord<T> {
    fn assign(&mut self, other: &Self) {
        self.value.clone_from(&other.value);
    }

    fn create(&self) -> Self {
        ValueRecord {
            value: self.value.clone(),
        }
    }
}

/// One version of a framed object's value.
pub struct FrameRecord<R> {
    frame_id: AtomicUsize,
    next: Option<Arc<FrameRecord<R>>>,
    value: RwLock<Arc<R>>,
}

impl<R> FrameRecord<R> {
    /// Create an unlinked record. It becomes part of a chain through
    /// [`RecordChain::prepend_frame_record`].
    pub fn new(frame_id: FrameId, value: R) -> Self {
        Self {
            frame_id: AtomicUsize::new(frame_id),
            next: None,
            value: RwLock::new(Arc::new(value)),
        }
    }

    #[inline]
    pub fn frame_id(&self) -> FrameId {
        self.frame_id.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_frame_id(&self, id: FrameId) {
        self.frame_id.store(id, Ordering::Release);
    }

    /// The next older record in the chain.
    #[inline]
    pub fn next(&self) -> Option<&Arc<FrameRecord<R>>> {
        self.next.as_ref()
    }

    /// The current payload.
    ///
    /// The lock is only held while the pointer is cloned, so callers may
    /// keep the payload across further reads and writes of the same object.
    pub fn read(&self) -> Arc<R> {
        Arc::clone(&self.value.read())
    }

    pub fn with<T>(&self, f: impl FnOnce(&R) -> T) -> T {
        f(&self.read())
    }

    /// Publish `value` as the payload.
    ///
    /// Only records returned by [`writable`](crate::writable) for the
    /// calling frame may be replaced; every other record is published and
    /// treated as immutable.
    pub fn replace(&self, value: R) {
        *self.value.write() = Arc::new(value);
    }

    /// Copy `source` into this record, in place when no reader still holds
    /// the old payload.
    pub(crate) fn assign_from(&self, source: &R)
    where
        R: Record,
    {
        let mut slot = self.value.write();
        match Arc::get_mut(&mut slot) {
            Some(value) => value.assign(source),
            None => *slot = Arc::new(copy_payload(source)),
        }
    }

    /// Number of records from this one to the end of the chain.
    pub fn chain_len(self: &Arc<Self>) -> usize {
        iter_chain(self).count()
    }
}

impl<R> Drop for FrameRecord<R> {
    fn drop(&mut self) {
        // Unlink iteratively so long histories don't recurse.
        let mut next = self.next.take();
        while let Some(record) = next {
            match Arc::try_unwrap(record) {
                Ok(mut record) => next = record.next.take(),
                Err(_) => break,
            }
        }
    }
}

impl<R> fmt::Debug for FrameRecord<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameRecord")
            .field("frame_id", &self.frame_id())
            .field("has_next", &self.next.is_some())
            .finish()
    }
}

/// Iterator over a chain, newest record first.
pub struct ChainIter<'a, R> {
    cursor: Option<&'a Arc<FrameRecord<R>>>,
}

impl<'a, R> Iterator for ChainIter<'a, R> {
    type Item = &'a Arc<FrameRecord<R>>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.cursor?;
        self.cursor = record.next.as_ref();
        Some(record)
    }
}

pub fn iter_chain<R>(head: &Arc<FrameRecord<R>>) -> ChainIter<'_, R> {
    ChainIter { cursor: Some(head) }
}

/// Record chain storage embedded in every framed object.
///
/// Holds the object's identity, the chain head and the per-object writer
/// lock that serialises record reuse and creation. Readers only take the
/// head lock long enough to clone the head pointer.
pub struct RecordChain<R> {
    id: ObjectId,
    head: RwLock<Arc<FrameRecord<R>>>,
    writer: Mutex<()>,
}

impl<R: Record> RecordChain<R> {
    /// Create a chain holding `value`.
    ///
    /// Inside a frame the first record carries that frame's id, so the
    /// object stays invisible to other frames until the frame commits.
    /// Outside of any frame it is stamped [`CREATION_FRAME_ID`].
    pub fn new(value: R) -> Self {
        let frame_id = frame::current_frame_id().unwrap_or(CREATION_FRAME_ID);
        Self::with_frame_id(frame_id, value)
    }

    pub(crate) fn with_frame_id(frame_id: FrameId, value: R) -> Self {
        Self {
            id: ObjectId::next(),
            head: RwLock::new(Arc::new(FrameRecord::new(frame_id, value))),
            writer: Mutex::new(()),
        }
    }
}

impl<R> RecordChain<R> {
    #[inline]
    pub fn object_id(&self) -> ObjectId {
        self.id
    }

    /// Head of the chain.
    pub fn first_frame_record(&self) -> Arc<FrameRecord<R>> {
        Arc::clone(&self.head.read())
    }

    /// Link `record` in front of the current head and publish it.
    pub fn prepend_frame_record(&self, mut record: FrameRecord<R>) -> Arc<FrameRecord<R>> {
        let mut head = self.head.write();
        record.next = Some(Arc::clone(&head));
        let record = Arc::new(record);
        *head = Arc::clone(&record);
        record
    }

    pub fn len(&self) -> usize {
        self.first_frame_record().chain_len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Frame ids of every record, newest first.
    pub fn frame_ids(&self) -> Vec<FrameId> {
        let head = self.first_frame_record();
        iter_chain(&head).map(|record| record.frame_id()).collect()
    }

    pub(crate) fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock()
    }
}

impl<R> fmt::Debug for RecordChain<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordChain")
            .field("id", &self.id)
            .field("frame_ids", &self.frame_ids())
            .finish()
    }
}

/// Whether a record written by `candidate` may be observed by frame `current`.
#[inline]
pub(crate) fn valid(current: FrameId, candidate: FrameId, invalid: &FrameIdSet) -> bool {
    candidate != INVALID_FRAME_ID
        && candidate <= current
        && (candidate == current || !is_speculative(candidate))
        && !invalid.get(candidate)
}

/// The record with the highest id valid for frame `id`, if any.
pub fn readable_record<R>(
    head: &Arc<FrameRecord<R>>,
    id: FrameId,
    invalid: &FrameIdSet,
) -> Option<Arc<FrameRecord<R>>> {
    let mut best: Option<&Arc<FrameRecord<R>>> = None;
    let mut best_id = INVALID_FRAME_ID;

    for record in iter_chain(head) {
        let candidate = record.frame_id();
        if valid(id, candidate, invalid) && (best.is_none() || best_id < candidate) {
            best = Some(record);
            best_id = candidate;
        }
    }

    best.cloned()
}

/// What the write path needs to know about the directory to recycle
/// records, captured under the directory lock and used without it.
#[derive(Debug, Clone)]
pub struct ReuseHorizon {
    /// Records at or below this id that are obscured by a newer record at or
    /// below it can't be selected by any open or future frame.
    pub(crate) limit: FrameId,
    pub(crate) open: FrameIdSet,
    pub(crate) aborted: FrameIdSet,
    pub(crate) enabled: bool,
}

/// Find a record of the chain that no open or future frame can select.
///
/// Records of aborted frames, and of closed speculative frames other than
/// `current`, are reusable straight away. Otherwise, when two records are
/// both valid at the horizon limit the newer one obscures the older one,
/// which is returned.
pub(crate) fn used<R>(
    head: &Arc<FrameRecord<R>>,
    current: FrameId,
    horizon: &ReuseHorizon,
) -> Option<Arc<FrameRecord<R>>> {
    if !horizon.enabled {
        return None;
    }

    let mut valid_record: Option<&Arc<FrameRecord<R>>> = None;

    for record in iter_chain(head) {
        let id = record.frame_id();
        if id == INVALID_FRAME_ID {
            return Some(Arc::clone(record));
        }
        if id == FRAME_ID_MAX {
            continue;
        }
        if horizon.aborted.get(id)
            || (is_speculative(id) && id != current && !horizon.open.get(id))
        {
            return Some(Arc::clone(record));
        }
        if valid(horizon.limit, id, &horizon.aborted) {
            match valid_record {
                None => valid_record = Some(record),
                Some(existing) => {
                    let older = if id < existing.frame_id() {
                        record
                    } else {
                        existing
                    };
                    return Some(Arc::clone(older));
                }
            }
        }
    }

    None
}

/// Produce a record for `current` to write into, stamped [`FRAME_ID_MAX`]
/// so no reader selects it before its payload is in place.
///
/// Reuses a record when [`used`] finds one, otherwise creates one from
/// `template` and prepends it. The caller must hold the chain's writer
/// lock, copy the payload and stamp the real frame id.
pub(crate) fn new_overwritable_record<R: Record>(
    chain: &RecordChain<R>,
    template: &FrameRecord<R>,
    current: FrameId,
    horizon: &ReuseHorizon,
) -> Arc<FrameRecord<R>> {
    let head = chain.first_frame_record();
    if let Some(reusable) = used(&head, current, horizon) {
        log::debug!(
            "frame {current} reuses record of frame {} on object {:?}",
            reusable.frame_id(),
            chain.object_id()
        );
        reusable.set_frame_id(FRAME_ID_MAX);
        return reusable;
    }

    let created = template.with(|value| value.create());
    chain.prepend_frame_record(FrameRecord::new(FRAME_ID_MAX, created))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_of(ids: &[FrameId]) -> Arc<FrameRecord<ValueRecord<i32>>> {
        let chain = RecordChain::with_frame_id(ids[ids.len() - 1], ValueRecord::new(0));
        for &id in ids.iter().rev().skip(1) {
            chain.prepend_frame_record(FrameRecord::new(id, ValueRecord::new(id as i32)));
        }
        chain.first_frame_record()
    }

    fn horizon(limit: FrameId) -> ReuseHorizon {
        ReuseHorizon {
            limit,
            open: FrameIdSet::new(),
            aborted: FrameIdSet::new(),
            enabled: true,
        }
    }

    #[test]
    fn readable_picks_highest_valid_record() {
        let head = chain_of(&[10, 6, CREATION_FRAME_ID]);
        let none = FrameIdSet::new();

        assert_eq!(readable_record(&head, 10, &none).unwrap().frame_id(), 10);
        assert_eq!(readable_record(&head, 8, &none).unwrap().frame_id(), 6);
        assert_eq!(
            readable_record(&head, 4, &none).unwrap().frame_id(),
            CREATION_FRAME_ID
        );
    }

    #[test]
    fn readable_skips_invalid_ids() {
        let head = chain_of(&[10, 6, CREATION_FRAME_ID]);
        let invalid: FrameIdSet = [6, 10].into_iter().collect();

        assert_eq!(
            readable_record(&head, 12, &invalid).unwrap().frame_id(),
            CREATION_FRAME_ID
        );
    }

    #[test]
    fn readable_hides_other_speculative_frames() {
        let head = chain_of(&[7, 4]);
        let none = FrameIdSet::new();

        assert_eq!(readable_record(&head, 8, &none).unwrap().frame_id(), 4);
        assert_eq!(readable_record(&head, 7, &none).unwrap().frame_id(), 7);
    }

    #[test]
    fn readable_ignores_placeholders_and_sentinels() {
        let head = chain_of(&[FRAME_ID_MAX, INVALID_FRAME_ID]);
        assert!(readable_record(&head, 100, &FrameIdSet::new()).is_none());
    }

    #[test]
    fn used_returns_aborted_record() {
        let head = chain_of(&[8, 6, CREATION_FRAME_ID]);
        let mut horizon = horizon(9);
        horizon.aborted = FrameIdSet::new().set(6);

        assert_eq!(used(&head, 10, &horizon).unwrap().frame_id(), 6);
    }

    #[test]
    fn used_returns_oldest_obscured_record() {
        let head = chain_of(&[20, 8, 4]);
        assert_eq!(used(&head, 22, &horizon(9)).unwrap().frame_id(), 4);
    }

    #[test]
    fn used_keeps_single_visible_record() {
        let head = chain_of(&[20, 8]);
        assert!(used(&head, 22, &horizon(9)).is_none());
    }

    #[test]
    fn used_leaves_open_speculative_records_alone() {
        let head = chain_of(&[9, 4]);
        let mut open_speculative = horizon(3);
        open_speculative.open = FrameIdSet::new().set(9);
        assert!(used(&head, 10, &open_speculative).is_none());

        assert_eq!(used(&head, 10, &horizon(3)).unwrap().frame_id(), 9);
        assert!(used(&head, 9, &horizon(3)).is_none());
    }

    #[test]
    fn used_is_disabled_by_config() {
        let head = chain_of(&[20, 8, 4]);
        let mut disabled = horizon(21);
        disabled.enabled = false;
        assert!(used(&head, 22, &disabled).is_none());
    }

    #[test]
    fn new_overwritable_record_prepends_when_nothing_is_reusable() {
        let chain = RecordChain::with_frame_id(CREATION_FRAME_ID, ValueRecord::new(5));
        let template = chain.first_frame_record();

        let record = new_overwritable_record(&chain, &template, 4, &horizon(3));

        assert_eq!(record.frame_id(), FRAME_ID_MAX);
        assert!(Arc::ptr_eq(&record, &chain.first_frame_record()));
        assert_eq!(record.read().value, 5);
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn new_overwritable_record_recycles_obscured_record() {
        let chain = RecordChain::with_frame_id(CREATION_FRAME_ID, ValueRecord::new(1));
        chain.prepend_frame_record(FrameRecord::new(4, ValueRecord::new(2)));
        let template = chain.first_frame_record();

        let record = new_overwritable_record(&chain, &template, 6, &horizon(5));

        assert_eq!(record.frame_id(), FRAME_ID_MAX);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.frame_ids(), vec![4, FRAME_ID_MAX]);
    }

    #[test]
    fn long_chains_drop_without_recursing() {
        let chain = RecordChain::with_frame_id(CREATION_FRAME_ID, ValueRecord::new(0u8));
        for id in 0..200_000 {
            chain.prepend_frame_record(FrameRecord::new(id * 2 + 4, ValueRecord::new(0u8)));
        }
        drop(chain);
    }
}
