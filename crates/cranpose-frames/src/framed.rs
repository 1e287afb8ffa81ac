//! The framed object capability and the modified-object sets frames collect.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::collections::map::HashMap;
use crate::frame_id_set::{FrameId, FrameIdSet};
use crate::record::{readable_record, FrameRecord, Record, RecordChain};

static NEXT_OBJECT_ID: AtomicUsize = AtomicUsize::new(1);

/// Process-unique identity of a framed object.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, PartialOrd, Ord)]
pub struct ObjectId(usize);

impl ObjectId {
    pub(crate) fn next() -> Self {
        Self(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn as_usize(self) -> usize {
        self.0
    }
}

/// Identity of a record within a chain, used to compare what two frames see.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub struct RecordKey(usize);

impl RecordKey {
    fn of<R>(record: &Arc<FrameRecord<R>>) -> Self {
        Self(Arc::as_ptr(record) as *const () as usize)
    }
}

/// A mutable value taking part in the frame system.
///
/// Implementors embed a [`RecordChain`] and expose it; everything else
/// (visibility, copy-on-write, collision checks) is provided.
pub trait Framed: Send + Sync + 'static {
    type Record: Record;

    fn records(&self) -> &RecordChain<Self::Record>;

    fn first_frame_record(&self) -> Arc<FrameRecord<Self::Record>> {
        self.records().first_frame_record()
    }

    fn prepend_frame_record(
        &self,
        record: FrameRecord<Self::Record>,
    ) -> Arc<FrameRecord<Self::Record>> {
        self.records().prepend_frame_record(record)
    }
}

/// Type-erased view of a [`Framed`] object, as handed to observers and
/// stored in modified sets.
pub trait FramedObject: Any + Send + Sync {
    fn object_id(&self) -> ObjectId;

    /// Length of the record chain.
    fn record_count(&self) -> usize;

    /// Identity of the record frame `id` would read given `invalid`.
    fn readable_record_key(&self, id: FrameId, invalid: &FrameIdSet) -> Option<RecordKey>;

    fn as_any(&self) -> &dyn Any;
}

impl<F: Framed> FramedObject for F {
    fn object_id(&self) -> ObjectId {
        self.records().object_id()
    }

    fn record_count(&self) -> usize {
        self.records().len()
    }

    fn readable_record_key(&self, id: FrameId, invalid: &FrameIdSet) -> Option<RecordKey> {
        let head = self.first_frame_record();
        readable_record(&head, id, invalid).map(|record| RecordKey::of(&record))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Framed objects written (or created) by a frame.
#[derive(Clone, Default)]
pub struct ModifiedSet {
    objects: HashMap<ObjectId, Arc<dyn FramedObject>>,
}

impl ModifiedSet {
    /// Returns `true` if the object was not yet in the set.
    pub(crate) fn insert(&mut self, object: Arc<dyn FramedObject>) -> bool {
        self.objects.insert(object.object_id(), object).is_none()
    }

    pub fn contains<O: FramedObject + ?Sized>(&self, object: &O) -> bool {
        self.objects.contains_key(&object.object_id())
    }

    pub fn contains_id(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn FramedObject>> + '_ {
        self.objects.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.objects.keys().copied()
    }
}

impl fmt::Debug for ModifiedSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.objects.keys()).finish()
    }
}
