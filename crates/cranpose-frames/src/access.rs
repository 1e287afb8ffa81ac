//! Reading and writing framed objects within a frame.

use std::sync::Arc;

use crate::error::{FrameError, Result};
use crate::frame::{self, Frame};
use crate::frame_id_set::{FrameId, FrameIdSet};
use crate::framed::{Framed, FramedObject};
use crate::record::{copy_payload, new_overwritable_record, readable_record, FrameRecord};

fn readable_in<F: Framed>(
    framed: &F,
    id: FrameId,
    invalid: &FrameIdSet,
) -> Arc<FrameRecord<F::Record>> {
    let head = framed.first_frame_record();
    match readable_record(&head, id, invalid) {
        Some(record) => record,
        None => panic!(
            "no record of {:?} is readable in frame {id}: created after the frame was \
             opened, or by a frame that has not committed (invalid={invalid:?}, chain={:?})",
            framed.records().object_id(),
            framed.records().frame_ids()
        ),
    }
}

/// The record of `framed` visible to `frame`, after notifying the frame's
/// read observers.
///
/// # Panics
///
/// If no record is visible, which means the object was created by a frame
/// `frame` can't see.
pub fn readable<F: Framed>(framed: &F, frame: &Frame) -> Arc<FrameRecord<F::Record>> {
    frame.notify_read(framed);
    readable_in(framed, frame.id(), frame.invalid())
}

/// Run `f` against the payload `frame` sees.
///
/// No lock is held while `f` runs, so it may read or write any framed
/// object, including `framed` itself.
pub fn read<F: Framed, T>(framed: &F, frame: &Frame, f: impl FnOnce(&F::Record) -> T) -> T {
    let value = readable(framed, frame).read();
    f(&value)
}

/// The record `frame` may write for `framed`.
///
/// The first write in a frame copies the visible record into a record owned
/// by the frame (recycling one no frame can select any more when possible)
/// and adds the object to the frame's modified set. Later writes return the
/// same record.
pub fn writable<F: Framed>(framed: &Arc<F>, frame: &Frame) -> Result<Arc<FrameRecord<F::Record>>> {
    if frame.is_read_only() {
        return Err(FrameError::ReadOnly(frame.id()));
    }

    let id = frame.id();
    let readable = readable_in(&**framed, id, frame.invalid());
    if readable.frame_id() == id {
        return Ok(readable);
    }

    frame.notify_write(&**framed);
    let horizon = frame.directory().reuse_horizon(frame);

    let record = {
        let records = framed.records();
        let _writer = records.lock_writer();
        let readable = readable_in(&**framed, id, frame.invalid());
        if readable.frame_id() == id {
            readable
        } else {
            let record = new_overwritable_record(records, &readable, id, &horizon);
            record.assign_from(&readable.read());
            record.set_frame_id(id);
            record
        }
    };

    let object: Arc<dyn FramedObject> = framed.clone();
    frame.record_modified(object);
    Ok(record)
}

/// Run `f` against the payload `frame` writes.
///
/// `f` edits a copy that replaces the frame's payload once it returns, so it
/// may read `framed` (and sees the value from before this write). Writes to
/// `framed` made inside `f` are overwritten by the copy.
pub fn write<F: Framed, T>(
    framed: &Arc<F>,
    frame: &Frame,
    f: impl FnOnce(&mut F::Record) -> T,
) -> Result<T> {
    let record = writable(framed, frame)?;
    let mut value = copy_payload(&*record.read());
    let result = f(&mut value);
    record.replace(value);
    Ok(result)
}

/// Register a freshly constructed object with the writable frame bound to
/// the calling thread, so the commit publishes it.
///
/// Framed types call this from their constructors. Outside a frame, or in
/// a read-only one, nothing is tracked.
pub fn created<F: Framed>(framed: &Arc<F>) {
    if let Ok(frame) = frame::current_frame() {
        if !frame.is_read_only() {
            let object: Arc<dyn FramedObject> = framed.clone();
            frame.record_modified(object);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::FrameDirectory;
    use crate::frame::{suspend, WriteObserver};
    use crate::frame_id_set::CREATION_FRAME_ID;
    use crate::record::{RecordChain, ValueRecord};
    use parking_lot::Mutex;

    struct Cell {
        records: RecordChain<ValueRecord<i64>>,
    }

    impl Framed for Cell {
        type Record = ValueRecord<i64>;

        fn records(&self) -> &RecordChain<Self::Record> {
            &self.records
        }
    }

    fn cell(value: i64) -> Arc<Cell> {
        let cell = Arc::new(Cell {
            records: RecordChain::new(ValueRecord::new(value)),
        });
        created(&cell);
        cell
    }

    fn get(cell: &Cell, frame: &Frame) -> i64 {
        read(cell, frame, |record| record.value)
    }

    fn set(cell: &Arc<Cell>, frame: &Frame, value: i64) {
        write(cell, frame, |record| record.value = value).unwrap();
    }

    #[test]
    fn created_outside_frames_use_the_creation_id() {
        let cell = cell(1);
        assert_eq!(cell.records().frame_ids(), vec![CREATION_FRAME_ID]);
    }

    #[test]
    fn first_write_copies_later_writes_reuse() {
        let directory = FrameDirectory::new();
        let cell = cell(1);
        let frame = directory.open(false).unwrap();

        let first = writable(&cell, &frame).unwrap();
        assert_eq!(first.frame_id(), frame.id());
        assert_eq!(first.read().value, 1);
        let second = writable(&cell, &frame).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(frame.was_modified(&*cell));

        frame.commit().unwrap();
    }

    #[test]
    fn read_only_frames_reject_writes() {
        let directory = FrameDirectory::new();
        let cell = cell(1);
        let frame = directory.open(true).unwrap();

        assert!(matches!(writable(&cell, &frame), Err(FrameError::ReadOnly(id)) if id == frame.id()));
        assert_eq!(get(&cell, &frame), 1);

        frame.commit().unwrap();
    }

    #[test]
    fn write_observer_fires_once_per_object() {
        let directory = FrameDirectory::new();
        let cell = cell(1);
        let writes = Arc::new(Mutex::new(0));
        let counted = writes.clone();
        let observer: WriteObserver = Arc::new(move |_| *counted.lock() += 1);
        let frame = directory.open_observed(None, Some(observer)).unwrap();

        set(&cell, &frame, 2);
        set(&cell, &frame, 3);

        assert_eq!(*writes.lock(), 1);
        frame.commit().unwrap();
    }

    #[test]
    fn objects_created_in_a_frame_stay_private_until_commit() {
        let directory = FrameDirectory::new();
        let frame = directory.open(false).unwrap();
        let cell = cell(7);
        assert_eq!(cell.records().frame_ids(), vec![frame.id()]);
        assert!(frame.was_modified(&*cell));
        let frame = suspend().unwrap();

        let other = directory.open(false).unwrap();
        assert!(readable_record(&cell.first_frame_record(), other.id(), other.invalid()).is_none());
        other.commit().unwrap();

        frame.commit().unwrap();
        let after = directory.open(true).unwrap();
        assert_eq!(get(&cell, &after), 7);
        after.commit().unwrap();
    }

    #[test]
    #[should_panic(expected = "is readable in frame")]
    fn reading_an_invisible_object_panics() {
        let directory = FrameDirectory::new();
        directory.open(false).unwrap();
        let cell = cell(7);
        let _pending = suspend().unwrap();

        let other = directory.open(false).unwrap();
        get(&cell, &other);
    }
}
