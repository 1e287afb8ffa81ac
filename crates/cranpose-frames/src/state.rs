//! A single framed value.

use std::fmt;
use std::sync::Arc;

use crate::access::{created, read, writable, write};
use crate::error::Result;
use crate::frame::{current_frame, Frame};
use crate::framed::{Framed, FramedObject, ObjectId};
use crate::record::{RecordChain, ValueRecord};

struct StateCell<T> {
    records: RecordChain<ValueRecord<T>>,
}

impl<T: Clone + Send + Sync + 'static> Framed for StateCell<T> {
    type Record = ValueRecord<T>;

    fn records(&self) -> &RecordChain<Self::Record> {
        &self.records
    }
}

/// A value whose reads and writes are isolated per frame.
///
/// Handles are cheap to clone and all refer to the same value. The
/// accessors without an `_in` suffix use the frame bound to the calling
/// thread and fail with [`FrameError::NotInFrame`](crate::FrameError::NotInFrame)
/// outside one.
pub struct State<T> {
    cell: Arc<StateCell<T>>,
}

impl<T: Clone + Send + Sync + 'static> State<T> {
    /// Create a state. Inside a writable frame the value is published when
    /// that frame commits.
    pub fn new(value: T) -> Self {
        let cell = Arc::new(StateCell {
            records: RecordChain::new(ValueRecord::new(value)),
        });
        created(&cell);
        Self { cell }
    }

    pub fn get(&self) -> Result<T> {
        Ok(self.get_in(&current_frame()?))
    }

    pub fn get_in(&self, frame: &Frame) -> T {
        self.with_in(frame, T::clone)
    }

    /// Borrow the visible value without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R> {
        Ok(self.with_in(&current_frame()?, f))
    }

    pub fn with_in<R>(&self, frame: &Frame, f: impl FnOnce(&T) -> R) -> R {
        read(&*self.cell, frame, |record| f(&record.value))
    }

    pub fn set(&self, value: T) -> Result<()> {
        self.set_in(&current_frame()?, value)
    }

    pub fn set_in(&self, frame: &Frame, value: T) -> Result<()> {
        writable(&self.cell, frame)?.replace(ValueRecord::new(value));
        Ok(())
    }

    /// Mutate a copy of the value, which becomes the frame's value once `f`
    /// returns. Reads of this state inside `f` see the previous value.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        self.update_in(&current_frame()?, f)
    }

    pub fn update_in<R>(&self, frame: &Frame, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        write(&self.cell, frame, |record| f(&mut record.value))
    }

    /// Number of records in the value's chain.
    pub fn record_count(&self) -> usize {
        self.cell.records.len()
    }

    pub fn object_id(&self) -> ObjectId {
        self.cell.records.object_id()
    }

    /// Type-erased view, as passed to observers and stored in modified sets.
    pub fn as_object(&self) -> &dyn FramedObject {
        &*self.cell
    }
}

impl<T> Clone for State<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> fmt::Debug for State<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("records", &self.cell.records)
            .finish()
    }
}
