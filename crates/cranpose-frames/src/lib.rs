#![doc = r"Frame-based multi-version state for Cranpose."]
//!
//! Framed objects keep a chain of records, one per frame that wrote them.
//! A frame reads the newest record committed before it was opened plus its
//! own writes, and commits only if no frame it could not see has committed
//! a change to the same objects in the meantime.
//!
//! ```
//! use cranpose_frames::{FrameDirectory, State};
//!
//! let directory = FrameDirectory::new();
//! let count = State::new(0);
//!
//! directory.frame(|| count.update(|value| *value += 1)).unwrap().unwrap();
//! assert_eq!(directory.read_frame(|| count.get()).unwrap().unwrap(), 1);
//! ```
#![allow(clippy::missing_const_for_thread_local)]

mod access;
pub mod collections;
pub mod config;
pub mod directory;
pub mod error;
pub mod frame;
pub mod frame_id_set;
pub mod framed;
mod framed_collections;
pub mod record;
mod scope;
mod state;


pub use access::{created, read, readable, writable, write};
pub use config::FrameDirectoryConfig;
pub use directory::{FrameDirectory, ObserverHandle};
pub use error::{FrameError, Result};
pub use frame::{
    abort, abort_handler, commit, commit_handler, current_frame, in_frame, observe_all_reads,
    restore, suspend, was_modified, CommitObserver, Frame, FrameOptions, ReadObserver,
    WriteObserver,
};
pub use frame_id_set::{
    is_speculative, FrameId, FrameIdSet, CREATION_FRAME_ID, FRAME_ID_MAX, INVALID_FRAME_ID,
};
pub use framed::{Framed, FramedObject, ModifiedSet, ObjectId, RecordKey};
pub use framed_collections::{FramedList, FramedMap};
pub use record::{FrameRecord, Record, RecordChain, ValueRecord};
pub use scope::FrameGuard;
pub use state::State;
