//! Process-wide frame bookkeeping.
//!
//! A [`FrameDirectory`] allocates frame ids and tracks which frames are open
//! and which were aborted; that is all a frame needs to decide which record
//! of a framed object it may see. Every mutation happens under one mutex
//! which is never held while user callbacks run.
//!
//! Directories are plain values shared by `Arc`, so independent directories
//! can coexist (tests create one each).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};

use crate::config::FrameDirectoryConfig;
use crate::error::{FrameError, Result};
use crate::frame::{self, CommitObserver, Frame, FrameOptions, ReadObserver, WriteObserver};
use crate::frame_id_set::{is_speculative, FrameId, FrameIdSet, CREATION_FRAME_ID};
use crate::record::ReuseHorizon;

/// Frame id allocation, the open and aborted sets, and commit observers.
pub struct FrameDirectory {
    config: FrameDirectoryConfig,
    state: Mutex<DirectoryState>,
}

struct DirectoryState {
    /// Highest id handed out. Advanced by 2 so parity separates normal and
    /// speculative frames.
    max_frame_id: FrameId,
    open: FrameIdSet,
    aborted: FrameIdSet,
    /// `open` and `aborted` combined, kept up to date instead of being
    /// rebuilt on every open.
    invalid: FrameIdSet,
    /// Multiset of the lowest id every open frame may still read from.
    pins: BTreeMap<FrameId, usize>,
    commit_observers: Vec<(usize, CommitObserver)>,
}

impl DirectoryState {
    fn new() -> Self {
        Self {
            max_frame_id: CREATION_FRAME_ID,
            open: FrameIdSet::new(),
            aborted: FrameIdSet::new(),
            invalid: FrameIdSet::new(),
            pins: BTreeMap::new(),
            commit_observers: Vec::new(),
        }
    }

    fn pin(&mut self, id: FrameId) {
        *self.pins.entry(id).or_insert(0) += 1;
    }

    fn unpin(&mut self, id: FrameId) {
        if let Some(count) = self.pins.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                self.pins.remove(&id);
            }
        }
    }

    fn lowest_pin(&self) -> Option<FrameId> {
        self.pins.keys().next().copied()
    }

    fn close(&mut self, frame: &Frame) {
        self.open = self.open.clear(frame.id());
        if !self.aborted.get(frame.id()) {
            self.invalid = self.invalid.clear(frame.id());
        }
        self.unpin(frame.pin());
        frame.mark_closed();
    }

    fn abort(&mut self, frame: &Frame) {
        if !frame.is_speculative() {
            self.aborted = self.aborted.set(frame.id());
        }
        self.close(frame);
    }
}

impl FrameDirectory {
    pub fn new() -> Arc<Self> {
        Self::with_config(FrameDirectoryConfig::default())
    }

    pub fn with_config(config: FrameDirectoryConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(DirectoryState::new()),
        })
    }

    pub fn config(&self) -> FrameDirectoryConfig {
        self.config
    }

    fn lock(&self) -> MutexGuard<'_, DirectoryState> {
        self.state.lock()
    }

    /// Open a read/write (or read-only) frame bound to the calling thread.
    pub fn open(self: &Arc<Self>, read_only: bool) -> Result<Frame> {
        self.open_with(FrameOptions {
            read_only,
            ..FrameOptions::default()
        })
    }

    /// Open a read/write frame with observers installed.
    pub fn open_observed(
        self: &Arc<Self>,
        read_observer: Option<ReadObserver>,
        write_observer: Option<WriteObserver>,
    ) -> Result<Frame> {
        self.open_with(FrameOptions {
            read_observer,
            write_observer,
            ..FrameOptions::default()
        })
    }

    /// Open a speculative frame: its writes are invisible to every other
    /// frame and it can only be aborted.
    pub fn speculate(self: &Arc<Self>) -> Result<Frame> {
        self.open_with(FrameOptions {
            speculative: true,
            ..FrameOptions::default()
        })
    }

    pub fn open_with(self: &Arc<Self>, options: FrameOptions) -> Result<Frame> {
        frame::ensure_unbound()?;

        let (id, invalid, pin) = {
            let mut state = self.lock();
            state.max_frame_id += 2;
            let id = if options.speculative {
                state.max_frame_id | 1
            } else {
                state.max_frame_id
            };
            let invalid = state.invalid.clone();
            let pin = state.open.lowest(id);
            state.open = state.open.set(id);
            state.invalid = state.invalid.set(id);
            state.pin(pin);
            (id, invalid, pin)
        };

        let frame = Frame::new(Arc::clone(self), id, invalid, pin, options);
        if let Err(err) = frame::bind(&frame) {
            self.lock().close(&frame);
            return Err(err);
        }
        log::trace!("opened {frame} (invalid: {:?})", frame.invalid());
        Ok(frame)
    }

    /// Commit `frame`, publishing its writes to frames opened afterwards.
    ///
    /// Every object the frame modified is checked for a record committed by
    /// another frame since this one opened. Any such collision aborts the
    /// frame and returns [`FrameError::Aborted`]. Otherwise commit observers
    /// are told which objects changed, on the calling thread, after the
    /// directory lock is released.
    ///
    /// Writes to different objects never collide, even when they are
    /// logically related.
    pub fn commit(&self, frame: &Frame) -> Result<()> {
        let id = frame.id();
        let (modified, observers) = {
            let mut state = self.lock();
            if !state.open.get(id) {
                return Err(FrameError::NotOpen(id));
            }
            if is_speculative(id) {
                return Err(FrameError::SpeculativeCommit(id));
            }

            let modified = match frame.modified() {
                Some(modified) if !modified.is_empty() => modified,
                _ => {
                    state.close(frame);
                    drop(state);
                    frame::unbind_if_current(frame);
                    log::trace!("closed {frame} without changes");
                    return Ok(());
                }
            };

            let next = state.max_frame_id + 2;
            let current_invalid = state.invalid.clone();
            let previous_invalid = frame.invalid().set(id);
            let collisions = modified
                .iter()
                .filter(|object| {
                    object.readable_record_key(next, &current_invalid)
                        != object.readable_record_key(id, &previous_invalid)
                })
                .count();

            if collisions > 0 {
                state.abort(frame);
                drop(state);
                frame::unbind_if_current(frame);
                log::debug!("{frame} collided on {collisions} object(s), aborting");
                return Err(FrameError::Aborted(frame.clone()));
            }

            state.close(frame);
            let observers: Vec<CommitObserver> = state
                .commit_observers
                .iter()
                .map(|(_, observer)| Arc::clone(observer))
                .collect();
            (modified, observers)
        };

        frame::unbind_if_current(frame);
        log::debug!(
            "committed {frame}: {} object(s), {} observer(s)",
            modified.len(),
            observers.len()
        );
        for observer in observers {
            observer(&modified, frame);
        }
        Ok(())
    }

    /// Abort `frame`. Its writes become invisible to every frame.
    ///
    /// On success this returns `Err(FrameError::Aborted(frame))` so the
    /// abort propagates through `?` out of the work that requested it.
    pub fn abort(&self, frame: &Frame) -> Result<()> {
        {
            let mut state = self.lock();
            if !state.open.get(frame.id()) {
                return Err(FrameError::NotOpen(frame.id()));
            }
            state.abort(frame);
        }
        frame::unbind_if_current(frame);
        log::debug!("aborted {frame}");
        Err(FrameError::Aborted(frame.clone()))
    }

    /// Abort `frame` if it is still open. Never fails, for cleanup paths
    /// that must not mask the error they are unwinding with.
    pub fn abort_handler(&self, frame: &Frame) {
        let aborted = {
            let mut state = self.lock();
            let open = state.open.get(frame.id());
            if open {
                state.abort(frame);
            }
            open
        };
        frame::unbind_if_current(frame);
        if aborted {
            log::debug!("aborted {frame} during cleanup");
        }
    }

    /// Register `observer` to be told about every successful commit.
    /// Observers run in registration order. Dropping the handle
    /// unregisters.
    pub fn register_commit_observer(self: &Arc<Self>, observer: CommitObserver) -> ObserverHandle {
        let token = frame::next_observer_token();
        self.lock().commit_observers.push((token, observer));
        ObserverHandle {
            directory: Arc::downgrade(self),
            token,
        }
    }

    fn unregister_commit_observer(&self, token: usize) {
        self.lock()
            .commit_observers
            .retain(|(existing, _)| *existing != token);
    }

    pub fn is_open(&self, id: FrameId) -> bool {
        self.lock().open.get(id)
    }

    pub fn is_aborted(&self, id: FrameId) -> bool {
        self.lock().aborted.get(id)
    }

    pub fn open_frame_ids(&self) -> FrameIdSet {
        self.lock().open.clone()
    }

    pub fn aborted_frame_ids(&self) -> FrameIdSet {
        self.lock().aborted.clone()
    }

    pub fn max_frame_id(&self) -> FrameId {
        self.lock().max_frame_id
    }

    /// What `frame`'s write path may recycle.
    ///
    /// The limit sits below the lowest id any open frame may still read,
    /// so a record that some open frame can select is never handed out.
    pub(crate) fn reuse_horizon(&self, frame: &Frame) -> ReuseHorizon {
        let state = self.lock();
        let lowest = state
            .lowest_pin()
            .map_or(frame.pin(), |pin| pin.min(frame.pin()));
        ReuseHorizon {
            limit: lowest.saturating_sub(1),
            open: state.open.clone(),
            aborted: state.aborted.clone(),
            enabled: self.config.reuse_records,
        }
    }
}

impl fmt::Debug for FrameDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("FrameDirectory")
            .field("max_frame_id", &state.max_frame_id)
            .field("open", &state.open)
            .field("aborted", &state.aborted)
            .field("commit_observers", &state.commit_observers.len())
            .finish()
    }
}

/// Registration of a commit observer. Dropping it unregisters the observer.
pub struct ObserverHandle {
    directory: Weak<FrameDirectory>,
    token: usize,
}

impl ObserverHandle {
    /// Unregister now.
    pub fn dispose(self) {}
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        if let Some(directory) = self.directory.upgrade() {
            directory.unregister_commit_observer(self.token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{current_frame, in_frame, suspend};

    #[test]
    fn open_allocates_even_ids_two_apart() {
        let directory = FrameDirectory::new();

        let first = directory.open(false).unwrap();
        first.commit().unwrap();
        let second = directory.open(false).unwrap();
        second.commit().unwrap();

        assert_eq!(first.id(), CREATION_FRAME_ID + 2);
        assert_eq!(second.id(), first.id() + 2);
        assert_eq!(directory.max_frame_id(), second.id());
    }

    #[test]
    fn speculative_ids_are_odd() {
        let directory = FrameDirectory::new();
        let frame = directory.speculate().unwrap();
        assert!(frame.is_speculative());
        assert_eq!(frame.id() & 1, 1);
        directory.abort_handler(&frame);
    }

    #[test]
    fn open_fails_while_bound() {
        let directory = FrameDirectory::new();
        let frame = directory.open(false).unwrap();

        assert!(matches!(directory.open(false), Err(FrameError::AlreadyInFrame)));
        assert_eq!(current_frame().unwrap(), frame);
        assert_eq!(directory.open_frame_ids().len(), 1);

        frame.commit().unwrap();
    }

    #[test]
    fn invalid_set_follows_many_aborts_and_commits() {
        let directory = FrameDirectory::new();
        for round in 0..300 {
            let frame = directory.open(false).unwrap();
            if round % 3 == 0 {
                directory.abort_handler(&frame);
            } else {
                frame.commit().unwrap();
            }
        }
        let pending = {
            directory.open(false).unwrap();
            suspend().unwrap()
        };

        let frame = directory.open(false).unwrap();
        let expected = directory.aborted_frame_ids().set(pending.id());
        assert_eq!(directory.aborted_frame_ids().len(), 100);
        assert_eq!(frame.invalid(), &expected);

        frame.commit().unwrap();
        pending.commit().unwrap();
    }

    #[test]
    fn invalid_set_captures_open_and_aborted_frames() {
        let directory = FrameDirectory::new();

        let aborted = directory.open(false).unwrap();
        directory.abort_handler(&aborted);
        let pending = {
            directory.open(false).unwrap();
            suspend().unwrap()
        };

        let frame = directory.open(false).unwrap();
        assert!(frame.invalid().get(aborted.id()));
        assert!(frame.invalid().get(pending.id()));
        assert!(!frame.invalid().get(frame.id()));

        frame.commit().unwrap();
        pending.commit().unwrap();
    }

    #[test]
    fn commit_of_closed_frame_is_rejected() {
        let directory = FrameDirectory::new();
        let frame = directory.open(false).unwrap();
        frame.commit().unwrap();

        assert!(matches!(directory.commit(&frame), Err(FrameError::NotOpen(_))));
        assert!(matches!(directory.abort(&frame), Err(FrameError::NotOpen(_))));
        directory.abort_handler(&frame);
    }

    #[test]
    fn speculative_frames_cannot_commit() {
        let directory = FrameDirectory::new();
        let frame = directory.speculate().unwrap();

        assert!(matches!(
            directory.commit(&frame),
            Err(FrameError::SpeculativeCommit(id)) if id == frame.id()
        ));
        assert!(frame.is_open());

        assert!(directory.abort(&frame).unwrap_err().is_collision());
        assert!(!directory.is_aborted(frame.id()));
        assert!(!in_frame());
    }

    #[test]
    fn abort_records_the_id_and_unbinds() {
        let directory = FrameDirectory::new();
        let frame = directory.open(false).unwrap();

        let err = directory.abort(&frame).unwrap_err();
        assert_eq!(err.aborted_frame(), Some(&frame));
        assert!(directory.is_aborted(frame.id()));
        assert!(!directory.is_open(frame.id()));
        assert!(!in_frame());
    }

    #[test]
    fn empty_commit_skips_observers() {
        let directory = FrameDirectory::new();
        let calls = Arc::new(Mutex::new(0));
        let counted = calls.clone();
        let _handle = directory.register_commit_observer(Arc::new(move |_, _| *counted.lock() += 1));

        directory.open(false).unwrap().commit().unwrap();
        directory.open(true).unwrap().commit().unwrap();

        assert_eq!(*calls.lock(), 0);
    }

    #[test]
    fn dropping_the_handle_unregisters() {
        let directory = FrameDirectory::new();
        let handle = directory.register_commit_observer(Arc::new(|_, _| {}));
        assert_eq!(directory.lock().commit_observers.len(), 1);

        handle.dispose();
        assert!(directory.lock().commit_observers.is_empty());
    }

    #[test]
    fn horizon_follows_the_oldest_open_frame() {
        let directory = FrameDirectory::new();
        let old = {
            directory.open(false).unwrap();
            suspend().unwrap()
        };
        let frame = directory.open(false).unwrap();

        assert_eq!(directory.reuse_horizon(&frame).limit, old.id() - 1);
        old.commit().unwrap();
        // Still pinned by its own view: `old` was open when `frame` started.
        assert_eq!(directory.reuse_horizon(&frame).limit, old.id() - 1);

        frame.commit().unwrap();
        let next = directory.open(false).unwrap();
        assert_eq!(directory.reuse_horizon(&next).limit, next.id() - 1);
        next.commit().unwrap();
    }
}
