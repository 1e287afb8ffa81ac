//! Closure-scoped frames.
//!
//! Each helper opens a frame on the calling thread, runs a block and closes
//! the frame again. A [`FrameGuard`] makes sure a block that panics (or an
//! early return) leaves no frame open behind it.

use std::sync::Arc;

use crate::directory::{FrameDirectory, ObserverHandle};
use crate::error::{FrameError, Result};
use crate::frame::{self, CommitObserver, Frame, ReadObserver};

/// Aborts its frame on drop unless it was committed or suspended.
#[must_use = "dropping the guard aborts the frame"]
pub struct FrameGuard {
    frame: Frame,
    armed: bool,
}

impl FrameGuard {
    pub fn new(frame: Frame) -> Self {
        Self { frame, armed: true }
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Commit the frame. On any failure the frame is aborted when the guard
    /// drops, if the commit did not already abort it.
    pub fn commit(mut self) -> Result<()> {
        let result = self.frame.commit();
        if result.is_ok() {
            self.armed = false;
        }
        result
    }

    /// Abort the frame now.
    pub fn abort(mut self) -> Result<()> {
        self.armed = false;
        self.frame.abort()
    }

    /// Detach the frame from the calling thread and hand it back, still
    /// open, for a later [`restore`](crate::restore).
    ///
    /// Fails with [`FrameError::NotInFrame`] when the guarded frame is not
    /// the one bound to the calling thread; the binding is left alone and
    /// the guard aborts its frame as it drops.
    pub fn suspend(mut self) -> Result<Frame> {
        if frame::current_frame()? != self.frame {
            return Err(FrameError::NotInFrame);
        }
        let frame = frame::suspend()?;
        self.armed = false;
        Ok(frame)
    }

    /// Give up ownership without closing the frame.
    pub fn into_inner(mut self) -> Frame {
        self.armed = false;
        self.frame.clone()
    }
}

impl From<Frame> for FrameGuard {
    fn from(frame: Frame) -> Self {
        Self::new(frame)
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        if self.armed {
            self.frame.directory().abort_handler(&self.frame);
        }
    }
}

impl FrameDirectory {
    /// Run `block` in a new read/write frame and commit it.
    ///
    /// A panic in `block` aborts the frame before unwinding continues. A
    /// collision at commit is returned as [`FrameError::Aborted`](crate::FrameError::Aborted)
    /// and the block's value is dropped.
    pub fn frame<T>(self: &Arc<Self>, block: impl FnOnce() -> T) -> Result<T> {
        let guard = FrameGuard::new(self.open(false)?);
        let value = block();
        guard.commit()?;
        Ok(value)
    }

    /// Like [`frame`](Self::frame) for fallible blocks: an error from
    /// `block` aborts the frame and is returned unchanged.
    pub fn try_frame<T>(self: &Arc<Self>, block: impl FnOnce() -> Result<T>) -> Result<T> {
        let guard = FrameGuard::new(self.open(false)?);
        let value = block()?;
        guard.commit()?;
        Ok(value)
    }

    /// Run `block` in a read-only frame.
    pub fn read_frame<T>(self: &Arc<Self>, block: impl FnOnce() -> T) -> Result<T> {
        let guard = FrameGuard::new(self.open(true)?);
        let value = block();
        guard.commit()?;
        Ok(value)
    }

    /// Run `block` in a new frame with `observer` told about every read.
    pub fn observe_frame<T>(
        self: &Arc<Self>,
        observer: ReadObserver,
        block: impl FnOnce() -> T,
    ) -> Result<T> {
        let guard = FrameGuard::new(self.open_observed(Some(observer), None)?);
        let value = block();
        guard.commit()?;
        Ok(value)
    }

    /// Run `block` in a new frame and return that frame suspended, still
    /// open.
    pub fn suspended(self: &Arc<Self>, block: impl FnOnce()) -> Result<Frame> {
        let guard = FrameGuard::new(self.open(false)?);
        block();
        guard.suspend()
    }

    /// Bind `frame` again, run `block` and commit.
    pub fn restored<T>(&self, frame: &Frame, block: impl FnOnce() -> T) -> Result<T> {
        frame::restore(frame)?;
        let guard = FrameGuard::new(frame.clone());
        let value = block();
        guard.commit()?;
        Ok(value)
    }

    /// Run `block` in a new frame and abort it afterwards.
    pub fn aborted<T>(self: &Arc<Self>, block: impl FnOnce() -> T) -> Result<T> {
        let guard = FrameGuard::new(self.open(false)?);
        let value = block();
        drop(guard);
        Ok(value)
    }

    /// Run `block` with `observer` registered for commits.
    pub fn observe_commit<T>(self: &Arc<Self>, observer: CommitObserver, block: impl FnOnce() -> T) -> T {
        let _handle: ObserverHandle = self.register_commit_observer(observer);
        block()
    }
}
