//! Frames and their binding to the calling thread.
//!
//! A [`Frame`] is one logical transaction: an id, the ids it must treat as
//! not yet committed, and the observers active while it runs. At most one
//! frame is bound to a thread at a time and a frame is bound to at most one
//! thread; [`suspend`] and [`restore`] move a frame between threads.

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::directory::FrameDirectory;
use crate::error::{FrameError, Result};
use crate::frame_id_set::{is_speculative, FrameId, FrameIdSet};
use crate::framed::{FramedObject, ModifiedSet};

/// Called with every framed object read in a frame.
pub type ReadObserver = Arc<dyn Fn(&dyn FramedObject) + Send + Sync + 'static>;

/// Called the first time a frame writes a framed object.
pub type WriteObserver = Arc<dyn Fn(&dyn FramedObject) + Send + Sync + 'static>;

/// Called after every successful commit with the objects the frame changed.
pub type CommitObserver = Arc<dyn Fn(&ModifiedSet, &Frame) + Send + Sync + 'static>;

type ObserverList = SmallVec<[(usize, ReadObserver); 2]>;

static NEXT_OBSERVER_TOKEN: AtomicUsize = AtomicUsize::new(1);

pub(crate) fn next_observer_token() -> usize {
    NEXT_OBSERVER_TOKEN.fetch_add(1, Ordering::Relaxed)
}

/// How a frame should be opened.
#[derive(Clone, Default)]
pub struct FrameOptions {
    pub read_only: bool,
    /// Speculative frames are invisible to every other frame and can only
    /// be aborted.
    pub speculative: bool,
    pub read_observer: Option<ReadObserver>,
    pub write_observer: Option<WriteObserver>,
}

impl fmt::Debug for FrameOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameOptions")
            .field("read_only", &self.read_only)
            .field("speculative", &self.speculative)
            .field("read_observer", &self.read_observer.is_some())
            .field("write_observer", &self.write_observer.is_some())
            .finish()
    }
}

struct FrameInner {
    id: FrameId,
    invalid: FrameIdSet,
    read_only: bool,
    /// Lowest frame id this frame may still read records from.
    pin: FrameId,
    read_observers: Mutex<ObserverList>,
    write_observer: Option<WriteObserver>,
    modified: Option<Mutex<ModifiedSet>>,
    bound: AtomicBool,
    closed: AtomicBool,
    directory: Arc<FrameDirectory>,
}

/// Handle to an open (or finished) frame. Clones refer to the same frame.
#[derive(Clone)]
pub struct Frame {
    inner: Arc<FrameInner>,
}

impl Frame {
    pub(crate) fn new(
        directory: Arc<FrameDirectory>,
        id: FrameId,
        invalid: FrameIdSet,
        pin: FrameId,
        options: FrameOptions,
    ) -> Self {
        let mut read_observers: ObserverList = thread_read_observers();
        if let Some(observer) = options.read_observer {
            read_observers.insert(0, (next_observer_token(), observer));
        }

        Self {
            inner: Arc::new(FrameInner {
                id,
                invalid,
                read_only: options.read_only,
                pin,
                read_observers: Mutex::new(read_observers),
                write_observer: options.write_observer,
                modified: (!options.read_only).then(|| Mutex::new(ModifiedSet::default())),
                bound: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                directory,
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> FrameId {
        self.inner.id
    }

    /// Ids this frame treats as not committed: frames open or aborted when
    /// it was opened.
    pub fn invalid(&self) -> &FrameIdSet {
        &self.inner.invalid
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    pub fn is_speculative(&self) -> bool {
        is_speculative(self.inner.id)
    }

    pub fn directory(&self) -> &Arc<FrameDirectory> {
        &self.inner.directory
    }

    /// Whether the frame is still in its directory's open set.
    pub fn is_open(&self) -> bool {
        self.inner.directory.is_open(self.inner.id)
    }

    /// Snapshot of the objects written so far; `None` for read-only frames.
    pub fn modified(&self) -> Option<ModifiedSet> {
        self.inner.modified.as_ref().map(|set| set.lock().clone())
    }

    pub fn was_modified<O: FramedObject + ?Sized>(&self, object: &O) -> bool {
        self.inner
            .modified
            .as_ref()
            .is_some_and(|set| set.lock().contains(object))
    }

    /// Commit this frame. See [`FrameDirectory::commit`].
    pub fn commit(&self) -> Result<()> {
        self.inner.directory.commit(self)
    }

    /// Abort this frame. See [`FrameDirectory::abort`].
    pub fn abort(&self) -> Result<()> {
        self.inner.directory.abort(self)
    }

    pub(crate) fn pin(&self) -> FrameId {
        self.inner.pin
    }

    /// Adds `object` to the modified set, returning `true` the first time.
    /// Read-only frames track nothing.
    pub(crate) fn record_modified(&self, object: Arc<dyn FramedObject>) -> bool {
        match &self.inner.modified {
            Some(set) => set.lock().insert(object),
            None => false,
        }
    }

    pub(crate) fn notify_read(&self, object: &dyn FramedObject) {
        // Copied out so observers may install or remove observers themselves.
        let observers: ObserverList = self.inner.read_observers.lock().clone();
        for (_, observer) in observers.iter() {
            observer(object);
        }
    }

    pub(crate) fn notify_write(&self, object: &dyn FramedObject) {
        if let Some(observer) = &self.inner.write_observer {
            observer(object);
        }
    }

    pub(crate) fn add_read_observer(&self, token: usize, observer: ReadObserver) {
        self.inner.read_observers.lock().push((token, observer));
    }

    pub(crate) fn remove_read_observer(&self, token: usize) {
        self.inner
            .read_observers
            .lock()
            .retain(|(existing, _)| *existing != token);
    }

    pub(crate) fn mark_closed(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.bound.store(false, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn same(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl Eq for Frame {}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.inner.id)
            .field("read_only", &self.inner.read_only)
            .field("invalid", &self.inner.invalid)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame {}", self.inner.id)
    }
}

thread_local! {
    static CURRENT_FRAME: RefCell<Option<Frame>> = const { RefCell::new(None) };
    static THREAD_READ_OBSERVERS: RefCell<ObserverList> = RefCell::new(SmallVec::new());
}

fn thread_read_observers() -> ObserverList {
    THREAD_READ_OBSERVERS.with(|cell| cell.borrow().clone())
}

/// Returns the bound frame, dropping the binding if the frame was closed
/// from another thread in the meantime.
fn bound_frame() -> Option<Frame> {
    CURRENT_FRAME.with(|cell| {
        let mut current = cell.borrow_mut();
        if current.as_ref().is_some_and(Frame::is_closed) {
            *current = None;
        }
        current.clone()
    })
}

pub(crate) fn ensure_unbound() -> Result<()> {
    match bound_frame() {
        Some(_) => Err(FrameError::AlreadyInFrame),
        None => Ok(()),
    }
}

pub(crate) fn bind(frame: &Frame) -> Result<()> {
    ensure_unbound()?;
    if frame.inner.bound.swap(true, Ordering::AcqRel) {
        return Err(FrameError::FrameBound(frame.id()));
    }
    CURRENT_FRAME.with(|cell| *cell.borrow_mut() = Some(frame.clone()));
    log::trace!("bound {frame} to {:?}", std::thread::current().id());
    Ok(())
}

/// Clears the calling thread's binding if it is `frame`.
pub(crate) fn unbind_if_current(frame: &Frame) {
    CURRENT_FRAME.with(|cell| {
        let mut current = cell.borrow_mut();
        if current.as_ref().is_some_and(|bound| bound.same(frame)) {
            *current = None;
        }
    });
}

pub(crate) fn current_frame_id() -> Option<FrameId> {
    bound_frame().map(|frame| frame.id())
}

/// The frame bound to the calling thread.
pub fn current_frame() -> Result<Frame> {
    bound_frame().ok_or(FrameError::NotInFrame)
}

pub fn in_frame() -> bool {
    bound_frame().is_some()
}

/// Detach the bound frame from the calling thread without closing it.
pub fn suspend() -> Result<Frame> {
    let frame = current_frame()?;
    CURRENT_FRAME.with(|cell| *cell.borrow_mut() = None);
    frame.inner.bound.store(false, Ordering::Release);
    log::trace!("suspended {frame}");
    Ok(frame)
}

/// Bind a suspended, still open frame to the calling thread.
pub fn restore(frame: &Frame) -> Result<()> {
    ensure_unbound()?;
    if !frame.is_open() {
        return Err(FrameError::NotOpen(frame.id()));
    }
    bind(frame)
}

/// Commit the bound frame.
pub fn commit() -> Result<()> {
    let frame = current_frame()?;
    frame.directory().commit(&frame)
}

/// Commit the bound frame if there is one.
pub fn commit_handler() -> Result<()> {
    match bound_frame() {
        Some(frame) => frame.directory().commit(&frame),
        None => Ok(()),
    }
}

/// Abort the bound frame.
pub fn abort() -> Result<()> {
    let frame = current_frame()?;
    frame.directory().abort(&frame)
}

/// Abort the bound frame if there is one, never failing.
pub fn abort_handler() {
    if let Some(frame) = bound_frame() {
        frame.directory().abort_handler(&frame);
    }
}

/// Whether the bound frame has written or created `object`.
pub fn was_modified<O: FramedObject + ?Sized>(object: &O) -> bool {
    bound_frame().is_some_and(|frame| frame.was_modified(object))
}

/// Run `block` with `observer` receiving every read made on this thread:
/// in the bound frame, if any, and in every frame opened while it runs.
pub fn observe_all_reads<T>(observer: ReadObserver, block: impl FnOnce() -> T) -> T {
    struct Installed {
        token: usize,
        frame: Option<Frame>,
    }

    impl Drop for Installed {
        fn drop(&mut self) {
            let token = self.token;
            THREAD_READ_OBSERVERS.with(|cell| {
                cell.borrow_mut().retain(|(existing, _)| *existing != token);
            });
            if let Some(frame) = &self.frame {
                frame.remove_read_observer(token);
            }
        }
    }

    let token = next_observer_token();
    THREAD_READ_OBSERVERS.with(|cell| cell.borrow_mut().push((token, observer.clone())));
    let frame = bound_frame();
    if let Some(frame) = &frame {
        frame.add_read_observer(token, observer);
    }

    let _installed = Installed { token, frame };
    block()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_frame_is_bound_initially() {
        assert!(!in_frame());
        assert!(matches!(current_frame(), Err(FrameError::NotInFrame)));
        assert!(matches!(suspend(), Err(FrameError::NotInFrame)));
        assert!(matches!(commit(), Err(FrameError::NotInFrame)));
        assert!(commit_handler().is_ok());
        abort_handler();
    }

    #[test]
    fn suspend_and_restore_move_the_binding() {
        let directory = FrameDirectory::new();
        let frame = directory.open(false).unwrap();
        assert_eq!(current_frame().unwrap(), frame);

        let suspended = suspend().unwrap();
        assert_eq!(suspended, frame);
        assert!(!in_frame());

        restore(&suspended).unwrap();
        assert_eq!(current_frame().unwrap(), frame);
        commit().unwrap();
        assert!(!in_frame());
    }

    #[test]
    fn restore_fails_while_bound() {
        let directory = FrameDirectory::new();
        let first = directory.open(false).unwrap();
        let first = {
            assert_eq!(current_frame().unwrap(), first);
            suspend().unwrap()
        };
        let second = directory.open(false).unwrap();

        assert!(matches!(restore(&first), Err(FrameError::AlreadyInFrame)));

        second.commit().unwrap();
        restore(&first).unwrap();
        first.commit().unwrap();
    }

    #[test]
    fn restore_fails_for_closed_frames() {
        let directory = FrameDirectory::new();
        directory.open(false).unwrap();
        let frame = suspend().unwrap();
        directory.commit(&frame).unwrap();

        assert!(matches!(restore(&frame), Err(FrameError::NotOpen(id)) if id == frame.id()));
    }

    #[test]
    fn frames_bound_elsewhere_cannot_be_restored() {
        let directory = FrameDirectory::new();
        let frame = directory.open(false).unwrap();

        let other = frame.clone();
        let result = std::thread::spawn(move || restore(&other).map_err(|err| err.to_string()))
            .join()
            .unwrap();
        assert_eq!(result, Err(format!("frame {} is bound to another thread", frame.id())));

        commit().unwrap();
    }

    #[test]
    fn closing_elsewhere_releases_the_binding() {
        let directory = FrameDirectory::new();
        let frame = directory.open(false).unwrap();

        let other = frame.clone();
        std::thread::spawn(move || other.commit().unwrap())
            .join()
            .unwrap();

        assert!(!in_frame());
        directory.open(false).unwrap();
        commit().unwrap();
    }

    #[test]
    fn read_only_frames_have_no_modified_set() {
        let directory = FrameDirectory::new();
        let frame = directory.open(true).unwrap();
        assert!(frame.is_read_only());
        assert!(frame.modified().is_none());
        commit().unwrap();

        let frame = directory.open(false).unwrap();
        assert_eq!(frame.modified().map(|set| set.len()), Some(0));
        commit().unwrap();
    }
}
