//! Error types returned by frame operations.

use thiserror::Error;

use crate::frame::Frame;
use crate::frame_id_set::FrameId;

/// Errors produced by frame lifecycle and write operations.
///
/// Everything except [`FrameError::Aborted`] is a usage error: the caller
/// broke the frame contract and retrying will not help.
#[derive(Debug, Clone, Error)]
pub enum FrameError {
    /// The frame was aborted, either explicitly or because committing it
    /// collided with a concurrently committed write. Callers are expected to
    /// discard the frame's work and retry from a fresh frame.
    #[error("frame {} aborted", .0.id())]
    Aborted(Frame),

    /// A frame is already bound to the calling thread.
    #[error("in a frame")]
    AlreadyInFrame,

    /// No frame is bound to the calling thread.
    #[error("not in a frame")]
    NotInFrame,

    /// The frame is not in the directory's open set.
    #[error("frame {0} is not open")]
    NotOpen(FrameId),

    /// Speculative frames can only be aborted.
    #[error("cannot commit speculative frame {0}")]
    SpeculativeCommit(FrameId),

    /// A write was attempted in a read-only frame.
    #[error("cannot write in read-only frame {0}")]
    ReadOnly(FrameId),

    /// The frame is currently bound to another thread.
    #[error("frame {0} is bound to another thread")]
    FrameBound(FrameId),
}

impl FrameError {
    /// Returns `true` for the recoverable abort/collision outcome.
    pub fn is_collision(&self) -> bool {
        matches!(self, FrameError::Aborted(_))
    }

    /// The aborted frame, if this is an abort.
    pub fn aborted_frame(&self) -> Option<&Frame> {
        match self {
            FrameError::Aborted(frame) => Some(frame),
            _ => None,
        }
    }
}

pub type Result<T, E = FrameError> = std::result::Result<T, E>;
