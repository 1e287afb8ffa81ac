//! Directory configuration.

/// Tunables for a [`FrameDirectory`](crate::FrameDirectory).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDirectoryConfig {
    /// Recycle records that no open or future frame can select instead of
    /// growing the chain on every first write. Disabling this keeps the full
    /// history of every object, which is useful when inspecting chains.
    pub reuse_records: bool,
}

impl Default for FrameDirectoryConfig {
    fn default() -> Self {
        Self {
            reuse_records: true,
        }
    }
}

impl FrameDirectoryConfig {
    /// Keep every record ever written.
    pub fn preserve_history() -> Self {
        Self {
            reuse_records: false,
        }
    }
}
