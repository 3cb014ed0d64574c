//! Workspace arena.
//!
//! One device buffer split into equal, disjoint per-context regions. Regions
//! are computed from the context index and the stride recorded at the last
//! successful allocation; there are no stored per-context pointers to keep in
//! sync, and the degraded state is simply "no buffer".
//!
//! ```text
//! base                                                     base + size
//! |  ctx 0: stride bytes  |  ctx 1: stride bytes  |  ...  |
//! ```

use std::fmt;

use tracing::{debug, warn};

use crate::device::{DeviceBuffer, DevicePtr, DnnDevice};

/// Result of [`WorkspaceArena::ensure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceOutcome {
    /// Current buffer already large enough.
    Unchanged,
    /// New buffer of `bytes` allocated.
    Reallocated { bytes: usize },
    /// Allocation of `requested` bytes failed; the arena is now empty.
    Degraded { requested: usize },
}

impl WorkspaceOutcome {
    pub fn is_degraded(&self) -> bool {
        matches!(self, WorkspaceOutcome::Degraded { .. })
    }
}

/// One context's slice of the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkspaceRegion {
    pub ptr: DevicePtr,
    /// Byte offset from the arena base.
    pub offset: usize,
    pub len: usize,
}

/// Owned workspace buffer plus its partitioning.
pub struct WorkspaceArena<B> {
    buffer: Option<B>,
    size: usize,
    stride: usize,
    contexts: usize,
}

impl<B> Default for WorkspaceArena<B> {
    fn default() -> Self {
        Self {
            buffer: None,
            size: 0,
            stride: 0,
            contexts: 0,
        }
    }
}

impl<B: DeviceBuffer> WorkspaceArena<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make room for `per_context` bytes in each of `contexts` regions.
    ///
    /// Reallocates only when `per_context * contexts` is strictly larger than
    /// the current size. The old buffer is freed before the new one is
    /// requested. On allocation failure the arena is left empty with size 0
    /// and the caller is expected to fall back to zero-workspace algorithms.
    pub fn ensure<D>(&mut self, device: &D, per_context: usize, contexts: usize) -> WorkspaceOutcome
    where
        D: DnnDevice<Buffer = B>,
    {
        let required = per_context.saturating_mul(contexts);
        if required <= self.size {
            return WorkspaceOutcome::Unchanged;
        }

        self.release(device);

        match device.alloc(required) {
            Ok(buffer) => {
                debug!(
                    target: "cudnn_conv::workspace",
                    bytes = required,
                    per_context,
                    contexts,
                    base = %buffer.ptr(),
                    "Workspace reallocated"
                );
                self.buffer = Some(buffer);
                self.size = required;
                self.stride = per_context;
                self.contexts = contexts;
                WorkspaceOutcome::Reallocated { bytes: required }
            }
            Err(e) => {
                warn!(
                    target: "cudnn_conv::workspace",
                    requested = required,
                    error = %e,
                    "Workspace allocation failed; falling back to zero-workspace algorithms"
                );
                WorkspaceOutcome::Degraded {
                    requested: required,
                }
            }
        }
    }

    /// Region for context `index`, or `None` when there is no buffer.
    pub fn region(&self, index: usize) -> Option<WorkspaceRegion> {
        let buffer = self.buffer.as_ref()?;
        if index >= self.contexts {
            return None;
        }
        let offset = index * self.stride;
        Some(WorkspaceRegion {
            ptr: buffer.ptr().offset(offset),
            offset,
            len: self.stride,
        })
    }

    /// Base pointer for context `index`; null when degraded or out of range.
    pub fn region_ptr(&self, index: usize) -> DevicePtr {
        self.region(index).map_or(DevicePtr::NULL, |r| r.ptr)
    }

    /// Recorded buffer size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes per context region.
    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn is_allocated(&self) -> bool {
        self.buffer.is_some()
    }

    /// Free the buffer, if any, and reset to empty. Free errors are logged.
    pub fn release<D>(&mut self, device: &D)
    where
        D: DnnDevice<Buffer = B>,
    {
        if let Some(buffer) = self.buffer.take() {
            if let Err(e) = device.free(buffer) {
                warn!(target: "cudnn_conv::workspace", error = %e, "Failed to free workspace");
            }
        }
        self.size = 0;
        self.stride = 0;
        self.contexts = 0;
    }
}

impl<B: fmt::Debug> fmt::Debug for WorkspaceArena<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkspaceArena")
            .field("buffer", &self.buffer)
            .field("size", &self.size)
            .field("stride", &self.stride)
            .field("contexts", &self.contexts)
            .finish()
    }
}
