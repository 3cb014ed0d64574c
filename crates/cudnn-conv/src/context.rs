//! Execution context pool.
//!
//! One stream plus one library handle bound to it per context. The pool is
//! created once at setup with `group * streams_per_group` contexts and is
//! immutable afterwards; only teardown consumes it.

use std::fmt;

use tracing::{debug, warn};

use crate::device::DnnDevice;
use crate::error::{ConvError, ConvResult};

/// A stream and the handle bound to it.
pub struct ExecutionContext<D: DnnDevice> {
    stream: D::Stream,
    handle: D::Handle,
}

impl<D: DnnDevice> ExecutionContext<D> {
    pub fn stream(&self) -> &D::Stream {
        &self.stream
    }

    pub fn handle(&self) -> &D::Handle {
        &self.handle
    }
}

impl<D: DnnDevice> fmt::Debug for ExecutionContext<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("stream", &self.stream)
            .field("handle", &self.handle)
            .finish()
    }
}

/// Fixed-size set of execution contexts, indexed `g * streams_per_group + s`.
pub struct ExecutionContextPool<D: DnnDevice> {
    contexts: Vec<ExecutionContext<D>>,
}

impl<D: DnnDevice> ExecutionContextPool<D> {
    /// Create `count` contexts.
    ///
    /// # Errors
    ///
    /// `ConvError::ContextCreation` naming the first index that failed.
    /// Contexts created before the failure are destroyed first, so a failed
    /// call leaves nothing live on the device.
    pub fn create(device: &D, count: usize) -> ConvResult<Self> {
        let mut pool = Self {
            contexts: Vec::with_capacity(count),
        };

        for index in 0..count {
            match Self::create_one(device) {
                Ok(ctx) => pool.contexts.push(ctx),
                Err(e) => {
                    let created = pool.contexts.len();
                    pool.destroy(device);
                    warn!(
                        target: "cudnn_conv::context",
                        index,
                        released = created,
                        error = %e,
                        "Execution context creation failed"
                    );
                    return Err(ConvError::ContextCreation {
                        index,
                        message: e.to_string(),
                    });
                }
            }
        }

        debug!(target: "cudnn_conv::context", count, device = %device.name(), "Execution contexts ready");
        Ok(pool)
    }

    fn create_one(device: &D) -> ConvResult<ExecutionContext<D>> {
        let stream = device.create_stream()?;
        match device.create_handle(&stream) {
            Ok(handle) => Ok(ExecutionContext { stream, handle }),
            Err(e) => {
                if let Err(release) = device.destroy_stream(stream) {
                    warn!(target: "cudnn_conv::context", error = %release, "Failed to destroy orphaned stream");
                }
                Err(e)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ExecutionContext<D>> {
        self.contexts.get(index)
    }

    pub fn handle(&self, index: usize) -> Option<&D::Handle> {
        self.contexts.get(index).map(ExecutionContext::handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExecutionContext<D>> {
        self.contexts.iter()
    }

    /// Destroy every handle, then its stream. Release failures are logged
    /// and counted, never propagated.
    pub fn destroy(self, device: &D) -> usize {
        let mut failures = 0;
        for (index, ctx) in self.contexts.into_iter().enumerate() {
            if let Err(e) = device.destroy_handle(ctx.handle) {
                failures += 1;
                warn!(target: "cudnn_conv::context", index, error = %e, "Failed to destroy handle");
            }
            if let Err(e) = device.destroy_stream(ctx.stream) {
                failures += 1;
                warn!(target: "cudnn_conv::context", index, error = %e, "Failed to destroy stream");
            }
        }
        failures
    }
}

impl<D: DnnDevice> fmt::Debug for ExecutionContextPool<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.contexts.iter()).finish()
    }
}
