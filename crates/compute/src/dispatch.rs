//! Uploads, launches and blocking readback.

use tracing::{debug, info, warn};

use crate::backend::ComputeBackend;
use crate::binder;
use crate::buffer::{BufferHandle, Element};
use crate::context::ComputeContext;
use crate::signature::MemoryScope;
use crate::{ComputeError, Result};

/// Validates a 1-D launch shape against the device limit.
///
/// # Errors
///
/// `InvalidWorkSize` for zero sizes, a local size that does not divide the
/// global size, or one above `max_local`.
pub fn check_work_size(global: usize, local: usize, max_local: usize) -> Result<()> {
    let reason = if global == 0 || local == 0 {
        "work sizes must be non-zero"
    } else if global % local != 0 {
        "local size must divide global size"
    } else if local > max_local {
        "local size exceeds the device work-group limit"
    } else {
        return Ok(());
    };
    Err(ComputeError::InvalidWorkSize {
        global,
        local,
        reason,
    })
}

impl<B: ComputeBackend> ComputeContext<B> {
    /// Enqueues pending uploads of the kernel's buffers, in signature order,
    /// then a launch over `[0, global)` in groups of `local`. Returns without
    /// waiting.
    ///
    /// Buffers whose host contents have not changed since their last upload
    /// are not sent again, so a buffer shared by several kernels is uploaded
    /// once per change. [`Self::rebind`] schedules every attached buffer, so
    /// the dispatch after it uploads all of them.
    ///
    /// # Errors
    ///
    /// `ArgumentBindingIncomplete` when any position is unbound or a bound
    /// buffer was replaced since the last bind, `UnusedResources` when the
    /// pool gained resources after binding, `InvalidWorkSize`, or a rejected
    /// enqueue.
    pub fn dispatch(&self, kernel: &str, global: usize, local: usize) -> Result<()> {
        let record = self.kernel(kernel)?;
        binder::assert_complete(record)
            .inspect_err(|err| warn!(kernel, %err, "dispatch refused"))?;
        check_work_size(global, local, self.backend.info().max_work_group_size)?;

        let mut uploads = 0usize;
        for (&resource, descriptor) in record.bound.iter().zip(record.signature.iter()) {
            if descriptor.scope == MemoryScope::Local {
                continue;
            }
            let Some(handle) = record.bound_buffer(resource) else {
                continue;
            };
            if self.upload(handle)? {
                uploads += 1;
            }
        }
        self.backend.enqueue_kernel(&record.kernel, global, local)?;
        debug!(kernel, global, local, uploads, "dispatched");
        Ok(())
    }

    fn upload(&self, handle: &BufferHandle<B>) -> Result<bool> {
        let Some(words) = handle.take_pending_upload() else {
            return Ok(false);
        };
        self.backend
            .enqueue_write(handle.memory(), &words)
            .inspect_err(|_| handle.mark_upload_pending())?;
        Ok(true)
    }

    /// Blocking read of `count` elements of buffer `slot` of `kernel`.
    ///
    /// The device contents replace the host mirror; the values are taken from
    /// the read cursor and the cursor is rewound afterwards, also on error.
    ///
    /// # Errors
    ///
    /// Unknown kernel or slot, a failed read, or `ReadOutOfRange` when `count`
    /// exceeds the buffer.
    pub fn read_buffer<T: Element>(&self, kernel: &str, slot: usize, count: usize) -> Result<Vec<T>> {
        let handle = self.buffer(kernel, T::TYPE, slot)?;
        // Host writes not yet sent would be lost to the read.
        self.upload(&handle)?;
        {
            let mut host = handle.host();
            self.backend.read(handle.memory(), &mut host.words)?;
        }
        let values = handle.take::<T>(count);
        handle.rewind();
        values
    }

    /// # Errors
    ///
    /// See [`Self::read_buffer`].
    pub fn read_int_buffer(&self, kernel: &str, slot: usize, count: usize) -> Result<Vec<i32>> {
        self.read_buffer(kernel, slot, count)
    }

    /// # Errors
    ///
    /// See [`Self::read_buffer`].
    pub fn read_float_buffer(&self, kernel: &str, slot: usize, count: usize) -> Result<Vec<f32>> {
        self.read_buffer(kernel, slot, count)
    }

    /// [`Self::read_buffer`] that also logs every element.
    ///
    /// # Errors
    ///
    /// See [`Self::read_buffer`].
    pub fn dump_buffer<T: Element>(&self, kernel: &str, slot: usize, count: usize) -> Result<Vec<T>> {
        let values = self.read_buffer::<T>(kernel, slot, count)?;
        for (index, value) in values.iter().enumerate() {
            info!(kernel, slot, index, %value, "buffer element");
        }
        Ok(values)
    }
}
