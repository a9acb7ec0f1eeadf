//! Device buffers and their host-visible mirrors.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::ComputeBackend;
use crate::{ComputeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Int,
    Float,
}

impl ElementType {
    #[must_use]
    pub const fn size_in_bytes(self) -> usize {
        4
    }
}

/// Access granted to kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AccessMode {
    #[default]
    ReadWrite,
    ReadOnly,
    WriteOnly,
}

impl AccessMode {
    /// Legacy numeric codes: 0 read-write, 1 read-only, 2 write-only.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::ReadWrite),
            1 => Some(Self::ReadOnly),
            2 => Some(Self::WriteOnly),
            _ => None,
        }
    }

    #[must_use]
    pub const fn kernel_writable(self) -> bool {
        !matches!(self, Self::ReadOnly)
    }
}

/// Host element types that can live in a buffer.
pub trait Element: bytemuck::Pod + fmt::Debug + fmt::Display {
    const TYPE: ElementType;
}

impl Element for i32 {
    const TYPE: ElementType = ElementType::Int;
}

impl Element for f32 {
    const TYPE: ElementType = ElementType::Float;
}

/// Initial contents of a new buffer.
#[derive(Debug, Clone, Copy)]
pub enum Fill<'a, T> {
    Zeroed,
    Broadcast(T),
    /// Must have exactly the buffer's length.
    Exact(&'a [T]),
    /// Element `i` is `source[i % source.len()]`.
    Tiled(&'a [T]),
}

impl<T: Element> Fill<'_, T> {
    pub(crate) fn materialize(&self, len: usize) -> Result<Vec<u32>> {
        let mut words = vec![0u32; len];
        let view: &mut [T] = bytemuck::cast_slice_mut(&mut words);
        match *self {
            Fill::Zeroed => {}
            Fill::Broadcast(value) => view.fill(value),
            Fill::Exact(source) => {
                if source.len() != len {
                    return Err(ComputeError::FillLength {
                        expected: len,
                        found: source.len(),
                    });
                }
                view.copy_from_slice(source);
            }
            Fill::Tiled(source) => {
                if source.is_empty() {
                    return Err(ComputeError::EmptyTileSource);
                }
                for (i, slot) in view.iter_mut().enumerate() {
                    *slot = source[i % source.len()];
                }
            }
        }
        Ok(words)
    }
}

/// Host copy of a buffer plus the read cursor used by partial reads.
#[derive(Debug, Default)]
pub(crate) struct HostMirror {
    pub(crate) words: Vec<u32>,
    position: usize,
}

impl HostMirror {
    fn take<T: Element>(&mut self, count: usize) -> Result<Vec<T>> {
        let end = self.position + count;
        if end > self.words.len() {
            return Err(ComputeError::ReadOutOfRange {
                requested: count,
                position: self.position,
                len: self.words.len(),
            });
        }
        let values: &[T] = bytemuck::cast_slice(&self.words[self.position..end]);
        self.position = end;
        Ok(values.to_vec())
    }

    fn rewind(&mut self) {
        self.position = 0;
    }
}

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(0);

/// Shared handle to a device buffer. Kernel pools that alias a buffer hold
/// clones of the same handle; the allocation is released with the last one.
pub type BufferHandle<B> = Arc<DeviceBuffer<B>>;

pub struct DeviceBuffer<B: ComputeBackend> {
    id: u64,
    element: ElementType,
    len: usize,
    access: AccessMode,
    memory: B::Memory,
    host: Mutex<HostMirror>,
    upload_pending: AtomicBool,
}

impl<B: ComputeBackend> DeviceBuffer<B> {
    pub(crate) fn new(
        memory: B::Memory,
        element: ElementType,
        access: AccessMode,
        words: Vec<u32>,
    ) -> BufferHandle<B> {
        Arc::new(Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            element,
            len: words.len(),
            access,
            memory,
            host: Mutex::new(HostMirror { words, position: 0 }),
            upload_pending: AtomicBool::new(true),
        })
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn element(&self) -> ElementType {
        self.element
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn access(&self) -> AccessMode {
        self.access
    }

    #[must_use]
    pub fn size_in_bytes(&self) -> usize {
        self.len * self.element.size_in_bytes()
    }

    /// Whether host contents still have to reach the device.
    #[must_use]
    pub fn upload_pending(&self) -> bool {
        self.upload_pending.load(Ordering::Acquire)
    }

    pub(crate) fn memory(&self) -> &B::Memory {
        &self.memory
    }

    pub(crate) fn mark_upload_pending(&self) {
        self.upload_pending.store(true, Ordering::Release);
    }

    /// Host words to upload if an upload is pending; clears the flag.
    pub(crate) fn take_pending_upload(&self) -> Option<Vec<u32>> {
        self.upload_pending
            .swap(false, Ordering::AcqRel)
            .then(|| self.host.lock().words.clone())
    }

    pub(crate) fn host(&self) -> parking_lot::MutexGuard<'_, HostMirror> {
        self.host.lock()
    }

    /// Reads `count` host elements at the cursor and advances it.
    ///
    /// # Errors
    ///
    /// Fails on an element type mismatch or when fewer than `count` elements
    /// remain after the cursor.
    pub fn take<T: Element>(&self, count: usize) -> Result<Vec<T>> {
        self.check_element::<T>()?;
        self.host.lock().take(count)
    }

    /// Moves the read cursor back to the first element.
    pub fn rewind(&self) {
        self.host.lock().rewind();
    }

    #[must_use]
    pub fn position(&self) -> usize {
        self.host.lock().position
    }

    /// Overwrites host elements starting at `offset` and marks the buffer for upload.
    ///
    /// # Errors
    ///
    /// Fails on an element type mismatch or when the write runs past the end.
    pub fn write<T: Element>(&self, offset: usize, values: &[T]) -> Result<()> {
        self.check_element::<T>()?;
        let mut host = self.host.lock();
        let end = offset + values.len();
        if end > host.words.len() {
            return Err(ComputeError::ReadOutOfRange {
                requested: values.len(),
                position: offset,
                len: host.words.len(),
            });
        }
        let view: &mut [T] = bytemuck::cast_slice_mut(&mut host.words[offset..end]);
        view.copy_from_slice(values);
        drop(host);
        self.mark_upload_pending();
        Ok(())
    }

    /// Copy of the whole host mirror.
    ///
    /// # Errors
    ///
    /// Fails on an element type mismatch.
    pub fn host_values<T: Element>(&self) -> Result<Vec<T>> {
        self.check_element::<T>()?;
        Ok(bytemuck::cast_slice(&self.host.lock().words).to_vec())
    }

    pub(crate) fn check_element<T: Element>(&self) -> Result<()> {
        if T::TYPE == self.element {
            Ok(())
        } else {
            Err(ComputeError::ElementMismatch {
                expected: T::TYPE,
                found: self.element,
            })
        }
    }
}

impl<B: ComputeBackend> fmt::Debug for DeviceBuffer<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("id", &self.id)
            .field("element", &self.element)
            .field("len", &self.len)
            .field("access", &self.access)
            .field("upload_pending", &self.upload_pending())
            .finish_non_exhaustive()
    }
}
