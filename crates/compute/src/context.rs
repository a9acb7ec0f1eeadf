//! Device context and kernel registry.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::backend::{ComputeBackend, DeviceInfo};
use crate::binder::{self, BindMode, ResourceRef};
use crate::buffer::{AccessMode, BufferHandle, DeviceBuffer, Element, ElementType, Fill};
use crate::config::ContextConfig;
use crate::pool::ResourcePool;
use crate::signature::{self, KernelSignature};
use crate::{ComputeError, Result};

/// Everything the context knows about one registered kernel.
pub struct KernelRecord<B: ComputeBackend> {
    pub(crate) name: String,
    pub(crate) kernel: B::Kernel,
    pub(crate) signature: KernelSignature,
    pub(crate) pool: ResourcePool<B>,
    /// Pool slot attached to each argument position, in signature order.
    pub(crate) bound: Vec<ResourceRef>,
    pub(crate) complete: bool,
    /// First argument position whose buffer was replaced after binding.
    /// Dispatch is refused until a rebind attaches the new buffer.
    pub(crate) stale: Option<usize>,
}

impl<B: ComputeBackend> KernelRecord<B> {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn signature(&self) -> &KernelSignature {
        &self.signature
    }

    #[must_use]
    pub fn pool(&self) -> &ResourcePool<B> {
        &self.pool
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.complete
    }

    /// Records that the buffer in `slot` changed under a bound kernel.
    fn replaced_buffer(&mut self, element: ElementType, slot: usize) -> Option<usize> {
        if !self.complete {
            return None;
        }
        let resource = match element {
            ElementType::Int => ResourceRef::IntBuffer(slot),
            ElementType::Float => ResourceRef::FloatBuffer(slot),
        };
        let position = self.bound.iter().position(|&bound| bound == resource)?;
        self.stale = Some(self.stale.map_or(position, |earlier| earlier.min(position)));
        Some(position)
    }

    pub(crate) fn bound_buffer(&self, resource: ResourceRef) -> Option<&BufferHandle<B>> {
        match resource {
            ResourceRef::IntBuffer(slot) => self.pool.buffer(ElementType::Int, slot),
            ResourceRef::FloatBuffer(slot) => self.pool.buffer(ElementType::Float, slot),
            _ => None,
        }
    }
}

/// One device, one queue, and the kernels registered on it.
///
/// Dropping the context releases the device. Buffer handles cloned out of it
/// stay valid as host objects but must not be used with another context.
pub struct ComputeContext<B: ComputeBackend> {
    pub(crate) backend: B,
    config: ContextConfig,
    pub(crate) kernels: HashMap<String, KernelRecord<B>>,
}

impl<B: ComputeBackend + std::fmt::Debug> std::fmt::Debug for ComputeContext<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeContext")
            .field("backend", &self.backend)
            .field("config", &self.config)
            .field("kernels", &self.kernels.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<B: ComputeBackend> ComputeContext<B> {
    /// Opens the device named by `config.device`.
    ///
    /// # Errors
    ///
    /// `DeviceNotFound` when no platform matches; there is no fallback.
    pub fn open(config: ContextConfig, options: B::Options) -> Result<Self> {
        let backend = B::open(&config.device, options)?;
        let device = backend.info();
        info!(
            platform = %device.platform,
            device = %device.name,
            category = %config.device,
            "compute context ready"
        );
        Ok(Self::with_backend(backend, config))
    }

    #[must_use]
    pub fn with_backend(backend: B, config: ContextConfig) -> Self {
        Self {
            backend,
            config,
            kernels: HashMap::new(),
        }
    }

    /// Drains the queue and releases the device.
    ///
    /// # Errors
    ///
    /// Reports a failure of any command still queued.
    pub fn close(self) -> Result<()> {
        let outcome = self.backend.finish();
        debug!(kernels = self.kernels.len(), "compute context closed");
        outcome
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    #[must_use]
    pub fn device(&self) -> &DeviceInfo {
        self.backend.info()
    }

    #[must_use]
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn kernel_names(&self) -> impl Iterator<Item = &str> {
        self.kernels.keys().map(String::as_str)
    }

    /// Locates the source of `name`. `hint` may be a file or a directory
    /// holding `<name>.cl`; without it the configured directories are searched.
    ///
    /// # Errors
    ///
    /// `KernelSourceNotFound` listing every path tried.
    pub fn locate_source(&self, name: &str, hint: Option<&Path>) -> Result<PathBuf> {
        let file_name = format!("{name}.cl");
        let candidates: Vec<PathBuf> = match hint {
            Some(path) if path.is_dir() => vec![path.join(&file_name)],
            Some(path) => vec![path.to_path_buf()],
            None => self
                .config
                .kernel_dirs
                .iter()
                .map(|dir| dir.join(&file_name))
                .collect(),
        };
        if let Some(found) = candidates.iter().find(|path| path.is_file()) {
            return Ok(found.clone());
        }
        Err(ComputeError::KernelSourceNotFound {
            kernel: name.to_owned(),
            searched: candidates,
        })
    }

    /// Loads, parses and compiles kernel `name` from disk.
    ///
    /// # Errors
    ///
    /// Source lookup and read failures, `Signature` for an unparseable
    /// parameter list and `KernelCompile` with the compiler diagnostic.
    pub fn register_kernel(&mut self, name: &str, hint: Option<&Path>) -> Result<&KernelSignature> {
        let path = self.locate_source(name, hint)?;
        let source = fs::read_to_string(&path).map_err(|source| ComputeError::KernelSourceRead {
            path: path.clone(),
            source,
        })?;
        debug!(kernel = name, path = %path.display(), "loaded kernel source");
        self.register_kernel_source(name, &source)
    }

    /// Parses and compiles kernel `name` from `source`.
    ///
    /// Registering an existing name replaces its program and clears its
    /// binding; the resource pool, including aliases, is kept.
    ///
    /// # Errors
    ///
    /// `Signature` for an unparseable parameter list, `KernelCompile` with the
    /// compiler diagnostic.
    pub fn register_kernel_source(&mut self, name: &str, source: &str) -> Result<&KernelSignature> {
        let signature =
            signature::parse_kernel(source, Some(name)).map_err(|source| ComputeError::Signature {
                kernel: name.to_owned(),
                source,
            })?;
        let kernel = self
            .backend
            .build_kernel(name, source, &self.config.build_options)
            .inspect_err(|err| warn!(kernel = name, %err, "kernel build failed"))?;
        info!(kernel = name, arguments = signature.len(), "registered kernel");

        let pool = self
            .kernels
            .remove(name)
            .map(|previous| previous.pool)
            .unwrap_or_default();
        let record = self.kernels.entry(name.to_owned()).or_insert(KernelRecord {
            name: name.to_owned(),
            kernel,
            signature,
            pool,
            bound: Vec::new(),
            complete: false,
            stale: None,
        });
        Ok(&record.signature)
    }

    /// # Errors
    ///
    /// `UnknownKernel` when `name` was never registered.
    pub fn kernel(&self, name: &str) -> Result<&KernelRecord<B>> {
        self.kernels
            .get(name)
            .ok_or_else(|| ComputeError::UnknownKernel(name.to_owned()))
    }

    pub(crate) fn kernel_mut(&mut self, name: &str) -> Result<&mut KernelRecord<B>> {
        self.kernels
            .get_mut(name)
            .ok_or_else(|| ComputeError::UnknownKernel(name.to_owned()))
    }

    /// # Errors
    ///
    /// `UnknownKernel` when `name` was never registered.
    pub fn signature(&self, name: &str) -> Result<&KernelSignature> {
        self.kernel(name).map(KernelRecord::signature)
    }

    fn create_buffer<T: Element>(
        &mut self,
        kernel: &str,
        slot: usize,
        len: usize,
        access: AccessMode,
        fill: Fill<'_, T>,
    ) -> Result<BufferHandle<B>> {
        let words = fill.materialize(len)?;
        // Look the kernel up before allocating device memory.
        self.kernel(kernel)?;
        let memory = self.backend.allocate(T::TYPE, len, access)?;
        let handle = DeviceBuffer::<B>::new(memory, T::TYPE, access, words);
        let record = self.kernel_mut(kernel)?;
        if record.pool.insert_buffer(slot, handle.clone()).is_some() {
            if let Some(position) = record.replaced_buffer(T::TYPE, slot) {
                warn!(kernel, slot, position, "replaced a bound buffer; dispatch refused until rebind");
            }
        }
        debug!(kernel, slot, len, element = ?T::TYPE, ?access, "created buffer");
        Ok(handle)
    }

    /// Allocates an int buffer of `len` elements in `slot` of `kernel`'s pool.
    ///
    /// # Errors
    ///
    /// `UnknownKernel`, fill errors, or a refused allocation.
    pub fn create_int_buffer(
        &mut self,
        kernel: &str,
        slot: usize,
        len: usize,
        access: AccessMode,
        fill: Fill<'_, i32>,
    ) -> Result<BufferHandle<B>> {
        self.create_buffer(kernel, slot, len, access, fill)
    }

    /// Allocates a float buffer of `len` elements in `slot` of `kernel`'s pool.
    ///
    /// # Errors
    ///
    /// `UnknownKernel`, fill errors, or a refused allocation.
    pub fn create_float_buffer(
        &mut self,
        kernel: &str,
        slot: usize,
        len: usize,
        access: AccessMode,
        fill: Fill<'_, f32>,
    ) -> Result<BufferHandle<B>> {
        self.create_buffer(kernel, slot, len, access, fill)
    }

    /// # Errors
    ///
    /// `UnknownKernel` or `SlotOutOfRange` when the slot holds no buffer of `element`.
    pub fn buffer(&self, kernel: &str, element: ElementType, slot: usize) -> Result<BufferHandle<B>> {
        self.kernel(kernel)?
            .pool
            .buffer(element, slot)
            .cloned()
            .ok_or_else(|| ComputeError::SlotOutOfRange {
                kernel: kernel.to_owned(),
                what: match element {
                    ElementType::Int => "int buffer",
                    ElementType::Float => "float buffer",
                },
                slot,
            })
    }

    /// Overwrites host elements of an int buffer from `offset`; uploaded on next use.
    ///
    /// # Errors
    ///
    /// Unknown kernel or slot, or a write past the end.
    pub fn write_int_buffer(
        &self,
        kernel: &str,
        slot: usize,
        offset: usize,
        values: &[i32],
    ) -> Result<()> {
        self.buffer(kernel, ElementType::Int, slot)?.write(offset, values)
    }

    /// Overwrites host elements of a float buffer from `offset`; uploaded on next use.
    ///
    /// # Errors
    ///
    /// Unknown kernel or slot, or a write past the end.
    pub fn write_float_buffer(
        &self,
        kernel: &str,
        slot: usize,
        offset: usize,
        values: &[f32],
    ) -> Result<()> {
        self.buffer(kernel, ElementType::Float, slot)?.write(offset, values)
    }

    /// Sets or overwrites int scalar `slot`.
    ///
    /// # Errors
    ///
    /// `UnknownKernel`.
    pub fn create_int_arg(&mut self, kernel: &str, slot: usize, value: i32) -> Result<()> {
        self.kernel_mut(kernel)?.pool.set_int(slot, value);
        Ok(())
    }

    /// Sets or overwrites float scalar `slot`.
    ///
    /// # Errors
    ///
    /// `UnknownKernel`.
    pub fn create_float_arg(&mut self, kernel: &str, slot: usize, value: f32) -> Result<()> {
        self.kernel_mut(kernel)?.pool.set_float(slot, value);
        Ok(())
    }

    /// Sets or overwrites long scalar `slot`.
    ///
    /// # Errors
    ///
    /// `UnknownKernel`.
    pub fn create_long_arg(&mut self, kernel: &str, slot: usize, value: i64) -> Result<()> {
        self.kernel_mut(kernel)?.pool.set_long(slot, value);
        Ok(())
    }

    /// # Errors
    ///
    /// `UnknownKernel` or an empty slot.
    pub fn int_arg(&self, kernel: &str, slot: usize) -> Result<i32> {
        self.kernel(kernel)?.pool.int(slot).ok_or_else(|| ComputeError::SlotOutOfRange {
            kernel: kernel.to_owned(),
            what: "int argument",
            slot,
        })
    }

    /// # Errors
    ///
    /// `UnknownKernel` or an empty slot.
    pub fn float_arg(&self, kernel: &str, slot: usize) -> Result<f32> {
        self.kernel(kernel)?.pool.float(slot).ok_or_else(|| ComputeError::SlotOutOfRange {
            kernel: kernel.to_owned(),
            what: "float argument",
            slot,
        })
    }

    /// # Errors
    ///
    /// `UnknownKernel` or an empty slot.
    pub fn long_arg(&self, kernel: &str, slot: usize) -> Result<i64> {
        self.kernel(kernel)?.pool.long(slot).ok_or_else(|| ComputeError::SlotOutOfRange {
            kernel: kernel.to_owned(),
            what: "long argument",
            slot,
        })
    }

    /// Installs the buffer in `src_kernel`'s `src_slot` into `dst_kernel`'s
    /// `dst_slot`. Both pools then share one device allocation.
    ///
    /// # Errors
    ///
    /// `AliasResolution` when the source slot holds no buffer of `element`,
    /// `UnknownKernel` for the destination.
    pub fn alias_buffer(
        &mut self,
        element: ElementType,
        src_kernel: &str,
        src_slot: usize,
        dst_kernel: &str,
        dst_slot: usize,
    ) -> Result<BufferHandle<B>> {
        let handle = self
            .kernels
            .get(src_kernel)
            .and_then(|record| record.pool.buffer(element, src_slot))
            .cloned()
            .ok_or_else(|| ComputeError::AliasResolution {
                kernel: src_kernel.to_owned(),
                element,
                slot: src_slot,
            })?;
        let record = self.kernel_mut(dst_kernel)?;
        if record.pool.insert_buffer(dst_slot, handle.clone()).is_some() {
            if let Some(position) = record.replaced_buffer(element, dst_slot) {
                warn!(
                    kernel = dst_kernel,
                    slot = dst_slot,
                    position,
                    "alias replaced a bound buffer; dispatch refused until rebind"
                );
            }
        }
        debug!(
            src_kernel,
            src_slot,
            dst_kernel,
            dst_slot,
            buffer = handle.id(),
            "aliased buffer"
        );
        Ok(handle)
    }

    /// # Errors
    ///
    /// See [`Self::alias_buffer`].
    pub fn alias_int_buffer(
        &mut self,
        src_kernel: &str,
        src_slot: usize,
        dst_kernel: &str,
        dst_slot: usize,
    ) -> Result<BufferHandle<B>> {
        self.alias_buffer(ElementType::Int, src_kernel, src_slot, dst_kernel, dst_slot)
    }

    /// # Errors
    ///
    /// See [`Self::alias_buffer`].
    pub fn alias_float_buffer(
        &mut self,
        src_kernel: &str,
        src_slot: usize,
        dst_kernel: &str,
        dst_slot: usize,
    ) -> Result<BufferHandle<B>> {
        self.alias_buffer(ElementType::Float, src_kernel, src_slot, dst_kernel, dst_slot)
    }

    /// First-time bind of every argument position. Returns the bound count.
    ///
    /// # Errors
    ///
    /// `AlreadyBound` if arguments are bound, `ArgumentBindingIncomplete` or
    /// `UnusedResources` when the pool does not match the signature.
    pub fn bind(&mut self, kernel: &str) -> Result<usize> {
        let record = self
            .kernels
            .get_mut(kernel)
            .ok_or_else(|| ComputeError::UnknownKernel(kernel.to_owned()))?;
        binder::bind(&self.backend, record, BindMode::Fresh)
    }

    /// Rewrites every argument slot in place and schedules every attached
    /// buffer for upload on the next dispatch.
    ///
    /// # Errors
    ///
    /// `NotBound` without a prior complete bind, otherwise as [`Self::bind`].
    pub fn rebind(&mut self, kernel: &str) -> Result<usize> {
        let record = self
            .kernels
            .get_mut(kernel)
            .ok_or_else(|| ComputeError::UnknownKernel(kernel.to_owned()))?;
        binder::bind(&self.backend, record, BindMode::Rebind)
    }

    /// Rewrites scalar slots only, leaving buffers and their upload state alone.
    ///
    /// # Errors
    ///
    /// `NotBound` without a prior complete bind.
    pub fn rebind_scalars(&mut self, kernel: &str) -> Result<usize> {
        let record = self
            .kernels
            .get_mut(kernel)
            .ok_or_else(|| ComputeError::UnknownKernel(kernel.to_owned()))?;
        binder::bind(&self.backend, record, BindMode::Scalars)
    }

    /// # Errors
    ///
    /// `ArgumentBindingIncomplete` naming the first unmet position.
    pub fn assert_binding_complete(&self, kernel: &str) -> Result<()> {
        binder::assert_complete(self.kernel(kernel)?)
    }

    /// Bytes of device memory held by `kernel`'s buffers, aliases included.
    ///
    /// # Errors
    ///
    /// `UnknownKernel`.
    pub fn device_memory_used(&self, kernel: &str) -> Result<usize> {
        Ok(self.kernel(kernel)?.pool.buffer_bytes())
    }

    /// Blocks until everything enqueued has run.
    ///
    /// # Errors
    ///
    /// Reports a failure of any queued command.
    pub fn finish(&self) -> Result<()> {
        self.backend.finish()
    }
}
