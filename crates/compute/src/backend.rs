use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use crate::buffer::{AccessMode, BufferHandle, ElementType};
use crate::Result;

#[cfg(feature = "cpu")]
pub mod cpu;
#[cfg(feature = "opencl")]
pub mod opencl;

/// A device plus its single in-order command queue.
///
/// Everything enqueued runs in enqueue order; `enqueue_*` return without
/// waiting, `read` and `finish` block until the queue has drained.
pub trait ComputeBackend: Sized + 'static {
    /// Device allocation backing one buffer.
    type Memory;
    /// A compiled kernel with its argument slots.
    type Kernel;
    /// Backend specific construction input.
    type Options;

    /// Selects a device matching `category`. No fallback to another category.
    ///
    /// # Errors
    ///
    /// Returns `ComputeError::DeviceNotFound` when nothing matches.
    fn open(category: &DeviceCategory, options: Self::Options) -> Result<Self>;

    fn info(&self) -> &DeviceInfo;

    /// Compiles `source` and extracts the kernel called `name`.
    ///
    /// # Errors
    ///
    /// Returns `ComputeError::KernelCompile` carrying the compiler diagnostic.
    fn build_kernel(&self, name: &str, source: &str, build_options: &str) -> Result<Self::Kernel>;

    /// Allocates `len` four-byte elements.
    ///
    /// # Errors
    ///
    /// Fails when the device refuses the allocation.
    fn allocate(&self, element: ElementType, len: usize, access: AccessMode) -> Result<Self::Memory>;

    /// Attaches `arg` to argument slot `index`, replacing what was there.
    ///
    /// # Errors
    ///
    /// Fails when the device rejects the argument.
    fn set_arg(&self, kernel: &mut Self::Kernel, index: u32, arg: KernelArg<'_, Self>) -> Result<()>;

    /// Enqueues a non-blocking host to device copy of `words`.
    ///
    /// # Errors
    ///
    /// Fails when the enqueue is rejected.
    fn enqueue_write(&self, memory: &Self::Memory, words: &[u32]) -> Result<()>;

    /// Enqueues a 1-D range launch over `[0, global)` in groups of `local`.
    ///
    /// # Errors
    ///
    /// Fails when the enqueue is rejected.
    fn enqueue_kernel(&self, kernel: &Self::Kernel, global: usize, local: usize) -> Result<()>;

    /// Blocking device to host copy into `words`, after everything enqueued before it.
    ///
    /// # Errors
    ///
    /// Reports failures of the read or of any command it waited for.
    fn read(&self, memory: &Self::Memory, words: &mut [u32]) -> Result<()>;

    /// Blocks until the queue is empty.
    ///
    /// # Errors
    ///
    /// Reports failures of any command it waited for.
    fn finish(&self) -> Result<()>;
}

/// A value attached to one kernel argument slot.
pub enum KernelArg<'a, B: ComputeBackend> {
    Int(i32),
    Long(i64),
    Float(f32),
    Buffer(&'a BufferHandle<B>),
    /// Work-group local scratch of the given size; no host data behind it.
    Local { bytes: usize },
}

/// Device category token used to pick a platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum DeviceCategory {
    #[default]
    Any,
    Gpu,
    Cpu,
    /// Platform name, compared case-insensitively.
    Vendor(String),
}

impl DeviceCategory {
    #[must_use]
    pub fn parse(token: &str) -> Self {
        let token = token.trim();
        if token.is_empty() || token.eq_ignore_ascii_case("any") {
            Self::Any
        } else if ["gpu", "graphics", "graphics processor"]
            .iter()
            .any(|t| token.eq_ignore_ascii_case(t))
        {
            Self::Gpu
        } else if ["cpu", "processor"].iter().any(|t| token.eq_ignore_ascii_case(t)) {
            Self::Cpu
        } else if token.eq_ignore_ascii_case("nvidia") {
            Self::Vendor("NVIDIA CUDA".to_owned())
        } else {
            Self::Vendor(token.to_owned())
        }
    }

    /// Whether a platform with the given name and device types satisfies the category.
    #[must_use]
    pub fn matches_platform(&self, platform_name: &str, device_types: &[DeviceType]) -> bool {
        match self {
            Self::Any => !device_types.is_empty(),
            Self::Gpu => device_types.contains(&DeviceType::Gpu),
            Self::Cpu => device_types.contains(&DeviceType::Cpu),
            Self::Vendor(name) => platform_name.trim().eq_ignore_ascii_case(name),
        }
    }
}

impl FromStr for DeviceCategory {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl fmt::Display for DeviceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("any"),
            Self::Gpu => f.write_str("GPU"),
            Self::Cpu => f.write_str("CPU"),
            Self::Vendor(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Cpu,
    Gpu,
    Accelerator,
    Other,
}

/// Capabilities of the selected device, for logs and capacity checks.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub platform: String,
    pub name: String,
    pub vendor: String,
    pub device_type: DeviceType,
    pub compute_units: u32,
    pub clock_mhz: u32,
    pub global_mem_bytes: u64,
    pub max_alloc_bytes: u64,
    pub max_work_group_size: usize,
}
