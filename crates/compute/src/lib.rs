#![deny(clippy::all)]
#![warn(clippy::pedantic)]

//! Host-side management of compute kernels: device selection, signature
//! inference from kernel source, per-kernel resource pools, positional
//! argument binding and in-order dispatch with blocking readback.

pub mod backend;
pub mod binder;
pub mod buffer;
pub mod config;
pub mod context;
pub mod dispatch;
mod error;
pub mod kernels;
pub mod pool;
pub mod signature;

pub use backend::{ComputeBackend, DeviceCategory, DeviceInfo, DeviceType, KernelArg};
pub use binder::{BindCursor, ResourceRef};
pub use buffer::{AccessMode, BufferHandle, DeviceBuffer, Element, ElementType, Fill};
pub use config::ContextConfig;
pub use context::{ComputeContext, KernelRecord};
pub use dispatch::check_work_size;
pub use error::{ComputeError, Result};
pub use pool::ResourcePool;
pub use signature::{
    ArgumentDescriptor, ArgumentKind, KernelSignature, MemoryScope, SignatureError,
};

#[cfg(feature = "cpu")]
pub use backend::cpu::{CpuBackend, HostKernelLibrary, WorkItem};
#[cfg(feature = "opencl")]
pub use backend::opencl::{OpenClBackend, OpenClOptions};
