//! Kernels shipped with the engine: OpenCL sources plus host bodies for the
//! CPU backend.

pub mod fill_float_buffer;
pub mod vector_add;

#[cfg(feature = "cpu")]
use crate::backend::cpu::HostKernelLibrary;

/// Host bodies for every kernel in this module.
#[cfg(feature = "cpu")]
#[must_use]
pub fn builtin_library() -> HostKernelLibrary {
    HostKernelLibrary::new()
        .with(vector_add::NAME, vector_add::run)
        .with(fill_float_buffer::NAME, fill_float_buffer::run)
}
