use std::env;
use std::ffi::OsString;
use std::path::PathBuf;

use crate::backend::DeviceCategory;

/// Device category token, e.g. `GPU`, `CPU` or a platform name.
pub const DEVICE_ENV: &str = "COMPUTE_DEVICE";
/// Kernel source search path, in the platform's `PATH` syntax.
pub const KERNEL_PATH_ENV: &str = "COMPUTE_KERNEL_PATH";

/// Programmatic setup for a [`crate::ComputeContext`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    pub device: DeviceCategory,
    /// Directories searched, in order, for `<kernel>.cl`.
    pub kernel_dirs: Vec<PathBuf>,
    /// Passed verbatim to the device compiler.
    pub build_options: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            device: DeviceCategory::Any,
            kernel_dirs: vec![PathBuf::from("kernels"), PathBuf::from("src/kernels")],
            build_options: String::new(),
        }
    }
}

impl ContextConfig {
    /// Defaults overlaid with `COMPUTE_DEVICE` and `COMPUTE_KERNEL_PATH`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().overlay(|key| env::var_os(key))
    }

    fn overlay(mut self, lookup: impl Fn(&str) -> Option<OsString>) -> Self {
        if let Some(device) = lookup(DEVICE_ENV) {
            self.device = DeviceCategory::parse(&device.to_string_lossy());
        }
        if let Some(path) = lookup(KERNEL_PATH_ENV) {
            let dirs: Vec<PathBuf> = env::split_paths(&path)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
            if !dirs.is_empty() {
                self.kernel_dirs = dirs;
            }
        }
        self
    }

    #[must_use]
    pub fn with_device(mut self, device: DeviceCategory) -> Self {
        self.device = device;
        self
    }

    /// Searches `dir` before the current directories.
    #[must_use]
    pub fn with_kernel_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.kernel_dirs.insert(0, dir.into());
        self
    }

    #[must_use]
    pub fn with_build_options(mut self, options: impl Into<String>) -> Self {
        self.build_options = options.into();
        self
    }
}
