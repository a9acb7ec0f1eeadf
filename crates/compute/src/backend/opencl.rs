//! OpenCL backend on `opencl3`. One context, one in-order queue.

use std::fmt;
use std::ptr;
use std::sync::Arc;

use opencl3::command_queue::CommandQueue;
use opencl3::context::Context;
use opencl3::device::{
    Device, CL_DEVICE_TYPE_ACCELERATOR, CL_DEVICE_TYPE_ALL, CL_DEVICE_TYPE_CPU, CL_DEVICE_TYPE_GPU,
};
use opencl3::event::Event;
use opencl3::kernel::Kernel;
use opencl3::memory::{Buffer, ClMem, CL_MEM_READ_ONLY, CL_MEM_READ_WRITE, CL_MEM_WRITE_ONLY};
use opencl3::platform::get_platforms;
use opencl3::program::Program;
use opencl3::types::{cl_device_type, cl_uint, CL_BLOCKING, CL_NON_BLOCKING};
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::backend::{ComputeBackend, DeviceCategory, DeviceInfo, DeviceType, KernelArg};
use crate::buffer::{AccessMode, ElementType};
use crate::{ComputeError, Result};

/// No construction options; the platform is chosen from the category.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenClOptions;

pub struct OpenClMemory {
    buffer: Mutex<Buffer<cl_uint>>,
    len: usize,
}

impl fmt::Debug for OpenClMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenClMemory").field("len", &self.len).finish_non_exhaustive()
    }
}

pub struct OpenClKernel {
    name: String,
    kernel: Kernel,
    _program: Program,
}

impl fmt::Debug for OpenClKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenClKernel").field("name", &self.name).finish_non_exhaustive()
    }
}

/// A non-blocking write and the host words it reads from. The words must
/// outlive the transfer, so both stay here until the queue is drained.
struct StagedWrite {
    _words: Vec<u32>,
    event: Event,
}

pub struct OpenClBackend {
    info: DeviceInfo,
    context: Context,
    queue: CommandQueue,
    staged: Mutex<Vec<StagedWrite>>,
}

// SAFETY: the wrapped OpenCL handles are reference counted by the driver and
// the OpenCL runtime API is thread-safe for everything except kernel argument
// setting, which takes `&mut` here.
unsafe impl Send for OpenClBackend {}
unsafe impl Sync for OpenClBackend {}
unsafe impl Send for OpenClMemory {}
unsafe impl Sync for OpenClMemory {}
unsafe impl Send for OpenClKernel {}

impl fmt::Debug for OpenClBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenClBackend").field("info", &self.info).finish_non_exhaustive()
    }
}

fn cl_err(context: &str) -> impl Fn(opencl3::error_codes::ClError) -> ComputeError + '_ {
    move |err| ComputeError::Backend(format!("{context}: {err}"))
}

fn device_type(raw: cl_device_type) -> DeviceType {
    if raw & CL_DEVICE_TYPE_GPU != 0 {
        DeviceType::Gpu
    } else if raw & CL_DEVICE_TYPE_CPU != 0 {
        DeviceType::Cpu
    } else if raw & CL_DEVICE_TYPE_ACCELERATOR != 0 {
        DeviceType::Accelerator
    } else {
        DeviceType::Other
    }
}

fn describe(platform: &str, device: &Device) -> DeviceInfo {
    DeviceInfo {
        platform: platform.trim().to_owned(),
        name: device.name().unwrap_or_default().trim().to_owned(),
        vendor: device.vendor().unwrap_or_default().trim().to_owned(),
        device_type: device_type(device.dev_type().unwrap_or(0)),
        compute_units: device.max_compute_units().unwrap_or(0),
        clock_mhz: device.max_clock_frequency().unwrap_or(0),
        global_mem_bytes: device.global_mem_size().unwrap_or(0),
        max_alloc_bytes: device.max_mem_alloc_size().unwrap_or(0),
        max_work_group_size: device.max_work_group_size().unwrap_or(1),
    }
}

fn flops(info: &DeviceInfo) -> u64 {
    u64::from(info.compute_units) * u64::from(info.clock_mhz)
}

impl OpenClBackend {
    fn wait_staged(&self) -> Result<()> {
        let staged = std::mem::take(&mut *self.staged.lock());
        for write in &staged {
            write.event.wait().map_err(cl_err("buffer upload"))?;
        }
        Ok(())
    }
}

impl ComputeBackend for OpenClBackend {
    type Memory = Arc<OpenClMemory>;
    type Kernel = OpenClKernel;
    type Options = OpenClOptions;

    fn open(category: &DeviceCategory, _options: Self::Options) -> Result<Self> {
        let platforms = get_platforms().map_err(cl_err("platform query"))?;
        let mut available = Vec::new();
        let mut best: Option<(DeviceInfo, Device)> = None;
        for platform in &platforms {
            let platform_name = platform.name().unwrap_or_default();
            available.push(platform_name.trim().to_owned());
            let devices: Vec<(DeviceInfo, Device)> = platform
                .get_devices(CL_DEVICE_TYPE_ALL)
                .unwrap_or_default()
                .into_iter()
                .map(|id| {
                    let device = Device::new(id);
                    (describe(&platform_name, &device), device)
                })
                .collect();
            let types: Vec<DeviceType> = devices.iter().map(|(i, _)| i.device_type).collect();
            if !category.matches_platform(&platform_name, &types) {
                continue;
            }
            // First matching platform wins; within it, the fastest device.
            for (info, device) in devices {
                let wanted = match category {
                    DeviceCategory::Gpu => info.device_type == DeviceType::Gpu,
                    DeviceCategory::Cpu => info.device_type == DeviceType::Cpu,
                    DeviceCategory::Any | DeviceCategory::Vendor(_) => true,
                };
                debug!(platform = %info.platform, device = %info.name, wanted, "candidate device");
                if wanted && best.as_ref().map_or(true, |(b, _)| flops(&info) > flops(b)) {
                    best = Some((info, device));
                }
            }
            if best.is_some() {
                break;
            }
        }

        let Some((info, device)) = best else {
            return Err(ComputeError::DeviceNotFound {
                category: category.to_string(),
                available,
            });
        };
        let context = Context::from_device(&device).map_err(cl_err("context creation"))?;
        #[allow(deprecated)]
        let queue =
            CommandQueue::create_default(&context, 0).map_err(cl_err("command queue creation"))?;
        info!(
            platform = %info.platform,
            device = %info.name,
            compute_units = info.compute_units,
            clock_mhz = info.clock_mhz,
            global_mem_mb = info.global_mem_bytes >> 20,
            "opened OpenCL device"
        );
        Ok(Self {
            info,
            context,
            queue,
            staged: Mutex::new(Vec::new()),
        })
    }

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn build_kernel(&self, name: &str, source: &str, build_options: &str) -> Result<Self::Kernel> {
        let program = Program::create_and_build_from_source(&self.context, source, build_options)
            .map_err(|log| ComputeError::KernelCompile {
                kernel: name.to_owned(),
                diagnostic: log,
            })?;
        let kernel = Kernel::create(&program, name).map_err(|err| ComputeError::KernelCompile {
            kernel: name.to_owned(),
            diagnostic: err.to_string(),
        })?;
        trace!(kernel = name, build_options, "built OpenCL kernel");
        Ok(OpenClKernel {
            name: name.to_owned(),
            kernel,
            _program: program,
        })
    }

    fn allocate(&self, _element: ElementType, len: usize, access: AccessMode) -> Result<Self::Memory> {
        let flags = match access {
            AccessMode::ReadWrite => CL_MEM_READ_WRITE,
            AccessMode::ReadOnly => CL_MEM_READ_ONLY,
            AccessMode::WriteOnly => CL_MEM_WRITE_ONLY,
        };
        // Zero-length allocations are invalid in OpenCL.
        let buffer = unsafe {
            Buffer::<cl_uint>::create(&self.context, flags, len.max(1), ptr::null_mut())
        }
        .map_err(cl_err("buffer allocation"))?;
        Ok(Arc::new(OpenClMemory {
            buffer: Mutex::new(buffer),
            len,
        }))
    }

    fn set_arg(&self, kernel: &mut Self::Kernel, index: u32, arg: KernelArg<'_, Self>) -> Result<()> {
        let result = unsafe {
            match arg {
                KernelArg::Int(v) => kernel.kernel.set_arg(index, &v),
                KernelArg::Long(v) => kernel.kernel.set_arg(index, &v),
                KernelArg::Float(v) => kernel.kernel.set_arg(index, &v),
                KernelArg::Buffer(handle) => {
                    let mem = handle.memory().buffer.lock().get();
                    kernel.kernel.set_arg(index, &mem)
                }
                KernelArg::Local { bytes } => kernel.kernel.set_arg_local_buffer(index, bytes),
            }
        };
        result.map_err(|err| {
            ComputeError::Backend(format!("kernel `{}` argument {index}: {err}", kernel.name))
        })
    }

    fn enqueue_write(&self, memory: &Self::Memory, words: &[u32]) -> Result<()> {
        if words.is_empty() {
            return Ok(());
        }
        let staging = words.to_vec();
        let event = unsafe {
            self.queue.enqueue_write_buffer(
                &mut *memory.buffer.lock(),
                CL_NON_BLOCKING,
                0,
                &staging,
                &[],
            )
        }
        .map_err(cl_err("buffer upload"))?;
        self.staged.lock().push(StagedWrite {
            _words: staging,
            event,
        });
        Ok(())
    }

    fn enqueue_kernel(&self, kernel: &Self::Kernel, global: usize, local: usize) -> Result<()> {
        let global_work = [global];
        let local_work = [local];
        unsafe {
            self.queue.enqueue_nd_range_kernel(
                kernel.kernel.get(),
                1,
                ptr::null(),
                global_work.as_ptr(),
                local_work.as_ptr(),
                &[],
            )
        }
        .map_err(|err| ComputeError::Backend(format!("launch of `{}`: {err}", kernel.name)))?;
        Ok(())
    }

    fn read(&self, memory: &Self::Memory, words: &mut [u32]) -> Result<()> {
        if words.len() != memory.len {
            return Err(ComputeError::Backend(format!(
                "read of {} words from a buffer of {}",
                words.len(),
                memory.len
            )));
        }
        if !words.is_empty() {
            let buffer = memory.buffer.lock();
            unsafe { self.queue.enqueue_read_buffer(&buffer, CL_BLOCKING, 0, words, &[]) }
                .map_err(cl_err("buffer readback"))?;
        }
        // An in-order blocking read implies every earlier write finished.
        self.wait_staged()
    }

    fn finish(&self) -> Result<()> {
        self.queue.finish().map_err(cl_err("queue finish"))?;
        self.wait_staged()
    }
}
