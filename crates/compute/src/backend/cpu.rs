//! Host backend. Kernels are Rust closures registered by name in a
//! [`HostKernelLibrary`]; the OpenCL C source still drives signature parsing.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::backend::{ComputeBackend, DeviceCategory, DeviceInfo, DeviceType, KernelArg};
use crate::buffer::{AccessMode, ElementType};
use crate::signature;
use crate::{ComputeError, Result};

pub const PLATFORM_NAME: &str = "Host";
pub const MAX_WORK_GROUP_SIZE: usize = 1024;
const HOST_MEMORY_BYTES: u64 = 4 << 30;

pub type HostKernelFn = Arc<dyn Fn(&mut WorkItem<'_>) -> Result<()> + Send + Sync>;

/// Host implementations keyed by kernel name.
#[derive(Clone, Default)]
pub struct HostKernelLibrary {
    kernels: HashMap<String, HostKernelFn>,
}

impl HostKernelLibrary {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, body: F) -> &mut Self
    where
        F: Fn(&mut WorkItem<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.kernels.insert(name.into(), Arc::new(body));
        self
    }

    #[must_use]
    pub fn with<F>(mut self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut WorkItem<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.register(name, body);
        self
    }

    /// Adds every kernel of `other`, replacing same-named entries.
    pub fn extend(&mut self, other: HostKernelLibrary) -> &mut Self {
        self.kernels.extend(other.kernels);
        self
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.kernels.contains_key(name)
    }

    fn get(&self, name: &str) -> Option<HostKernelFn> {
        self.kernels.get(name).cloned()
    }
}

impl fmt::Debug for HostKernelLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.kernels.keys().collect();
        names.sort();
        f.debug_struct("HostKernelLibrary").field("kernels", &names).finish()
    }
}

#[derive(Debug)]
pub struct CpuMemory {
    words: Mutex<Vec<u32>>,
    element: ElementType,
    access: AccessMode,
}

#[derive(Clone)]
enum ArgValue {
    Int(i32),
    Long(i64),
    Float(f32),
    Buffer(Arc<CpuMemory>),
    Local { bytes: usize },
}

pub struct CpuKernel {
    name: String,
    body: HostKernelFn,
    args: Vec<Option<ArgValue>>,
}

impl fmt::Debug for CpuKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuKernel")
            .field("name", &self.name)
            .field("arity", &self.args.len())
            .finish_non_exhaustive()
    }
}

enum Command {
    Write {
        memory: Arc<CpuMemory>,
        words: Vec<u32>,
    },
    Launch {
        name: String,
        body: HostKernelFn,
        args: Vec<ArgValue>,
        global: usize,
        local: usize,
    },
}

pub struct CpuBackend {
    info: DeviceInfo,
    library: HostKernelLibrary,
    queue: Mutex<VecDeque<Command>>,
}

impl fmt::Debug for CpuBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuBackend")
            .field("info", &self.info)
            .field("library", &self.library)
            .field("queued", &self.queue.lock().len())
            .finish()
    }
}

impl CpuBackend {
    fn drain(&self) -> Result<()> {
        loop {
            // Pop one at a time so a kernel body never runs under the queue lock.
            let Some(command) = self.queue.lock().pop_front() else {
                return Ok(());
            };
            if let Err(err) = execute(command) {
                self.queue.lock().clear();
                return Err(err);
            }
        }
    }
}

impl ComputeBackend for CpuBackend {
    type Memory = Arc<CpuMemory>;
    type Kernel = CpuKernel;
    type Options = HostKernelLibrary;

    fn open(category: &DeviceCategory, options: Self::Options) -> Result<Self> {
        if !category.matches_platform(PLATFORM_NAME, &[DeviceType::Cpu]) {
            return Err(ComputeError::DeviceNotFound {
                category: category.to_string(),
                available: vec![PLATFORM_NAME.to_owned()],
            });
        }
        let compute_units = std::thread::available_parallelism()
            .map_or(1, |n| u32::try_from(n.get()).unwrap_or(u32::MAX));
        let info = DeviceInfo {
            platform: PLATFORM_NAME.to_owned(),
            name: "host cpu".to_owned(),
            vendor: std::env::consts::ARCH.to_owned(),
            device_type: DeviceType::Cpu,
            compute_units,
            clock_mhz: 0,
            global_mem_bytes: HOST_MEMORY_BYTES,
            max_alloc_bytes: HOST_MEMORY_BYTES / 4,
            max_work_group_size: MAX_WORK_GROUP_SIZE,
        };
        debug!(?info, kernels = ?options, "opened host device");
        Ok(Self {
            info,
            library: options,
            queue: Mutex::new(VecDeque::new()),
        })
    }

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn build_kernel(&self, name: &str, source: &str, build_options: &str) -> Result<Self::Kernel> {
        let declared = signature::parse_kernel(source, Some(name)).map_err(|err| {
            ComputeError::KernelCompile {
                kernel: name.to_owned(),
                diagnostic: err.to_string(),
            }
        })?;
        let body = self.library.get(name).ok_or_else(|| ComputeError::KernelCompile {
            kernel: name.to_owned(),
            diagnostic: "no host implementation registered".to_owned(),
        })?;
        trace!(kernel = name, build_options, arity = declared.len(), "built host kernel");
        Ok(CpuKernel {
            name: name.to_owned(),
            body,
            args: vec![None; declared.len()],
        })
    }

    fn allocate(&self, element: ElementType, len: usize, access: AccessMode) -> Result<Self::Memory> {
        let bytes = (len * element.size_in_bytes()) as u64;
        if bytes > self.info.max_alloc_bytes {
            return Err(ComputeError::Backend(format!(
                "allocation of {bytes} bytes exceeds the {} byte limit",
                self.info.max_alloc_bytes
            )));
        }
        Ok(Arc::new(CpuMemory {
            words: Mutex::new(vec![0; len]),
            element,
            access,
        }))
    }

    fn set_arg(&self, kernel: &mut Self::Kernel, index: u32, arg: KernelArg<'_, Self>) -> Result<()> {
        let value = match arg {
            KernelArg::Int(v) => ArgValue::Int(v),
            KernelArg::Long(v) => ArgValue::Long(v),
            KernelArg::Float(v) => ArgValue::Float(v),
            KernelArg::Buffer(handle) => ArgValue::Buffer(Arc::clone(handle.memory())),
            KernelArg::Local { bytes } => ArgValue::Local { bytes },
        };
        let slot = kernel
            .args
            .get_mut(index as usize)
            .ok_or_else(|| ComputeError::SlotOutOfRange {
                kernel: kernel.name.clone(),
                what: "argument",
                slot: index as usize,
            })?;
        *slot = Some(value);
        Ok(())
    }

    fn enqueue_write(&self, memory: &Self::Memory, words: &[u32]) -> Result<()> {
        let len = memory.words.lock().len();
        if words.len() != len {
            return Err(ComputeError::Backend(format!(
                "write of {} words into a buffer of {len}",
                words.len()
            )));
        }
        self.queue.lock().push_back(Command::Write {
            memory: Arc::clone(memory),
            words: words.to_vec(),
        });
        Ok(())
    }

    fn enqueue_kernel(&self, kernel: &Self::Kernel, global: usize, local: usize) -> Result<()> {
        let args = kernel
            .args
            .iter()
            .enumerate()
            .map(|(i, a)| {
                a.clone().ok_or_else(|| {
                    ComputeError::Backend(format!("kernel `{}`: argument {i} is not set", kernel.name))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.queue.lock().push_back(Command::Launch {
            name: kernel.name.clone(),
            body: Arc::clone(&kernel.body),
            args,
            global,
            local,
        });
        Ok(())
    }

    fn read(&self, memory: &Self::Memory, words: &mut [u32]) -> Result<()> {
        self.drain()?;
        let source = memory.words.lock();
        if source.len() != words.len() {
            return Err(ComputeError::Backend(format!(
                "read of {} words from a buffer of {}",
                words.len(),
                source.len()
            )));
        }
        words.copy_from_slice(&source);
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        self.drain()
    }
}

fn execute(command: Command) -> Result<()> {
    match command {
        Command::Write { memory, words } => {
            memory.words.lock().copy_from_slice(&words);
            Ok(())
        }
        Command::Launch {
            name,
            body,
            args,
            global,
            local,
        } => launch(&name, &*body, &args, global, local),
    }
}

enum Slot {
    Int(i32),
    Long(i64),
    Float(f32),
    Buffer {
        store: usize,
        element: ElementType,
        writable: bool,
    },
    Local {
        store: usize,
    },
}

fn launch(
    name: &str,
    body: &(dyn Fn(&mut WorkItem<'_>) -> Result<()> + Send + Sync),
    args: &[ArgValue],
    global: usize,
    local: usize,
) -> Result<()> {
    trace!(kernel = name, global, local, "host launch");
    // Each distinct allocation gets one scratch store, so aliased arguments see
    // each other's writes within the launch.
    // Global memories paired with their store index; local scratch shares
    // the store vector, so positions in `memories` are not store indices.
    let mut memories: Vec<(Arc<CpuMemory>, usize)> = Vec::new();
    let mut store: Vec<Vec<u32>> = Vec::new();
    let mut local_stores = Vec::new();
    let mut slots = Vec::with_capacity(args.len());
    for arg in args {
        let slot = match arg {
            ArgValue::Int(v) => Slot::Int(*v),
            ArgValue::Long(v) => Slot::Long(*v),
            ArgValue::Float(v) => Slot::Float(*v),
            ArgValue::Buffer(memory) => {
                let known = memories
                    .iter()
                    .find(|(m, _)| Arc::ptr_eq(m, memory))
                    .map(|&(_, index)| index);
                let index = known.unwrap_or_else(|| {
                    store.push(memory.words.lock().clone());
                    memories.push((Arc::clone(memory), store.len() - 1));
                    store.len() - 1
                });
                Slot::Buffer {
                    store: index,
                    element: memory.element,
                    writable: memory.access.kernel_writable(),
                }
            }
            ArgValue::Local { bytes } => {
                store.push(vec![0; bytes.div_ceil(4)]);
                local_stores.push(store.len() - 1);
                Slot::Local {
                    store: store.len() - 1,
                }
            }
        };
        slots.push(slot);
    }

    for group in 0..global / local {
        for &index in &local_stores {
            store[index].fill(0);
        }
        for local_id in 0..local {
            let mut item = WorkItem {
                kernel: name,
                slots: &slots[..],
                store: &mut store[..],
                global_id: group * local + local_id,
                local_id,
                group_id: group,
                global_size: global,
                local_size: local,
            };
            body(&mut item)?;
        }
    }

    for (memory, index) in &memories {
        *memory.words.lock() = std::mem::take(&mut store[*index]);
    }
    Ok(())
}

/// One invocation of a host kernel body. Work items of a group run in order
/// on the calling thread; there are no barriers.
pub struct WorkItem<'a> {
    kernel: &'a str,
    slots: &'a [Slot],
    store: &'a mut [Vec<u32>],
    global_id: usize,
    local_id: usize,
    group_id: usize,
    global_size: usize,
    local_size: usize,
}

impl WorkItem<'_> {
    #[must_use]
    pub fn global_id(&self) -> usize {
        self.global_id
    }

    #[must_use]
    pub fn local_id(&self) -> usize {
        self.local_id
    }

    #[must_use]
    pub fn group_id(&self) -> usize {
        self.group_id
    }

    #[must_use]
    pub fn global_size(&self) -> usize {
        self.global_size
    }

    #[must_use]
    pub fn local_size(&self) -> usize {
        self.local_size
    }

    #[must_use]
    pub fn kernel(&self) -> &str {
        self.kernel
    }

    /// # Errors
    ///
    /// Fails when argument `index` is not an int scalar.
    pub fn int_arg(&self, index: usize) -> Result<i32> {
        match self.slots.get(index) {
            Some(Slot::Int(v)) => Ok(*v),
            _ => Err(ComputeError::ArgumentType { index, expected: "int" }),
        }
    }

    /// # Errors
    ///
    /// Fails when argument `index` is not a long scalar.
    pub fn long_arg(&self, index: usize) -> Result<i64> {
        match self.slots.get(index) {
            Some(Slot::Long(v)) => Ok(*v),
            _ => Err(ComputeError::ArgumentType { index, expected: "long" }),
        }
    }

    /// # Errors
    ///
    /// Fails when argument `index` is not a float scalar.
    pub fn float_arg(&self, index: usize) -> Result<f32> {
        match self.slots.get(index) {
            Some(Slot::Float(v)) => Ok(*v),
            _ => Err(ComputeError::ArgumentType { index, expected: "float" }),
        }
    }

    /// Element count of buffer argument `index`.
    ///
    /// # Errors
    ///
    /// Fails when argument `index` is not a buffer.
    pub fn buffer_len(&self, index: usize) -> Result<usize> {
        match self.slots.get(index) {
            Some(Slot::Buffer { store, .. } | Slot::Local { store }) => Ok(self.store[*store].len()),
            _ => Err(ComputeError::ArgumentType {
                index,
                expected: "buffer",
            }),
        }
    }

    /// # Errors
    ///
    /// Fails when argument `index` is not an int buffer or `i` is out of bounds.
    pub fn int_at(&self, index: usize, i: usize) -> Result<i32> {
        self.word(index, ElementType::Int, i).map(bytemuck::cast)
    }

    /// # Errors
    ///
    /// Fails when argument `index` is not a float buffer or `i` is out of bounds.
    pub fn float_at(&self, index: usize, i: usize) -> Result<f32> {
        self.word(index, ElementType::Float, i).map(bytemuck::cast)
    }

    /// # Errors
    ///
    /// Fails when argument `index` is not a writable int buffer or `i` is out of bounds.
    pub fn set_int(&mut self, index: usize, i: usize, value: i32) -> Result<()> {
        self.put(index, ElementType::Int, i, bytemuck::cast(value))
    }

    /// # Errors
    ///
    /// Fails when argument `index` is not a writable float buffer or `i` is out of bounds.
    pub fn set_float(&mut self, index: usize, i: usize, value: f32) -> Result<()> {
        self.put(index, ElementType::Float, i, bytemuck::cast(value))
    }

    fn resolve(&self, index: usize, element: ElementType) -> Result<(usize, bool)> {
        let expected = match element {
            ElementType::Int => "int buffer",
            ElementType::Float => "float buffer",
        };
        match self.slots.get(index) {
            Some(Slot::Buffer {
                store,
                element: actual,
                writable,
            }) if *actual == element => Ok((*store, *writable)),
            // Local scratch is untyped.
            Some(Slot::Local { store }) => Ok((*store, true)),
            _ => Err(ComputeError::ArgumentType { index, expected }),
        }
    }

    fn word(&self, index: usize, element: ElementType, i: usize) -> Result<u32> {
        let (store, _) = self.resolve(index, element)?;
        self.store[store]
            .get(i)
            .copied()
            .ok_or_else(|| self.out_of_bounds(index, i, self.store[store].len()))
    }

    fn put(&mut self, index: usize, element: ElementType, i: usize, value: u32) -> Result<()> {
        let (store, writable) = self.resolve(index, element)?;
        if !writable {
            return Err(ComputeError::Backend(format!(
                "kernel `{}` wrote to read-only argument {index}",
                self.kernel
            )));
        }
        let len = self.store[store].len();
        if i >= len {
            return Err(self.out_of_bounds(index, i, len));
        }
        self.store[store][i] = value;
        Ok(())
    }

    fn out_of_bounds(&self, index: usize, i: usize, len: usize) -> ComputeError {
        ComputeError::Backend(format!(
            "kernel `{}`: work item {} accessed element {i} of argument {index} (length {len})",
            self.kernel, self.global_id
        ))
    }
}
