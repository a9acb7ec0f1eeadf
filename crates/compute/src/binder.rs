//! Positional binding of pool resources to kernel argument slots.
//!
//! The signature is walked in order. Each descriptor claims the next slot of
//! its kind from the kernel's pool; every kind has its own cursor. Buffers
//! and scalars are attached to the backend kernel as they are claimed, but no
//! data moves until dispatch.

use tracing::{debug, warn};

use crate::backend::{ComputeBackend, KernelArg};
use crate::buffer::ElementType;
use crate::context::KernelRecord;
use crate::pool::ResourcePool;
use crate::signature::{ArgumentDescriptor, ArgumentKind, KernelSignature, MemoryScope};
use crate::{ComputeError, Result};

/// A pool slot attached to an argument position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceRef {
    IntBuffer(usize),
    FloatBuffer(usize),
    Int(usize),
    Long(usize),
    Float(usize),
}

impl ResourceRef {
    #[must_use]
    pub fn is_buffer(self) -> bool {
        matches!(self, Self::IntBuffer(_) | Self::FloatBuffer(_))
    }

    fn is_present<B: ComputeBackend>(self, pool: &ResourcePool<B>) -> bool {
        match self {
            Self::IntBuffer(slot) => pool.buffer(ElementType::Int, slot).is_some(),
            Self::FloatBuffer(slot) => pool.buffer(ElementType::Float, slot).is_some(),
            Self::Int(slot) => pool.int(slot).is_some(),
            Self::Long(slot) => pool.long(slot).is_some(),
            Self::Float(slot) => pool.float(slot).is_some(),
        }
    }
}

/// Next unclaimed slot index per resource kind. Advances only on a successful claim.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BindCursor {
    pub int_buffers: usize,
    pub float_buffers: usize,
    pub ints: usize,
    pub longs: usize,
    pub floats: usize,
}

impl BindCursor {
    /// Claims the next slot of `kind`, or `None` when the pool has nothing there.
    pub fn claim<B: ComputeBackend>(
        &mut self,
        kind: ArgumentKind,
        pool: &ResourcePool<B>,
    ) -> Option<ResourceRef> {
        let (counter, make): (&mut usize, fn(usize) -> ResourceRef) = match kind {
            ArgumentKind::IntBuffer => (
                &mut self.int_buffers,
                ResourceRef::IntBuffer as fn(usize) -> ResourceRef,
            ),
            ArgumentKind::FloatBuffer => (&mut self.float_buffers, ResourceRef::FloatBuffer),
            ArgumentKind::IntScalar => (&mut self.ints, ResourceRef::Int),
            ArgumentKind::LongScalar => (&mut self.longs, ResourceRef::Long),
            ArgumentKind::FloatScalar => (&mut self.floats, ResourceRef::Float),
        };
        let candidate = make(*counter);
        if candidate.is_present(pool) {
            *counter += 1;
            Some(candidate)
        } else {
            None
        }
    }
}

/// Resolves every signature position to a pool slot.
///
/// # Errors
///
/// `ArgumentBindingIncomplete` at the first position whose kind has no slot
/// left, `UnusedResources` when the pool holds more than the signature takes.
pub fn resolve<B: ComputeBackend>(
    kernel: &str,
    signature: &KernelSignature,
    pool: &ResourcePool<B>,
) -> Result<Vec<ResourceRef>> {
    let mut cursor = BindCursor::default();
    let mut refs = Vec::with_capacity(signature.len());
    for (position, descriptor) in signature.iter().enumerate() {
        let Some(resource) = cursor.claim(descriptor.kind, pool) else {
            return Err(ComputeError::ArgumentBindingIncomplete {
                kernel: kernel.to_owned(),
                position,
                expected: signature.len(),
                bound: refs.len(),
            });
        };
        refs.push(resource);
    }
    let held = pool.resource_count();
    if held != signature.len() {
        return Err(ComputeError::UnusedResources {
            kernel: kernel.to_owned(),
            expected: signature.len(),
            found: held,
        });
    }
    Ok(refs)
}

fn kernel_arg<'p, B: ComputeBackend>(
    resource: ResourceRef,
    descriptor: &ArgumentDescriptor,
    pool: &'p ResourcePool<B>,
) -> Option<KernelArg<'p, B>> {
    let buffer = |element, slot| {
        pool.buffer(element, slot).map(|handle| {
            if descriptor.scope == MemoryScope::Local {
                KernelArg::Local {
                    bytes: handle.size_in_bytes(),
                }
            } else {
                KernelArg::Buffer(handle)
            }
        })
    };
    match resource {
        ResourceRef::IntBuffer(slot) => buffer(ElementType::Int, slot),
        ResourceRef::FloatBuffer(slot) => buffer(ElementType::Float, slot),
        ResourceRef::Int(slot) => pool.int(slot).map(KernelArg::Int),
        ResourceRef::Long(slot) => pool.long(slot).map(KernelArg::Long),
        ResourceRef::Float(slot) => pool.float(slot).map(KernelArg::Float),
    }
}

fn attach<B: ComputeBackend>(
    backend: &B,
    record: &mut KernelRecord<B>,
    refs: &[ResourceRef],
    scalars_only: bool,
) -> Result<()> {
    let KernelRecord {
        name,
        kernel,
        signature,
        pool,
        ..
    } = record;
    for (position, (&resource, descriptor)) in refs.iter().zip(signature.iter()).enumerate() {
        if scalars_only && resource.is_buffer() {
            continue;
        }
        let arg = kernel_arg(resource, descriptor, pool).ok_or_else(|| {
            ComputeError::ArgumentBindingIncomplete {
                kernel: name.clone(),
                position,
                expected: signature.len(),
                bound: position,
            }
        })?;
        let index = u32::try_from(position).map_err(|_| ComputeError::SlotOutOfRange {
            kernel: name.clone(),
            what: "argument",
            slot: position,
        })?;
        backend.set_arg(kernel, index, arg)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BindMode {
    /// First bind; the kernel must have nothing bound.
    Fresh,
    /// Overwrite every slot in place and re-upload every attached buffer.
    Rebind,
    /// Overwrite scalar slots only; buffer upload state is untouched.
    Scalars,
}

/// Binds `record` according to `mode`. Returns the number of bound slots.
///
/// A failure leaves the kernel with nothing bound; it refuses dispatch until
/// a later fresh bind succeeds.
pub(crate) fn bind<B: ComputeBackend>(
    backend: &B,
    record: &mut KernelRecord<B>,
    mode: BindMode,
) -> Result<usize> {
    match mode {
        BindMode::Fresh if !record.bound.is_empty() || record.complete => {
            return Err(ComputeError::AlreadyBound(record.name.clone()));
        }
        BindMode::Rebind | BindMode::Scalars if !record.complete => {
            return Err(ComputeError::NotBound(record.name.clone()));
        }
        _ => {}
    }

    let result = match mode {
        BindMode::Scalars => {
            let refs = record.bound.clone();
            attach(backend, record, &refs, true).map(|()| refs)
        }
        BindMode::Fresh | BindMode::Rebind => resolve(&record.name, &record.signature, &record.pool)
            .and_then(|refs| attach(backend, record, &refs, false).map(|()| refs)),
    };

    match result {
        Ok(refs) => {
            if mode == BindMode::Rebind {
                for handle in record.pool.buffers() {
                    handle.mark_upload_pending();
                }
            }
            if mode != BindMode::Scalars {
                record.stale = None;
            }
            debug!(kernel = %record.name, ?mode, arguments = refs.len(), "bound kernel arguments");
            record.bound = refs;
            record.complete = true;
            Ok(record.bound.len())
        }
        Err(err) => {
            warn!(kernel = %record.name, ?mode, %err, "binding failed; kernel disabled");
            record.bound.clear();
            record.complete = false;
            record.stale = None;
            Err(err)
        }
    }
}

/// Checks that every signature position has a bound resource and that the
/// pool still matches what was bound.
///
/// # Errors
///
/// `ArgumentBindingIncomplete` naming the first unmet or replaced position,
/// `UnusedResources` when the pool grew after binding.
pub(crate) fn assert_complete<B: ComputeBackend>(record: &KernelRecord<B>) -> Result<()> {
    let expected = record.signature.len();
    if record.complete
        && record.stale.is_none()
        && record.bound.len() == expected
        && record.pool.resource_count() == expected
    {
        return Ok(());
    }
    // Report the precise gap in the pool when there is one.
    resolve(&record.name, &record.signature, &record.pool)?;
    let position = record.stale.unwrap_or(record.bound.len());
    Err(ComputeError::ArgumentBindingIncomplete {
        kernel: record.name.clone(),
        position,
        expected,
        bound: position,
    })
}
