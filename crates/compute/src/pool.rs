//! Per-kernel slot tables for buffers and scalar arguments.

use crate::backend::ComputeBackend;
use crate::buffer::{BufferHandle, ElementType};

/// Slots are indexed per kind; they need not be dense.
pub struct ResourcePool<B: ComputeBackend> {
    int_buffers: Vec<Option<BufferHandle<B>>>,
    float_buffers: Vec<Option<BufferHandle<B>>>,
    int_args: Vec<Option<i32>>,
    long_args: Vec<Option<i64>>,
    float_args: Vec<Option<f32>>,
}

impl<B: ComputeBackend> Default for ResourcePool<B> {
    fn default() -> Self {
        Self {
            int_buffers: Vec::new(),
            float_buffers: Vec::new(),
            int_args: Vec::new(),
            long_args: Vec::new(),
            float_args: Vec::new(),
        }
    }
}

fn put<T>(slots: &mut Vec<Option<T>>, slot: usize, value: T) -> Option<T> {
    if slots.len() <= slot {
        slots.resize_with(slot + 1, || None);
    }
    slots[slot].replace(value)
}

fn occupied<T>(slots: &[Option<T>]) -> usize {
    slots.iter().filter(|s| s.is_some()).count()
}

impl<B: ComputeBackend> ResourcePool<B> {
    /// Stores `buffer` in its element's table, returning the previous occupant.
    pub fn insert_buffer(&mut self, slot: usize, buffer: BufferHandle<B>) -> Option<BufferHandle<B>> {
        match buffer.element() {
            ElementType::Int => put(&mut self.int_buffers, slot, buffer),
            ElementType::Float => put(&mut self.float_buffers, slot, buffer),
        }
    }

    #[must_use]
    pub fn buffer(&self, element: ElementType, slot: usize) -> Option<&BufferHandle<B>> {
        let table = match element {
            ElementType::Int => &self.int_buffers,
            ElementType::Float => &self.float_buffers,
        };
        table.get(slot).and_then(Option::as_ref)
    }

    pub fn set_int(&mut self, slot: usize, value: i32) -> Option<i32> {
        put(&mut self.int_args, slot, value)
    }

    pub fn set_long(&mut self, slot: usize, value: i64) -> Option<i64> {
        put(&mut self.long_args, slot, value)
    }

    pub fn set_float(&mut self, slot: usize, value: f32) -> Option<f32> {
        put(&mut self.float_args, slot, value)
    }

    #[must_use]
    pub fn int(&self, slot: usize) -> Option<i32> {
        self.int_args.get(slot).copied().flatten()
    }

    #[must_use]
    pub fn long(&self, slot: usize) -> Option<i64> {
        self.long_args.get(slot).copied().flatten()
    }

    #[must_use]
    pub fn float(&self, slot: usize) -> Option<f32> {
        self.float_args.get(slot).copied().flatten()
    }

    /// Number of occupied slots across every kind.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        occupied(&self.int_buffers)
            + occupied(&self.float_buffers)
            + occupied(&self.int_args)
            + occupied(&self.long_args)
            + occupied(&self.float_args)
    }

    /// Every buffer in the pool, ints first. An alias appears in each pool holding it.
    pub fn buffers(&self) -> impl Iterator<Item = &BufferHandle<B>> {
        self.int_buffers
            .iter()
            .chain(&self.float_buffers)
            .filter_map(Option::as_ref)
    }

    /// Bytes of device memory referenced by this pool.
    #[must_use]
    pub fn buffer_bytes(&self) -> usize {
        self.buffers().map(|b| b.size_in_bytes()).sum()
    }
}

#[cfg(all(test, feature = "cpu"))]
mod tests {
    use super::*;
    use crate::backend::cpu::CpuBackend;
    use crate::backend::{ComputeBackend, DeviceCategory};
    use crate::buffer::{AccessMode, DeviceBuffer};

    fn buffer(backend: &CpuBackend, element: ElementType, len: usize) -> BufferHandle<CpuBackend> {
        let memory = backend.allocate(element, len, AccessMode::ReadWrite).unwrap();
        DeviceBuffer::new(memory, element, AccessMode::ReadWrite, vec![0; len])
    }

    #[test]
    fn sparse_slots_and_counts() {
        let backend = CpuBackend::open(&DeviceCategory::Any, Default::default()).unwrap();
        let mut pool = ResourcePool::<CpuBackend>::default();
        assert_eq!(pool.resource_count(), 0);

        pool.insert_buffer(2, buffer(&backend, ElementType::Float, 8));
        pool.set_int(0, 10);
        pool.set_long(3, -1);

        assert!(pool.buffer(ElementType::Float, 0).is_none());
        assert_eq!(pool.buffer(ElementType::Float, 2).unwrap().len(), 8);
        assert!(pool.buffer(ElementType::Int, 2).is_none());
        assert_eq!(pool.int(0), Some(10));
        assert_eq!(pool.long(3), Some(-1));
        assert_eq!(pool.long(0), None);
        assert_eq!(pool.resource_count(), 3);
        assert_eq!(pool.buffer_bytes(), 32);
    }

    #[test]
    fn overwrite_returns_previous_occupant() {
        let backend = CpuBackend::open(&DeviceCategory::Any, Default::default()).unwrap();
        let mut pool = ResourcePool::<CpuBackend>::default();
        assert_eq!(pool.set_float(0, 1.0), None);
        assert_eq!(pool.set_float(0, 2.0), Some(1.0));
        assert_eq!(pool.float(0), Some(2.0));

        let first = buffer(&backend, ElementType::Int, 4);
        let id = first.id();
        pool.insert_buffer(0, first);
        let replaced = pool.insert_buffer(0, buffer(&backend, ElementType::Int, 4));
        assert_eq!(replaced.map(|b| b.id()), Some(id));
        assert_eq!(pool.resource_count(), 2);
    }
}
