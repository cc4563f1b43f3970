//! Best-fit free lists for per-frame scratch memory.
//!
//! Preprocessing needs a tensor staging buffer (`Vec<f32>`) and a packed pixel matrix
//! (`Vec<u32>`) on every frame. A [`ScratchPool`] hands previously released objects back
//! out so steady-state detection does not allocate. The pool is owned by whoever owns the
//! detection lock and is therefore not synchronized itself.
//!
//! The pool never evicts: an idle object stays until [`ScratchPool::clear`] is called.

use std::fmt;

/// An object that can be recycled through a [`ScratchPool`].
pub trait Scratch {
    /// Number of elements the object can hold without reallocating.
    fn capacity(&self) -> usize;
    /// Allocate a fresh object holding at least `min_capacity` elements.
    fn allocate(min_capacity: usize) -> Self;
    /// Clear contents before the object goes back to the free list.
    fn reset(&mut self);
}

impl<T> Scratch for Vec<T> {
    fn capacity(&self) -> usize {
        Vec::capacity(self)
    }

    fn allocate(min_capacity: usize) -> Self {
        Vec::with_capacity(min_capacity)
    }

    fn reset(&mut self) {
        self.clear();
    }
}

/// Unbounded best-fit pool keyed by capacity.
pub struct ScratchPool<T: Scratch> {
    idle: Vec<T>,
    allocations: usize,
    reuses: usize,
}

impl<T: Scratch> Default for ScratchPool<T> {
    fn default() -> Self {
        Self {
            idle: Vec::new(),
            allocations: 0,
            reuses: 0,
        }
    }
}

impl<T: Scratch> ScratchPool<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the smallest idle object holding at least `min_capacity` elements, or allocate.
    pub fn acquire(&mut self, min_capacity: usize) -> T {
        if let Some(index) = self.best_fit(min_capacity) {
            self.reuses += 1;
            return self.idle.swap_remove(index);
        }
        self.allocations += 1;
        T::allocate(min_capacity)
    }

    /// Reset `object` and return it to the free list.
    pub fn release(&mut self, mut object: T) {
        object.reset();
        self.idle.push(object);
    }

    /// Drop every idle object.
    pub fn clear(&mut self) {
        self.idle.clear();
    }

    /// Number of idle objects ready for reuse.
    pub fn available(&self) -> usize {
        self.idle.len()
    }

    /// Total element capacity currently parked in the pool.
    pub fn pooled_capacity(&self) -> usize {
        self.idle.iter().map(Scratch::capacity).sum()
    }

    /// How many times `acquire` had to allocate.
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    /// How many times `acquire` was served from the free list.
    pub fn reuses(&self) -> usize {
        self.reuses
    }

    fn best_fit(&self, min_capacity: usize) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for (index, object) in self.idle.iter().enumerate() {
            let capacity = object.capacity();
            if capacity < min_capacity {
                continue;
            }
            if best.is_none_or(|(_, best_capacity)| capacity < best_capacity) {
                best = Some((index, capacity));
                if capacity == min_capacity {
                    break;
                }
            }
        }
        best.map(|(index, _)| index)
    }
}

impl<T: Scratch> fmt::Debug for ScratchPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScratchPool")
            .field("idle", &self.idle.len())
            .field("pooled_capacity", &self.pooled_capacity())
            .field("allocations", &self.allocations)
            .field("reuses", &self.reuses)
            .finish()
    }
}

/// The scratch pools used by one preprocessing pipeline.
#[derive(Debug, Default)]
pub struct ScratchBuffers {
    /// Tensor staging buffers.
    pub tensors: ScratchPool<Vec<f32>>,
    /// Packed RGBA pixel matrices (one `u32` per pixel).
    pub pixels: ScratchPool<Vec<u32>>,
}

impl ScratchBuffers {
    /// Release every pooled buffer.
    pub fn clear(&mut self) {
        self.tensors.clear();
        self.pixels.clear();
    }
}
