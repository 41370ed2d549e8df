// src/core/collections.rs

//! The two container shapes the cycle is built from: a contiguous array
//! that is re-indexed on every generation, and a segmented list whose
//! elements never move once pushed.

/// A contiguous growable array with explicit capacity accounting.
///
/// `push` doubles the allocation when full, relocating the storage;
/// callers must treat indices, not references, as the stable handle.
/// Collections that hand out long-lived references use [`StableList`].
#[derive(Debug)]
pub struct Array<T> {
    elts: Vec<T>,
    nalloc: usize,
}

impl<T> Array<T> {
    pub fn with_capacity(n: usize) -> Self {
        let nalloc = n.max(1);
        Self {
            elts: Vec::with_capacity(nalloc),
            nalloc,
        }
    }

    /// Number of elements in use.
    pub fn nelts(&self) -> usize {
        self.elts.len()
    }

    /// Current capacity.
    pub fn nalloc(&self) -> usize {
        self.nalloc
    }

    pub fn is_empty(&self) -> bool {
        self.elts.is_empty()
    }

    pub fn push(&mut self, value: T) {
        if self.elts.len() == self.nalloc {
            self.nalloc *= 2;
            self.elts.reserve_exact(self.nalloc - self.elts.len());
        }
        self.elts.push(value);
    }

    pub fn get(&self, i: usize) -> Option<&T> {
        self.elts.get(i)
    }

    pub fn get_mut(&mut self, i: usize) -> Option<&mut T> {
        self.elts.get_mut(i)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.elts.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.elts.iter_mut()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.elts
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.elts
    }
}

/// A segmented list: a chain of fixed-capacity parts.
///
/// Each part holds up to `nalloc` elements; a full part chains a fresh one.
/// Elements are never moved or reallocated after `push`, so indices stay
/// valid for the lifetime of the list and iteration order is insertion
/// order. The open-files collection uses this because modules keep handles
/// into it while parsing is still appending.
#[derive(Debug)]
pub struct StableList<T> {
    parts: Vec<Vec<T>>,
    nalloc: usize,
}

impl<T> StableList<T> {
    pub fn new(nalloc: usize) -> Self {
        let nalloc = nalloc.max(1);
        Self {
            parts: vec![Vec::with_capacity(nalloc)],
            nalloc,
        }
    }

    pub fn len(&self) -> usize {
        self.parts.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.iter().all(Vec::is_empty)
    }

    /// Number of chained parts.
    pub fn parts(&self) -> usize {
        self.parts.len()
    }

    pub fn push(&mut self, value: T) -> &mut T {
        if self
            .parts
            .last()
            .expect("list has at least one part")
            .len()
            == self.nalloc
        {
            self.parts.push(Vec::with_capacity(self.nalloc));
        }
        let part = self.parts.last_mut().expect("list has at least one part");
        part.push(value);
        part.last_mut().expect("part is non-empty")
    }

    pub fn get(&self, i: usize) -> Option<&T> {
        self.parts.get(i / self.nalloc)?.get(i % self.nalloc)
    }

    /// Walks every part in chain order, draining each part's elements.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.parts.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.parts.iter_mut().flatten()
    }
}
