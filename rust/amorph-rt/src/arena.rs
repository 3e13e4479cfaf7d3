//! Per-iteration bump arena.
//!
//! Operators that build temporary structures during an iteration allocate
//! them here; the executor resets the arena on every commit and abort, so an
//! allocation never outlives its iteration. `Drop` impls of allocated values
//! are **not** run — the arena is for plain scratch data.

use std::alloc::Layout;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

/// Default size of a backing chunk: 16 KiB.
const DEFAULT_CHUNK_BYTES: usize = 16 * 1024;

/// One backing chunk with a bump offset.
struct Chunk {
    buf: Box<[u8]>,
    used: usize,
}

impl Chunk {
    fn with_capacity(bytes: usize) -> Self {
        Self {
            buf: vec![0u8; bytes].into_boxed_slice(),
            used: 0,
        }
    }

    /// Bump-allocate `size` bytes at `align` within this chunk, if they fit.
    fn bump(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let base = self.buf.as_ptr() as usize;
        let aligned = (base + self.used + align - 1) & !(align - 1);
        let end = aligned - base + size;
        if end > self.buf.len() {
            return None;
        }
        self.used = end;
        NonNull::new(aligned as *mut u8)
    }
}

/// A bump arena scoped to a single iteration.
///
/// `!Send` and `!Sync`: it lives on the worker's stack and never crosses
/// threads.
pub struct IterationArena {
    chunks: Vec<Chunk>,
    /// Index of the chunk currently being bumped.
    active: usize,
    /// Bytes handed out since the last reset (excluding alignment padding).
    allocated: usize,
    /// Number of resets performed; one per committed or aborted iteration
    /// when the arena option is enabled.
    resets: u64,
    chunk_bytes: usize,
    _single_thread: PhantomData<*mut u8>,
}

impl IterationArena {
    /// An empty arena; no memory is reserved until the first allocation.
    pub fn new() -> Self {
        Self::with_chunk_bytes(DEFAULT_CHUNK_BYTES)
    }

    /// An empty arena with a custom backing-chunk size.
    ///
    /// # Panics
    /// Panics if `chunk_bytes` is 0.
    pub fn with_chunk_bytes(chunk_bytes: usize) -> Self {
        assert!(chunk_bytes > 0, "chunk_bytes must be > 0");
        Self {
            chunks: Vec::new(),
            active: 0,
            allocated: 0,
            resets: 0,
            chunk_bytes,
            _single_thread: PhantomData,
        }
    }

    /// Allocate raw memory for `layout`.
    ///
    /// # Panics
    /// Panics on zero-sized layouts; use [`alloc_value`](Self::alloc_value)
    /// for ZSTs.
    pub fn alloc(&mut self, layout: Layout) -> NonNull<u8> {
        let (size, align) = (layout.size(), layout.align());
        assert!(size > 0, "zero-sized raw allocations are not supported");

        // Walk forward through existing chunks before growing.
        while self.active < self.chunks.len() {
            if let Some(ptr) = self.chunks[self.active].bump(size, align) {
                self.allocated += size;
                return ptr;
            }
            self.active += 1;
        }

        let bytes = self.chunk_bytes.max(size + align - 1);
        self.chunks.push(Chunk::with_capacity(bytes));
        self.active = self.chunks.len() - 1;
        self.allocated += size;
        match self.chunks[self.active].bump(size, align) {
            Some(ptr) => ptr,
            // A fresh chunk sized for the request always fits it.
            None => unreachable!("fresh arena chunk rejected allocation"),
        }
    }

    /// Allocate and initialize a value, returning a reference valid until
    /// the next [`reset`](Self::reset). The value's `Drop` is never run.
    pub fn alloc_value<T>(&mut self, value: T) -> &mut T {
        let layout = Layout::new::<T>();
        if layout.size() == 0 {
            // SAFETY: ZSTs need no storage; a dangling aligned pointer is a
            // valid reference target.
            return unsafe { &mut *NonNull::<T>::dangling().as_ptr() };
        }
        let ptr = self.alloc(layout).cast::<T>().as_ptr();
        // SAFETY: `alloc` returned `layout.size()` bytes at `layout.align()`
        // that no other live reference points into.
        unsafe {
            ptr.write(value);
            &mut *ptr
        }
    }

    /// Invalidate all allocations and rewind to the first chunk. Chunks
    /// beyond the first are returned to the system.
    pub fn reset(&mut self) {
        if let Some(first) = self.chunks.first_mut() {
            first.used = 0;
        }
        self.chunks.truncate(1);
        self.active = 0;
        self.allocated = 0;
        self.resets += 1;
    }

    /// Bytes handed out since the last reset.
    pub fn bytes_allocated(&self) -> usize {
        self.allocated
    }

    /// Bytes reserved across all backing chunks.
    pub fn bytes_reserved(&self) -> usize {
        self.chunks.iter().map(|c| c.buf.len()).sum()
    }

    /// Number of resets performed so far.
    pub fn resets(&self) -> u64 {
        self.resets
    }

    /// Whether anything has been allocated since the last reset.
    pub fn is_empty(&self) -> bool {
        self.allocated == 0
    }
}

impl Default for IterationArena {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for IterationArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IterationArena")
            .field("chunks", &self.chunks.len())
            .field("bytes_allocated", &self.allocated)
            .field("bytes_reserved", &self.bytes_reserved())
            .field("resets", &self.resets)
            .finish()
    }
}
