/// Per-request scratch arena.
///
/// A bump allocator over one growable buffer, reset as a whole at the
/// start of each dispatch. Allocations are handed out as index-based
/// [`ArenaSlice`] handles stamped with the arena epoch; a handle from an
/// earlier epoch resolves to `None` instead of aliasing newer data.

/// Handle into the arena, valid until the next reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaSlice {
    offset: usize,
    len: usize,
    epoch: u64,
}

impl ArenaSlice {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug)]
pub struct ScratchArena {
    buf: Vec<u8>,
    offset: usize,
    capacity: usize,
    epoch: u64,
}

impl ScratchArena {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::new(),
            offset: 0,
            capacity,
            epoch: 0,
        }
    }

    /// Copies `data` into the arena. Returns `None` when the request would
    /// exceed the arena capacity.
    pub fn alloc_copy(&mut self, data: &[u8]) -> Option<ArenaSlice> {
        let end = self.offset.checked_add(data.len())?;
        if end > self.capacity {
            return None;
        }
        if self.buf.len() < end {
            self.buf.resize(end, 0);
        }
        self.buf[self.offset..end].copy_from_slice(data);
        let slice = ArenaSlice {
            offset: self.offset,
            len: data.len(),
            epoch: self.epoch,
        };
        self.offset = end;
        Some(slice)
    }

    pub fn get(&self, slice: ArenaSlice) -> Option<&[u8]> {
        if slice.epoch != self.epoch {
            return None;
        }
        self.buf.get(slice.offset..slice.offset + slice.len)
    }

    /// Invalidates every outstanding slice.
    pub fn reset(&mut self) {
        self.offset = 0;
        self.epoch = self.epoch.wrapping_add(1);
    }

    /// Releases the backing memory.
    pub fn release(&mut self) {
        self.reset();
        self.buf = Vec::new();
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        if self.buf.len() > capacity {
            self.buf.truncate(capacity);
            self.buf.shrink_to_fit();
        }
        self.reset();
    }

    /// Bytes handed out since the last reset.
    pub fn used(&self) -> usize {
        self.offset
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}
