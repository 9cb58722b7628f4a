//! Tiered buffer pools
//!
//! Three tiers sized for the common read shapes: small (512 B) for index
//! entries and ids, default (4 KiB) for typical blocks, large (64 KiB)
//! for chunk I/O. Each tier has a ceiling beyond which a returned buffer
//! is dropped instead of pooled, so one oversized read cannot pin a giant
//! allocation forever.

use parking_lot::Mutex;

const SMALL_SIZE: usize = 512;
const DEFAULT_SIZE: usize = 4 * 1024;
const LARGE_SIZE: usize = 64 * 1024;

const SMALL_CEILING: usize = 4 * 1024;
const DEFAULT_CEILING: usize = 64 * 1024;
const LARGE_CEILING: usize = 1024 * 1024;

const MAX_POOLED_PER_TIER: usize = 64;

struct Tier {
    bufs: Mutex<Vec<Vec<u8>>>,
    alloc_size: usize,
    ceiling: usize,
}

impl Tier {
    fn new(alloc_size: usize, ceiling: usize) -> Self {
        Tier {
            bufs: Mutex::new(Vec::new()),
            alloc_size,
            ceiling,
        }
    }

    fn get(&self, size_hint: usize) -> Vec<u8> {
        let mut bufs = self.bufs.lock();
        match bufs.pop() {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => Vec::with_capacity(size_hint.max(self.alloc_size)),
        }
    }

    fn put(&self, buf: Vec<u8>) {
        if buf.capacity() > self.ceiling {
            return;
        }
        let mut bufs = self.bufs.lock();
        if bufs.len() < MAX_POOLED_PER_TIER {
            bufs.push(buf);
        }
    }

    fn len(&self) -> usize {
        self.bufs.lock().len()
    }
}

/// The three-tier buffer pool set
pub struct BufferPools {
    small: Tier,
    default: Tier,
    large: Tier,
}

impl Default for BufferPools {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPools {
    /// Fresh, empty pools
    pub fn new() -> Self {
        BufferPools {
            small: Tier::new(SMALL_SIZE, SMALL_CEILING),
            default: Tier::new(DEFAULT_SIZE, DEFAULT_CEILING),
            large: Tier::new(LARGE_SIZE, LARGE_CEILING),
        }
    }

    fn tier_for(&self, size: usize) -> &Tier {
        if size <= SMALL_SIZE {
            &self.small
        } else if size <= DEFAULT_SIZE {
            &self.default
        } else {
            &self.large
        }
    }

    /// Check out a cleared buffer suitable for `size_hint` bytes
    pub fn get(&self, size_hint: usize) -> Vec<u8> {
        self.tier_for(size_hint).get(size_hint)
    }

    /// Return a buffer; dropped silently if it outgrew its tier's ceiling
    pub fn put(&self, buf: Vec<u8>) {
        let cap = buf.capacity();
        if cap <= SMALL_CEILING {
            self.small.put(buf);
        } else if cap <= DEFAULT_CEILING {
            self.default.put(buf);
        } else if cap <= LARGE_CEILING {
            self.large.put(buf);
        }
        // Beyond the large ceiling the buffer just drops.
    }

    /// Total buffers currently pooled, across tiers
    pub fn pooled(&self) -> usize {
        self.small.len() + self.default.len() + self.large.len()
    }
}
