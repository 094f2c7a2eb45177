//! Shared cluster buffers: a handful of cached decompressed clusters for reads,
//! and a free list of cluster-sized buffers for writers.

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::footer::CLUSTER_SIZE_MAX;

/// Decompressed clusters kept per mount.
pub const CACHE_SLOTS: usize = 4;

/// Cluster-sized buffers kept on the free list per mount.
pub const POOL_BUFFERS: usize = 16;

pub type CacheKey = (u64, u64);

/// Resizes `buf` to `len` bytes, reporting allocation failure instead of aborting.
pub(crate) fn try_resize(buf: &mut Vec<u8>, len: usize) -> Result<()> {
    if len > buf.len() {
        buf.try_reserve_exact(len - buf.len())
            .map_err(|_| Error::OutOfMemory { bytes: len })?;
    }
    buf.resize(len, 0);
    Ok(())
}

/// Allocates `len` zeroed bytes, reporting failure instead of aborting.
pub(crate) fn try_alloc(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    try_resize(&mut buf, len)?;
    Ok(buf)
}

#[derive(Debug, Default)]
struct Slot {
    key: Option<CacheKey>,
    /// Valid bytes of `u_buf`.
    len: usize,
    in_use: bool,
    u_buf: Vec<u8>,
    c_buf: Vec<u8>,
}

#[derive(Debug)]
struct Slots {
    slots: Vec<Slot>,
    /// Round-robin eviction cursor.
    hand: usize,
}

/// Up to [`CACHE_SLOTS`] decompressed clusters keyed by `(inode, cluster index)`.
///
/// The lock only covers claiming and releasing a slot; its buffers are moved out
/// to the claimant so copies happen outside the lock.
#[derive(Debug)]
pub struct ClusterCache {
    inner: Mutex<Slots>,
}

impl Default for ClusterCache {
    fn default() -> Self {
        ClusterCache::new(CACHE_SLOTS)
    }
}

impl ClusterCache {
    pub fn new(slots: usize) -> ClusterCache {
        ClusterCache {
            inner: Mutex::new(Slots {
                slots: (0..slots).map(|_| Slot::default()).collect(),
                hand: 0,
            }),
        }
    }

    /// Claims the slot holding `key`, if any slot holds it and nobody else has it claimed.
    pub fn lookup(&self, key: CacheKey) -> Option<ClusterBuffers<'_>> {
        let mut inner = self.inner.lock();
        let index = inner
            .slots
            .iter()
            .position(|s| !s.in_use && s.key == Some(key))?;

        let slot = &mut inner.slots[index];
        slot.in_use = true;
        tracing::trace!(inode = key.0, cluster = key.1, slot = index, "cache hit");

        Some(ClusterBuffers {
            cache: Some((self, index)),
            key: Some(key),
            len: slot.len,
            u_buf: std::mem::take(&mut slot.u_buf),
            c_buf: std::mem::take(&mut slot.c_buf),
        })
    }

    /// Claims a slot to fill with cluster `key`, evicting round-robin.
    ///
    /// When every slot is claimed, transient buffers are handed out instead.
    pub fn claim(&self, key: CacheKey) -> ClusterBuffers<'_> {
        let mut inner = self.inner.lock();
        let count = inner.slots.len();
        let start = inner.hand;

        let free = (0..count)
            .map(|i| (start + i) % count)
            .find(|&i| !inner.slots[i].in_use);

        match free {
            Some(index) => {
                inner.hand = (index + 1) % count;
                let slot = &mut inner.slots[index];
                if let Some(evicted) = slot.key.replace(key) {
                    tracing::trace!(
                        inode = evicted.0,
                        cluster = evicted.1,
                        slot = index,
                        "cache evict"
                    );
                }
                slot.in_use = true;
                slot.len = 0;

                ClusterBuffers {
                    cache: Some((self, index)),
                    key: Some(key),
                    len: 0,
                    u_buf: std::mem::take(&mut slot.u_buf),
                    c_buf: std::mem::take(&mut slot.c_buf),
                }
            }
            None => {
                tracing::warn!(
                    inode = key.0,
                    cluster = key.1,
                    "no free cache slot, using transient buffers"
                );
                ClusterBuffers::transient()
            }
        }
    }

    /// Forgets every cluster of `inode`.
    pub fn invalidate_inode(&self, inode: u64) {
        let mut inner = self.inner.lock();
        for slot in inner.slots.iter_mut() {
            if slot.key.map(|k| k.0 == inode).unwrap_or(false) {
                slot.key = None;
            }
        }
    }

    /// Forgets cluster `key`.
    pub fn invalidate(&self, key: CacheKey) {
        let mut inner = self.inner.lock();
        for slot in inner.slots.iter_mut() {
            if slot.key == Some(key) {
                slot.key = None;
            }
        }
    }

    fn release(
        &self,
        index: usize,
        key: Option<CacheKey>,
        len: usize,
        u_buf: Vec<u8>,
        c_buf: Vec<u8>,
    ) {
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[index];
        slot.u_buf = u_buf;
        slot.c_buf = c_buf;
        slot.len = len;
        slot.in_use = false;
        // An invalidation while the slot was claimed already cleared its key.
        if key.is_none() || slot.key.is_some() {
            slot.key = key;
        }
    }
}

/// A claimed pair of cluster buffers: `u_buf` for decompressed bytes, `c_buf` for
/// the payload read from the lower file. Released back to its slot on drop.
pub struct ClusterBuffers<'a> {
    cache: Option<(&'a ClusterCache, usize)>,
    key: Option<CacheKey>,
    len: usize,
    pub u_buf: Vec<u8>,
    pub c_buf: Vec<u8>,
}

impl<'a> ClusterBuffers<'a> {
    pub fn transient() -> ClusterBuffers<'a> {
        ClusterBuffers {
            cache: None,
            key: None,
            len: 0,
            u_buf: Vec::new(),
            c_buf: Vec::new(),
        }
    }

    #[inline(always)]
    pub fn is_cached(&self) -> bool {
        self.cache.is_some()
    }

    /// Number of valid decompressed bytes in `u_buf`.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        &self.u_buf[..self.len]
    }

    /// Marks the first `len` bytes of `u_buf` as a complete, cacheable cluster.
    pub fn fill(&mut self, len: usize) {
        self.len = len;
    }

    /// Keeps the contents out of the cache when released.
    pub fn forget(&mut self) {
        self.key = None;
    }
}

impl Drop for ClusterBuffers<'_> {
    fn drop(&mut self) {
        if let Some((cache, index)) = self.cache.take() {
            let key = if self.len == 0 { None } else { self.key };
            cache.release(
                index,
                key,
                self.len,
                std::mem::take(&mut self.u_buf),
                std::mem::take(&mut self.c_buf),
            );
        }
    }
}

/// Free list of cluster-sized buffers, falling back to fresh allocations when empty.
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    capacity: usize,
}

impl Default for BufferPool {
    fn default() -> Self {
        BufferPool::new(POOL_BUFFERS)
    }
}

impl BufferPool {
    pub fn new(capacity: usize) -> BufferPool {
        BufferPool {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Returns a zeroed buffer of [`CLUSTER_SIZE_MAX`] bytes.
    pub fn get(&self) -> Result<Vec<u8>> {
        if let Some(mut buf) = self.free.lock().pop() {
            buf.iter_mut().for_each(|b| *b = 0);
            return Ok(buf);
        }
        tracing::trace!("buffer pool empty, allocating");
        try_alloc(CLUSTER_SIZE_MAX as usize)
    }

    pub fn put(&self, mut buf: Vec<u8>) {
        if buf.capacity() < CLUSTER_SIZE_MAX as usize {
            return;
        }
        buf.resize(CLUSTER_SIZE_MAX as usize, 0);
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(buf);
        }
    }

    pub fn available(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(cache: &ClusterCache, key: CacheKey, byte: u8) {
        let mut buffers = cache.claim(key);
        buffers.u_buf.clear();
        buffers.u_buf.resize(16, byte);
        buffers.fill(16);
    }

    #[test]
    fn hit_after_fill() {
        let cache = ClusterCache::default();
        assert!(cache.lookup((1, 0)).is_none());

        fill(&cache, (1, 0), 7);
        let hit = cache.lookup((1, 0)).unwrap();
        assert_eq!(hit.data(), &[7u8; 16][..]);

        // Claimed slots are invisible to other lookups.
        assert!(cache.lookup((1, 0)).is_none());
        drop(hit);
        assert!(cache.lookup((1, 0)).is_some());
    }

    #[test]
    fn round_robin_eviction() {
        let cache = ClusterCache::new(2);
        fill(&cache, (1, 0), 1);
        fill(&cache, (1, 1), 2);
        fill(&cache, (1, 2), 3);

        assert!(cache.lookup((1, 0)).is_none());
        assert!(cache.lookup((1, 1)).is_some());
        assert!(cache.lookup((1, 2)).is_some());
    }

    #[test]
    fn exhausted_falls_back_to_transient() {
        let cache = ClusterCache::new(1);
        let first = cache.claim((1, 0));
        assert!(first.is_cached());

        let mut second = cache.claim((1, 1));
        assert!(!second.is_cached());
        second.u_buf.resize(4, 9);
        second.fill(4);
        drop(second);
        drop(first);

        assert!(cache.lookup((1, 1)).is_none());
    }

    #[test]
    fn unfilled_and_forgotten_claims_are_not_cached() {
        let cache = ClusterCache::default();
        drop(cache.claim((1, 0)));
        assert!(cache.lookup((1, 0)).is_none());

        let mut buffers = cache.claim((1, 1));
        buffers.u_buf.resize(4, 1);
        buffers.fill(4);
        buffers.forget();
        drop(buffers);
        assert!(cache.lookup((1, 1)).is_none());
    }

    #[test]
    fn invalidation() {
        let cache = ClusterCache::default();
        fill(&cache, (1, 0), 1);
        fill(&cache, (1, 1), 1);
        fill(&cache, (2, 0), 1);

        cache.invalidate((1, 1));
        assert!(cache.lookup((1, 1)).is_none());

        cache.invalidate_inode(1);
        assert!(cache.lookup((1, 0)).is_none());
        assert!(cache.lookup((2, 0)).is_some());
    }

    #[test]
    fn invalidated_while_claimed() {
        let cache = ClusterCache::default();
        fill(&cache, (1, 0), 1);

        let hit = cache.lookup((1, 0)).unwrap();
        cache.invalidate_inode(1);
        drop(hit);
        assert!(cache.lookup((1, 0)).is_none());
    }

    #[test]
    fn pool_reuses_buffers() {
        let pool = BufferPool::new(1);
        let mut a = pool.get().unwrap();
        assert_eq!(a.len(), CLUSTER_SIZE_MAX as usize);
        a[0] = 5;
        let b = pool.get().unwrap();

        pool.put(a);
        pool.put(b);
        assert_eq!(pool.available(), 1);

        let c = pool.get().unwrap();
        assert_eq!(c[0], 0);
        assert_eq!(pool.available(), 0);
    }
}
