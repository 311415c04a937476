use crate::config::PAGE_SIZE;
use log::warn;
use metrics::gauge;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex,
};
use tokio::sync::Notify;

pub const fn pages_for(size: usize) -> usize {
    (size + PAGE_SIZE - 1) / PAGE_SIZE
}

// A chain of fixed-size pages backing one incoming payload. The last
// page may be partially used; `payload_len` is authoritative.
pub struct PageChain {
    pages: Vec<Vec<u8>>,
    payload_len: usize,
}

impl PageChain {
    pub fn new(pages: Vec<Vec<u8>>, payload_len: usize) -> Self {
        debug_assert!(pages.len() == pages_for(payload_len));
        Self { pages, payload_len }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    // Payload-trimmed view of each page, in order
    pub fn slices(&self) -> impl Iterator<Item = &[u8]> {
        let payload_len = self.payload_len;
        self.pages.iter().enumerate().map(move |(i, page)| {
            let start = i * PAGE_SIZE;
            let len = PAGE_SIZE.min(payload_len - start);
            &page[..len]
        })
    }

    // Mutable page windows for filling from the socket
    pub fn fill_targets(&mut self) -> Vec<(usize, usize)> {
        let payload_len = self.payload_len;
        (0..self.pages.len())
            .map(|i| {
                let start = i * PAGE_SIZE;
                (i, PAGE_SIZE.min(payload_len - start))
            })
            .collect()
    }

    pub fn page_mut(&mut self, index: usize) -> &mut [u8] {
        &mut self.pages[index]
    }

    pub fn copy_from_slice(&mut self, data: &[u8]) {
        debug_assert_eq!(data.len(), self.payload_len);
        for (i, chunk) in data.chunks(PAGE_SIZE).enumerate() {
            self.pages[i][..chunk.len()].copy_from_slice(chunk);
        }
    }

    pub fn to_contiguous(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload_len);
        for slice in self.slices() {
            out.extend_from_slice(slice);
        }
        out
    }

    fn into_pages(self) -> Vec<Vec<u8>> {
        self.pages
    }
}

// Process-wide page allocator. Pages are recycled through a vacant list
// up to a watermark; the per-device budget lives with the device, this
// pool only hands buffers out and takes them back.
pub struct PagePool {
    vacant: Mutex<Vec<Vec<u8>>>,
    watermark: usize,
    outstanding: AtomicUsize,
    // woken whenever pages return, so budget waiters can retry
    pub freed: Notify,
}

impl PagePool {
    pub fn new(prealloc_pages: usize) -> Self {
        let vacant = (0..prealloc_pages).map(|_| vec![0u8; PAGE_SIZE]).collect();
        Self {
            vacant: Mutex::new(vacant),
            watermark: prealloc_pages,
            outstanding: AtomicUsize::new(0),
            freed: Notify::new(),
        }
    }

    // Pages currently handed out; zero when the engine is quiescent
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn vacant_count(&self) -> usize {
        self.vacant.lock().expect("page pool lock poisoned").len()
    }

    // Take a chain of `n` pages. Recycled pages first, fresh
    // allocations beyond that; the per-device budget decides whether
    // the caller is allowed to ask at all.
    pub fn take(&self, n: usize, payload_len: usize) -> PageChain {
        let mut pages = {
            let mut vacant = self.vacant.lock().expect("page pool lock poisoned");
            let keep = vacant.len().saturating_sub(n);
            vacant.split_off(keep)
        };
        while pages.len() < n {
            pages.push(vec![0u8; PAGE_SIZE]);
        }
        self.outstanding.fetch_add(n, Ordering::SeqCst);
        gauge!("replica_pool_pages_outstanding").set(self.outstanding() as f64);
        PageChain::new(pages, payload_len)
    }

    pub fn free(&self, chain: PageChain) {
        let pages = chain.into_pages();
        let count = pages.len();
        {
            let mut vacant = self.vacant.lock().expect("page pool lock poisoned");
            for page in pages {
                if vacant.len() < self.watermark {
                    vacant.push(page);
                }
                // beyond the watermark the page is simply dropped
            }
        }
        let previous = self.outstanding.fetch_sub(count, Ordering::SeqCst);
        if previous < count {
            warn!("page pool accounting went negative ({} < {})", previous, count);
        }
        gauge!("replica_pool_pages_outstanding").set(self.outstanding() as f64);
        self.freed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pages_for() {
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(PAGE_SIZE), 1);
        assert_eq!(pages_for(PAGE_SIZE + 1), 2);
        assert_eq!(pages_for(1 << 20), 256);
    }

    #[test]
    fn test_take_and_free_recycles() {
        let pool = PagePool::new(4);
        assert_eq!(pool.vacant_count(), 4);

        let chain = pool.take(3, 3 * PAGE_SIZE);
        assert_eq!(pool.outstanding(), 3);
        assert_eq!(pool.vacant_count(), 1);

        pool.free(chain);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.vacant_count(), 4);
    }

    #[test]
    fn test_take_beyond_prealloc() {
        let pool = PagePool::new(1);
        let chain = pool.take(4, 4 * PAGE_SIZE);
        assert_eq!(chain.page_count(), 4);
        assert_eq!(pool.outstanding(), 4);

        // freeing keeps only up to the watermark
        pool.free(chain);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.vacant_count(), 1);
    }

    #[test]
    fn test_chain_slices_trim_last_page() {
        let pool = PagePool::new(2);
        let mut chain = pool.take(2, PAGE_SIZE + 100);
        let data: Vec<u8> = (0..PAGE_SIZE + 100).map(|i| (i % 251) as u8).collect();
        chain.copy_from_slice(&data);

        let lens: Vec<usize> = chain.slices().map(|s| s.len()).collect();
        assert_eq!(lens, vec![PAGE_SIZE, 100]);
        assert_eq!(chain.to_contiguous(), data);
        pool.free(chain);
    }
}
