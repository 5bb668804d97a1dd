use crate::buffer::instance::{BufferPoolInstance, PageReadGuard, PageWriteGuard};
use crate::buffer::BufferPoolConfig;
use crate::disk::DiskManager;
use crate::error::{BufferError, BufferResult};
use crate::page::PageId;
use crate::wal::LogManager;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A horizontally partitioned buffer pool.
///
/// Page id `p` lives in shard `p % num_instances`; each shard is a full
/// [`BufferPoolInstance`] minting ids with stride `num_instances`, so the
/// shards share one logical address space over one disk manager without
/// ever colliding. Routing needs no lock of its own.
pub struct ParallelBufferPool {
    instances: Vec<BufferPoolInstance>,
    /// Rotating start shard for allocation. A best-effort hint: races
    /// between concurrent allocators only skew load spreading.
    last_alloc_index: AtomicUsize,
}

impl ParallelBufferPool {
    pub fn new(
        num_instances: usize,
        pool_size: usize,
        disk: Arc<Mutex<DiskManager>>,
        log: Option<Arc<dyn LogManager>>,
    ) -> Self {
        assert!(num_instances > 0, "a pool needs at least one instance");
        let instances = (0..num_instances)
            .map(|i| {
                BufferPoolInstance::sharded(
                    pool_size,
                    num_instances as u32,
                    i as u32,
                    disk.clone(),
                    log.clone(),
                )
            })
            .collect();

        Self {
            instances,
            last_alloc_index: AtomicUsize::new(0),
        }
    }

    pub fn with_config(
        config: BufferPoolConfig,
        disk: Arc<Mutex<DiskManager>>,
        log: Option<Arc<dyn LogManager>>,
    ) -> Self {
        Self::new(config.num_instances, config.pool_size, disk, log)
    }

    /// Allocates a page on the first shard with a free frame, probing
    /// round-robin from a start shard that rotates by one per call.
    pub fn new_page(&self) -> BufferResult<(PageId, PageWriteGuard<'_>)> {
        let num_instances = self.instances.len();
        let start = self.last_alloc_index.load(Ordering::Relaxed);

        for k in 0..num_instances {
            let index = (start + k) % num_instances;
            match self.instances[index].new_page() {
                Ok(result) => {
                    self.last_alloc_index
                        .store((start + 1) % num_instances, Ordering::Relaxed);
                    return Ok(result);
                }
                Err(BufferError::BufferPoolFull) => continue,
                Err(e) => return Err(e),
            }
        }

        // The start shard still rotates on a fully pinned pool
        self.last_alloc_index
            .store((start + 1) % num_instances, Ordering::Relaxed);
        Err(BufferError::BufferPoolFull)
    }

    pub fn fetch_page(&self, page_id: PageId) -> BufferResult<PageReadGuard<'_>> {
        self.instance_for(page_id).fetch_page(page_id)
    }

    pub fn fetch_page_write(&self, page_id: PageId) -> BufferResult<PageWriteGuard<'_>> {
        self.instance_for(page_id).fetch_page_write(page_id)
    }

    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        self.instance_for(page_id).unpin_page(page_id, is_dirty)
    }

    pub fn flush_page(&self, page_id: PageId) -> BufferResult<bool> {
        self.instance_for(page_id).flush_page(page_id)
    }

    pub fn flush_all_pages(&self) -> BufferResult<()> {
        for instance in &self.instances {
            instance.flush_all_pages()?;
        }
        Ok(())
    }

    pub fn delete_page(&self, page_id: PageId) -> BufferResult<bool> {
        self.instance_for(page_id).delete_page(page_id)
    }

    /// Total frame capacity across all shards.
    pub fn get_pool_size(&self) -> usize {
        self.instances.len() * self.instances[0].get_pool_size()
    }

    pub fn num_instances(&self) -> usize {
        self.instances.len()
    }

    fn instance_for(&self, page_id: PageId) -> &BufferPoolInstance {
        &self.instances[page_id.0 as usize % self.instances.len()]
    }
}
