pub mod instance;
pub mod lru;
pub mod parallel;
pub mod replacer;

pub use instance::{BufferPoolInstance, PageReadGuard, PageWriteGuard};
pub use lru::LruReplacer;
pub use parallel::ParallelBufferPool;
pub use replacer::{FrameId, Replacer};

/// Sizing for a parallel pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of independent shards.
    pub num_instances: usize,
    /// Frames per shard.
    pub pool_size: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        BufferPoolConfig {
            num_instances: 1,
            pool_size: 64,
        }
    }
}
