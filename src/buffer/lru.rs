use super::replacer::{FrameId, Replacer};
use hashlink::LinkedHashSet;
use parking_lot::Mutex;

/// LRU replacer ordered by the moment a frame became unpinned, not by
/// access: re-unpinning a frame that is already evictable does not refresh
/// its position.
#[derive(Debug)]
pub struct LruReplacer {
    inner: Mutex<LruInner>,
}

#[derive(Debug)]
struct LruInner {
    /// Evictable frames, least recently unpinned at the front
    entries: LinkedHashSet<FrameId>,
    /// Maximum number of frames
    capacity: usize,
}

impl LruReplacer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruInner {
                entries: LinkedHashSet::with_capacity(capacity),
                capacity,
            }),
        }
    }
}

impl Replacer for LruReplacer {
    fn victim(&self) -> Option<FrameId> {
        self.inner.lock().entries.pop_front()
    }

    fn pin(&self, frame_id: FrameId) {
        self.inner.lock().entries.remove(&frame_id);
    }

    fn unpin(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        if inner.entries.contains(&frame_id) {
            return;
        }
        // Capacity in practice equals pool_size, so overflow only happens
        // on misuse; the oldest entry is dropped without notification.
        if inner.entries.len() >= inner.capacity {
            inner.entries.pop_front();
        }
        inner.entries.insert(frame_id);
    }

    fn size(&self) -> usize {
        self.inner.lock().entries.len()
    }
}
