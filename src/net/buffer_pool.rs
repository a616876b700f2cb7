// # Network Buffer Pool
//
// Free lists of payload buffers in power-of-two size classes from 256 B to
// 32 KiB. Allocations above the largest class bypass the pool and are freed
// individually. Each class's free list is guarded by its own lock.

use parking_lot::Mutex;

const MIN_CLASS_SIZE: usize = 256;
const MAX_CLASS_SIZE: usize = 32 * 1024;
const NUM_CLASSES: usize = 8; // 256, 512, ..., 32768

/// Cap on buffers retained per size class
const MAX_FREE_PER_CLASS: usize = 64;

pub struct NetBufferPool {
    classes: [Mutex<Vec<Vec<u8>>>; NUM_CLASSES],
}

impl Default for NetBufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl NetBufferPool {
    pub fn new() -> Self {
        Self {
            classes: std::array::from_fn(|_| Mutex::new(Vec::new())),
        }
    }

    /// A zeroed-length buffer whose capacity covers `size`.
    pub fn alloc(&self, size: usize) -> Vec<u8> {
        match class_index(size) {
            Some(idx) => {
                let mut free = self.classes[idx].lock();
                match free.pop() {
                    Some(mut buf) => {
                        buf.clear();
                        buf
                    }
                    None => Vec::with_capacity(class_size(idx)),
                }
            }
            None => Vec::with_capacity(size),
        }
    }

    /// Return a buffer; oversized buffers are simply dropped.
    pub fn free(&self, buf: Vec<u8>) {
        if let Some(idx) = class_index(buf.capacity()) {
            if buf.capacity() == class_size(idx) {
                let mut free = self.classes[idx].lock();
                if free.len() < MAX_FREE_PER_CLASS {
                    free.push(buf);
                }
            }
        }
    }

    /// Buffers currently cached in a class's free list
    pub fn free_count(&self, size: usize) -> usize {
        class_index(size)
            .map(|idx| self.classes[idx].lock().len())
            .unwrap_or(0)
    }
}

fn class_size(idx: usize) -> usize {
    MIN_CLASS_SIZE << idx
}

/// Smallest class covering `size`, or `None` when the pool is bypassed
fn class_index(size: usize) -> Option<usize> {
    if size > MAX_CLASS_SIZE {
        return None;
    }
    let mut idx = 0;
    while class_size(idx) < size {
        idx += 1;
    }
    Some(idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_selection() {
        assert_eq!(class_index(1), Some(0));
        assert_eq!(class_index(256), Some(0));
        assert_eq!(class_index(257), Some(1));
        assert_eq!(class_index(32 * 1024), Some(7));
        assert_eq!(class_index(32 * 1024 + 1), None);
    }

    #[test]
    fn test_alloc_reuses_freed_buffer() {
        let pool = NetBufferPool::new();
        let buf = pool.alloc(300);
        assert!(buf.capacity() >= 300);
        pool.free(buf);
        assert_eq!(pool.free_count(300), 1);
        let again = pool.alloc(300);
        assert_eq!(pool.free_count(300), 0);
        assert!(again.capacity() >= 300);
    }

    #[test]
    fn test_oversized_bypass() {
        let pool = NetBufferPool::new();
        let buf = pool.alloc(64 * 1024);
        assert!(buf.capacity() >= 64 * 1024);
        pool.free(buf);
        assert_eq!(pool.free_count(64 * 1024), 0);
    }
}
