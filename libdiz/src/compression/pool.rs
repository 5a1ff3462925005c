use std::sync::{Mutex, PoisonError};

/// Free list of block-sized byte buffers.
///
/// A buffer is only returned here by its last user: workers return input
/// blocks after compressing, the drain returns output blocks after they
/// reached the sink. Buffers smaller than a block are dropped instead.
pub(crate) struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    buffer_capacity: usize,
    max_free: usize,
}

impl BufferPool {
    pub(crate) fn new(block_size: usize, concurrency: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            buffer_capacity: block_size + (block_size >> 4),
            max_free: concurrency * 3 + 2,
        }
    }

    pub(crate) fn get(&self) -> Vec<u8> {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.buffer_capacity))
    }

    pub(crate) fn put(&self, mut buf: Vec<u8>) {
        if buf.capacity() < self.buffer_capacity {
            return;
        }
        buf.clear();
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.max_free {
            free.push(buf);
        }
    }
}
