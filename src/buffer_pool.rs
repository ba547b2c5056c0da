use parking_lot::Mutex;

/// Size of one relay read
pub const RELAY_BUFFER_SIZE: usize = 64 * 1024;

const MAX_POOL_SIZE: usize = 64;

/// Pool of relay buffers so long-lived tunnels don't churn the allocator
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(MAX_POOL_SIZE)),
        }
    }

    /// Get a buffer from the pool or create a new one
    pub fn get_buffer(&self) -> Vec<u8> {
        match self.buffers.lock().pop() {
            Some(buffer) => buffer,
            None => vec![0u8; RELAY_BUFFER_SIZE],
        }
    }

    /// Return a buffer to the pool for reuse
    pub fn return_buffer(&self, mut buffer: Vec<u8>) {
        // Reject buffers with wrong capacity to avoid memory bloat
        if buffer.capacity() < RELAY_BUFFER_SIZE || buffer.capacity() > RELAY_BUFFER_SIZE * 2 {
            return;
        }

        // Zero on return so data never crosses tunnels
        buffer.clear();
        buffer.resize(RELAY_BUFFER_SIZE, 0);

        let mut pool = self.buffers.lock();
        if pool.len() < MAX_POOL_SIZE {
            pool.push(buffer);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Global buffer pool instance
static BUFFER_POOL: std::sync::OnceLock<BufferPool> = std::sync::OnceLock::new();

fn buffer_pool() -> &'static BufferPool {
    BUFFER_POOL.get_or_init(BufferPool::new)
}

/// RAII lease that returns the buffer to the global pool on drop
#[derive(Debug)]
pub struct BufferLease {
    buffer: Vec<u8>,
}

impl BufferLease {
    pub fn new() -> Self {
        Self {
            buffer: buffer_pool().get_buffer(),
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buffer.as_mut_slice()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buffer.as_slice()
    }
}

impl Default for BufferLease {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        buffer_pool().return_buffer(std::mem::take(&mut self.buffer));
    }
}
