use crate::error::{DizError, Result};

/// Size of the dictionary carried from one block into the next.
pub const TAIL_SIZE: usize = 16 * 1024;
pub const DEFAULT_BLOCK_SIZE: usize = 1 << 20;
pub const DEFAULT_LEVEL: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionConfig {
    /// Deflate level, 0 (store) through 9 (best).
    pub level: u32,
    /// Uncompressed bytes per block; each block is one unit of parallel work.
    pub block_size: usize,
    /// Maximum number of blocks in flight between `write` and the sink.
    pub concurrency: usize,
}

impl CompressionConfig {
    pub fn new(level: u32, block_size: usize, concurrency: usize) -> Result<Self> {
        let config = Self {
            level,
            block_size,
            concurrency,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size <= TAIL_SIZE {
            return Err(DizError::InvalidConfig(format!(
                "block size must be larger than {TAIL_SIZE} bytes, got {}",
                self.block_size
            )));
        }
        if self.concurrency == 0 {
            return Err(DizError::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.level > 9 {
            return Err(DizError::InvalidConfig(format!(
                "compression level must be between 0 and 9, got {}",
                self.level
            )));
        }
        Ok(())
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            level: DEFAULT_LEVEL,
            block_size: DEFAULT_BLOCK_SIZE,
            concurrency: cpus * 2,
        }
    }
}
