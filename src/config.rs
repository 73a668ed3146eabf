use std::time::Duration;

use crate::error::Error;

/// Configuration for the event loop and its submission engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of submission queue entries.
    pub queue_size: u32,
    /// Maximum number of request records alive at once (pending plus
    /// in-flight). Pushing beyond this returns `QueueFull`.
    pub pool_capacity: usize,
    /// Number of provided buffers for multishot reads. Must be a power
    /// of two.
    pub buffer_count: u16,
    /// Size of each provided buffer in bytes.
    pub buffer_size: u32,
    /// Kernel buffer group id for the provided-buffer ring.
    pub buffer_group: u16,
    /// How long one `submit` call waits for a completion before the loop
    /// re-checks its stop flag and pending work.
    pub submit_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            queue_size: 1024,
            pool_capacity: 1024,
            buffer_count: 128,
            buffer_size: 2048,
            buffer_group: 1,
            submit_timeout: Duration::from_millis(100),
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), Error> {
        if self.queue_size == 0 || !self.queue_size.is_power_of_two() {
            return Err(Error::RingSetup(
                "queue_size must be a nonzero power of two".into(),
            ));
        }
        if self.pool_capacity == 0 {
            return Err(Error::RingSetup("pool_capacity must be nonzero".into()));
        }
        if self.buffer_count == 0 || !self.buffer_count.is_power_of_two() {
            return Err(Error::RingSetup(
                "buffer_count must be a nonzero power of two".into(),
            ));
        }
        if self.buffer_size == 0 {
            return Err(Error::RingSetup("buffer_size must be nonzero".into()));
        }
        Ok(())
    }
}
