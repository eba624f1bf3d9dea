//! Buffer recycling

mod pool;

pub use pool::{BufferPool, FrameBuffer, PoolStats, SharedBufferPool, StalePolicy};
