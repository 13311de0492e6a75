//! Pooled sample buffers, shared memory regions and the platform codec contract.

#![forbid(unsafe_code)]

pub mod buffer_pool;
pub mod codec;
pub mod loopback;
pub mod memory;
pub mod sample;

pub use buffer_pool::{Buffer, BufferPool, BufferPoolStats, PoolMode};
pub use codec::{CodecFactory, CodecFault, PlatformCallbacks, PlatformCodec};
pub use loopback::{LoopbackCodec, LoopbackCodecFactory, LoopbackConfig, LoopbackDriver, LoopbackStats};
pub use memory::SharedMemory;
pub use sample::Sample;

pub use wavry_common::{Codec, MediaFormat, Resolution};
