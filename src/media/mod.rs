//! Media data handling between the network and the decoders.
//!
//! - [`MediaBuffer`]: circular frame queue filled by a streaming channel
//! - [`NativeBufferPool`]: reusable buffers for decompressed alpha planes
//! - [`es`]: parser for the elementary-stream container carried in each frame

pub mod buffer;
pub mod es;
pub mod pool;

pub use buffer::MediaBuffer;
pub use es::{ContentType, EsFrame, FrameTimestamp, FrameType};
pub use pool::{NativeBufferPool, PooledBuffer};
