use wavry_common::{BufferId, CryptoInfo, SampleInfo};

use crate::buffer_pool::Buffer;

/// A timed unit of media plus the buffer holding its payload.
///
/// Render-to-surface outputs and end-of-stream markers carry no buffer.
#[derive(Debug)]
pub struct Sample {
    info: SampleInfo,
    crypto: Option<CryptoInfo>,
    buffer: Option<Buffer>,
}

impl Sample {
    pub fn with_buffer(buffer: Buffer, info: SampleInfo) -> Self {
        Self {
            info,
            crypto: None,
            buffer: Some(buffer),
        }
    }

    pub fn without_buffer(info: SampleInfo) -> Self {
        Self {
            info,
            crypto: None,
            buffer: None,
        }
    }

    pub fn info(&self) -> &SampleInfo {
        &self.info
    }

    pub fn set_info(&mut self, info: SampleInfo) {
        self.info = info;
    }

    pub fn crypto(&self) -> Option<&CryptoInfo> {
        self.crypto.as_ref()
    }

    pub fn set_crypto(&mut self, crypto: Option<CryptoInfo>) {
        self.crypto = crypto;
    }

    pub fn buffer(&self) -> Option<&Buffer> {
        self.buffer.as_ref()
    }

    pub fn buffer_id(&self) -> Option<BufferId> {
        self.buffer.as_ref().map(Buffer::id)
    }

    /// Detach the buffer so it can go back to its pool.
    pub fn take_buffer(&mut self) -> Option<Buffer> {
        self.buffer.take()
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.info.is_end_of_stream()
    }
}
