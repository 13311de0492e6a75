//! Contract between a codec session and the platform codec it drives.
//!
//! Platform codecs run asynchronously: they announce free input slots and
//! finished output slots through [`PlatformCallbacks`], typically from their
//! own thread. Implementations must never invoke callbacks from inside one of
//! the [`PlatformCodec`] methods, since the caller holds its session lock there.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use wavry_common::{
    CodecCapability, ConfigureFlags, CryptoInfo, MediaFormat, RenderTarget, SampleInfo, SlotId,
};

/// Failure reported asynchronously by the platform codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecFault {
    pub code: i32,
    /// Decode-class errors are recoverable; configuration/hardware loss is not.
    pub recoverable: bool,
}

pub trait PlatformCallbacks: Send + Sync {
    fn on_input_slot_available(&self, slot: SlotId);
    fn on_output_available(&self, slot: SlotId, info: SampleInfo);
    fn on_format_changed(&self, format: MediaFormat);
    fn on_error(&self, fault: CodecFault);
}

pub trait PlatformCodec: Send {
    fn configure(
        &mut self,
        format: &MediaFormat,
        target: RenderTarget,
        flags: ConfigureFlags,
        callbacks: Arc<dyn PlatformCallbacks>,
    ) -> Result<()>;

    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;

    /// Drop all queued work. Slots handed out before the flush become invalid
    /// and the codec stays idle until the next `start`.
    fn flush(&mut self) -> Result<()>;

    fn release(&mut self);

    /// Platform memory behind an input slot; `None` if the slot is not currently dequeued.
    fn input_buffer(&mut self, slot: SlotId) -> Option<&mut [u8]>;

    fn queue_input(
        &mut self,
        slot: SlotId,
        info: SampleInfo,
        crypto: Option<&CryptoInfo>,
    ) -> Result<()>;

    /// Platform memory behind an output slot; `None` if the slot is not currently pending.
    fn output_buffer(&self, slot: SlotId) -> Option<&[u8]>;

    fn release_output(&mut self, slot: SlotId, render: bool) -> Result<()>;
}

/// Creates platform codecs inside the session host.
pub trait CodecFactory: Send + Sync {
    fn capabilities(&self) -> Vec<CodecCapability>;

    fn create(&self, format: &MediaFormat, flags: ConfigureFlags) -> Result<Box<dyn PlatformCodec>>;

    fn capability_for(&self, format: &MediaFormat) -> Option<CodecCapability> {
        self.capabilities()
            .into_iter()
            .find(|cap| cap.codec == format.codec)
    }
}
