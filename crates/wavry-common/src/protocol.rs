//! Values exchanged between a codec proxy and the session host.
//!
//! None of these types carry payload bytes. Payloads live in shared memory
//! regions referenced by [`BufferId`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Identity of one remote codec session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Versioned handle to a pooled buffer.
///
/// `generation` is bumped every time the slot at `index` is disposed, so an id
/// held across a dispose never matches the slot's next allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferId {
    pub index: u32,
    pub generation: u32,
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Platform codec buffer slot, as reported by the codec's callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotId(pub u32);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Input,
    Output,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct SampleFlags: u32 {
        const KEY_FRAME = 1 << 0;
        const CODEC_CONFIG = 1 << 1;
        const END_OF_STREAM = 1 << 2;
        const PARTIAL_FRAME = 1 << 3;
        const DECODE_ONLY = 1 << 4;
    }
}

/// Timing and layout of one sample's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleInfo {
    pub timestamp_us: i64,
    pub offset: usize,
    pub size: usize,
    pub flags: SampleFlags,
}

impl SampleInfo {
    pub fn new(timestamp_us: i64, size: usize, flags: SampleFlags) -> Self {
        Self {
            timestamp_us,
            offset: 0,
            size,
            flags,
        }
    }

    pub fn end_of_stream(timestamp_us: i64) -> Self {
        Self::new(timestamp_us, 0, SampleFlags::END_OF_STREAM)
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags.contains(SampleFlags::END_OF_STREAM)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionScheme {
    /// AES-CTR full sample / subsample encryption
    Cenc,
    /// AES-CBC pattern encryption
    Cbcs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsampleEntry {
    pub clear_bytes: u32,
    pub encrypted_bytes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionPattern {
    pub crypt_byte_block: u32,
    pub skip_byte_block: u32,
}

/// Per-sample decryption parameters handed through to the platform codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoInfo {
    pub scheme: EncryptionScheme,
    pub key_id: Vec<u8>,
    pub iv: Vec<u8>,
    pub subsamples: Vec<SubsampleEntry>,
    #[serde(default)]
    pub pattern: Option<EncryptionPattern>,
}

impl CryptoInfo {
    pub const KEY_ID_LEN: usize = 16;

    /// Check the descriptor against the payload it is meant to describe.
    pub fn validate(&self, sample_size: usize) -> Result<()> {
        if self.key_id.len() != Self::KEY_ID_LEN {
            return Err(Error::invalid_argument(format!(
                "key id must be {} bytes, got {}",
                Self::KEY_ID_LEN,
                self.key_id.len()
            )));
        }
        if self.iv.len() != 8 && self.iv.len() != 16 {
            return Err(Error::invalid_argument(format!(
                "iv must be 8 or 16 bytes, got {}",
                self.iv.len()
            )));
        }
        if self.scheme == EncryptionScheme::Cenc && self.pattern.is_some() {
            return Err(Error::invalid_argument("cenc does not take a pattern"));
        }
        if !self.subsamples.is_empty() {
            let covered: u64 = self
                .subsamples
                .iter()
                .map(|s| u64::from(s.clear_bytes) + u64::from(s.encrypted_bytes))
                .sum();
            if covered != sample_size as u64 {
                return Err(Error::invalid_argument(format!(
                    "subsamples cover {covered} bytes but sample has {sample_size}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Codec {
    Av1,
    Hevc,
    H264,
    Vp9,
    Opus,
    Aac,
}

impl Codec {
    pub fn is_video(&self) -> bool {
        matches!(self, Codec::Av1 | Codec::Hevc | Codec::H264 | Codec::Vp9)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resolution {
    pub width: u16,
    pub height: u16,
}

/// Stream format negotiated at configure time and reported on format changes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaFormat {
    pub codec: Codec,
    pub resolution: Resolution,
    /// Largest input sample the session accepts; also the input pool's initial buffer size.
    #[serde(default)]
    pub max_input_size: Option<usize>,
    #[serde(default)]
    pub enable_10bit: bool,
    #[serde(default)]
    pub enable_hdr: bool,
}

impl MediaFormat {
    pub fn video(codec: Codec, width: u16, height: u16) -> Self {
        Self {
            codec,
            resolution: Resolution { width, height },
            max_input_size: None,
            enable_10bit: false,
            enable_hdr: false,
        }
    }

    pub fn audio(codec: Codec) -> Self {
        Self::video(codec, 0, 0)
    }
}

/// Where decoded output ends up.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RenderTarget {
    /// Output bytes are copied into pooled buffers and handed to the caller.
    Buffers,
    /// Output is rendered straight to a presentation surface; samples carry no buffer.
    Surface { surface_id: u64 },
}

impl RenderTarget {
    pub fn is_surface(&self) -> bool {
        matches!(self, RenderTarget::Surface { .. })
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ConfigureFlags: u32 {
        const ENCODE = 1 << 0;
        const ADAPTIVE_PLAYBACK = 1 << 1;
        const TUNNELED = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CodecCapability {
    pub codec: Codec,
    pub hardware_accelerated: bool,
    pub supports_10bit: bool,
    pub supports_hdr10: bool,
    pub adaptive_playback: bool,
    pub tunneled_playback: bool,
}

impl CodecCapability {
    pub const fn sdr(codec: Codec, hardware_accelerated: bool) -> Self {
        Self {
            codec,
            hardware_accelerated,
            supports_10bit: false,
            supports_hdr10: false,
            adaptive_playback: false,
            tunneled_playback: false,
        }
    }
}

/// Returned from `input`; lets the caller detect work submitted before a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionToken {
    pub session: SessionId,
    pub generation: u32,
}

/// Answer to an input allocation: the buffer to fill and the generation it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputTicket {
    pub buffer: BufferId,
    pub capacity: usize,
    pub generation: u32,
}

/// A filled input buffer handed back for submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub buffer: BufferId,
    pub generation: u32,
    pub info: SampleInfo,
    #[serde(default)]
    pub crypto: Option<CryptoInfo>,
}

/// Describes one decoded output delivered to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDescriptor {
    pub info: SampleInfo,
    /// `None` when rendering to a surface.
    pub buffer: Option<BufferId>,
    pub generation: u32,
    /// Position in the session's delivery order.
    pub sequence: u64,
}

/// Client request to give an output back to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRelease {
    pub sequence: u64,
    pub generation: u32,
    pub render: bool,
}

/// Callbacks flowing from a session back to its client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    InputStatus { timestamp_us: i64, processed: bool },
    FormatChanged { format: MediaFormat },
    Output { output: OutputDescriptor },
    Error { fatal: bool },
}
