//! Configuration for codec sessions and the process hosting them.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::{Codec, ConfigureFlags, MediaFormat, RenderTarget};

/// Limits for one direction's buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Initial size class in bytes; `0` means unknown until the platform reports one.
    pub default_size: usize,
    /// Maximum number of buffers the pool may own at once.
    pub max_buffers: usize,
    /// Maximum bytes across all buffers the pool owns.
    pub max_total_bytes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            default_size: 0,
            max_buffers: 32,
            max_total_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Everything needed to create (and later re-create) a remote session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub format: MediaFormat,
    pub render_target: RenderTarget,
    pub flags: ConfigureFlags,
    #[serde(default)]
    pub input_pool: PoolConfig,
    #[serde(default)]
    pub output_pool: PoolConfig,
}

impl SessionConfig {
    pub fn decoder(format: MediaFormat) -> Self {
        Self {
            format,
            render_target: RenderTarget::Buffers,
            flags: ConfigureFlags::empty(),
            input_pool: PoolConfig::default(),
            output_pool: PoolConfig::default(),
        }
    }

    pub fn with_surface(mut self, surface_id: u64) -> Self {
        self.render_target = RenderTarget::Surface { surface_id };
        self
    }

    pub fn with_flags(mut self, flags: ConfigureFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn is_encoder(&self) -> bool {
        self.flags.contains(ConfigureFlags::ENCODE)
    }

    pub fn validate(&self) -> Result<()> {
        let res = self.format.resolution;
        if self.format.codec.is_video() && (res.width == 0 || res.height == 0) {
            return Err(Error::config(format!(
                "video format needs a resolution, got {}x{}",
                res.width, res.height
            )));
        }
        if self.is_encoder() && self.render_target.is_surface() {
            return Err(Error::config("an encoder cannot render to a surface"));
        }
        if self.flags.contains(ConfigureFlags::TUNNELED) && !self.render_target.is_surface() {
            return Err(Error::config("tunneled playback requires a surface"));
        }
        if let Some(max) = self.format.max_input_size {
            if max == 0 || max > self.input_pool.max_total_bytes {
                return Err(Error::config(format!(
                    "max input size {max} does not fit the input pool's {} byte limit",
                    self.input_pool.max_total_bytes
                )));
            }
        }
        for (name, pool) in [("input", &self.input_pool), ("output", &self.output_pool)] {
            if pool.max_buffers == 0 {
                return Err(Error::config(format!("{name} pool allows no buffers")));
            }
            if pool.default_size > pool.max_total_bytes {
                return Err(Error::config(format!(
                    "{name} pool default size {} exceeds its byte limit {}",
                    pool.default_size, pool.max_total_bytes
                )));
            }
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::decoder(MediaFormat::video(Codec::H264, 1920, 1080))
    }
}

/// Settings for the process hosting sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    pub max_sessions: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self { max_sessions: 16 }
    }
}
