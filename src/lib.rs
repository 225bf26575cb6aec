pub mod buffer;
pub mod codec;
pub mod component;
pub mod convert;
pub mod device;
pub mod error;
pub mod host;
pub mod pipeline;
pub mod utils;

use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use component::{Component, ComponentSpec, Stats};
pub use error::{Error, Result};
pub use host::{ChannelHost, Host, HostEvent, HostMessage};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Component configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub buffers: BufferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Tag slots; must exceed the device's reorder depth plus one.
    pub ledger_size: usize,
    pub queue_wait_ms: u64,
    pub device_timeout_ms: u64,
    /// How long output stages wait for the first submission before re-checking state.
    pub start_wait_ms: u64,
    /// Input timestamps are decode timestamps.
    pub dts_mode: bool,
    /// Decode intra pictures only.
    pub thumbnail_mode: bool,
    pub max_consecutive_tag_misses: u32,
    pub pin_threads: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub input_buffer_count: usize,
    pub input_buffer_size: usize,
    /// Sink pool buffers beyond the device's reference picture count.
    pub extra_dpb_buffers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ledger_size: pipeline::ledger::DEFAULT_LEDGER_SIZE,
            queue_wait_ms: 20,
            device_timeout_ms: 20,
            start_wait_ms: 50,
            dts_mode: false,
            thumbnail_mode: false,
            max_consecutive_tag_misses: 8,
            pin_threads: false,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            input_buffer_count: 4,
            input_buffer_size: 1920 * 1080 * 3 / 2,
            extra_dpb_buffers: 3,
        }
    }
}

impl PipelineConfig {
    pub fn queue_wait(&self) -> Duration {
        Duration::from_millis(self.queue_wait_ms)
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_millis(self.device_timeout_ms)
    }

    pub fn start_wait(&self) -> Duration {
        Duration::from_millis(self.start_wait_ms)
    }
}
