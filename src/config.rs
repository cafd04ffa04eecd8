//! Capture configuration and the hardware-layer snapshot.
//!
//! Two structures feed a session:
//!
//! - [`CaptureConfig`] — our own knobs (endpoints, archive path, queue and
//!   window sizing). Loaded from an optional TOML file layered with
//!   `XCAPTURE_`-prefixed environment variables.
//! - [`ConfigSnapshot`] — the read-only view of the hardware-control layer
//!   taken at session start: accumulation length, engine count, bandwidth,
//!   channel count, input labels, equalization coefficients, timing.
//!
//! Both validate eagerly; a missing or malformed field fails session startup
//! with [`CaptureError::Config`] instead of surfacing mid-capture.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, Result};

fn default_listen_addr() -> SocketAddr {
    "0.0.0.0:7148".parse().unwrap()
}

fn default_publish_addr() -> SocketAddr {
    "127.0.0.1:7149".parse().unwrap()
}

fn default_archive_path() -> PathBuf {
    PathBuf::from("capture.xcap")
}

fn default_max_packet_payload() -> usize {
    4096
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_window() -> usize {
    4
}

fn default_flush_timeout_ms() -> u64 {
    2000
}

fn default_normalize() -> bool {
    true
}

/// Capture-side configuration.
///
/// The reorder window and force-flush timeout are deliberately explicit
/// fields rather than constants; both trade completeness against memory and
/// latency and belong in the operator's hands.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Address the heap receiver binds.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Destination endpoint for the aggregate display stream.
    #[serde(default = "default_publish_addr")]
    pub publish_addr: SocketAddr,
    /// Archive container path for this session.
    #[serde(default = "default_archive_path")]
    pub archive_path: PathBuf,
    /// Maximum payload bytes per outbound aggregate packet.
    #[serde(default = "default_max_packet_payload")]
    pub max_packet_payload: usize,
    /// Receiver-to-assembler queue depth before drop-oldest kicks in.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Number of most-recent counters kept in flight under reordering.
    #[serde(default = "default_window")]
    pub window: usize,
    /// Milliseconds an incomplete frame may age before a forced flush.
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,
    /// Divide frame values by accumulation length before delivery.
    #[serde(default = "default_normalize")]
    pub normalize: bool,
}

impl CaptureConfig {
    /// Load configuration from an optional TOML file plus environment.
    ///
    /// Layering order: file (if given, or `./xcapture.toml` when present),
    /// then environment variables prefixed `XCAPTURE_` (e.g.
    /// `XCAPTURE_LISTEN_ADDR=0.0.0.0:7300`). Validates before returning.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        builder = match path {
            Some(p) => builder.add_source(File::from(p)),
            None => builder.add_source(File::with_name("xcapture").required(false)),
        };
        builder = builder.add_source(Environment::with_prefix("XCAPTURE"));

        let cfg: Self = builder
            .build()
            .map_err(|e| CaptureError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| CaptureError::Config(e.to_string()))?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Check every field the workers depend on.
    pub fn validate(&self) -> Result<()> {
        if self.max_packet_payload == 0 {
            return Err(CaptureError::Config(
                "max_packet_payload must be positive".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(CaptureError::Config("queue_capacity must be positive".into()));
        }
        if self.window == 0 {
            return Err(CaptureError::Config("window must be positive".into()));
        }
        if self.flush_timeout_ms == 0 {
            return Err(CaptureError::Config(
                "flush_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            publish_addr: default_publish_addr(),
            archive_path: default_archive_path(),
            max_packet_payload: default_max_packet_payload(),
            queue_capacity: default_queue_capacity(),
            window: default_window(),
            flush_timeout_ms: default_flush_timeout_ms(),
            normalize: default_normalize(),
        }
    }
}

/// Read-only configuration snapshot from the hardware-control layer.
///
/// Captured once at session start; the session never mutates it. Also
/// serialized verbatim into the archive container's session record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigSnapshot {
    /// Number of X-engines contributing to each frame.
    pub engine_count: usize,
    /// Spectral channels across the full bandwidth.
    pub channel_count: usize,
    /// Processed bandwidth in Hz.
    pub bandwidth_hz: f64,
    /// Samples integrated into one frame's values.
    pub accumulation_length: u32,
    /// ADC clock rate in Hz; with the accumulation length this fixes the
    /// frame cadence.
    pub clock_rate_hz: f64,
    /// Sync epoch as milliseconds since the Unix epoch; counter 0 maps here.
    pub sync_epoch_ms: u64,
    /// Input labels, one per physical input.
    pub labels: Vec<String>,
    /// Per-input equalization coefficients, as applied upstream.
    pub eq_coefficients: Vec<Vec<f32>>,
}

impl ConfigSnapshot {
    /// Check the invariants the capture core relies on.
    pub fn validate(&self) -> Result<()> {
        if self.engine_count == 0 {
            return Err(CaptureError::Config("engine count must be positive".into()));
        }
        if self.channel_count == 0 {
            return Err(CaptureError::Config(
                "channel count must be positive".into(),
            ));
        }
        if self.accumulation_length == 0 {
            return Err(CaptureError::Config(
                "accumulation length must be positive".into(),
            ));
        }
        if !(self.clock_rate_hz > 0.0) {
            return Err(CaptureError::Config("clock rate must be positive".into()));
        }
        if !(self.bandwidth_hz > 0.0) {
            return Err(CaptureError::Config("bandwidth must be positive".into()));
        }
        if !self.labels.is_empty()
            && !self.eq_coefficients.is_empty()
            && self.labels.len() != self.eq_coefficients.len()
        {
            return Err(CaptureError::Config(format!(
                "{} labels but {} equalization entries",
                self.labels.len(),
                self.eq_coefficients.len()
            )));
        }
        Ok(())
    }

    /// Capture timestamp for a frame counter, in milliseconds since the
    /// Unix epoch.
    ///
    /// One counter step spans `accumulation_length` clock cycles.
    pub fn timestamp_ms(&self, counter: u64) -> u64 {
        let period_ms = f64::from(self.accumulation_length) * 1000.0 / self.clock_rate_hz;
        self.sync_epoch_ms + (counter as f64 * period_ms) as u64
    }
}
