//! # xcapture
//!
//! Capture core for a correlator X-engine array: ingests the packetized
//! heap stream the engines emit, reassembles per-engine fragments into
//! complete integration frames, optionally rescales them by accumulation
//! length, persists them to a session archive container, and republishes
//! an aggregate stream for live-display consumers.
//!
//! ## Architecture
//!
//! - **Data Plane** (UDP in): receiver → bounded queue → assembler →
//!   two independent fan-out consumers (archive writer, aggregate
//!   publisher)
//! - **Control Plane** (UDP out, on demand): descriptor issuer emitting
//!   bootstrap metadata, decoupled from frame cadence
//!
//! ## Example
//!
//! ```ignore
//! use xcapture::{CaptureConfig, CaptureSession, ConfigSnapshot};
//!
//! #[tokio::main]
//! async fn main() -> xcapture::Result<()> {
//!     let config = CaptureConfig::load(None)?;
//!     let snapshot: ConfigSnapshot = hardware_layer_snapshot();
//!
//!     let session = CaptureSession::start(config, snapshot).await?;
//!     // ... runs until stopped or a fatal transport error ...
//!     session.wait().await
//! }
//! ```

pub mod archive;
pub mod assembler;
pub mod config;
pub mod control;
pub mod counters;
pub mod error;
pub mod protocol;
pub mod publisher;
pub mod queue;
pub mod receiver;
pub mod scaler;
pub mod session;

pub use config::{CaptureConfig, ConfigSnapshot};
pub use error::{CaptureError, Result};
pub use session::CaptureSession;
