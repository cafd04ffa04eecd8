//! Descriptor issuer: bootstrap metadata for downstream consumers.
//!
//! A consumer joining the aggregate stream mid-session knows nothing about
//! the items it will see. The issuer emits everything needed to bootstrap,
//! each piece as an independent heap, in fixed order when a full bootstrap
//! is requested:
//!
//! 1. data item descriptors
//! 2. static configuration metadata (bandwidth, channel count, engine count)
//! 3. timing metadata (sync epoch, clock rate)
//! 4. equalization coefficients
//! 5. input labelling
//!
//! Every operation is synchronous, one-shot, and side-effect-free beyond
//! the transmission itself — safe to repeat at any time without touching
//! live frame processing. Heap construction is deterministic, so a reissue
//! after a consumer restart is byte-identical to the initial issuance.
//!
//! The issuer owns a plain blocking UDP socket: these are occasional
//! control-plane sends, kept off the async data plane and out of its
//! failure domain.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ConfigSnapshot;
use crate::error::{CaptureError, Result};
use crate::protocol::{flags, item, DescriptorRegistry, HeapBuilder};

/// Static configuration metadata blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticMeta {
    pub bandwidth_hz: f64,
    pub channel_count: u64,
    pub engine_count: u64,
}

/// Timing metadata blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingMeta {
    pub sync_epoch_ms: u64,
    pub clock_rate_hz: f64,
}

/// Equalization coefficient blob, one entry per input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EqMeta {
    pub coefficients: Vec<Vec<f32>>,
}

/// Input labelling blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Labelling {
    pub labels: Vec<String>,
}

/// Emits bootstrap heaps to the aggregate stream endpoint.
pub struct DescriptorIssuer {
    socket: UdpSocket,
    dest: SocketAddr,
    snapshot: ConfigSnapshot,
    registry: Arc<DescriptorRegistry>,
}

impl DescriptorIssuer {
    /// Bind the issuer's control socket.
    pub fn new(
        dest: SocketAddr,
        snapshot: ConfigSnapshot,
        registry: Arc<DescriptorRegistry>,
    ) -> Result<Self> {
        let bind_addr = if dest.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).map_err(CaptureError::Transport)?;
        Ok(Self {
            socket,
            dest,
            snapshot,
            registry,
        })
    }

    /// Full bootstrap, in the fixed order consumers expect.
    pub fn issue_all(&self) -> Result<()> {
        self.issue_data_descriptors()?;
        self.issue_static_meta()?;
        self.issue_timing_meta()?;
        self.issue_eq_meta()?;
        self.issue_labelling()?;
        Ok(())
    }

    /// Emit one descriptor heap per cached data item descriptor.
    pub fn issue_data_descriptors(&self) -> Result<()> {
        for heap in self.build_descriptor_heaps()? {
            self.send(&heap)?;
        }
        debug!(count = self.registry.len(), "data descriptors issued");
        Ok(())
    }

    /// Emit the static configuration metadata heap.
    pub fn issue_static_meta(&self) -> Result<()> {
        self.send(&self.build_static_meta_heap()?)
    }

    /// Emit the timing metadata heap.
    pub fn issue_timing_meta(&self) -> Result<()> {
        self.send(&self.build_timing_meta_heap()?)
    }

    /// Emit the equalization coefficient heap.
    pub fn issue_eq_meta(&self) -> Result<()> {
        self.send(&self.build_eq_meta_heap()?)
    }

    /// Emit the input labelling heap.
    pub fn issue_labelling(&self) -> Result<()> {
        self.send(&self.build_labelling_heap()?)
    }

    /// One descriptor heap per registry entry, ordered by item identifier.
    pub fn build_descriptor_heaps(&self) -> Result<Vec<Vec<u8>>> {
        self.registry
            .snapshot()
            .iter()
            .map(|descriptor| {
                HeapBuilder::new(flags::IS_DESCRIPTOR)
                    .addressed(item::DESCRIPTOR_BLOB, descriptor.encode()?)
                    .build()
            })
            .collect()
    }

    pub fn build_static_meta_heap(&self) -> Result<Vec<u8>> {
        let blob = rmp_serde::to_vec_named(&StaticMeta {
            bandwidth_hz: self.snapshot.bandwidth_hz,
            channel_count: self.snapshot.channel_count as u64,
            engine_count: self.snapshot.engine_count as u64,
        })?;
        HeapBuilder::new(flags::IS_METADATA)
            .addressed(item::STATIC_META, blob)
            .build()
    }

    pub fn build_timing_meta_heap(&self) -> Result<Vec<u8>> {
        let blob = rmp_serde::to_vec_named(&TimingMeta {
            sync_epoch_ms: self.snapshot.sync_epoch_ms,
            clock_rate_hz: self.snapshot.clock_rate_hz,
        })?;
        HeapBuilder::new(flags::IS_METADATA)
            .addressed(item::TIMING_META, blob)
            .build()
    }

    pub fn build_eq_meta_heap(&self) -> Result<Vec<u8>> {
        let blob = rmp_serde::to_vec_named(&EqMeta {
            coefficients: self.snapshot.eq_coefficients.clone(),
        })?;
        HeapBuilder::new(flags::IS_METADATA)
            .addressed(item::EQ_META, blob)
            .build()
    }

    pub fn build_labelling_heap(&self) -> Result<Vec<u8>> {
        let blob = rmp_serde::to_vec_named(&Labelling {
            labels: self.snapshot.labels.clone(),
        })?;
        HeapBuilder::new(flags::IS_METADATA)
            .addressed(item::LABELLING, blob)
            .build()
    }

    fn send(&self, heap: &[u8]) -> Result<()> {
        self.socket
            .send_to(heap, self.dest)
            .map_err(CaptureError::Transport)?;
        Ok(())
    }
}
