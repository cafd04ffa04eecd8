//! Heap receiver: the dedicated UDP receive worker.
//!
//! One task owns the inbound socket and nothing else. Per datagram it
//! decodes the heap, routes descriptor heaps into the shared registry, and
//! turns data heaps into contributions pushed onto the drop-oldest queue —
//! so the network path never waits on assembly, disk, or the display feed.
//!
//! Malformed packets are logged, counted, and dropped; they never escalate.
//! A socket-level receive failure is fatal and propagates to the session
//! supervisor. On every exit path the queue sentinel is injected so the
//! assembler drains and stops.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ConfigSnapshot;
use crate::counters::{bump, SessionCounters};
use crate::error::{CaptureError, Result};
use crate::protocol::{item, Contribution, DescriptorRegistry, Heap, ItemDescriptor};
use crate::queue::DropOldestQueue;

/// Receive buffer size; comfortably above the largest legal datagram.
const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// The receive worker. Constructed bound; consumed by [`HeapReceiver::run`].
pub struct HeapReceiver {
    socket: UdpSocket,
    snapshot: ConfigSnapshot,
    registry: Arc<DescriptorRegistry>,
    queue: Arc<DropOldestQueue<Contribution>>,
    counters: Arc<SessionCounters>,
    stop: watch::Receiver<bool>,
}

impl HeapReceiver {
    /// Bind the inbound socket.
    ///
    /// A bind failure is a transport error and fails session startup.
    pub async fn bind(
        listen_addr: SocketAddr,
        snapshot: ConfigSnapshot,
        registry: Arc<DescriptorRegistry>,
        queue: Arc<DropOldestQueue<Contribution>>,
        counters: Arc<SessionCounters>,
        stop: watch::Receiver<bool>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(listen_addr)
            .await
            .map_err(CaptureError::Transport)?;
        Ok(Self {
            socket,
            snapshot,
            registry,
            queue,
            counters,
            stop,
        })
    }

    /// The bound local address (useful when binding port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(CaptureError::Transport)
    }

    /// Run the receive loop until the stop signal or a fatal socket error.
    pub async fn run(mut self) -> Result<()> {
        info!(addr = %self.local_addr()?, "heap receiver listening");
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        let result = loop {
            tokio::select! {
                changed = self.stop.changed() => {
                    // A dropped sender also means shutdown.
                    if changed.is_err() || *self.stop.borrow() {
                        break Ok(());
                    }
                }
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, _peer)) => self.handle_datagram(&buf[..len]),
                        Err(e) => {
                            warn!(error = %e, "socket receive failed, shutting down");
                            break Err(CaptureError::Transport(e));
                        }
                    }
                }
            }
        };

        // Orderly drain downstream on every exit path.
        self.queue.push_sentinel();
        result
    }

    fn handle_datagram(&self, datagram: &[u8]) {
        let heap = match Heap::decode(Bytes::copy_from_slice(datagram)) {
            Ok(heap) => heap,
            Err(e) => {
                warn!(len = datagram.len(), error = %e, "malformed datagram dropped");
                bump(&self.counters.protocol_errors);
                return;
            }
        };

        if heap.header.is_descriptor() {
            self.handle_descriptor(&heap);
        } else if heap.header.is_metadata() {
            // Metadata heaps are something we emit, not consume.
            debug!("ignoring inbound metadata heap");
        } else {
            self.handle_data(&heap);
        }
    }

    fn handle_descriptor(&self, heap: &Heap) {
        let Some(blob) = heap.addressed(item::DESCRIPTOR_BLOB) else {
            warn!("descriptor heap without descriptor blob, dropped");
            bump(&self.counters.protocol_errors);
            return;
        };
        match ItemDescriptor::decode(&blob) {
            Ok(descriptor) => {
                let id = descriptor.id;
                let refreshed = self.registry.insert(descriptor);
                debug!(id, refreshed, "descriptor cached");
            }
            Err(e) => {
                warn!(error = %e, "undecodable descriptor blob, dropped");
                bump(&self.counters.protocol_errors);
            }
        }
    }

    fn handle_data(&self, heap: &Heap) {
        let Some(counter) = heap.immediate(item::FRAME_COUNTER) else {
            warn!("data heap without frame counter, dropped");
            bump(&self.counters.protocol_errors);
            return;
        };
        let Some(engine) = heap.immediate(item::ENGINE_INDEX) else {
            warn!(counter, "data heap without engine index, dropped");
            bump(&self.counters.protocol_errors);
            return;
        };
        let Some(payload) = heap.addressed(item::SEGMENT_DATA) else {
            warn!(counter, "data heap without payload segment, dropped");
            bump(&self.counters.protocol_errors);
            return;
        };
        let engine_index = engine as usize;
        if engine_index >= self.snapshot.engine_count {
            warn!(
                counter,
                engine = engine_index,
                engines = self.snapshot.engine_count,
                "engine index out of range, dropped"
            );
            bump(&self.counters.protocol_errors);
            return;
        }

        // Heaps may omit the per-frame attributes; fall back to values
        // derived from the session snapshot.
        let timestamp_ms = heap
            .immediate(item::TIMESTAMP_MS)
            .unwrap_or_else(|| self.snapshot.timestamp_ms(counter));
        let accumulation_length = heap
            .immediate(item::ACCUMULATION_LENGTH)
            .map_or(self.snapshot.accumulation_length, |v| v as u32);

        let contribution = Contribution {
            counter,
            engine_index,
            timestamp_ms,
            accumulation_length,
            payload,
        };

        if let Some(dropped) = self.queue.push(contribution) {
            warn!(
                counter = dropped.counter,
                engine = dropped.engine_index,
                "receive queue saturated, dropped oldest contribution"
            );
            bump(&self.counters.queue_drops);
        }
    }
}
