//! Aggregate publisher: the live-display feed.
//!
//! Re-serializes each flushed frame into one or more outbound heaps whose
//! payload chunks stay under the configured maximum packet payload. Every
//! packet carries the frame counter, its byte offset within the frame, and
//! the total frame length, so a display consumer can reassemble — or
//! tolerate gaps. Transport is plain UDP with no retransmission; a missing
//! frame on a live display is cheaper than a stalled one.
//!
//! The publisher owns the outbound sequence number for the session. A send
//! failure is a transport error and fatal; re-chunking problems are not.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::assembler::FlushedFrame;
use crate::counters::{bump, SessionCounters};
use crate::error::{CaptureError, Result};
use crate::protocol::{item, HeapBuilder};

/// Publishes flushed frames as chunked heaps over UDP.
pub struct AggregatePublisher {
    socket: UdpSocket,
    dest: SocketAddr,
    max_payload: usize,
    sequence: u64,
    counters: Arc<SessionCounters>,
}

impl AggregatePublisher {
    /// Bind an ephemeral outbound socket aimed at `dest`.
    pub async fn bind(
        dest: SocketAddr,
        max_payload: usize,
        counters: Arc<SessionCounters>,
    ) -> Result<Self> {
        let bind_addr: SocketAddr = if dest.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(CaptureError::Transport)?;
        Ok(Self {
            socket,
            dest,
            max_payload,
            sequence: 0,
            counters,
        })
    }

    /// Current outbound sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Send one frame as a series of chunked heaps.
    pub async fn publish(&mut self, frame: &FlushedFrame) -> Result<()> {
        let total = frame.payload.len();
        let mut offset = 0usize;

        loop {
            let end = (offset + self.max_payload).min(total);
            let chunk = frame.payload.slice(offset..end);

            let heap = HeapBuilder::new(0)
                .immediate(item::FRAME_COUNTER, frame.counter)
                .immediate(item::SEQUENCE, self.sequence)
                .immediate(item::TIMESTAMP_MS, frame.timestamp_ms)
                .immediate(item::SEGMENT_OFFSET, offset as u64)
                .immediate(item::FRAME_LENGTH, total as u64)
                .addressed(item::SEGMENT_DATA, chunk)
                .build()?;

            self.socket
                .send_to(&heap, self.dest)
                .await
                .map_err(CaptureError::Transport)?;
            self.sequence += 1;
            bump(&self.counters.packets_published);

            offset = end;
            if offset >= total {
                break;
            }
        }

        debug!(
            counter = frame.counter,
            bytes = total,
            "frame republished"
        );
        Ok(())
    }
}

/// Spawn the publisher task consuming the assembler's fan-out channel.
///
/// Returns when the channel closes (orderly shutdown) or on a fatal
/// transport error, which propagates to the session supervisor.
pub fn spawn_publisher_task(
    mut publisher: AggregatePublisher,
    mut rx: mpsc::Receiver<FlushedFrame>,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = publisher.publish(&frame).await {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!(counter = frame.counter, error = %e, "frame not republished");
            }
        }
        info!("aggregate publisher stopped");
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::protocol::Heap;

    fn frame(counter: u64, payload: Vec<u8>) -> FlushedFrame {
        FlushedFrame {
            counter,
            timestamp_ms: 777,
            accumulation_length: 8192,
            complete: true,
            parsed: true,
            payload: Bytes::from(payload),
        }
    }

    async fn consumer() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    async fn recv_heap(socket: &UdpSocket) -> Heap {
        let mut buf = vec![0u8; 64 * 1024];
        let (len, _) = socket.recv_from(&mut buf).await.unwrap();
        Heap::decode(Bytes::copy_from_slice(&buf[..len])).unwrap()
    }

    #[tokio::test]
    async fn test_small_frame_single_packet() {
        let (consumer, dest) = consumer().await;
        let counters = Arc::new(SessionCounters::new());
        let mut publisher = AggregatePublisher::bind(dest, 1024, counters.clone())
            .await
            .unwrap();

        publisher.publish(&frame(42, vec![0xEE; 100])).await.unwrap();

        let heap = recv_heap(&consumer).await;
        assert_eq!(heap.immediate(item::FRAME_COUNTER), Some(42));
        assert_eq!(heap.immediate(item::SEQUENCE), Some(0));
        assert_eq!(heap.immediate(item::SEGMENT_OFFSET), Some(0));
        assert_eq!(heap.immediate(item::FRAME_LENGTH), Some(100));
        assert_eq!(heap.addressed(item::SEGMENT_DATA).unwrap().len(), 100);

        assert_eq!(counters.snapshot().packets_published, 1);
    }

    #[tokio::test]
    async fn test_large_frame_chunked_and_reassembles() {
        let (consumer, dest) = consumer().await;
        let mut publisher =
            AggregatePublisher::bind(dest, 256, Arc::new(SessionCounters::new()))
                .await
                .unwrap();

        let payload: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        publisher.publish(&frame(7, payload.clone())).await.unwrap();

        // 1000 bytes at 256 per packet: 4 chunks.
        let mut reassembled = vec![0u8; 1000];
        for _ in 0..4 {
            let heap = recv_heap(&consumer).await;
            assert_eq!(heap.immediate(item::FRAME_COUNTER), Some(7));
            assert_eq!(heap.immediate(item::FRAME_LENGTH), Some(1000));

            let offset = heap.immediate(item::SEGMENT_OFFSET).unwrap() as usize;
            let chunk = heap.addressed(item::SEGMENT_DATA).unwrap();
            assert!(chunk.len() <= 256);
            reassembled[offset..offset + chunk.len()].copy_from_slice(&chunk);
        }

        assert_eq!(reassembled, payload);
    }

    #[tokio::test]
    async fn test_sequence_increments_across_frames() {
        let (consumer, dest) = consumer().await;
        let mut publisher =
            AggregatePublisher::bind(dest, 1024, Arc::new(SessionCounters::new()))
                .await
                .unwrap();

        publisher.publish(&frame(1, vec![0; 8])).await.unwrap();
        publisher.publish(&frame(2, vec![0; 8])).await.unwrap();
        assert_eq!(publisher.sequence(), 2);

        let first = recv_heap(&consumer).await;
        let second = recv_heap(&consumer).await;
        assert_eq!(first.immediate(item::SEQUENCE), Some(0));
        assert_eq!(second.immediate(item::SEQUENCE), Some(1));
    }

    #[tokio::test]
    async fn test_publisher_task_drains_and_stops() {
        let (consumer, dest) = consumer().await;
        let publisher =
            AggregatePublisher::bind(dest, 1024, Arc::new(SessionCounters::new()))
                .await
                .unwrap();

        let (tx, rx) = mpsc::channel(8);
        let task = spawn_publisher_task(publisher, rx);

        tx.send(frame(9, vec![1, 2, 3])).await.unwrap();
        drop(tx);

        assert!(task.await.unwrap().is_ok());
        let heap = recv_heap(&consumer).await;
        assert_eq!(heap.immediate(item::FRAME_COUNTER), Some(9));
    }
}
