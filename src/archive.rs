//! Archive container: session-lifetime persistence of completed frames.
//!
//! One container file per capture session:
//!
//! ```text
//! ┌───────┬─────────┬────────────────────┬──────────────────┬─ ─ ─
//! │ Magic │ Version │ Session record     │ Frame record     │ ...
//! │ XCAP  │ 1 byte  │ u32 len + msgpack  │ see below        │
//! └───────┴─────────┴────────────────────┴──────────────────┴─ ─ ─
//! ```
//!
//! The session record holds the attributes captured once at session start
//! (labels, equalization coefficients, bandwidth, channel count, timing).
//! Each frame record is `u32 meta_len + msgpack meta + u32 payload_len +
//! raw payload`, keyed by capture timestamp in the meta. All length
//! prefixes are Big Endian.
//!
//! The writer is a dedicated task over any `AsyncWrite`, fed by an mpsc
//! channel from the assembler. A record is durable only once its single
//! `write_all` reports success; a failure loses that record, is counted
//! and logged, and the session keeps running. The container is flushed and
//! shut down on every exit path.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use std::sync::Arc;

use crate::assembler::FlushedFrame;
use crate::config::ConfigSnapshot;
use crate::counters::{bump, SessionCounters};
use crate::error::{CaptureError, Result};

/// Container magic.
pub const ARCHIVE_MAGIC: &[u8; 4] = b"XCAP";

/// Container format version.
pub const ARCHIVE_VERSION: u8 = 1;

/// Default capacity of the assembler-to-archive channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Per-frame attributes stored alongside the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMeta {
    /// Capture timestamp, ms since Unix epoch; the record's key.
    pub timestamp_ms: u64,
    /// Integration counter.
    pub counter: u64,
    /// Accumulation length in effect for this frame.
    pub accumulation_length: u32,
    /// False when the frame was force-flushed with missing segments.
    pub complete: bool,
}

impl FrameMeta {
    fn from_frame(frame: &FlushedFrame) -> Self {
        Self {
            timestamp_ms: frame.timestamp_ms,
            counter: frame.counter,
            accumulation_length: frame.accumulation_length,
            complete: frame.complete,
        }
    }
}

/// One frame read back from a container.
#[derive(Debug, Clone)]
pub struct ArchiveRecord {
    pub meta: FrameMeta,
    pub payload: Bytes,
}

/// Encode the container preamble and session record.
fn encode_preamble(snapshot: &ConfigSnapshot) -> Result<Vec<u8>> {
    let session = rmp_serde::to_vec_named(snapshot)?;
    let mut buf = Vec::with_capacity(5 + 4 + session.len());
    buf.extend_from_slice(ARCHIVE_MAGIC);
    buf.push(ARCHIVE_VERSION);
    buf.extend_from_slice(&(session.len() as u32).to_be_bytes());
    buf.extend_from_slice(&session);
    Ok(buf)
}

/// Encode one frame record as a single contiguous buffer.
///
/// A single buffer keeps the write atomic from the container's point of
/// view: either the whole record lands or none of it does, so one failed
/// record does not corrupt the ones after it.
fn encode_record(frame: &FlushedFrame) -> Result<Vec<u8>> {
    let meta = rmp_serde::to_vec_named(&FrameMeta::from_frame(frame))?;
    let mut buf = Vec::with_capacity(4 + meta.len() + 4 + frame.payload.len());
    buf.extend_from_slice(&(meta.len() as u32).to_be_bytes());
    buf.extend_from_slice(&meta);
    buf.extend_from_slice(&(frame.payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&frame.payload);
    Ok(buf)
}

/// Spawn the archive task and return its join handle.
///
/// The task writes the preamble, then appends one record per received
/// frame until the channel closes, then flushes and shuts the writer down.
pub fn spawn_archive_task<W>(
    writer: W,
    snapshot: ConfigSnapshot,
    rx: mpsc::Receiver<FlushedFrame>,
    counters: Arc<SessionCounters>,
) -> JoinHandle<Result<()>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(archive_loop(writer, snapshot, rx, counters))
}

async fn archive_loop<W>(
    mut writer: W,
    snapshot: ConfigSnapshot,
    mut rx: mpsc::Receiver<FlushedFrame>,
    counters: Arc<SessionCounters>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    match encode_preamble(&snapshot) {
        Ok(preamble) => {
            if let Err(e) = writer.write_all(&preamble).await {
                warn!(error = %e, "archive preamble write failed");
                bump(&counters.storage_errors);
            }
        }
        Err(e) => {
            warn!(error = %e, "archive preamble encode failed");
            bump(&counters.storage_errors);
        }
    }

    while let Some(frame) = rx.recv().await {
        match write_record(&mut writer, &frame).await {
            Ok(()) => {
                bump(&counters.frames_archived);
                debug!(
                    counter = frame.counter,
                    timestamp_ms = frame.timestamp_ms,
                    complete = frame.complete,
                    "frame archived"
                );
            }
            Err(e) => {
                // Data loss for this frame is tolerated, not fatal.
                warn!(counter = frame.counter, error = %e, "frame record lost");
                bump(&counters.storage_errors);
            }
        }
    }

    // Channel closed: flush and close the container.
    if let Err(e) = writer.shutdown().await {
        warn!(error = %e, "archive close failed");
        bump(&counters.storage_errors);
    }
    info!("archive writer stopped");
    Ok(())
}

async fn write_record<W>(writer: &mut W, frame: &FlushedFrame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let record = encode_record(frame)?;
    writer
        .write_all(&record)
        .await
        .map_err(CaptureError::Storage)?;
    writer.flush().await.map_err(CaptureError::Storage)?;
    Ok(())
}

/// Parse a container back into its session attributes and frame records.
///
/// A truncated trailing record (interrupted session) is ignored; everything
/// durably written before it is returned.
pub fn read_archive(bytes: &[u8]) -> Result<(ConfigSnapshot, Vec<ArchiveRecord>)> {
    let invalid = |msg: &str| {
        CaptureError::Storage(std::io::Error::new(std::io::ErrorKind::InvalidData, msg))
    };

    if bytes.len() < 5 || &bytes[..4] != ARCHIVE_MAGIC {
        return Err(invalid("not an archive container"));
    }
    if bytes[4] != ARCHIVE_VERSION {
        return Err(invalid("unsupported container version"));
    }

    let mut pos = 5usize;
    let read_len = |bytes: &[u8], pos: usize| -> Option<usize> {
        let end = pos.checked_add(4)?;
        let chunk = bytes.get(pos..end)?;
        Some(u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as usize)
    };

    let session_len = read_len(bytes, pos).ok_or_else(|| invalid("missing session record"))?;
    pos += 4;
    let session_bytes = bytes
        .get(pos..pos + session_len)
        .ok_or_else(|| invalid("truncated session record"))?;
    let snapshot: ConfigSnapshot = rmp_serde::from_slice(session_bytes)?;
    pos += session_len;

    let mut records = Vec::new();
    loop {
        let Some(meta_len) = read_len(bytes, pos) else {
            break;
        };
        let Some(meta_bytes) = bytes.get(pos + 4..pos + 4 + meta_len) else {
            break;
        };
        let Some(payload_len) = read_len(bytes, pos + 4 + meta_len) else {
            break;
        };
        let payload_start = pos + 4 + meta_len + 4;
        let Some(payload) = bytes.get(payload_start..payload_start + payload_len) else {
            break;
        };

        let meta: FrameMeta = rmp_serde::from_slice(meta_bytes)?;
        records.push(ArchiveRecord {
            meta,
            payload: Bytes::copy_from_slice(payload),
        });
        pos = payload_start + payload_len;
    }

    Ok((snapshot, records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    fn snapshot() -> ConfigSnapshot {
        ConfigSnapshot {
            engine_count: 4,
            channel_count: 64,
            bandwidth_hz: 400e6,
            accumulation_length: 8192,
            clock_rate_hz: 800e6,
            sync_epoch_ms: 0,
            labels: vec!["0x".into(), "0y".into()],
            eq_coefficients: vec![vec![1.0, 2.0], vec![3.0, 4.0]],
        }
    }

    fn frame(counter: u64, payload: Vec<u8>) -> FlushedFrame {
        FlushedFrame {
            counter,
            timestamp_ms: 1000 + counter,
            accumulation_length: 8192,
            complete: true,
            parsed: true,
            payload: Bytes::from(payload),
        }
    }

    #[tokio::test]
    async fn test_container_roundtrip() {
        let (tx, rx) = mpsc::channel(8);
        let counters = Arc::new(SessionCounters::new());
        let buf: Vec<u8> = Vec::new();
        let task = spawn_archive_task(Cursor::new(buf), snapshot(), rx, counters.clone());

        tx.send(frame(1000, vec![0xAA; 16])).await.unwrap();
        tx.send(frame(1001, vec![0xBB; 16])).await.unwrap();
        drop(tx);

        task.await.unwrap().unwrap();
        assert_eq!(counters.snapshot().frames_archived, 2);
    }

    #[tokio::test]
    async fn test_written_container_reads_back() {
        // Drive the loop directly against an in-memory writer we keep.
        let mut buf = Cursor::new(Vec::new());
        let (tx, rx) = mpsc::channel(8);
        let counters = Arc::new(SessionCounters::new());

        tx.send(frame(1000, vec![0xAA; 8])).await.unwrap();
        let mut incomplete = frame(1001, vec![0xBB; 8]);
        incomplete.complete = false;
        tx.send(incomplete).await.unwrap();
        drop(tx);

        archive_loop(&mut buf, snapshot(), rx, counters)
            .await
            .unwrap();

        let (session, records) = read_archive(buf.get_ref()).unwrap();
        assert_eq!(session, snapshot());
        assert_eq!(records.len(), 2);

        assert_eq!(records[0].meta.counter, 1000);
        assert_eq!(records[0].meta.timestamp_ms, 2000);
        assert!(records[0].meta.complete);
        assert_eq!(&records[0].payload[..], &[0xAA; 8]);

        assert!(!records[1].meta.complete);
    }

    /// Writer that fails exactly one write call, by index, then behaves.
    struct FailOnce {
        inner: Cursor<Vec<u8>>,
        fail_on: usize,
        calls: usize,
    }

    impl AsyncWrite for FailOnce {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            let call = self.calls;
            self.calls += 1;
            if call == self.fail_on {
                return Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk unhappy",
                )));
            }
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    #[tokio::test]
    async fn test_storage_failure_does_not_block_next_frame() {
        // Call 0 is the preamble; call 1 is frame 1's record, which fails.
        let mut writer = FailOnce {
            inner: Cursor::new(Vec::new()),
            fail_on: 1,
            calls: 0,
        };
        let (tx, rx) = mpsc::channel(8);
        let counters = Arc::new(SessionCounters::new());

        tx.send(frame(1, vec![1; 4])).await.unwrap();
        tx.send(frame(2, vec![2; 4])).await.unwrap();
        drop(tx);

        archive_loop(&mut writer, snapshot(), rx, counters.clone())
            .await
            .unwrap();

        let snap = counters.snapshot();
        assert_eq!(snap.storage_errors, 1);
        assert_eq!(snap.frames_archived, 1);

        // Frame 1's record is lost whole; frame 2 is intact after it.
        let (_, records) = read_archive(writer.inner.get_ref()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].meta.counter, 2);
    }

    #[test]
    fn test_read_rejects_bad_magic() {
        let err = read_archive(b"NOPE\x01").unwrap_err();
        assert!(matches!(err, CaptureError::Storage(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_read_tolerates_truncated_tail() {
        let preamble = encode_preamble(&snapshot()).unwrap();
        let record = encode_record(&frame(1, vec![9; 8])).unwrap();

        let mut bytes = preamble;
        bytes.extend_from_slice(&record);
        // A second record cut off mid-payload.
        bytes.extend_from_slice(&record[..record.len() / 2]);

        let (_, records) = read_archive(&bytes).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].meta.counter, 1);
    }

    #[test]
    fn test_record_encoding_layout() {
        let record = encode_record(&frame(5, vec![7; 3])).unwrap();

        let meta_len = u32::from_be_bytes(record[..4].try_into().unwrap()) as usize;
        let payload_len_at = 4 + meta_len;
        let payload_len = u32::from_be_bytes(
            record[payload_len_at..payload_len_at + 4].try_into().unwrap(),
        ) as usize;

        assert_eq!(payload_len, 3);
        assert_eq!(&record[payload_len_at + 4..], &[7, 7, 7]);
    }
}
