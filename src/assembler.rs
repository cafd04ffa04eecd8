//! Frame reassembly from per-engine contributions.
//!
//! Contributions for one integration arrive from `engine_count` independent
//! engines, out of order and sometimes not at all. The assembler keeps a
//! bounded working set of in-flight frames (the most-recent `window`
//! counters) and flushes each frame exactly once: when every engine has
//! contributed, when it outlives the flush timeout, or when the window
//! evicts it. Incomplete flushes zero-fill the missing segments and clear
//! the complete flag — partial data delivered promptly beats complete data
//! delivered late.
//!
//! Downstream consumers observe strictly increasing counters: a completion
//! first force-flushes any older in-flight frames, and contributions at or
//! behind the last flushed counter are discarded as too late.
//!
//! The assembler itself is synchronous state; the session drives it from a
//! queue-consuming task with a periodic age check.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use crate::counters::{bump, SessionCounters};
use crate::protocol::{item, Contribution, DescriptorRegistry};

/// Assembler sizing, taken from [`crate::config::CaptureConfig`].
#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    /// Contributions per complete frame.
    pub engine_count: usize,
    /// Most-recent counters kept in flight.
    pub window: usize,
    /// Age at which an incomplete frame is force-flushed.
    pub flush_timeout: Duration,
}

/// A frame leaving the assembler for the fan-out consumers.
#[derive(Debug, Clone)]
pub struct FlushedFrame {
    /// Integration counter.
    pub counter: u64,
    /// Capture timestamp, ms since Unix epoch.
    pub timestamp_ms: u64,
    /// Accumulation length in effect for this frame.
    pub accumulation_length: u32,
    /// True when every engine contributed before the flush.
    pub complete: bool,
    /// True when a descriptor for the data item was cached by flush time;
    /// false means the payload is preserved raw but unparsed.
    pub parsed: bool,
    /// Full-bandwidth payload, contributions concatenated by engine index.
    pub payload: Bytes,
}

/// One in-flight frame.
struct Bucket {
    segments: Vec<Option<Bytes>>,
    filled: usize,
    segment_size: usize,
    first_seen: Instant,
    timestamp_ms: u64,
    accumulation_length: u32,
}

impl Bucket {
    fn new(engine_count: usize, contribution: &Contribution) -> Self {
        Self {
            segments: vec![None; engine_count],
            filled: 0,
            segment_size: contribution.payload.len(),
            first_seen: Instant::now(),
            timestamp_ms: contribution.timestamp_ms,
            accumulation_length: contribution.accumulation_length,
        }
    }
}

/// Reassembles contributions into frames, bounded by `window`.
pub struct FrameAssembler {
    config: AssemblerConfig,
    registry: Arc<DescriptorRegistry>,
    counters: Arc<SessionCounters>,
    buckets: BTreeMap<u64, Bucket>,
    highest_seen: Option<u64>,
    last_flushed: Option<u64>,
}

impl FrameAssembler {
    pub fn new(
        config: AssemblerConfig,
        registry: Arc<DescriptorRegistry>,
        counters: Arc<SessionCounters>,
    ) -> Self {
        Self {
            config,
            registry,
            counters,
            buckets: BTreeMap::new(),
            highest_seen: None,
            last_flushed: None,
        }
    }

    /// Insert one contribution; returns any frames flushed as a result, in
    /// counter order.
    pub fn insert(&mut self, contribution: Contribution) -> Vec<FlushedFrame> {
        let counter = contribution.counter;

        if self.is_too_late(counter) {
            warn!(counter, "contribution behind retained window, discarding");
            bump(&self.counters.late_drops);
            return Vec::new();
        }
        if contribution.engine_index >= self.config.engine_count {
            warn!(
                counter,
                engine = contribution.engine_index,
                "engine index out of range, discarding"
            );
            bump(&self.counters.protocol_errors);
            return Vec::new();
        }

        self.highest_seen = Some(self.highest_seen.map_or(counter, |h| h.max(counter)));

        let engine_count = self.config.engine_count;
        let bucket = self
            .buckets
            .entry(counter)
            .or_insert_with(|| Bucket::new(engine_count, &contribution));

        if bucket.segments[contribution.engine_index].is_some() {
            warn!(
                counter,
                engine = contribution.engine_index,
                "duplicate contribution, discarding"
            );
            bump(&self.counters.protocol_errors);
            return Vec::new();
        }
        if contribution.payload.len() != bucket.segment_size {
            warn!(
                counter,
                engine = contribution.engine_index,
                got = contribution.payload.len(),
                expected = bucket.segment_size,
                "segment size mismatch, discarding"
            );
            bump(&self.counters.protocol_errors);
            return Vec::new();
        }

        bucket.segments[contribution.engine_index] = Some(contribution.payload);
        bucket.filled += 1;

        let mut flushed = Vec::new();
        if bucket.filled == engine_count {
            // Preserve counter ordering downstream: everything older goes
            // out first, incomplete and flagged.
            flushed.extend(self.flush_older_than(counter));
            let bucket = self.buckets.remove(&counter).expect("bucket exists");
            flushed.push(self.flush_bucket(counter, bucket));
        }

        // Window overflow evicts the oldest in-flight frame.
        while self.buckets.len() > self.config.window {
            if let Some((counter, bucket)) = self.buckets.pop_first() {
                debug!(counter, "window full, evicting oldest in-flight frame");
                flushed.push(self.flush_bucket(counter, bucket));
            }
        }

        flushed
    }

    /// Force-flush frames that have outlived the flush timeout.
    ///
    /// Called periodically by the session's assembler task. Each aged frame
    /// is flushed exactly once; removal from the working set precedes
    /// delivery.
    pub fn flush_aged(&mut self, now: Instant) -> Vec<FlushedFrame> {
        let mut flushed = Vec::new();
        while let Some((&counter, bucket)) = self.buckets.first_key_value() {
            if now.duration_since(bucket.first_seen) < self.config.flush_timeout {
                break;
            }
            let bucket = self.buckets.remove(&counter).expect("bucket exists");
            warn!(
                counter,
                filled = bucket.filled,
                engines = self.config.engine_count,
                "flush timeout, forcing incomplete flush"
            );
            flushed.push(self.flush_bucket(counter, bucket));
        }
        flushed
    }

    /// Number of frames currently in flight.
    pub fn in_flight(&self) -> usize {
        self.buckets.len()
    }

    fn is_too_late(&self, counter: u64) -> bool {
        if self.last_flushed.is_some_and(|f| counter <= f) {
            return true;
        }
        self.highest_seen
            .is_some_and(|h| counter + (self.config.window as u64) <= h)
    }

    fn flush_older_than(&mut self, counter: u64) -> Vec<FlushedFrame> {
        let older: Vec<u64> = self
            .buckets
            .range(..counter)
            .map(|(&c, _)| c)
            .collect();
        older
            .into_iter()
            .map(|c| {
                let bucket = self.buckets.remove(&c).expect("bucket exists");
                warn!(
                    counter = c,
                    filled = bucket.filled,
                    "newer frame completed, flushing older frame incomplete"
                );
                self.flush_bucket(c, bucket)
            })
            .collect()
    }

    fn flush_bucket(&mut self, counter: u64, bucket: Bucket) -> FlushedFrame {
        let complete = bucket.filled == self.config.engine_count;
        let parsed = self.registry.contains(item::SEGMENT_DATA);
        if !parsed {
            warn!(counter, "no descriptor for data item, payload unparsed");
        }

        let mut payload = BytesMut::with_capacity(bucket.segment_size * bucket.segments.len());
        for segment in &bucket.segments {
            match segment {
                Some(bytes) => payload.put_slice(bytes),
                None => payload.put_bytes(0, bucket.segment_size),
            }
        }

        bump(&self.counters.frames_assembled);
        if !complete {
            bump(&self.counters.incomplete_flushes);
        }
        self.last_flushed = Some(counter);

        FlushedFrame {
            counter,
            timestamp_ms: bucket.timestamp_ms,
            accumulation_length: bucket.accumulation_length,
            complete,
            parsed,
            payload: payload.freeze(),
        }
    }
}
