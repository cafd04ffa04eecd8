//! Heap struct with typed item accessors, plus the outbound builder.
//!
//! A heap is the atomic transport unit: header, item-pointer list, payload
//! pool. Decoding is strict — a datagram must contain exactly the bytes the
//! header declares — so a malformed packet is rejected as a whole instead of
//! yielding a half-parsed heap. Uses `bytes::Bytes` so pool segments are
//! shared zero-copy with downstream consumers.

use bytes::Bytes;

use super::wire_format::{
    HeapHeader, ItemAddress, ItemPointer, DEFAULT_MAX_POOL_SIZE, HEADER_SIZE, ITEM_POINTER_SIZE,
};
use crate::error::{CaptureError, Result};

/// A decoded heap.
#[derive(Debug, Clone)]
pub struct Heap {
    /// Decoded header.
    pub header: HeapHeader,
    /// Item pointers, in wire order.
    pub pointers: Vec<ItemPointer>,
    /// Payload pool (zero-copy via `bytes::Bytes`).
    pub pool: Bytes,
}

impl Heap {
    /// Decode a heap from a single datagram.
    ///
    /// Validates the header, requires the datagram length to match the
    /// declared item count and pool length exactly, and bounds-checks every
    /// pool offset.
    pub fn decode(datagram: Bytes) -> Result<Self> {
        let header = HeapHeader::decode(&datagram)
            .ok_or_else(|| CaptureError::Protocol("datagram shorter than header".to_string()))?;
        header.validate(DEFAULT_MAX_POOL_SIZE)?;

        let pointer_bytes = usize::from(header.item_count) * ITEM_POINTER_SIZE;
        let expected = HEADER_SIZE + pointer_bytes + header.pool_length as usize;
        if datagram.len() != expected {
            return Err(CaptureError::Protocol(format!(
                "datagram length {} does not match declared {}",
                datagram.len(),
                expected
            )));
        }

        let mut pointers = Vec::with_capacity(usize::from(header.item_count));
        for i in 0..usize::from(header.item_count) {
            let start = HEADER_SIZE + i * ITEM_POINTER_SIZE;
            let ptr = ItemPointer::decode(&datagram[start..start + ITEM_POINTER_SIZE])
                .expect("slice has exactly one pointer");
            pointers.push(ptr);
        }

        let pool = datagram.slice(HEADER_SIZE + pointer_bytes..);

        for ptr in &pointers {
            if let ItemAddress::Offset(offset) = ptr.address {
                if offset > pool.len() as u64 {
                    return Err(CaptureError::Protocol(format!(
                        "item 0x{:04x} offset {} beyond pool of {} bytes",
                        ptr.id,
                        offset,
                        pool.len()
                    )));
                }
            }
        }

        Ok(Self {
            header,
            pointers,
            pool,
        })
    }

    /// Get an immediate item's value by identifier.
    pub fn immediate(&self, id: u16) -> Option<u64> {
        self.pointers.iter().find_map(|p| match p.address {
            ItemAddress::Immediate(v) if p.id == id => Some(v),
            _ => None,
        })
    }

    /// Get an addressed item's pool segment by identifier.
    ///
    /// An addressed item's extent runs from its offset to the next higher
    /// offset claimed by any other addressed item, or to the pool end.
    pub fn addressed(&self, id: u16) -> Option<Bytes> {
        let offset = self.pointers.iter().find_map(|p| match p.address {
            ItemAddress::Offset(o) if p.id == id => Some(o),
            _ => None,
        })?;

        let end = self
            .pointers
            .iter()
            .filter_map(|p| match p.address {
                ItemAddress::Offset(o) if o > offset => Some(o),
                _ => None,
            })
            .min()
            .unwrap_or(self.pool.len() as u64);

        Some(self.pool.slice(offset as usize..end as usize))
    }

    /// Item identifiers present in this heap, in wire order.
    pub fn item_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.pointers.iter().map(|p| p.id)
    }
}

/// Builder for outbound heaps.
///
/// Items serialize in insertion order and addressed payloads pack into the
/// pool in the same order, so a given input sequence always produces
/// byte-identical output. The descriptor issuer relies on this for
/// idempotent reissue.
#[derive(Debug, Default)]
pub struct HeapBuilder {
    flags: u8,
    immediates: Vec<(u16, u64)>,
    addressed: Vec<(u16, Bytes)>,
}

impl HeapBuilder {
    /// Create a builder for a heap with the given flags.
    pub fn new(flags: u8) -> Self {
        Self {
            flags,
            immediates: Vec::new(),
            addressed: Vec::new(),
        }
    }

    /// Add an immediate item.
    pub fn immediate(mut self, id: u16, value: u64) -> Self {
        self.immediates.push((id, value));
        self
    }

    /// Add an addressed item; its payload lands in the pool.
    pub fn addressed(mut self, id: u16, payload: impl Into<Bytes>) -> Self {
        self.addressed.push((id, payload.into()));
        self
    }

    /// Serialize to wire bytes.
    pub fn build(self) -> Result<Vec<u8>> {
        let item_count = self.immediates.len() + self.addressed.len();
        if item_count > usize::from(u16::MAX) {
            return Err(CaptureError::Protocol("too many items in heap".to_string()));
        }

        let pool_length: usize = self.addressed.iter().map(|(_, p)| p.len()).sum();
        let header = HeapHeader::new(self.flags, item_count as u16, pool_length as u32);

        let mut buf =
            Vec::with_capacity(HEADER_SIZE + item_count * ITEM_POINTER_SIZE + pool_length);
        buf.extend_from_slice(&header.encode());

        for (id, value) in &self.immediates {
            buf.extend_from_slice(&ItemPointer::immediate(*id, *value).encode()?);
        }
        let mut offset = 0u64;
        for (id, payload) in &self.addressed {
            buf.extend_from_slice(&ItemPointer::offset(*id, offset).encode()?);
            offset += payload.len() as u64;
        }
        for (_, payload) in &self.addressed {
            buf.extend_from_slice(payload);
        }

        Ok(buf)
    }
}

/// One engine's contribution to one integration frame.
///
/// Extracted from a data heap by the receiver; timestamp and accumulation
/// length fall back to session defaults when the heap omits them.
#[derive(Debug, Clone)]
pub struct Contribution {
    /// Integration counter this segment belongs to.
    pub counter: u64,
    /// Index of the contributing engine.
    pub engine_index: usize,
    /// Capture timestamp, ms since Unix epoch.
    pub timestamp_ms: u64,
    /// Accumulation length in effect for this frame.
    pub accumulation_length: u32,
    /// Raw payload segment (zero-copy slice of the heap pool).
    pub payload: Bytes,
}

/// Build a data heap carrying one engine's segment.
///
/// This is the inbound wire image the X-engines produce; the capture core
/// itself uses it for loopback tests and traffic simulation.
pub fn build_data_heap(
    counter: u64,
    engine_index: u64,
    timestamp_ms: u64,
    accumulation_length: u64,
    segment: &[u8],
) -> Result<Vec<u8>> {
    use super::wire_format::item;

    HeapBuilder::new(0)
        .immediate(item::FRAME_COUNTER, counter)
        .immediate(item::ENGINE_INDEX, engine_index)
        .immediate(item::TIMESTAMP_MS, timestamp_ms)
        .immediate(item::ACCUMULATION_LENGTH, accumulation_length)
        .addressed(item::SEGMENT_DATA, Bytes::copy_from_slice(segment))
        .build()
}
