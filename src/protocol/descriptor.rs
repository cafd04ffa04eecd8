//! Item descriptors and the process-lifetime descriptor registry.
//!
//! A descriptor declares an item's identity, element format, and shape.
//! Data-only heaps reference items by bare identifier, so a consumer needs
//! the descriptor before it can interpret them; until one arrives the bytes
//! are preserved raw. Descriptors travel as MessagePack blobs inside
//! descriptor heaps and are cached here for the life of the process,
//! refreshed whenever a reissue arrives.
//!
//! The registry is read-mostly: the receiver writes on new descriptor
//! heaps, the assembler and issuer only read.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::wire_format::item;
use crate::error::Result;

/// Element format of an item's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemFormat {
    /// 48-bit unsigned integer carried immediate.
    U48,
    /// Big-endian IEEE-754 single-precision samples.
    F32Be,
    /// Uninterpreted bytes.
    Raw,
}

/// Declares an item's identity, format, and shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDescriptor {
    /// Item identifier the descriptor applies to.
    pub id: u16,
    /// Human-readable item name.
    pub name: String,
    /// Element format.
    pub format: ItemFormat,
    /// Dimensions; empty for scalars.
    pub shape: Vec<u64>,
}

impl ItemDescriptor {
    /// Encode to a MessagePack blob (named fields, deterministic).
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decode from a MessagePack blob.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// The descriptors this capture core itself emits and consumes.
///
/// `channel_count` sizes the data segment's declared shape.
pub fn standard_descriptors(channel_count: usize) -> Vec<ItemDescriptor> {
    let scalar = |id: u16, name: &str| ItemDescriptor {
        id,
        name: name.to_string(),
        format: ItemFormat::U48,
        shape: Vec::new(),
    };

    vec![
        scalar(item::FRAME_COUNTER, "frame_counter"),
        scalar(item::ENGINE_INDEX, "engine_index"),
        scalar(item::TIMESTAMP_MS, "timestamp"),
        scalar(item::ACCUMULATION_LENGTH, "accumulation_length"),
        scalar(item::SEGMENT_OFFSET, "segment_offset"),
        scalar(item::FRAME_LENGTH, "frame_length"),
        scalar(item::SEQUENCE, "sequence"),
        ItemDescriptor {
            id: item::SEGMENT_DATA,
            name: "integration_data".to_string(),
            format: ItemFormat::F32Be,
            shape: vec![channel_count as u64],
        },
    ]
}

/// Thread-safe descriptor cache.
#[derive(Debug, Default)]
pub struct DescriptorRegistry {
    inner: RwLock<HashMap<u16, ItemDescriptor>>,
}

impl DescriptorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry pre-populated with the standard descriptors.
    pub fn with_standard(channel_count: usize) -> Self {
        let registry = Self::new();
        for desc in standard_descriptors(channel_count) {
            registry.insert(desc);
        }
        registry
    }

    /// Insert or refresh a descriptor. Returns true if an existing entry
    /// was replaced.
    pub fn insert(&self, descriptor: ItemDescriptor) -> bool {
        self.inner
            .write()
            .insert(descriptor.id, descriptor)
            .is_some()
    }

    /// Look up a descriptor by item identifier.
    pub fn get(&self, id: u16) -> Option<ItemDescriptor> {
        self.inner.read().get(&id).cloned()
    }

    /// Check whether an item identifier is known.
    pub fn contains(&self, id: u16) -> bool {
        self.inner.read().contains_key(&id)
    }

    /// All cached descriptors, sorted by identifier.
    ///
    /// Sorted so callers that serialize the set (the issuer) get a
    /// deterministic order.
    pub fn snapshot(&self) -> Vec<ItemDescriptor> {
        let mut all: Vec<ItemDescriptor> = self.inner.read().values().cloned().collect();
        all.sort_by_key(|d| d.id);
        all
    }

    /// Number of cached descriptors.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
