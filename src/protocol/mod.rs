//! Protocol module - heap wire format, decoding, and descriptors.
//!
//! This module implements the streaming protocol subset the capture core
//! needs:
//! - 10-byte heap header and 8-byte item-pointer encoding/decoding
//! - Heap struct with typed item accessors and an outbound builder
//! - Item descriptors and the process-lifetime descriptor registry

mod descriptor;
mod heap;
mod wire_format;

pub use descriptor::{standard_descriptors, DescriptorRegistry, ItemDescriptor, ItemFormat};
pub use heap::{build_data_heap, Contribution, Heap, HeapBuilder};
pub use wire_format::{
    flags, item, HeapHeader, ItemAddress, ItemPointer, DEFAULT_MAX_POOL_SIZE, HEADER_SIZE,
    HEAP_MAGIC, ITEM_POINTER_SIZE, MAX_ITEM_ID, MAX_ITEM_VALUE, PROTOCOL_VERSION,
};
