//! Shared-memory files: mappings, log buffers and counters.

pub mod counters;
pub mod log;
pub mod mapped;

pub use log::LogBuffers;
pub use mapped::MappedFile;
