/*
[INPUT]:  Public API exports for paradex-feed-recorder crate
[OUTPUT]: Module declarations and public re-exports
[POS]:    Crate root - library entry point
[UPDATE]: When adding new modules or public exports
*/

pub mod config;
pub mod sink;

// Re-export main types for convenience
pub use config::{BookOutput, RecorderConfig, StreamSelection};
pub use sink::{JsonLinesSink, Record, write_records};
