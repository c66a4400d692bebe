/*
[INPUT]:  Feed schema definitions and serde requirements
[OUTPUT]: Typed Rust structs/enums with serialization support
[POS]:    Data layer - type definitions shared by the feed
[UPDATE]: When the wire schema or output records change
*/

pub mod enums;
pub mod models;

pub use enums::*;
pub use models::*;
