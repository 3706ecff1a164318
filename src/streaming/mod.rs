//! Line and JSON framing for adapters layered on top of the bridge

pub mod extract;
pub mod framer;

pub use extract::{DONE_MARKER, TextField, is_done};
pub use framer::{DATA_PREFIX, LineFramer};
