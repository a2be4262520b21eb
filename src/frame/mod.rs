//! The framing codec shared by every carrier - pure transforms, no I/O.

pub mod chunked;
pub mod connection_header;
pub mod labelled;
