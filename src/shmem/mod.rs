//! Shared-memory ring transport: a bidirectional fixed-size region with named
//!  cross-process signals for flow control.
//!
//! Region layout (all numbers little-endian, matching in-memory representation):
//! ```ascii
//! 0: closed flag (u8) - non-zero means the peer is closing; every waiter checks
//!     this immediately upon waking
//! 1: declared region size (i32) - written by the creator, mirrored by the opener
//! 5: half A (outbound for the creator)
//! *: half B (outbound for the opener)
//! ```
//! Each half:
//! ```ascii
//! 0: total fragment size (i32)
//! 4: finish flag (i32) - non-zero on the last fragment of a logical message
//! 8: payload, up to (region_size - 5) / 2 - 8 bytes
//! ```
//! Mutual exclusion over the region is entirely via the named signals plus the
//!  single rendezvous mutex during the initial handshake - there is no additional
//!  in-process lock around region accesses.

pub mod connection;
pub mod ipc;
pub mod layout;
pub mod manager;
