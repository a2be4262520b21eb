//! A pluggable reliable transport layer for message-oriented peers: the same
//!  connection-manager contract runs over very different carriers (shared memory
//!  between processes on one machine, an HTTP tunnel through proxies and firewalls),
//!  with framing, sequence discipline and security layered identically on top of
//!  each of them.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (defined-length chunks of
//!   data, not byte streams), addressed by a stable 128-bit host id
//!   * several independent named connections can coexist towards the same peer
//! * Carriers are unreliable and asymmetric; the layer on top makes them behave:
//!   * every message carries a sequence number; the receiver classifies each
//!     arrival as new, repeated or desynchronized
//!   * a sender retains the exact serialized bytes of an unacknowledged message
//!     and replays them verbatim over a fresh physical connection after a carrier
//!     fault - the receiver answers a repeated sequence from its response cache,
//!     so a message is never applied twice however often the carrier fails
//!     mid-exchange
//!   * a sequence gap is unrecoverable by design: the connection is torn down
//!     rather than guessing at what was lost
//! * Deadline propagation instead of per-call timeouts: the caller attaches one
//!   overall budget to a message, and every stage along the way (lock acquisition,
//!   connect, handshake, carrier I/O) runs against that same budget. An elapsed
//!   deadline fails before any carrier I/O is attempted.
//! * Security is negotiated per connection through a pluggable session: handshake
//!   packets flow inside the same envelope framing as payloads, so a carrier does
//!   not need to know whether a connection is encrypted
//! * Idle connections are pinged, dead ones closed, expired peers forgotten - all
//!   by a periodic keeper timer per manager, never inline with a send
//!
//! ## Security envelope
//!
//! Every payload and handshake packet travels inside the same envelope:
//!
//! ```ascii
//! 0: flag (u8):
//!    * 0  handshake sub-stream, followed by a sub-marker:
//!         * 0  handshake data (opaque bytes owned by the security session)
//!         * 1  failure report: error identifier and message, both
//!              varint-length-prefixed
//!    * 1  encrypted payload: the session's ciphertext (for the null session,
//!         the plaintext itself)
//! ```
//!
//! ## Labelled content framing
//!
//! The plaintext inside a payload envelope is a labelled sequence of entries, so
//!  several application messages can share one carrier exchange:
//!
//! ```ascii
//! per entry:  0: marker 0 (u8)
//!             1: entry length (u32 BE)
//!             5: entry bytes
//! end:        0: marker 1 (u8)
//! ```
//!
//! An empty sequence (just the end marker) is a ping.
//!
//! ## Carriers
//!
//! * [shmem]: a shared-memory ring per direction, with named auto-reset signals
//!   for handover and a rendezvous mutex serializing connection establishment.
//!   Lowest latency, machine-local only.
//! * [http]: every exchange is a plain `POST` request/response pair, so the
//!   tunnel traverses proxies that only speak HTTP. The connecting side runs two
//!   logical connections: a sender for its own outbound messages and a listener
//!   long-poll the answering side parks until it has content to deliver.

pub mod config;
pub mod deadline;
pub mod error;
pub mod frame;
pub mod host;
pub mod http;
pub mod manager;
pub mod message;
pub mod physical;
pub mod security;
pub mod shmem;
