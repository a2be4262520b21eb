//! The HTTP tunnel carrier: reliable messaging over plain HTTP/1.1 exchanges, for
//!  peers separated by proxies or firewalls that only pass HTTP.
//!
//! Every tunnel request is a POST whose body is one tunnel packet:
//! ```ascii
//! 0:  protocol version (u8)
//! 1:  packet type (u8)
//! 2:  sequence number (u64 BE)
//! 10: sender host id (16 bytes)
//! 26: connection name length (varint), then UTF-8 name bytes
//! ..: security-framed payload (rest of the body)
//! ```
//!
//! A client keeps two logical connections per peer: the *sender* connection carries
//!  outbound messages as request/response exchanges, and the *listener* connection
//!  is a long poll the server answers with inbound messages (or a timed-out marker
//!  the client answers by immediately polling again). Sequence numbers and pending
//!  content make exchanges replayable: a client that loses the response repeats the
//!  request byte-identically, and the server answers a repeated sequence from its
//!  response cache without reprocessing.

pub mod client;
pub mod packet;
pub mod server;
pub mod wire;
