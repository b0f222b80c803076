//! tlsock - TLS client sockets over plain byte streams
//!
//! This crate wraps an already-connected transport in an OpenSSL client
//! session: version negotiation, handshake with a deadline, nonblocking
//! retry with adaptive chunking, peer trust accessors, and a socket facade
//! that keeps raw IO off an encrypted stream.
//!
//! Logging goes through `tracing`; install a subscriber to see it.

pub mod net;
pub mod tls;
