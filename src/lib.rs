//! Reliable, connection-oriented file transfer over unreliable datagrams:
//! a sliding-window sender with Reno congestion control and selective
//! acknowledgement, and a reassembling receiver, speaking a checksummed
//! frame protocol over UDP.

pub mod transport;
