//! HTTP RPC Layer
//!
//! JSON-over-HTTP plumbing between cluster nodes: the wire types every
//! endpoint speaks, the outbound transport used by the subsystems, and the
//! warp server that exposes this node to peers and clients.

pub mod client;
pub mod server;
pub mod wire;

pub use client::{HttpTransport, PeerTransport};
