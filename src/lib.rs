//! Peer-to-peer file transfer over WebRTC data channels.
//!
//! Two halves share this crate: `server` is the signaling hub that pairs
//! peers into rooms and relays their session descriptions, and `transfer`
//! is the peer-side session that negotiates a connection and streams files
//! directly to the other end. `protocol` defines the wire formats both
//! halves speak.

pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transfer;
