//! peerlink-core — handle types, wire constants and configuration.
//! All other peerlink crates depend on this one.

pub mod config;
pub mod handle;
pub mod wire;

pub use handle::{AttachSession, DiscoverySession, Epoch, NetworkToken, PeerHandle, Role, SessionRole};
