//! peerlinkd — proximity peer sessions and the connections they carry.
//!
//! [`session::PeerSessionController`] attaches to a discovery service and
//! runs one publish or subscribe session. Publishers admit requesting peers
//! into a [`registry::ConnectionRegistry`]; subscribers open a
//! [`link::PeerLink`] to every publisher they find.

pub mod link;
pub mod registry;
pub mod session;
