//! Discovery session lifecycle.
//!
//! The controller turns the discovery service's push-style callbacks into
//! awaited results and wires confirmed sessions to the connection registry
//! (publish) or to peer links (subscribe).

mod controller;
mod publisher;
mod state;
mod subscriber;

pub use controller::PeerSessionController;
pub use state::ControllerState;
