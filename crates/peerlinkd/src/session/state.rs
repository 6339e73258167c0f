//! Controller lifecycle states.

use std::fmt;

/// Where a [`PeerSessionController`](super::PeerSessionController) is in its
/// attach → publish/subscribe lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerState {
    Detached,
    Attaching,
    Attached,
    Publishing,
    Subscribing,
    /// A publish or subscribe session is live.
    Active,
    Closed,
    /// Attach was rejected, or the service vanished mid-request.
    Failed,
}

impl ControllerState {
    /// States from which a new attach may be requested.
    pub fn can_attach(self) -> bool {
        matches!(
            self,
            ControllerState::Detached | ControllerState::Closed | ControllerState::Failed
        )
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ControllerState::Detached => "detached",
            ControllerState::Attaching => "attaching",
            ControllerState::Attached => "attached",
            ControllerState::Publishing => "publishing",
            ControllerState::Subscribing => "subscribing",
            ControllerState::Active => "active",
            ControllerState::Closed => "closed",
            ControllerState::Failed => "failed",
        };
        f.write_str(s)
    }
}
