//! peerlink-services — the contracts peerlink consumes and produces,
//! plus an in-process medium that implements them.

pub mod discovery;
pub mod loopback;
pub mod manual;
pub mod provision;
pub mod sink;

pub use discovery::{
    AttachReply, DiscoveryError, DiscoveryService, ServiceConfig, SessionEvent, SessionEvents,
};
pub use loopback::LoopbackMedium;
pub use manual::ManualProvisioner;
pub use provision::{LinkProvisioner, NetworkEvent, NetworkEvents, ProvisionRequest, ProvisionedNetwork};
pub use sink::{ChannelSink, DataSink, LogSink};
