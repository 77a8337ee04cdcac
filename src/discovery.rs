//! Discovery collaborator contract.
//!
//! Peer discovery (broadcast, mDNS, a rendezvous server) is an external
//! concern; this module only defines the event shape the core consumes and
//! a minimal static adapter for tests and the demo binary.

use crate::process::ProcessName;

/// This process's protocol version, packed as `major<<16 | minor<<8 | patch`
/// and advertised by every discovery collaborator. Two peers only need to
/// agree on the major component to interoperate; see [`major_version`].
pub const PROTOCOL_MAJOR: u32 = 1;
pub const PROTOCOL_MINOR: u32 = 0;
pub const PROTOCOL_PATCH: u32 = 0;
pub const PROTOCOL_VERSION: u32 = (PROTOCOL_MAJOR << 16) | (PROTOCOL_MINOR << 8) | PROTOCOL_PATCH;

/// The major component of a packed protocol version number.
pub fn major_version(version_number: u32) -> u32 {
    version_number >> 16
}

/// How a peer was learned about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryKind {
    /// Discovered directly (e.g. a broadcast reply).
    Info,
    /// Learned indirectly through a rendezvous hub rather than directly.
    Hub,
    /// Offered back in reply to our own announcement.
    Reply,
    /// Invited in by a remote peer's explicit callback, rather than found
    /// through broadcast or a hub.
    Callback,
    /// A direct connect request naming this process specifically, bypassing
    /// discovery broadcast entirely.
    Connect,
    /// Learned through a lightweight bridge announcement rather than a full
    /// ensemble peer — carries transport endpoints but no clock candidacy.
    BridgeLite,
}

/// One fact a discovery collaborator reports to the core.
#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub ensemble_name: String,
    pub version_number: u32,
    pub process: ProcessName,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub kind: DiscoveryKind,
}

/// A source of [`PeerEvent`]s the poll loop drains once per iteration.
pub trait DiscoverySink: Send {
    fn poll_events(&mut self) -> Vec<PeerEvent>;
}

/// A fixed list of peers known ahead of time, useful for tests and small
/// demos where a real broadcast/mDNS collaborator would be overkill.
#[derive(Default)]
pub struct StaticPeerList {
    pending: Vec<PeerEvent>,
}

impl StaticPeerList {
    pub fn new(peers: Vec<PeerEvent>) -> Self {
        StaticPeerList { pending: peers }
    }
}

impl DiscoverySink for StaticPeerList {
    fn poll_events(&mut self) -> Vec<PeerEvent> {
        std::mem::take(&mut self.pending)
    }
}
