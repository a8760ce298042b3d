use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub type NodeId = u32;

/// Identifies one circulation of the token. Drawn by the initiator.
pub type RoundId = u64;

/// One row of the ring topology table.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RingMember {
    pub id: NodeId,
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    pub successor: NodeId,
}

pub(crate) fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl RingMember {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Trust material locations for one node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PkiPaths {
    pub ca_cert: PathBuf,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
}

impl PkiPaths {
    /// `ca/ca.crt`, `server/server{id}.{crt,key}`, `client/client{id}.{crt,key}`.
    pub fn for_node<P: AsRef<Path>>(dir: P, id: NodeId) -> Self {
        let dir = dir.as_ref();
        Self {
            ca_cert: dir.join("ca").join("ca.crt"),
            server_cert: dir.join("server").join(format!("server{}.crt", id)),
            server_key: dir.join("server").join(format!("server{}.key", id)),
            client_cert: dir.join("client").join(format!("client{}.crt", id)),
            client_key: dir.join("client").join(format!("client{}.key", id)),
        }
    }
}

/// Everything a node knows about itself. Fixed for the process lifetime.
#[derive(Clone, Debug)]
pub struct NodeIdentity {
    pub member: RingMember,
    pub successor: RingMember,
    pub pki: PkiPaths,
}

impl NodeIdentity {
    pub fn id(&self) -> NodeId {
        self.member.id
    }
}

/// The token passed from hop to hop.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoundMessage {
    pub sum: u64,
    pub initiator: NodeId,
    #[serde(default)]
    pub round: RoundId,
    /// The initiator's mask, carried in the clear. Only present when the ring
    /// runs with `MaskDisclosure::InMessage`.
    #[serde(rename = "R", default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<u64>,
}

/// Receiver's reply once a message has been decoded.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Ack {
    Accepted,
}

/// Where the initiator's mask lives.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MaskDisclosure {
    /// R never leaves the initiator.
    #[default]
    Local,
    /// R travels in every hop. Any node can then recover the initiator's
    /// value from the first hop; kept for wire compatibility only.
    InMessage,
}

/// Coarse view of a node's RoundState.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    Idle,
    Initiating,
    Forwarding,
    Draining,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeStatus {
    pub phase: RoundPhase,
    /// Round the node is initiating, forwarding or draining.
    pub round: Option<RoundId>,
    pub value: u64,
    pub last_result: Option<u64>,
}

impl NodeStatus {
    pub fn is_active(&self) -> bool {
        self.phase != RoundPhase::Idle
    }
}
