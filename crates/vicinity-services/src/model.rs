//! Persistent rows of the neighborhood subsystem: the `Neighbor` table
//! and the `NeighborhoodAction` work queue.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A known peer profile server, as dictated by the LBN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighbor {
    /// SHA-256 of the peer's public key. Primary key, exactly 32 bytes.
    pub neighbor_id: Vec<u8>,

    /// Last announced address of the peer.
    pub ip_address: IpAddr,

    /// Port of the peer's primary role interface.
    pub primary_port: u16,

    /// Port of the peer's neighbor-sharing interface. Populated by the
    /// peer-to-peer handshake, and cleared whenever `primary_port`
    /// changes until that handshake succeeds again.
    pub sr_neighbor_port: Option<u16>,

    /// Validated micro-degrees.
    pub location_latitude: i32,
    pub location_longitude: i32,

    /// None until the peer-to-peer handshake initializes this neighbor;
    /// while unset, inbound updates from the peer are rejected downstream.
    pub last_refresh_time: Option<DateTime<Utc>>,
}

/// Work item kinds the core emits. The action processor defines more
/// variants of its own for profile-sync events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NeighborhoodActionKind {
    AddNeighbor,
    RemoveNeighbor,
}

/// A durable work item for the external action processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborhoodAction {
    /// Store-assigned, strictly increasing with insertion order. The
    /// processor relies on this for per-neighbor FIFO execution.
    pub id: u64,

    /// The neighbor this action concerns.
    pub server_id: Vec<u8>,

    pub kind: NeighborhoodActionKind,

    /// Creation time (UTC).
    pub timestamp: DateTime<Utc>,

    /// Earliest time the processor may execute this. `AddNeighbor`
    /// carries a jitter delay; `RemoveNeighbor` none.
    pub execute_after: Option<DateTime<Utc>>,

    /// Unused by the core; carried for the processor's other variants.
    pub target_identity_id: Option<Vec<u8>>,
    pub additional_data: Option<String>,
}
