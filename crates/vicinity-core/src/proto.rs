//! LBN message protocol — the discriminated-union body riding inside the
//! wire envelope, plus the codec and per-session message builder.
//!
//! Bodies are CBOR. Every message carries a 32-bit correlation id and is
//! either a `Request` or a `Response`; nested enums select the service
//! category and the specific kind. A response answers a request iff the
//! ids match AND the nested category path matches — anything else is a
//! protocol violation.
//!
//! The core emits three requests (register, deregister, initial
//! neighborhood fetch) and three responses (notification ack, protocol
//! violation, internal error). It consumes the matching local-service
//! responses and the `NeighbourhoodChangedNotification` request.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::wire::ProtocolError;

/// Correlation id used for `ProtocolViolation` responses when no inbound
/// request exists to correlate with.
pub const PROTOCOL_VIOLATION_ID: u32 = 0x0BAD_C0DE;

/// Wire sentinel for "no location". Never a valid coordinate.
pub const NO_LOCATION: i32 = i32::MAX;

/// Latitude bound in micro-degrees.
pub const MAX_LATITUDE: i32 = 90_000_000;

/// Longitude bound in micro-degrees.
pub const MAX_LONGITUDE: i32 = 180_000_000;

/// Contact discriminator for an IPv4 address (4 address bytes).
pub const CONTACT_IPV4: u8 = 1;

/// Contact discriminator for an IPv6 address (16 address bytes).
pub const CONTACT_IPV6: u8 = 2;

// ── Message envelope ──────────────────────────────────────────────────────────

/// One complete LBN message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Correlation id, allocated monotonically per session by [`MessageBuilder`].
    pub id: u32,
    /// Exactly one of request / response.
    pub kind: MessageKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Request(Request),
    Response(Response),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    LocalService(LocalServiceRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalServiceRequest {
    RegisterService(ServiceProfile),
    DeregisterService(ServiceKind),
    GetNeighbourNodesByDistanceLocal,
    NeighbourhoodChangedNotification(Vec<NeighbourhoodChange>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    LocalService(LocalServiceResponse),
    /// Terminal response to unparseable or uncorrelatable input.
    ProtocolViolation,
    /// Terminal response when processing failed on this side.
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalServiceResponse {
    RegisterService(Status),
    DeregisterService(Status),
    GetNeighbourNodesByDistanceLocal {
        status: Status,
        nodes: Vec<NodeInfo>,
    },
    NeighbourhoodChangedNotification(Status),
}

/// Outcome carried by local-service responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    InvalidValue,
    Busy,
    Internal,
    Unsupported,
}

// ── Node descriptors ──────────────────────────────────────────────────────────

/// Service categories registrable with the LBN node. The core only ever
/// registers the profile service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceKind {
    Profile,
}

/// Registration descriptor for this server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceProfile {
    pub kind: ServiceKind,
    /// SHA-256 of the server's public key, 32 bytes.
    pub node_id: Vec<u8>,
    pub contact: NodeContact,
}

/// Network contact of a node.
///
/// `kind` is a raw discriminator, not an enum: a structurally valid body
/// may still carry an unresolvable contact (unknown kind, wrong address
/// width). Resolution happens in the reconciler, where failure aborts the
/// whole batch rather than skipping one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeContact {
    /// [`CONTACT_IPV4`] or [`CONTACT_IPV6`].
    pub kind: u8,
    /// 4 bytes for IPv4, 16 for IPv6.
    pub addr: Vec<u8>,
    /// TCP port. Carried as u32 on the wire; the valid range [1, 65535]
    /// is enforced by the receiver.
    pub port: u32,
}

/// Contact that cannot be resolved to an address.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContactError {
    #[error("unknown contact discriminator {0}")]
    UnknownKind(u8),
    #[error("contact kind {kind} with {len} address bytes")]
    BadAddressLength { kind: u8, len: usize },
}

impl NodeContact {
    /// Build a contact from a resolved address.
    pub fn from_addr(ip: IpAddr, port: u16) -> Self {
        match ip {
            IpAddr::V4(v4) => Self {
                kind: CONTACT_IPV4,
                addr: v4.octets().to_vec(),
                port: u32::from(port),
            },
            IpAddr::V6(v6) => Self {
                kind: CONTACT_IPV6,
                addr: v6.octets().to_vec(),
                port: u32::from(port),
            },
        }
    }

    /// Resolve the discriminated address bytes to an [`IpAddr`].
    pub fn resolve(&self) -> Result<IpAddr, ContactError> {
        match self.kind {
            CONTACT_IPV4 => {
                let octets: [u8; 4] = self.addr.as_slice().try_into().map_err(|_| {
                    ContactError::BadAddressLength {
                        kind: self.kind,
                        len: self.addr.len(),
                    }
                })?;
                Ok(IpAddr::from(octets))
            }
            CONTACT_IPV6 => {
                let octets: [u8; 16] = self.addr.as_slice().try_into().map_err(|_| {
                    ContactError::BadAddressLength {
                        kind: self.kind,
                        len: self.addr.len(),
                    }
                })?;
                Ok(IpAddr::from(octets))
            }
            other => Err(ContactError::UnknownKind(other)),
        }
    }
}

/// Identity + contact of a node as announced by the LBN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeProfile {
    pub node_id: Vec<u8>,
    pub contact: NodeContact,
}

/// A node with its location, as carried by the initial neighborhood
/// response and by add/update change notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub profile: NodeProfile,
    /// Micro-degrees, [-90e6, 90e6].
    pub latitude: i32,
    /// Micro-degrees, [-180e6, 180e6].
    pub longitude: i32,
}

/// One incremental neighborhood change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NeighbourhoodChange {
    AddedNodeInfo(NodeInfo),
    UpdatedNodeInfo(NodeInfo),
    RemovedNodeId(Vec<u8>),
}

/// Location validity predicate: within bounds and not the wire sentinel.
pub fn location_is_valid(latitude: i32, longitude: i32) -> bool {
    latitude != NO_LOCATION
        && longitude != NO_LOCATION
        && (-MAX_LATITUDE..=MAX_LATITUDE).contains(&latitude)
        && (-MAX_LONGITUDE..=MAX_LONGITUDE).contains(&longitude)
}

// ── Codec ─────────────────────────────────────────────────────────────────────

/// Encode a message body (CBOR, no envelope).
pub fn encode_body(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let mut body = Vec::new();
    ciborium::ser::into_writer(message, &mut body)
        .map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(body)
}

/// Decode a message body.
pub fn decode_body(body: &[u8]) -> Result<Message, ProtocolError> {
    ciborium::de::from_reader(body).map_err(|e| ProtocolError::Decode(e.to_string()))
}

// ── Correlation ───────────────────────────────────────────────────────────────

/// The correlation rule: a response answers a request iff the ids are
/// equal, the message is tagged `Response`, and the nested category path
/// matches the request's. A mismatch is a protocol violation.
pub fn response_matches(request: &Message, response: &Message) -> bool {
    if request.id != response.id {
        return false;
    }
    let MessageKind::Request(Request::LocalService(req)) = &request.kind else {
        return false;
    };
    let MessageKind::Response(Response::LocalService(resp)) = &response.kind else {
        return false;
    };
    matches!(
        (req, resp),
        (
            LocalServiceRequest::RegisterService(_),
            LocalServiceResponse::RegisterService(_)
        ) | (
            LocalServiceRequest::DeregisterService(_),
            LocalServiceResponse::DeregisterService(_)
        ) | (
            LocalServiceRequest::GetNeighbourNodesByDistanceLocal,
            LocalServiceResponse::GetNeighbourNodesByDistanceLocal { .. }
        ) | (
            LocalServiceRequest::NeighbourhoodChangedNotification(_),
            LocalServiceResponse::NeighbourhoodChangedNotification(_)
        )
    )
}

// ── Builder ───────────────────────────────────────────────────────────────────

/// Per-session message factory.
///
/// Ids start at 1 and increase by one per built request. A fresh builder
/// is created for every session, which resets the counter — correlation
/// is scoped to the session, so this is sound.
#[derive(Debug)]
pub struct MessageBuilder {
    next_id: u32,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self { next_id: 1 }
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    pub fn register_service(&mut self, profile: ServiceProfile) -> Message {
        Message {
            id: self.next_id(),
            kind: MessageKind::Request(Request::LocalService(
                LocalServiceRequest::RegisterService(profile),
            )),
        }
    }

    pub fn deregister_service(&mut self, kind: ServiceKind) -> Message {
        Message {
            id: self.next_id(),
            kind: MessageKind::Request(Request::LocalService(
                LocalServiceRequest::DeregisterService(kind),
            )),
        }
    }

    pub fn get_neighbour_nodes(&mut self) -> Message {
        Message {
            id: self.next_id(),
            kind: MessageKind::Request(Request::LocalService(
                LocalServiceRequest::GetNeighbourNodesByDistanceLocal,
            )),
        }
    }

    /// Ack for a processed change notification. Echoes the request id.
    pub fn neighbourhood_changed_response(id: u32, status: Status) -> Message {
        Message {
            id,
            kind: MessageKind::Response(Response::LocalService(
                LocalServiceResponse::NeighbourhoodChangedNotification(status),
            )),
        }
    }

    /// Terminal protocol-violation response. `id` is the offending
    /// request's id, or [`PROTOCOL_VIOLATION_ID`] when nothing decoded.
    pub fn protocol_violation_response(id: Option<u32>) -> Message {
        Message {
            id: id.unwrap_or(PROTOCOL_VIOLATION_ID),
            kind: MessageKind::Response(Response::ProtocolViolation),
        }
    }

    /// Terminal internal-error response for a request we failed to process.
    pub fn internal_error_response(id: u32) -> Message {
        Message {
            id,
            kind: MessageKind::Response(Response::Internal),
        }
    }
}

impl Default for MessageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
