//! Control messages exchanged during the connection handshake and on
//! roster changes.
//!
//! Each message owns a stable envelope id and a fixed payload layout.
//! Everything outside this closed set travels through the session layer
//! untouched.

use crate::envelope::{
    put_bool, put_bytes_with_len, put_i32, put_u8, ByteReader, DecodeError, Envelope,
};

/// What a connecting peer has to present to get confirmed. Configured once
/// per deployment and advertised in the first message the server sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationType {
    /// No real credential; peers typically submit a display name.
    None,
    /// Token from a deployment-specific web service.
    Custom,
    /// Authentication ticket issued by the platform the game runs on.
    PlatformTicket,
}

impl ConfirmationType {
    pub fn as_u8(self) -> u8 {
        match self {
            ConfirmationType::None => 0,
            ConfirmationType::Custom => 1,
            ConfirmationType::PlatformTicket => 2,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(ConfirmationType::None),
            1 => Ok(ConfirmationType::Custom),
            2 => Ok(ConfirmationType::PlatformTicket),
            other => Err(DecodeError::InvalidValue {
                field: "confirmation type",
                value: other,
            }),
        }
    }
}

/// Server to peer, sent right after the transport-level connect: tells the
/// peer which kind of credential to submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationRequired {
    pub confirmation_type: ConfirmationType,
}

impl ConfirmationRequired {
    pub const ID: u8 = 1;

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1);
        put_u8(&mut out, self.confirmation_type.as_u8());
        out
    }

    pub fn decode_payload(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = ByteReader::new(bytes);
        Ok(Self {
            confirmation_type: ConfirmationType::from_u8(reader.read_u8()?)?,
        })
    }

    pub fn into_envelope(self, frame: i32) -> Envelope {
        Envelope::new(Self::ID, frame, self.encode_payload())
    }
}

/// Peer to server: the credential answering a confirmation requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationSubmit {
    pub credential: Vec<u8>,
}

impl ConfirmationSubmit {
    pub const ID: u8 = 2;

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.credential.len());
        put_bytes_with_len(&mut out, &self.credential);
        out
    }

    pub fn decode_payload(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = ByteReader::new(bytes);
        Ok(Self {
            credential: reader.read_bytes_with_len()?,
        })
    }

    pub fn into_envelope(self, frame: i32) -> Envelope {
        Envelope::new(Self::ID, frame, self.encode_payload())
    }
}

/// Server to peer: the authorization verdict. `assigned_id` is the peer's
/// session id on acceptance and -1 on rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationResponse {
    pub assigned_id: i32,
    pub accepted: bool,
    pub data: Vec<u8>,
}

impl ConfirmationResponse {
    pub const ID: u8 = 3;

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + self.data.len());
        put_i32(&mut out, self.assigned_id);
        put_bool(&mut out, self.accepted);
        put_bytes_with_len(&mut out, &self.data);
        out
    }

    pub fn decode_payload(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = ByteReader::new(bytes);
        Ok(Self {
            assigned_id: reader.read_i32()?,
            accepted: reader.read_bool()?,
            data: reader.read_bytes_with_len()?,
        })
    }

    pub fn into_envelope(self, frame: i32) -> Envelope {
        Envelope::new(Self::ID, frame, self.encode_payload())
    }
}

/// Server to confirmed peers: another peer entered the roster. Also used
/// to replay the existing roster to a newly confirmed peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerJoined {
    pub peer_id: i32,
    pub data: Vec<u8>,
}

impl PeerJoined {
    pub const ID: u8 = 4;

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.data.len());
        put_i32(&mut out, self.peer_id);
        put_bytes_with_len(&mut out, &self.data);
        out
    }

    pub fn decode_payload(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = ByteReader::new(bytes);
        Ok(Self {
            peer_id: reader.read_i32()?,
            data: reader.read_bytes_with_len()?,
        })
    }

    pub fn into_envelope(self, frame: i32) -> Envelope {
        Envelope::new(Self::ID, frame, self.encode_payload())
    }
}

/// Server to confirmed peers: a peer left the roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerLeft {
    pub peer_id: i32,
}

impl PeerLeft {
    pub const ID: u8 = 5;

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4);
        put_i32(&mut out, self.peer_id);
        out
    }

    pub fn decode_payload(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = ByteReader::new(bytes);
        Ok(Self {
            peer_id: reader.read_i32()?,
        })
    }

    pub fn into_envelope(self, frame: i32) -> Envelope {
        Envelope::new(Self::ID, frame, self.encode_payload())
    }
}

/// Closed dispatch over the reserved envelope ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    ConfirmationRequired(ConfirmationRequired),
    ConfirmationSubmit(ConfirmationSubmit),
    ConfirmationResponse(ConfirmationResponse),
    PeerJoined(PeerJoined),
    PeerLeft(PeerLeft),
}

impl ControlMessage {
    /// `Ok(None)` means the envelope carries application traffic and should
    /// be forwarded unchanged.
    pub fn from_envelope(envelope: &Envelope) -> Result<Option<Self>, DecodeError> {
        let message = match envelope.id {
            ConfirmationRequired::ID => {
                Self::ConfirmationRequired(ConfirmationRequired::decode_payload(&envelope.payload)?)
            }
            ConfirmationSubmit::ID => {
                Self::ConfirmationSubmit(ConfirmationSubmit::decode_payload(&envelope.payload)?)
            }
            ConfirmationResponse::ID => {
                Self::ConfirmationResponse(ConfirmationResponse::decode_payload(&envelope.payload)?)
            }
            PeerJoined::ID => Self::PeerJoined(PeerJoined::decode_payload(&envelope.payload)?),
            PeerLeft::ID => Self::PeerLeft(PeerLeft::decode_payload(&envelope.payload)?),
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}
