//! Cluster Protocol Messages
//!
//! Two layers travel between servers:
//! - [`ClusterMessage`]: what the bridge publishes on a topic (event kind,
//!   origin server, opaque payload)
//! - [`PeerFrame`]: what the gossip backend's TCP links carry, length
//!   prefixed and bincode encoded

use bincode::{Decode, Encode};

/// Protocol version for compatibility checking
pub const CLUSTER_PROTOCOL_VERSION: u8 = 1;

/// Largest frame a peer link accepts
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Message published by a bridge on the topic named after `event_kind`
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ClusterMessage {
    pub event_kind: String,
    /// Server that published the message; used for self-echo suppression
    pub origin_server_id: String,
    /// Serialized payload, interpreted by the handler for `event_kind`
    pub payload: Vec<u8>,
}

impl ClusterMessage {
    pub fn new(
        event_kind: impl Into<String>,
        origin_server_id: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            event_kind: event_kind.into(),
            origin_server_id: origin_server_id.into(),
            payload,
        }
    }

    /// Encode message to bytes using bincode
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, bincode::config::standard())
    }

    /// Decode message from bytes using bincode
    pub fn decode(data: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        bincode::decode_from_slice(data, bincode::config::standard()).map(|(msg, _)| msg)
    }
}

/// Frames exchanged over a peer TCP link
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum PeerFrame {
    /// Handshake sent when connecting to a peer
    Hello { server_id: String, version: u8 },

    /// Handshake acknowledgment
    HelloAck { server_id: String, version: u8 },

    /// Topic message
    Message { topic: String, body: Vec<u8> },

    /// Keep-alive ping
    Ping,

    /// Keep-alive pong
    Pong,

    /// Graceful disconnect notification
    Goodbye,
}

impl PeerFrame {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, bincode::config::standard())
    }

    pub fn decode(data: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        bincode::decode_from_slice(data, bincode::config::standard()).map(|(frame, _)| frame)
    }

    /// Get the frame type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            PeerFrame::Hello { .. } => "Hello",
            PeerFrame::HelloAck { .. } => "HelloAck",
            PeerFrame::Message { .. } => "Message",
            PeerFrame::Ping => "Ping",
            PeerFrame::Pong => "Pong",
            PeerFrame::Goodbye => "Goodbye",
        }
    }
}

/// Frame a message with length prefix for TCP transmission
pub fn frame_message(frame: &PeerFrame) -> Result<Vec<u8>, bincode::error::EncodeError> {
    let payload = frame.encode()?;
    let len = payload.len() as u32;

    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&payload);

    Ok(out)
}

/// Read frame length from bytes (returns None if not enough data)
pub fn read_frame_length(data: &[u8]) -> Option<u32> {
    if data.len() < 4 {
        return None;
    }
    Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}
