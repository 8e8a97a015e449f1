//! Remote protocol message types
//!
//! Frames exchanged between [`WsRemote`](super::WsRemote) and
//! [`serve`](super::server::serve), CBOR encoded. Document bodies travel as
//! opaque JSON bytes so the flattened field map survives intact.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use super::{RemoteDocument, RemoteError};

/// Protocol version
pub const PROTOCOL_V1: &str = "1";

/// Correlates a response with its request
pub type RequestId = u64;

/// Messages sent to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Handshake
    #[serde(rename = "hello")]
    Hello {
        #[serde(rename = "clientId")]
        client_id: String,
        #[serde(rename = "protocolVersion")]
        protocol_version: String,
    },

    /// Full replace of `{collection}/{id}`
    #[serde(rename = "set")]
    Set {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        path: String,
        body: ByteBuf,
    },

    #[serde(rename = "remove")]
    Remove {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        path: String,
    },

    /// Read a whole collection
    #[serde(rename = "list")]
    List {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        collection: String,
    },

    /// Start receiving `change` frames for a collection
    #[serde(rename = "subscribe")]
    Subscribe {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        collection: String,
    },

    #[serde(rename = "unsubscribe")]
    Unsubscribe {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        collection: String,
    },

    #[serde(rename = "ping")]
    Ping {
        #[serde(rename = "requestId")]
        request_id: RequestId,
    },
}

/// Messages received from the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Handshake response
    #[serde(rename = "welcome")]
    Welcome {
        #[serde(rename = "serverId")]
        server_id: String,
        #[serde(rename = "protocolVersion")]
        protocol_version: String,
    },

    /// Request completed
    #[serde(rename = "ack")]
    Ack {
        #[serde(rename = "requestId")]
        request_id: RequestId,
    },

    /// Response to `list`
    #[serde(rename = "documents")]
    Documents {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        documents: Vec<ByteBuf>,
    },

    /// Unsolicited change in a subscribed collection
    #[serde(rename = "change")]
    Change {
        collection: String,
        id: String,
        /// Absent when the document was removed
        #[serde(default)]
        body: Option<ByteBuf>,
    },

    /// Request failed; without a request id the whole connection is at fault
    #[serde(rename = "error")]
    Error {
        #[serde(rename = "requestId", default)]
        request_id: Option<RequestId>,
        message: String,
    },

    #[serde(rename = "pong")]
    Pong {
        #[serde(rename = "requestId")]
        request_id: RequestId,
    },
}

impl ClientMessage {
    pub fn hello(client_id: &str) -> Self {
        ClientMessage::Hello {
            client_id: client_id.to_string(),
            protocol_version: PROTOCOL_V1.to_string(),
        }
    }

    /// Request id, if this message expects a response
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            ClientMessage::Hello { .. } => None,
            ClientMessage::Set { request_id, .. }
            | ClientMessage::Remove { request_id, .. }
            | ClientMessage::List { request_id, .. }
            | ClientMessage::Subscribe { request_id, .. }
            | ClientMessage::Unsubscribe { request_id, .. }
            | ClientMessage::Ping { request_id } => Some(*request_id),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, RemoteError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RemoteError> {
        decode(bytes)
    }
}

impl ServerMessage {
    pub fn welcome(server_id: &str) -> Self {
        ServerMessage::Welcome {
            server_id: server_id.to_string(),
            protocol_version: PROTOCOL_V1.to_string(),
        }
    }

    pub fn error(request_id: Option<RequestId>, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            request_id,
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, RemoteError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RemoteError> {
        decode(bytes)
    }
}

/// Serialize a document body for the wire
pub fn encode_document(doc: &RemoteDocument) -> Result<ByteBuf, RemoteError> {
    serde_json::to_vec(doc)
        .map(ByteBuf::from)
        .map_err(|e| RemoteError::Protocol(format!("Failed to encode document: {}", e)))
}

/// Parse a document body received from the wire
pub fn decode_document(bytes: &[u8]) -> Result<RemoteDocument, RemoteError> {
    serde_json::from_slice(bytes)
        .map_err(|e| RemoteError::Protocol(format!("Malformed document body: {}", e)))
}

fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, RemoteError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(message, &mut bytes)
        .map_err(|e| RemoteError::Protocol(format!("CBOR encoding failed: {}", e)))?;
    Ok(bytes)
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, RemoteError> {
    ciborium::from_reader(bytes)
        .map_err(|e| RemoteError::Protocol(format!("CBOR decoding failed: {}", e)))
}
