//! Decoded protocol messages, in both directions.

use crate::protocol::BlobMode;
use crate::vector::{Vector, VectorUpdate};
use chrono::NaiveDateTime;

/// Server to client
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// `def*Vector`: full definition of a vector
    DefVector { device: String, vector: Vector },
    /// `set*Vector`: partial update of an existing vector
    SetVector(VectorUpdate),
    /// `delProperty`: no device means every device, no name means the whole device
    DelProperty {
        device: Option<String>,
        name: Option<String>,
        timestamp: Option<NaiveDateTime>,
        message: Option<String>,
    },
    /// `message`: free-form notification
    Message {
        device: Option<String>,
        timestamp: Option<NaiveDateTime>,
        content: String,
    },
}

impl ServerMessage {
    pub fn device(&self) -> Option<&str> {
        match self {
            ServerMessage::DefVector { device, .. } => Some(device),
            ServerMessage::SetVector(update) => Some(&update.device),
            ServerMessage::DelProperty { device, .. } | ServerMessage::Message { device, .. } => {
                device.as_deref()
            }
        }
    }
}

/// Client to server
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    /// Ask for definitions, optionally narrowed to one device or vector
    GetProperties {
        device: Option<String>,
        name: Option<String>,
    },
    /// `new*Vector`. Only item names and values are put on the wire.
    NewVector {
        device: String,
        timestamp: Option<NaiveDateTime>,
        vector: Vector,
    },
    EnableBlob {
        device: Option<String>,
        name: Option<String>,
        mode: BlobMode,
    },
}

impl ClientCommand {
    pub fn get_properties() -> Self {
        ClientCommand::GetProperties {
            device: None,
            name: None,
        }
    }
}

/// Any top-level fragment
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Server(ServerMessage),
    Client(ClientCommand),
}
