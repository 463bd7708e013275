//! INDI Protocol Client
//!
//! Speaks the INDI XML protocol to an `indiserver` over TCP and keeps a live,
//! per-device registry of property vectors.
//!
//! ## Features
//!
//! - Incremental decoding of the element stream, with streamed BLOB payloads
//! - Malformed fragments are skipped without losing the connection
//! - Vector identity survives updates, so handles held by callers stay live
//! - Optimistic `Busy` marking on every write
//! - Waiting on a vector with timeout, cancellation and an optional abort
//! - Definition burst handshake with a tunable silence window
//! - mDNS discovery of servers

mod blob;
mod client;
mod connection;
mod decode;
mod device;
mod encode;
mod error;
mod message;
mod properties;
mod protocol;
mod value;
mod vector;
pub mod discovery;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use blob::Base64Stream;
pub use client::IndiClient;
pub use connection::{CommandSink, ConnectionState, IndiConnection, IndiEvent};
pub use decode::FrameReader;
pub use device::{AbortCommand, IndiDevice};
pub use encode::{encode_command, encode_message};
pub use error::{DecodeError, IndiError, IndiResult, ReadError};
pub use message::{ClientCommand, Frame, ServerMessage};
pub use properties::PropertiesRegistry;
pub use protocol::{
    parse_number, parse_timestamp, format_timestamp, standard_properties, BlobMode, IndiPermission,
    IndiState, LeafKind, SwitchRule, INDI_PROTOCOL_VERSION,
};
pub use value::{BlobLeaf, Leaf, LeafValue, LightLeaf, NumberLeaf, SwitchLeaf, TextLeaf};
pub use vector::{
    LeafHandle, TypedHandle, TypedVector, Vector, VectorHandle, VectorMeta, VectorUpdate,
    WaitOutcome,
};
pub use discovery::{
    discover_localhost, discover_mdns, discover_server, IndiDeviceInfo, IndiDeviceType, IndiServer,
};

/// Default INDI server port
pub const INDI_DEFAULT_PORT: u16 = 7624;

/// Client tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndiClientConfig {
    /// TCP connect timeout (default: 10 seconds)
    pub connection_timeout_secs: u64,
    /// Silence that ends the definition burst after connecting (default: 10ms).
    /// Raise it for servers behind slow links.
    pub quiescence_window_ms: u64,
    /// Upper bound on the whole definition burst (default: 30 seconds)
    pub handshake_timeout_secs: u64,
    /// Poll period while waiting on a vector, on top of change notifications (default: 100ms)
    pub property_poll_interval_ms: u64,
    /// Events buffered per subscriber before it lags (default: 1024)
    pub event_channel_capacity: usize,
    /// Outgoing commands queued per connection (default: 100)
    pub command_queue_capacity: usize,
    /// Disable Nagle on the socket (default: true)
    pub tcp_nodelay: bool,
}

impl Default for IndiClientConfig {
    fn default() -> Self {
        Self {
            connection_timeout_secs: 10,
            quiescence_window_ms: 10,
            handshake_timeout_secs: 30,
            property_poll_interval_ms: 100,
            event_channel_capacity: 1024,
            command_queue_capacity: 100,
            tcp_nodelay: true,
        }
    }
}

impl IndiClientConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn quiescence_window(&self) -> Duration {
        Duration::from_millis(self.quiescence_window_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn property_poll_interval(&self) -> Duration {
        Duration::from_millis(self.property_poll_interval_ms)
    }
}
