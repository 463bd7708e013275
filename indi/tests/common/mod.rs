//! In-process INDI server for driving a client over a duplex stream.

#![allow(dead_code)]

use allsky_indi::{
    encode_message, ClientCommand, FrameReader, IndiClient, IndiClientConfig, IndiEvent,
    IndiPermission, IndiState, Leaf, ServerMessage, TypedVector, Vector, VectorMeta,
};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::broadcast;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub struct MockServer {
    reader: FrameReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl MockServer {
    pub fn new(stream: DuplexStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: FrameReader::new(read_half),
            writer: write_half,
        }
    }

    pub async fn send(&mut self, message: ServerMessage) {
        let bytes = encode_message(&message).expect("encode");
        self.send_raw(&bytes).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("server write");
        self.writer.flush().await.expect("server flush");
    }

    pub async fn define(&mut self, device: &str, vector: Vector) {
        self.send(ServerMessage::DefVector {
            device: device.to_string(),
            vector,
        })
        .await;
    }

    pub async fn expect_command(&mut self) -> ClientCommand {
        tokio::time::timeout(TIMEOUT, self.reader.next_command())
            .await
            .expect("command timeout")
            .expect("command decode")
    }

    /// Skip commands until one matches.
    pub async fn expect_matching<F>(&mut self, mut predicate: F) -> ClientCommand
    where
        F: FnMut(&ClientCommand) -> bool,
    {
        loop {
            let command = self.expect_command().await;
            if predicate(&command) {
                return command;
            }
        }
    }

    /// Close both directions of the stream.
    pub fn hang_up(self) {
        drop(self);
    }
}

pub fn vector<L: Leaf>(name: &str, perm: IndiPermission, items: Vec<L>) -> Vector {
    let mut meta = VectorMeta::new(name);
    meta.perm = perm;
    meta.state = IndiState::Idle;
    L::wrap(TypedVector::with_items(meta, items).expect("unique items"))
}

pub fn fast_config() -> IndiClientConfig {
    IndiClientConfig {
        quiescence_window_ms: 100,
        property_poll_interval_ms: 20,
        ..IndiClientConfig::default()
    }
}

/// Connect a client to a mock server that has already queued `definitions`.
pub async fn connected(definitions: Vec<(&str, Vector)>) -> (IndiClient, MockServer) {
    let (client_side, server_side) = tokio::io::duplex(256 * 1024);
    let mut server = MockServer::new(server_side);
    for (device, vector) in definitions {
        server.define(device, vector).await;
    }

    let mut client = IndiClient::with_config("mock", None, fast_config());
    client.connect_stream(client_side).await.expect("handshake");
    let hello = server.expect_command().await;
    assert_eq!(hello, ClientCommand::get_properties());
    (client, server)
}

pub async fn next_event(events: &mut broadcast::Receiver<IndiEvent>) -> IndiEvent {
    tokio::time::timeout(TIMEOUT, events.recv())
        .await
        .expect("event timeout")
        .expect("event channel")
}

/// Wait for the first event the predicate accepts.
pub async fn wait_event<F>(events: &mut broadcast::Receiver<IndiEvent>, mut predicate: F) -> IndiEvent
where
    F: FnMut(&IndiEvent) -> bool,
{
    loop {
        let event = next_event(events).await;
        if predicate(&event) {
            return event;
        }
    }
}
