//! One live stream to an INDI server.
//!
//! A connection owns two tasks: the receive loop, which decodes fragments and
//! applies them to the device registry in arrival order, and the writer, which
//! drains the command queue so writes never interleave. Both stop on a shared
//! cancellation token. Transport failures are terminal: the connection moves to
//! `ConnectionLost` and nothing is retried here.

use crate::decode::FrameReader;
use crate::device::IndiDevice;
use crate::encode::encode_command;
use crate::error::{IndiError, IndiResult, ReadError};
use crate::message::{ClientCommand, ServerMessage};
use crate::protocol::{standard_properties, BlobMode};
use crate::vector::VectorHandle;
use crate::IndiClientConfig;
use chrono::NaiveDateTime;
use indexmap::IndexMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The stream failed or the server closed it
    ConnectionLost,
}

/// Events raised by a connection
#[derive(Debug, Clone)]
pub enum IndiEvent {
    Connected,
    /// Transport failure, with the reason
    ConnectionLost(String),
    Disconnected,
    DeviceFound(String),
    DeviceRemoved(String),
    DefinePropertyReceived {
        device: String,
        name: String,
        vector: VectorHandle,
    },
    SetPropertyReceived {
        device: String,
        name: String,
        vector: VectorHandle,
    },
    DeletePropertyReceived {
        device: String,
        name: String,
        vector: VectorHandle,
    },
    NotificationReceived {
        device: Option<String>,
        timestamp: Option<NaiveDateTime>,
        message: String,
    },
    /// A fragment was malformed and skipped
    DecodeFailed(String),
}

pub(crate) struct Outgoing {
    pub(crate) bytes: Vec<u8>,
    pub(crate) ack: oneshot::Sender<IndiResult<()>>,
}

/// Queue into the writer task of the current session.
///
/// Cloned into every device; empty while disconnected.
#[derive(Clone)]
pub struct CommandSink {
    tx: Arc<RwLock<Option<mpsc::Sender<Outgoing>>>>,
}

impl CommandSink {
    pub(crate) fn closed() -> Self {
        Self {
            tx: Arc::new(RwLock::new(None)),
        }
    }

    #[cfg(test)]
    fn with_sender(tx: mpsc::Sender<Outgoing>) -> Self {
        Self {
            tx: Arc::new(RwLock::new(Some(tx))),
        }
    }

    async fn open(&self, tx: mpsc::Sender<Outgoing>) {
        *self.tx.write().await = Some(tx);
    }

    async fn close(&self) {
        self.tx.write().await.take();
    }

    /// Encode and queue a command; resolves once it has been written and flushed.
    pub async fn send(&self, command: &ClientCommand) -> IndiResult<()> {
        let bytes = encode_command(command)?;
        let tx = self
            .tx
            .read()
            .await
            .clone()
            .ok_or(IndiError::NotConnected)?;

        let (ack, written) = oneshot::channel();
        tx.send(Outgoing { bytes, ack })
            .await
            .map_err(|_| IndiError::ChannelClosed("writer task stopped".to_string()))?;
        written
            .await
            .map_err(|_| IndiError::ChannelClosed("writer task dropped the command".to_string()))?
    }
}

struct Shared {
    config: IndiClientConfig,
    devices: RwLock<IndexMap<String, Arc<IndiDevice>>>,
    events: broadcast::Sender<IndiEvent>,
    state: watch::Sender<ConnectionState>,
    sink: CommandSink,
}

impl Shared {
    fn emit(&self, event: IndiEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

struct Session {
    cancel: CancellationToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Session {
    async fn stop(self) {
        self.cancel.cancel();
        for (task, handle) in [("reader", self.reader), ("writer", self.writer)] {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::error!("INDI {} task panicked: {}", task, e);
                }
            }
        }
    }
}

/// Stream to one INDI server plus the devices it announced
pub struct IndiConnection {
    shared: Arc<Shared>,
    session: Mutex<Option<Session>>,
}

impl IndiConnection {
    pub fn new(config: IndiClientConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                config,
                devices: RwLock::new(IndexMap::new()),
                events,
                state,
                sink: CommandSink::closed(),
            }),
            session: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &IndiClientConfig {
        &self.shared.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndiEvent> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Open a TCP stream to `host:port` and start the session.
    pub async fn connect(&self, host: &str, port: u16) -> IndiResult<()> {
        if self.is_connected() {
            return Err(IndiError::ConnectionFailed("already connected".to_string()));
        }

        let duration = self.shared.config.connection_timeout();
        self.shared.state.send_replace(ConnectionState::Connecting);
        tracing::info!("Connecting to INDI server at {}:{}", host, port);

        let stream = match tokio::time::timeout(duration, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.shared.state.send_replace(ConnectionState::Disconnected);
                return Err(IndiError::ConnectionFailed(format!("{}:{}: {}", host, port, e)));
            }
            Err(_) => {
                self.shared.state.send_replace(ConnectionState::Disconnected);
                return Err(IndiError::ConnectionTimeout {
                    host: host.to_string(),
                    port,
                    duration,
                });
            }
        };

        if self.shared.config.tcp_nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                tracing::warn!("Failed to set TCP_NODELAY: {}", e);
            }
        }

        self.attach(stream).await
    }

    /// Start a session over an already open duplex stream.
    pub async fn attach<S>(&self, stream: S) -> IndiResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut session = self.session.lock().await;
        if self.is_connected() {
            return Err(IndiError::ConnectionFailed("already connected".to_string()));
        }
        if let Some(stale) = session.take() {
            stale.stop().await;
            remove_all_devices(&self.shared).await;
        }

        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(self.shared.config.command_queue_capacity.max(1));
        self.shared.sink.open(tx).await;

        let cancel = CancellationToken::new();
        self.shared.state.send_replace(ConnectionState::Connected);
        self.shared.emit(IndiEvent::Connected);

        let reader = tokio::spawn(receive_loop(
            self.shared.clone(),
            FrameReader::new(read_half),
            cancel.clone(),
        ));
        let writer = tokio::spawn(writer_task(
            self.shared.clone(),
            write_half,
            rx,
            cancel.clone(),
        ));

        *session = Some(Session {
            cancel,
            reader,
            writer,
        });
        Ok(())
    }

    /// Queue a command; resolves once it is on the wire.
    pub async fn send(&self, command: &ClientCommand) -> IndiResult<()> {
        self.shared.sink.send(command).await
    }

    /// `getProperties` for everything
    pub async fn query_properties(&self) -> IndiResult<()> {
        self.send(&ClientCommand::get_properties()).await
    }

    pub async fn enable_blob(
        &self,
        device: Option<&str>,
        name: Option<&str>,
        mode: BlobMode,
    ) -> IndiResult<()> {
        self.send(&ClientCommand::EnableBlob {
            device: device.map(str::to_string),
            name: name.map(str::to_string),
            mode,
        })
        .await
    }

    /// Devices in the order they were first announced
    pub async fn devices(&self) -> Vec<Arc<IndiDevice>> {
        self.shared.devices.read().await.values().cloned().collect()
    }

    pub async fn device(&self, name: &str) -> Option<Arc<IndiDevice>> {
        self.shared.devices.read().await.get(name).cloned()
    }

    /// Devices whose driver reports a hardware connection
    pub async fn connected_devices(&self) -> Vec<Arc<IndiDevice>> {
        let mut connected = Vec::new();
        for device in self.devices().await {
            if device.is_connected().await {
                connected.push(device);
            }
        }
        connected
    }

    /// Devices that define `CCD_INFO`
    pub async fn cameras(&self) -> Vec<Arc<IndiDevice>> {
        let mut cameras = Vec::new();
        for device in self.devices().await {
            if device.has(standard_properties::CCD_INFO).await {
                cameras.push(device);
            }
        }
        cameras
    }

    /// Stop the session and release the stream. Calling it again is a no-op.
    pub async fn disconnect(&self) -> IndiResult<()> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };

        tracing::info!("Disconnecting from INDI server");
        self.shared.sink.close().await;
        session.stop().await;

        self.shared.state.send_replace(ConnectionState::Disconnected);
        self.shared.emit(IndiEvent::Disconnected);
        remove_all_devices(&self.shared).await;
        Ok(())
    }
}

impl Drop for IndiConnection {
    fn drop(&mut self) {
        if let Ok(mut session) = self.session.try_lock() {
            if let Some(session) = session.take() {
                session.cancel.cancel();
            }
        }
    }
}

async fn receive_loop<R: AsyncRead + Unpin>(
    shared: Arc<Shared>,
    mut reader: FrameReader<R>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = reader.next_message() => next,
        };

        match next {
            Ok(message) => dispatch(&shared, message).await,
            Err(ReadError::Decode(e)) => {
                tracing::warn!("Discarding malformed INDI fragment: {}", e);
                shared.emit(IndiEvent::DecodeFailed(e.to_string()));
            }
            Err(ReadError::Io(e)) => {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    tracing::info!("INDI connection closed (EOF)");
                } else {
                    tracing::error!("INDI read error: {}", e);
                }
                connection_lost(&shared, e.to_string()).await;
                break;
            }
        }
    }
}

async fn writer_task<W: AsyncWrite + Unpin>(
    shared: Arc<Shared>,
    mut writer: W,
    mut rx: mpsc::Receiver<Outgoing>,
    cancel: CancellationToken,
) {
    loop {
        let outgoing = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(outgoing) => outgoing,
                None => break,
            },
        };

        match write_frame(&mut writer, &outgoing.bytes).await {
            Ok(()) => {
                tracing::trace!("Sent {} bytes to INDI server", outgoing.bytes.len() + 1);
                let _ = outgoing.ack.send(Ok(()));
            }
            Err(e) => {
                tracing::error!("INDI write error: {}", e);
                let _ = outgoing.ack.send(Err(IndiError::WriteFailed(e.to_string())));
                connection_lost(&shared, format!("write failed: {}", e)).await;
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

async fn connection_lost(shared: &Shared, reason: String) {
    let changed = shared.state.send_if_modified(|state| {
        if *state == ConnectionState::Connected {
            *state = ConnectionState::ConnectionLost;
            true
        } else {
            false
        }
    });
    if !changed {
        return;
    }

    tracing::warn!("INDI connection lost: {}", reason);
    shared.sink.close().await;
    shared.emit(IndiEvent::ConnectionLost(reason));
    remove_all_devices(shared).await;
}

async fn device_entry(shared: &Shared, name: &str) -> Arc<IndiDevice> {
    if let Some(device) = shared.devices.read().await.get(name) {
        return device.clone();
    }

    let mut devices = shared.devices.write().await;
    if let Some(device) = devices.get(name) {
        return device.clone();
    }
    let device = Arc::new(IndiDevice::new(
        name,
        shared.sink.clone(),
        shared.config.property_poll_interval(),
    ));
    devices.insert(name.to_string(), device.clone());
    drop(devices);

    tracing::info!("INDI device found: {}", name);
    shared.emit(IndiEvent::DeviceFound(name.to_string()));
    device
}

async fn remove_device(shared: &Shared, name: &str) {
    let removed = shared.devices.write().await.shift_remove(name);
    if let Some(device) = removed {
        device.properties().clear().await;
        tracing::info!("INDI device removed: {}", name);
        shared.emit(IndiEvent::DeviceRemoved(name.to_string()));
    }
}

async fn remove_all_devices(shared: &Shared) {
    let removed: Vec<_> = shared.devices.write().await.drain(..).collect();
    for (name, device) in removed {
        device.properties().clear().await;
        shared.emit(IndiEvent::DeviceRemoved(name));
    }
}

async fn dispatch(shared: &Shared, message: ServerMessage) {
    match message {
        ServerMessage::DefVector { device, vector } => {
            let entry = device_entry(shared, &device).await;
            let name = vector.name().to_string();
            let (handle, created) = entry.properties().define(vector).await;
            tracing::debug!(
                "{} {}.{}",
                if created { "Defined" } else { "Redefined" },
                device,
                name
            );
            shared.emit(IndiEvent::DefinePropertyReceived {
                device,
                name,
                vector: handle,
            });
        }
        ServerMessage::SetVector(update) => {
            let targets = if update.device.is_empty() {
                shared.devices.read().await.values().cloned().collect::<Vec<_>>()
            } else {
                shared
                    .devices
                    .read()
                    .await
                    .get(&update.device)
                    .cloned()
                    .into_iter()
                    .collect()
            };

            let mut applied = false;
            for device in targets {
                let Some(handle) = device.properties().get(&update.name).await else {
                    continue;
                };
                match handle.apply(update.clone()).await {
                    Ok(()) => {
                        applied = true;
                        shared.emit(IndiEvent::SetPropertyReceived {
                            device: device.name().to_string(),
                            name: update.name.clone(),
                            vector: handle,
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Ignoring update for {}.{}: {}", device.name(), update.name, e);
                    }
                }
            }
            if !applied {
                tracing::debug!("No vector for update {}.{}", update.device, update.name);
            }
        }
        ServerMessage::DelProperty { device: None, .. } => {
            tracing::info!("INDI server removed all devices");
            remove_all_devices(shared).await;
        }
        ServerMessage::DelProperty {
            device: Some(device),
            name: None,
            ..
        } => remove_device(shared, &device).await,
        ServerMessage::DelProperty {
            device: Some(device),
            name: Some(name),
            ..
        } => {
            let entry = shared.devices.read().await.get(&device).cloned();
            let removed = match entry {
                Some(entry) => entry.properties().remove(&name).await,
                None => None,
            };
            if let Some(vector) = removed {
                tracing::debug!("Deleted {}.{}", device, name);
                shared.emit(IndiEvent::DeletePropertyReceived {
                    device,
                    name,
                    vector,
                });
            }
        }
        ServerMessage::Message {
            device,
            timestamp,
            content,
        } => {
            tracing::info!("[{}] {}", device.as_deref().unwrap_or("INDI"), content);
            shared.emit(IndiEvent::NotificationReceived {
                device,
                timestamp,
                message: content,
            });
        }
    }
}

/// Sink whose commands are acknowledged immediately and forwarded as text
#[cfg(test)]
pub(crate) fn test_sink() -> (CommandSink, mpsc::UnboundedReceiver<String>) {
    let (tx, mut rx) = mpsc::channel::<Outgoing>(16);
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(outgoing) = rx.recv().await {
            let _ = sent_tx.send(String::from_utf8_lossy(&outgoing.bytes).into_owned());
            let _ = outgoing.ack.send(Ok(()));
        }
    });
    (CommandSink::with_sender(tx), sent_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::encode_message;
    use crate::protocol::{IndiPermission, IndiState, LeafKind};
    use crate::value::{LeafValue, NumberLeaf};
    use crate::vector::{TypedVector, Vector, VectorMeta, VectorUpdate};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn definition(device: &str, name: &str) -> Vec<u8> {
        let mut meta = VectorMeta::new(name);
        meta.perm = IndiPermission::ReadWrite;
        let vector = Vector::Number(
            TypedVector::with_items(meta, vec![NumberLeaf::new("VALUE", 1.0)]).unwrap(),
        );
        encode_message(&ServerMessage::DefVector {
            device: device.to_string(),
            vector,
        })
        .unwrap()
    }

    async fn attached() -> (IndiConnection, DuplexStream) {
        let connection = IndiConnection::new(IndiClientConfig::default());
        let (client, server) = tokio::io::duplex(64 * 1024);
        connection.attach(client).await.unwrap();
        (connection, server)
    }

    async fn next_event(events: &mut broadcast::Receiver<IndiEvent>) -> IndiEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event timeout")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_send_without_session() {
        let connection = IndiConnection::new(IndiClientConfig::default());
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        let err = connection.query_properties().await.unwrap_err();
        assert!(matches!(err, IndiError::NotConnected));
        connection.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_commands_are_newline_terminated() {
        let (connection, mut server) = attached().await;
        connection.query_properties().await.unwrap();
        connection
            .enable_blob(Some("CCD Simulator"), None, BlobMode::Also)
            .await
            .unwrap();

        let expected = "<getProperties version=\"1.7\"/>\n<enableBLOB device=\"CCD Simulator\">Also</enableBLOB>\n";
        let mut received = vec![0u8; expected.len()];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(String::from_utf8(received).unwrap(), expected);
    }

    #[tokio::test]
    async fn test_attach_twice_fails() {
        let (connection, _server) = attached().await;
        let (other, _other_server) = tokio::io::duplex(1024);
        let err = connection.attach(other).await.unwrap_err();
        assert!(matches!(err, IndiError::ConnectionFailed(_)));
    }

    #[tokio::test]
    async fn test_update_without_device_applies_to_all() {
        let (connection, mut server) = attached().await;
        let mut events = connection.subscribe();

        server.write_all(&definition("Camera A", "CCD_TEMPERATURE")).await.unwrap();
        server.write_all(&definition("Camera B", "CCD_TEMPERATURE")).await.unwrap();
        let update = VectorUpdate::new("", "CCD_TEMPERATURE", LeafKind::Number)
            .with_state(IndiState::Ok)
            .with_item(LeafValue::number("VALUE", -5.0));
        server
            .write_all(&encode_message(&ServerMessage::SetVector(update)).unwrap())
            .await
            .unwrap();

        let mut updated = Vec::new();
        while updated.len() < 2 {
            if let IndiEvent::SetPropertyReceived { device, .. } = next_event(&mut events).await {
                updated.push(device);
            }
        }
        assert_eq!(updated, vec!["Camera A", "Camera B"]);

        for device in connection.devices().await {
            let value: NumberLeaf = device.get_leaf("CCD_TEMPERATURE", "VALUE").await.unwrap();
            assert_eq!(value.value, -5.0);
        }
    }

    #[tokio::test]
    async fn test_del_property_without_device_removes_everything() {
        let (connection, mut server) = attached().await;
        let mut events = connection.subscribe();

        server.write_all(&definition("Camera A", "CCD_INFO")).await.unwrap();
        server.write_all(&definition("Focuser", "ABS_FOCUS_POSITION")).await.unwrap();
        server.write_all(b"<delProperty/>").await.unwrap();

        let mut removed = Vec::new();
        while removed.len() < 2 {
            if let IndiEvent::DeviceRemoved(name) = next_event(&mut events).await {
                removed.push(name);
            }
        }
        assert_eq!(removed, vec!["Camera A", "Focuser"]);
        assert!(connection.devices().await.is_empty());
        assert!(connection.is_connected());
    }

    #[tokio::test]
    async fn test_cameras_filter() {
        let (connection, mut server) = attached().await;
        let mut events = connection.subscribe();

        server.write_all(&definition("Camera A", "CCD_INFO")).await.unwrap();
        server.write_all(&definition("Focuser", "ABS_FOCUS_POSITION")).await.unwrap();
        let mut defined = 0;
        while defined < 2 {
            if let IndiEvent::DefinePropertyReceived { .. } = next_event(&mut events).await {
                defined += 1;
            }
        }

        let cameras = connection.cameras().await;
        assert_eq!(cameras.len(), 1);
        assert_eq!(cameras[0].name(), "Camera A");
        assert!(connection.connected_devices().await.is_empty());
    }
}
