//! INDI client
//!
//! Opens a connection, asks the server for every property and waits for the
//! definition burst to settle before handing the connection out.

use crate::connection::{ConnectionState, IndiConnection, IndiEvent};
use crate::device::IndiDevice;
use crate::error::{IndiError, IndiResult};
use crate::message::ClientCommand;
use crate::{IndiClientConfig, INDI_DEFAULT_PORT};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// High-level INDI client
pub struct IndiClient {
    host: String,
    port: u16,
    config: IndiClientConfig,
    connection: Option<Arc<IndiConnection>>,
}

impl IndiClient {
    /// Create a client for `host`, on the default port unless one is given
    pub fn new(host: &str, port: Option<u16>) -> Self {
        Self::with_config(host, port, IndiClientConfig::default())
    }

    pub fn with_config(host: &str, port: Option<u16>, config: IndiClientConfig) -> Self {
        Self {
            host: host.to_string(),
            port: port.unwrap_or(INDI_DEFAULT_PORT),
            config,
            connection: None,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn config(&self) -> &IndiClientConfig {
        &self.config
    }

    /// Connect over TCP and wait for the server's definitions.
    pub async fn connect(&mut self) -> IndiResult<()> {
        self.disconnect().await?;

        let connection = Arc::new(IndiConnection::new(self.config.clone()));
        let events = connection.subscribe();
        connection.connect(&self.host, self.port).await?;
        self.handshake(connection, events).await
    }

    /// Run the handshake over an already open stream.
    pub async fn connect_stream<S>(&mut self, stream: S) -> IndiResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.disconnect().await?;

        let connection = Arc::new(IndiConnection::new(self.config.clone()));
        let events = connection.subscribe();
        connection.attach(stream).await?;
        self.handshake(connection, events).await
    }

    async fn handshake(
        &mut self,
        connection: Arc<IndiConnection>,
        mut events: broadcast::Receiver<IndiEvent>,
    ) -> IndiResult<()> {
        let settled = match connection.send(&ClientCommand::get_properties()).await {
            Ok(()) => wait_for_quiescence(&self.config, &mut events).await,
            Err(e) => Err(IndiError::HandshakeFailed(format!(
                "getProperties not sent: {}",
                e
            ))),
        };

        if let Err(e) = settled {
            tracing::warn!("INDI handshake with {}:{} failed: {}", self.host, self.port, e);
            connection.disconnect().await?;
            return Err(e);
        }
        if connection.state() != ConnectionState::Connected {
            connection.disconnect().await?;
            return Err(IndiError::HandshakeFailed(
                "connection closed during handshake".to_string(),
            ));
        }

        tracing::info!(
            "Connected to INDI server at {}:{} ({} devices)",
            self.host,
            self.port,
            connection.devices().await.len()
        );
        self.connection = Some(connection);
        Ok(())
    }

    pub async fn disconnect(&mut self) -> IndiResult<()> {
        match self.connection.take() {
            Some(connection) => connection.disconnect().await,
            None => Ok(()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .map(|connection| connection.is_connected())
            .unwrap_or(false)
    }

    pub fn connection(&self) -> Option<&Arc<IndiConnection>> {
        self.connection.as_ref()
    }

    pub fn subscribe(&self) -> IndiResult<broadcast::Receiver<IndiEvent>> {
        Ok(self.live()?.subscribe())
    }

    pub async fn devices(&self) -> Vec<Arc<IndiDevice>> {
        match &self.connection {
            Some(connection) => connection.devices().await,
            None => Vec::new(),
        }
    }

    pub async fn device(&self, name: &str) -> Option<Arc<IndiDevice>> {
        self.connection.as_ref()?.device(name).await
    }

    /// Wait until the server has announced `name`.
    ///
    /// Returns at once when the device is already known. Fails with
    /// `NotConnected` if the connection ends first.
    pub async fn wait_for_device(
        &self,
        name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> IndiResult<Arc<IndiDevice>> {
        let connection = self.live()?;
        let mut events = connection.subscribe();
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(device) = connection.device(name).await {
                return Ok(device);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(IndiError::Cancelled {
                        device: name.to_string(),
                        property: String::new(),
                    });
                }
                _ = sleep_until(deadline) => {
                    return Err(IndiError::DeviceTimeout {
                        device: name.to_string(),
                        duration: timeout,
                    });
                }
                event = events.recv() => match event {
                    Ok(IndiEvent::ConnectionLost(_)) | Ok(IndiEvent::Disconnected) | Err(RecvError::Closed) => {
                        return Err(IndiError::NotConnected);
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                },
            }
        }
    }

    fn live(&self) -> IndiResult<&Arc<IndiConnection>> {
        self.connection.as_ref().ok_or(IndiError::NotConnected)
    }
}

impl Default for IndiClient {
    fn default() -> Self {
        Self::new("localhost", None)
    }
}

/// Wait until no definition has arrived for one quiescence window.
async fn wait_for_quiescence(
    config: &IndiClientConfig,
    events: &mut broadcast::Receiver<IndiEvent>,
) -> IndiResult<()> {
    let window = config.quiescence_window();
    let limit = Instant::now() + config.handshake_timeout();
    let mut deadline = Instant::now() + window;
    let mut defined = 0usize;

    loop {
        tokio::select! {
            _ = sleep_until(deadline) => {
                tracing::debug!("Definition burst settled after {} vectors", defined);
                return Ok(());
            }
            _ = sleep_until(limit) => {
                return Err(IndiError::HandshakeFailed(format!(
                    "definitions still arriving after {:?}",
                    config.handshake_timeout()
                )));
            }
            event = events.recv() => match event {
                Ok(IndiEvent::DefinePropertyReceived { .. }) => {
                    defined += 1;
                    deadline = Instant::now() + window;
                }
                Ok(IndiEvent::ConnectionLost(reason)) => {
                    return Err(IndiError::HandshakeFailed(format!("connection lost: {}", reason)));
                }
                Ok(IndiEvent::Disconnected) | Err(RecvError::Closed) => {
                    return Err(IndiError::HandshakeFailed("connection closed".to_string()));
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    defined += skipped as usize;
                    deadline = Instant::now() + window;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_default_creation() {
        let client = IndiClient::default();
        assert_eq!(client.host(), "localhost");
        assert_eq!(client.port(), INDI_DEFAULT_PORT);
        assert!(!client.is_connected());
        assert!(client.connection().is_none());
    }

    #[test]
    fn test_client_custom_port() {
        let client = IndiClient::new("observatory.local", Some(7625));
        assert_eq!(client.host(), "observatory.local");
        assert_eq!(client.port(), 7625);
    }

    #[tokio::test]
    async fn test_subscribe_requires_connection() {
        let client = IndiClient::default();
        assert!(matches!(client.subscribe(), Err(IndiError::NotConnected)));
        assert!(client.devices().await.is_empty());
        assert!(client.device("CCD Simulator").await.is_none());
    }

    #[tokio::test]
    async fn test_wait_for_device_requires_connection() {
        let client = IndiClient::default();
        let err = client
            .wait_for_device("CCD Simulator", Duration::from_millis(10), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, IndiError::NotConnected));
    }

    #[tokio::test]
    async fn test_wait_for_device_times_out() {
        let (client_side, _server_side) = tokio::io::duplex(1024);
        let mut client = IndiClient::default();
        client.connect_stream(client_side).await.unwrap();
        let err = client
            .wait_for_device("CCD Simulator", Duration::from_millis(30), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, IndiError::DeviceTimeout { ref device, .. } if device == "CCD Simulator"));
    }

    #[tokio::test]
    async fn test_disconnect_when_idle() {
        let mut client = IndiClient::default();
        client.disconnect().await.unwrap();
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut client = IndiClient::new("127.0.0.1", Some(port));
        let err = client.connect().await.unwrap_err();
        assert!(matches!(
            err,
            IndiError::ConnectionFailed(_) | IndiError::ConnectionTimeout { .. }
        ));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_handshake_fails_when_server_hangs_up() {
        let (client_side, server_side) = tokio::io::duplex(1024);
        drop(server_side);

        let mut client = IndiClient::default();
        let err = client.connect_stream(client_side).await.unwrap_err();
        assert!(matches!(err, IndiError::HandshakeFailed(_)));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_quiescence_with_silent_server() {
        let (client_side, _server_side) = tokio::io::duplex(1024);
        let mut client = IndiClient::default();
        client.connect_stream(client_side).await.unwrap();
        assert!(client.is_connected());
        assert!(client.devices().await.is_empty());
        client.disconnect().await.unwrap();
        assert!(!client.is_connected());
    }
}
