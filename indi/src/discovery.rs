//! INDI server discovery
//!
//! Probes a host for a listening server, runs the client handshake and
//! classifies each announced device by the standard properties it defines.

use crate::protocol::standard_properties as sp;
use crate::{IndiClient, INDI_DEFAULT_PORT};
use mdns_sd::{ServiceDaemon, ServiceEvent};
use std::collections::HashSet;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;

/// mDNS service type advertised by indiserver
pub const INDI_MDNS_SERVICE: &str = "_indi._tcp.local.";

const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// A reachable INDI server and what it announced
#[derive(Debug, Clone)]
pub struct IndiServer {
    pub host: String,
    pub port: u16,
    pub devices: Vec<IndiDeviceInfo>,
}

#[derive(Debug, Clone)]
pub struct IndiDeviceInfo {
    pub name: String,
    pub device_type: IndiDeviceType,
    /// Property names in definition order
    pub properties: Vec<String>,
}

/// Device role, inferred from its properties
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndiDeviceType {
    Camera,
    Telescope,
    Focuser,
    FilterWheel,
    Dome,
    Rotator,
    Weather,
    Unknown,
}

/// Checked in order; the first role with a matching property wins.
const ROLE_MARKERS: &[(IndiDeviceType, &[&str])] = &[
    (
        IndiDeviceType::Camera,
        &[sp::CCD_EXPOSURE, sp::CCD_INFO, sp::CCD_FRAME, sp::CCD1],
    ),
    (
        IndiDeviceType::Telescope,
        &[sp::EQUATORIAL_EOD_COORD, sp::ON_COORD_SET, sp::TELESCOPE_MOTION_NS],
    ),
    (
        IndiDeviceType::Focuser,
        &[sp::ABS_FOCUS_POSITION, sp::REL_FOCUS_POSITION, sp::FOCUS_MOTION],
    ),
    (IndiDeviceType::FilterWheel, &[sp::FILTER_SLOT, sp::FILTER_NAME]),
    (
        IndiDeviceType::Dome,
        &[sp::DOME_SHUTTER, sp::DOME_MOTION, sp::ABS_DOME_POSITION],
    ),
    (IndiDeviceType::Rotator, &[sp::ABS_ROTATOR_ANGLE]),
    (
        IndiDeviceType::Weather,
        &[sp::WEATHER_STATUS, sp::WEATHER_PARAMETERS],
    ),
];

/// Infer a device role from its property names
pub fn infer_device_type<S: AsRef<str>>(properties: &[S]) -> IndiDeviceType {
    ROLE_MARKERS
        .iter()
        .find(|(_, markers)| {
            properties
                .iter()
                .any(|name| markers.contains(&name.as_ref()))
        })
        .map(|(role, _)| *role)
        .unwrap_or(IndiDeviceType::Unknown)
}

/// Probe the default port on this machine
pub async fn discover_localhost() -> Option<IndiServer> {
    discover_server("127.0.0.1", INDI_DEFAULT_PORT).await
}

/// Connect to `host:port`, enumerate its devices and disconnect.
pub async fn discover_server(host: &str, port: u16) -> Option<IndiServer> {
    if !port_open(host, port, PROBE_TIMEOUT).await {
        tracing::debug!("No INDI server listening on {}:{}", host, port);
        return None;
    }

    let mut client = IndiClient::new(host, Some(port));
    if let Err(e) = client.connect().await {
        tracing::debug!("INDI probe of {}:{} failed: {}", host, port, e);
        return None;
    }

    let mut devices = Vec::new();
    for device in client.devices().await {
        let properties = device.properties().names().await;
        devices.push(IndiDeviceInfo {
            name: device.name().to_string(),
            device_type: infer_device_type(&properties),
            properties,
        });
    }

    if let Err(e) = client.disconnect().await {
        tracing::debug!("Disconnect after probe failed: {}", e);
    }

    Some(IndiServer {
        host: host.to_string(),
        port,
        devices,
    })
}

/// Browse mDNS for INDI servers for `timeout` and probe each one found.
///
/// Servers that resolve but fail the probe are still returned, without devices.
pub async fn discover_mdns(timeout: Duration) -> Vec<IndiServer> {
    let mut servers = Vec::new();

    let mdns = match ServiceDaemon::new() {
        Ok(daemon) => daemon,
        Err(e) => {
            tracing::warn!("mDNS discovery unavailable: {}", e);
            return servers;
        }
    };
    let receiver = match mdns.browse(INDI_MDNS_SERVICE) {
        Ok(receiver) => receiver,
        Err(e) => {
            tracing::warn!("Failed to browse {}: {}", INDI_MDNS_SERVICE, e);
            let _ = mdns.shutdown();
            return servers;
        }
    };

    tracing::info!("Browsing mDNS for INDI servers for {:?}", timeout);
    let deadline = Instant::now() + timeout;
    let mut seen = HashSet::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        let receiver = receiver.clone();
        let event = match tokio::task::spawn_blocking(move || receiver.recv_timeout(remaining)).await {
            Ok(Ok(event)) => event,
            // Timed out or the daemon went away
            Ok(Err(_)) => break,
            Err(e) => {
                tracing::warn!("mDNS receive task failed: {}", e);
                break;
            }
        };

        match event {
            ServiceEvent::ServiceResolved(info) => {
                let port = info.get_port();
                let Some(address) = info.get_addresses().iter().next() else {
                    continue;
                };
                let host = address.to_string();
                if !seen.insert((host.clone(), port)) {
                    continue;
                }

                tracing::info!("Found INDI server {} at {}:{}", info.get_fullname(), host, port);
                let server = match discover_server(&host, port).await {
                    Some(server) => server,
                    None => IndiServer {
                        host,
                        port,
                        devices: Vec::new(),
                    },
                };
                servers.push(server);
            }
            ServiceEvent::ServiceFound(_, fullname) => {
                tracing::debug!("mDNS service found: {}", fullname);
            }
            _ => {}
        }
    }

    if let Err(e) = mdns.shutdown() {
        tracing::warn!("Failed to shut down mDNS daemon: {}", e);
    }
    tracing::info!("mDNS discovery found {} INDI server(s)", servers.len());
    servers
}

async fn port_open(host: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::encode_message;
    use crate::message::ServerMessage;
    use crate::value::NumberLeaf;
    use crate::vector::{TypedVector, Vector, VectorMeta};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_infer_device_type() {
        assert_eq!(
            infer_device_type(&["CONNECTION", "CCD_EXPOSURE"]),
            IndiDeviceType::Camera
        );
        assert_eq!(
            infer_device_type(&["CONNECTION", "EQUATORIAL_EOD_COORD"]),
            IndiDeviceType::Telescope
        );
        assert_eq!(
            infer_device_type(&["FILTER_SLOT".to_string()]),
            IndiDeviceType::FilterWheel
        );
        assert_eq!(
            infer_device_type(&["WEATHER_PARAMETERS"]),
            IndiDeviceType::Weather
        );
        assert_eq!(infer_device_type::<&str>(&[]), IndiDeviceType::Unknown);
        assert_eq!(infer_device_type(&["DRIVER_INFO"]), IndiDeviceType::Unknown);
    }

    #[test]
    fn test_camera_wins_over_later_roles() {
        // Cameras with an integrated filter wheel report both
        assert_eq!(
            infer_device_type(&["FILTER_SLOT", "CCD1"]),
            IndiDeviceType::Camera
        );
    }

    #[tokio::test]
    async fn test_discover_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(discover_server("127.0.0.1", port).await.is_none());
    }

    #[tokio::test]
    async fn test_discover_server_enumerates_devices() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            // The first accept is the port probe
            let (_probe, _) = listener.accept().await.unwrap();
            let (mut stream, _) = listener.accept().await.unwrap();

            let vector = Vector::Number(
                TypedVector::with_items(
                    VectorMeta::new("ABS_FOCUS_POSITION"),
                    vec![NumberLeaf::new("FOCUS_ABSOLUTE_POSITION", 1200.0)],
                )
                .unwrap(),
            );
            let def = encode_message(&ServerMessage::DefVector {
                device: "Focuser Simulator".to_string(),
                vector,
            })
            .unwrap();
            stream.write_all(&def).await.unwrap();

            // Hold the stream open until the client hangs up
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
        });

        let server = discover_server("127.0.0.1", port).await.unwrap();
        assert_eq!(server.port, port);
        assert_eq!(server.devices.len(), 1);
        assert_eq!(server.devices[0].name, "Focuser Simulator");
        assert_eq!(server.devices[0].device_type, IndiDeviceType::Focuser);
        assert_eq!(server.devices[0].properties, vec!["ABS_FOCUS_POSITION"]);
    }
}
