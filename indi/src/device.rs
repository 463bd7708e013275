//! A named device on an INDI server and its properties

use crate::connection::CommandSink;
use crate::error::{IndiError, IndiResult};
use crate::message::ClientCommand;
use crate::protocol::{standard_properties, BlobMode, IndiState};
use crate::properties::PropertiesRegistry;
use crate::value::{Leaf, LeafValue, SwitchLeaf};
use crate::vector::WaitOutcome;
use std::fmt::Write as _;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Switch to turn On when a pending operation is cancelled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortCommand {
    pub vector: String,
    pub element: String,
}

impl AbortCommand {
    pub fn new(vector: impl Into<String>, element: impl Into<String>) -> Self {
        Self {
            vector: vector.into(),
            element: element.into(),
        }
    }

    /// `CCD_ABORT_EXPOSURE.ABORT`
    pub fn ccd_exposure() -> Self {
        Self::new(standard_properties::CCD_ABORT_EXPOSURE, "ABORT")
    }
}

pub struct IndiDevice {
    name: String,
    properties: PropertiesRegistry,
    sink: CommandSink,
}

impl std::fmt::Debug for IndiDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndiDevice").field("name", &self.name).finish()
    }
}

impl IndiDevice {
    pub(crate) fn new(name: impl Into<String>, sink: CommandSink, poll_interval: Duration) -> Self {
        let name = name.into();
        Self {
            properties: PropertiesRegistry::new(name.clone(), sink.clone(), poll_interval),
            name,
            sink,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn properties(&self) -> &PropertiesRegistry {
        &self.properties
    }

    pub async fn has(&self, vector: &str) -> bool {
        self.properties.exists(vector).await
    }

    /// Whether `CONNECTION.CONNECT` is On
    pub async fn is_connected(&self) -> bool {
        let Some(connection) = self
            .properties
            .try_get::<SwitchLeaf>(standard_properties::CONNECTION)
            .await
        else {
            return false;
        };
        let connected = match connection.read().await {
            Ok(switches) => switches.is_on(standard_properties::CONNECT),
            Err(_) => false,
        };
        connected
    }

    /// Ask the driver to connect to the hardware.
    ///
    /// Only sends the request; wait on the CONNECTION vector for the outcome.
    pub async fn connect(&self) -> IndiResult<()> {
        tracing::info!("Connecting INDI device {}", self.name);
        self.switch_to(standard_properties::CONNECTION, standard_properties::CONNECT)
            .await
    }

    pub async fn disconnect(&self) -> IndiResult<()> {
        tracing::info!("Disconnecting INDI device {}", self.name);
        self.switch_to(standard_properties::CONNECTION, standard_properties::DISCONNECT)
            .await
    }

    /// Turn one element of a switch vector On
    pub async fn switch_to(&self, vector: &str, element: &str) -> IndiResult<()> {
        let handle = self.properties.require(vector).await?;
        self.properties
            .set(&handle, vec![LeafValue::switch(element, true)])
            .await
    }

    pub async fn set_numbers(&self, vector: &str, values: &[(&str, f64)]) -> IndiResult<()> {
        let handle = self.properties.require(vector).await?;
        let items = values
            .iter()
            .map(|(name, value)| LeafValue::number(*name, *value))
            .collect();
        self.properties.set(&handle, items).await
    }

    pub async fn set_texts(&self, vector: &str, values: &[(&str, &str)]) -> IndiResult<()> {
        let handle = self.properties.require(vector).await?;
        let items = values
            .iter()
            .map(|(name, value)| LeafValue::text(*name, *value))
            .collect();
        self.properties.set(&handle, items).await
    }

    /// Current copy of one leaf
    pub async fn get_leaf<L: Leaf>(&self, vector: &str, element: &str) -> IndiResult<L> {
        let handle = self.properties.require(vector).await?;
        let typed = match handle.typed::<L>().await {
            Some(typed) => typed,
            None => {
                return Err(IndiError::KindMismatch {
                    property: vector.to_string(),
                    expected: L::KIND,
                    actual: handle.kind().await,
                })
            }
        };
        typed.get(element).await.ok_or_else(|| IndiError::ElementNotFound {
            device: self.name.clone(),
            property: vector.to_string(),
            element: element.to_string(),
        })
    }

    /// Request BLOB delivery for this device
    pub async fn enable_blob(&self, mode: BlobMode) -> IndiResult<()> {
        self.sink
            .send(&ClientCommand::EnableBlob {
                device: Some(self.name.clone()),
                name: None,
                mode,
            })
            .await
    }

    /// Set a vector and wait for the device to finish with it.
    ///
    /// On cancellation the abort switch is turned On (when given) before
    /// `Cancelled` is returned. A timeout sends nothing; deciding whether to
    /// abort is left to the caller.
    pub async fn set_and_wait(
        &self,
        vector: &str,
        items: Vec<LeafValue>,
        timeout: Duration,
        cancel: &CancellationToken,
        abort: Option<&AbortCommand>,
    ) -> IndiResult<IndiState> {
        let handle = self.properties.require(vector).await?;
        self.properties.set(&handle, items).await?;

        match handle.wait_while_busy(timeout, cancel).await {
            WaitOutcome::Completed(state) => Ok(state),
            WaitOutcome::Alert(message) => Err(IndiError::DeviceAlert {
                device: self.name.clone(),
                property: vector.to_string(),
                message,
            }),
            WaitOutcome::TimedOut { last_state } => {
                tracing::warn!(
                    "{}.{} still {} after {:?}",
                    self.name,
                    vector,
                    last_state,
                    timeout
                );
                Err(IndiError::OperationTimeout {
                    device: self.name.clone(),
                    property: vector.to_string(),
                    duration: timeout,
                    last_state: Some(last_state),
                })
            }
            WaitOutcome::Cancelled => {
                if let Some(abort) = abort {
                    tracing::info!(
                        "{}.{} cancelled, sending {}.{}",
                        self.name,
                        vector,
                        abort.vector,
                        abort.element
                    );
                    if let Err(e) = self.switch_to(&abort.vector, &abort.element).await {
                        tracing::warn!("Abort of {}.{} failed: {}", self.name, vector, e);
                    }
                }
                Err(IndiError::Cancelled {
                    device: self.name.clone(),
                    property: vector.to_string(),
                })
            }
        }
    }

    /// Text listing of every vector and leaf
    pub async fn dump_properties(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", self.name);
        for handle in self.properties.all().await {
            let vector = handle.read().await;
            let meta = vector.meta();
            let _ = writeln!(
                out,
                "  {} [{}] state={} perm={}{}",
                meta.name,
                vector.kind(),
                meta.state,
                meta.perm.as_str(),
                meta.label
                    .as_deref()
                    .map(|l| format!(" \"{}\"", l))
                    .unwrap_or_default()
            );
            for item in vector.values() {
                let _ = writeln!(out, "    {} = {}", item.name(), item.display_value());
            }
        }
        out
    }
}
