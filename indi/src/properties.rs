//! Per-device property registry
//!
//! The map itself is behind an async lock; each vector carries its own lock
//! inside its [`VectorHandle`]. Definitions for a name that already exists are
//! written into the existing handle so references held elsewhere stay valid.

use crate::connection::CommandSink;
use crate::error::{IndiError, IndiResult};
use crate::message::ClientCommand;
use crate::protocol::{IndiPermission, IndiState, LeafKind};
use crate::value::{Leaf, LeafValue};
use crate::vector::{TypedHandle, Vector, VectorHandle, VectorMeta};
use indexmap::IndexMap;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

pub struct PropertiesRegistry {
    device: String,
    vectors: RwLock<IndexMap<String, VectorHandle>>,
    sink: CommandSink,
    poll_interval: Duration,
    /// Signalled whenever a new name is defined
    defined: Notify,
}

impl PropertiesRegistry {
    pub(crate) fn new(device: impl Into<String>, sink: CommandSink, poll_interval: Duration) -> Self {
        Self {
            device: device.into(),
            vectors: RwLock::new(IndexMap::new()),
            sink,
            poll_interval,
            defined: Notify::new(),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub async fn exists(&self, name: &str) -> bool {
        self.vectors.read().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.vectors.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.vectors.read().await.is_empty()
    }

    /// Vector names in definition order
    pub async fn names(&self) -> Vec<String> {
        self.vectors.read().await.keys().cloned().collect()
    }

    pub async fn all(&self) -> Vec<VectorHandle> {
        self.vectors.read().await.values().cloned().collect()
    }

    pub async fn get(&self, name: &str) -> Option<VectorHandle> {
        self.vectors.read().await.get(name).cloned()
    }

    /// Typed lookup; `None` if absent or of another kind
    pub async fn try_get<L: Leaf>(&self, name: &str) -> Option<TypedHandle<L>> {
        self.get(name).await?.typed::<L>().await
    }

    pub async fn require(&self, name: &str) -> IndiResult<VectorHandle> {
        self.get(name)
            .await
            .ok_or_else(|| IndiError::PropertyNotFound {
                device: self.device.clone(),
                property: name.to_string(),
            })
    }

    /// Wait until `name` is defined, returning at once if it already is.
    pub async fn wait_for(
        &self,
        name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> IndiResult<VectorHandle> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.defined.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(handle) = self.get(name).await {
                return Ok(handle);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(IndiError::Cancelled {
                        device: self.device.clone(),
                        property: name.to_string(),
                    });
                }
                _ = sleep_until(deadline) => {
                    return Err(IndiError::OperationTimeout {
                        device: self.device.clone(),
                        property: name.to_string(),
                        duration: timeout,
                        last_state: None,
                    });
                }
                _ = &mut notified => {}
            }
        }
    }

    /// Ask the server to resend every vector of this device.
    pub async fn refresh_all(&self) -> IndiResult<()> {
        self.sink
            .send(&ClientCommand::GetProperties {
                device: Some(self.device.clone()),
                name: None,
            })
            .await
    }

    /// Ask the server to resend one vector, marking the local copy Busy first.
    pub async fn refresh(&self, name: &str) -> IndiResult<()> {
        if let Some(vector) = self.get(name).await {
            vector.set_state(IndiState::Busy).await;
        }
        self.sink
            .send(&ClientCommand::GetProperties {
                device: Some(self.device.clone()),
                name: Some(name.to_string()),
            })
            .await
    }

    /// Push new values for some items of `vector`.
    ///
    /// The request is validated locally, the vector is marked Busy before this
    /// returns, and only names and values go on the wire. If the command
    /// cannot be written the previous state is put back.
    pub async fn set(&self, vector: &VectorHandle, items: Vec<LeafValue>) -> IndiResult<()> {
        if vector.device() != self.device {
            return Err(IndiError::PropertyNotFound {
                device: self.device.clone(),
                property: vector.name().to_string(),
            });
        }

        let (outgoing, previous) = {
            let mut current = vector.write().await;
            let outgoing = self.validate(&current, items)?;
            let previous = current.state();
            current.meta_mut().state = IndiState::Busy;
            (outgoing, previous)
        };
        vector.touch();

        self.vectors
            .write()
            .await
            .insert(vector.name().to_string(), vector.clone());

        tracing::debug!(
            "Setting {}.{} ({} items)",
            self.device,
            vector.name(),
            outgoing.len()
        );

        let command = ClientCommand::NewVector {
            device: self.device.clone(),
            timestamp: Some(chrono::Utc::now().naive_utc()),
            vector: outgoing,
        };
        if let Err(e) = self.sink.send(&command).await {
            vector.set_state(previous).await;
            return Err(e);
        }
        Ok(())
    }

    fn validate(&self, current: &Vector, items: Vec<LeafValue>) -> IndiResult<Vector> {
        let name = current.name();
        let kind = current.kind();

        if current.meta().perm == IndiPermission::ReadOnly {
            return Err(IndiError::PermissionDenied(format!(
                "{}.{} is read-only",
                self.device, name
            )));
        }
        if kind == LeafKind::Light {
            return Err(IndiError::NotWritable(format!(
                "{}.{} is a light vector",
                self.device, name
            )));
        }

        for item in &items {
            if item.kind() != kind {
                return Err(IndiError::KindMismatch {
                    property: name.to_string(),
                    expected: kind,
                    actual: item.kind(),
                });
            }
            let existing = current.item(item.name()).ok_or_else(|| IndiError::ElementNotFound {
                device: self.device.clone(),
                property: name.to_string(),
                element: item.name().to_string(),
            })?;
            if let (LeafValue::Number(limits), LeafValue::Number(requested)) = (&existing, item) {
                if !limits.in_range(requested.value) {
                    return Err(IndiError::ValueOutOfRange {
                        device: self.device.clone(),
                        property: name.to_string(),
                        element: item.name().to_string(),
                        value: requested.value,
                        min: limits.min,
                        max: limits.max,
                    });
                }
            }
        }

        Vector::from_items(VectorMeta::new(name), kind, items)
    }

    /// Register a definition. Returns the handle and whether it is new.
    pub(crate) async fn define(&self, vector: Vector) -> (VectorHandle, bool) {
        let name = vector.name().to_string();
        let existing = self.vectors.read().await.get(&name).cloned();
        if let Some(handle) = existing {
            handle.replace(vector).await;
            return (handle, false);
        }

        let mut vectors = self.vectors.write().await;
        if let Some(handle) = vectors.get(&name).cloned() {
            drop(vectors);
            handle.replace(vector).await;
            return (handle, false);
        }
        let handle = VectorHandle::with_poll_interval(self.device.clone(), vector, self.poll_interval);
        vectors.insert(name, handle.clone());
        drop(vectors);
        self.defined.notify_waiters();
        (handle, true)
    }

    pub(crate) async fn remove(&self, name: &str) -> Option<VectorHandle> {
        self.vectors.write().await.shift_remove(name)
    }

    pub(crate) async fn clear(&self) -> Vec<VectorHandle> {
        self.vectors.write().await.drain(..).map(|(_, v)| v).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_sink;
    use crate::value::{NumberLeaf, SwitchLeaf, TextLeaf};
    use crate::vector::TypedVector;

    fn registry() -> (PropertiesRegistry, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let (sink, sent) = test_sink();
        (
            PropertiesRegistry::new("CCD Simulator", sink, Duration::from_millis(10)),
            sent,
        )
    }

    fn numbers(name: &str, perm: IndiPermission, leaves: Vec<NumberLeaf>) -> Vector {
        let mut meta = VectorMeta::new(name);
        meta.perm = perm;
        meta.state = IndiState::Idle;
        Vector::Number(TypedVector::with_items(meta, leaves).unwrap())
    }

    fn gain(value: f64) -> NumberLeaf {
        let mut leaf = NumberLeaf::new("GAIN", value);
        leaf.max = 600.0;
        leaf.format = "%.f".to_string();
        leaf
    }

    #[tokio::test]
    async fn test_redefinition_keeps_identity() {
        let (registry, _sent) = registry();
        let (first, created) = registry
            .define(numbers("CCD_GAIN", IndiPermission::ReadWrite, vec![gain(1.0)]))
            .await;
        assert!(created);

        let (second, created) = registry
            .define(numbers("CCD_GAIN", IndiPermission::ReadOnly, vec![gain(2.0)]))
            .await;
        assert!(!created);
        assert!(VectorHandle::ptr_eq(&first, &second));
        assert_eq!(first.read().await.meta().perm, IndiPermission::ReadOnly);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_wait_for_definition() {
        let (registry, _sent) = registry();
        let registry = std::sync::Arc::new(registry);
        let (gain_vector, _) = registry
            .define(numbers("CCD_GAIN", IndiPermission::ReadWrite, vec![gain(1.0)]))
            .await;
        let cancel = CancellationToken::new();

        let found = registry
            .wait_for("CCD_GAIN", Duration::from_millis(10), &cancel)
            .await
            .unwrap();
        assert!(VectorHandle::ptr_eq(&found, &gain_vector));

        let late = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            late.define(numbers("CCD_TEMPERATURE", IndiPermission::ReadWrite, vec![]))
                .await;
        });
        let found = registry
            .wait_for("CCD_TEMPERATURE", Duration::from_secs(5), &cancel)
            .await
            .unwrap();
        assert_eq!(found.name(), "CCD_TEMPERATURE");
    }

    #[tokio::test]
    async fn test_wait_for_timeout_and_cancel() {
        let (registry, _sent) = registry();
        let err = registry
            .wait_for("CCD_COOLER", Duration::from_millis(20), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IndiError::OperationTimeout { ref property, last_state: None, .. } if property == "CCD_COOLER"
        ));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = registry
            .wait_for("CCD_COOLER", Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, IndiError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_names_follow_definition_order() {
        let (registry, _sent) = registry();
        for name in ["CONNECTION", "CCD_INFO", "CCD_EXPOSURE", "CCD_GAIN"] {
            registry
                .define(numbers(name, IndiPermission::ReadWrite, vec![]))
                .await;
        }
        registry.remove("CCD_INFO").await;
        assert_eq!(
            registry.names().await,
            vec!["CONNECTION", "CCD_EXPOSURE", "CCD_GAIN"]
        );
    }

    #[tokio::test]
    async fn test_try_get_checks_kind() {
        let (registry, _sent) = registry();
        registry
            .define(numbers("CCD_GAIN", IndiPermission::ReadWrite, vec![gain(1.0)]))
            .await;
        assert!(registry.try_get::<NumberLeaf>("CCD_GAIN").await.is_some());
        assert!(registry.try_get::<SwitchLeaf>("CCD_GAIN").await.is_none());
        assert!(registry.try_get::<NumberLeaf>("CCD_OFFSET").await.is_none());
        assert!(matches!(
            registry.require("CCD_OFFSET").await,
            Err(IndiError::PropertyNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_set_marks_busy_and_sends_values_only() {
        let (registry, mut sent) = registry();
        let (handle, _) = registry
            .define(numbers("CCD_GAIN", IndiPermission::ReadWrite, vec![gain(1.0)]))
            .await;

        registry
            .set(&handle, vec![LeafValue::number("GAIN", 250.0)])
            .await
            .unwrap();

        assert_eq!(handle.state().await, IndiState::Busy);
        // The local value only changes once the server confirms it
        let typed = handle.typed::<NumberLeaf>().await.unwrap();
        assert_eq!(typed.get("GAIN").await.unwrap().value, 1.0);

        let xml = sent.recv().await.unwrap();
        assert!(xml.starts_with(r#"<newNumberVector device="CCD Simulator" name="CCD_GAIN""#));
        assert!(xml.contains(r#"<oneNumber name="GAIN">250</oneNumber>"#));
        assert!(!xml.contains("max="));
    }

    #[tokio::test]
    async fn test_set_rejections_send_nothing() {
        let (registry, mut sent) = registry();
        let (read_only, _) = registry
            .define(numbers("CCD_INFO", IndiPermission::ReadOnly, vec![NumberLeaf::new("CCD_MAX_X", 1280.0)]))
            .await;
        let (gain_vector, _) = registry
            .define(numbers("CCD_GAIN", IndiPermission::ReadWrite, vec![gain(1.0)]))
            .await;

        let err = registry
            .set(&read_only, vec![LeafValue::number("CCD_MAX_X", 640.0)])
            .await
            .unwrap_err();
        assert!(matches!(err, IndiError::PermissionDenied(_)));

        let err = registry
            .set(&gain_vector, vec![LeafValue::switch("GAIN", true)])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IndiError::KindMismatch {
                expected: LeafKind::Number,
                actual: LeafKind::Switch,
                ..
            }
        ));

        let err = registry
            .set(&gain_vector, vec![LeafValue::number("OFFSET", 5.0)])
            .await
            .unwrap_err();
        assert!(matches!(err, IndiError::ElementNotFound { .. }));

        let err = registry
            .set(&gain_vector, vec![LeafValue::number("GAIN", 601.0)])
            .await
            .unwrap_err();
        assert!(matches!(err, IndiError::ValueOutOfRange { max, .. } if max == 600.0));

        assert_eq!(gain_vector.state().await, IndiState::Idle);
        assert_eq!(read_only.state().await, IndiState::Idle);
        assert!(sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_set_text_leaf() {
        let (registry, mut sent) = registry();
        let mut meta = VectorMeta::new("FITS_HEADER");
        meta.perm = IndiPermission::WriteOnly;
        let vector = Vector::Text(
            TypedVector::with_items(meta, vec![TextLeaf::new("FITS_OBSERVER", None)]).unwrap(),
        );
        let (handle, _) = registry.define(vector).await;
        registry
            .set(&handle, vec![LeafValue::text("FITS_OBSERVER", "Messier")])
            .await
            .unwrap();
        let xml = sent.recv().await.unwrap();
        assert!(xml.contains(r#"<oneText name="FITS_OBSERVER">Messier</oneText>"#));
    }

    #[tokio::test]
    async fn test_refresh_marks_busy() {
        let (registry, mut sent) = registry();
        let (handle, _) = registry
            .define(numbers("CCD_TEMPERATURE", IndiPermission::ReadWrite, vec![]))
            .await;
        registry.refresh("CCD_TEMPERATURE").await.unwrap();
        assert_eq!(handle.state().await, IndiState::Busy);
        assert_eq!(
            sent.recv().await.unwrap(),
            r#"<getProperties version="1.7" device="CCD Simulator" name="CCD_TEMPERATURE"/>"#
        );

        registry.refresh_all().await.unwrap();
        assert_eq!(
            sent.recv().await.unwrap(),
            r#"<getProperties version="1.7" device="CCD Simulator"/>"#
        );
    }

    #[tokio::test]
    async fn test_set_without_connection_restores_state() {
        let registry = PropertiesRegistry::new(
            "CCD Simulator",
            CommandSink::closed(),
            Duration::from_millis(10),
        );
        let (handle, _) = registry
            .define(numbers("CCD_GAIN", IndiPermission::ReadWrite, vec![gain(1.0)]))
            .await;
        let err = registry
            .set(&handle, vec![LeafValue::number("GAIN", 5.0)])
            .await
            .unwrap_err();
        assert!(matches!(err, IndiError::NotConnected));
        assert_eq!(handle.state().await, IndiState::Idle);
    }
}
