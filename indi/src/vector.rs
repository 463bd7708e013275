//! Property vectors and the shared handles application code holds on to.
//!
//! A registered vector lives behind a [`VectorHandle`]. Incoming updates are
//! merged into the same allocation, so a handle (or a [`LeafHandle`] derived
//! from it) taken before a `set*Vector` observes the new values afterwards.

use crate::error::{IndiError, IndiResult};
use crate::protocol::{parse_number, IndiPermission, IndiState, LeafKind, SwitchRule};
use crate::value::{BlobLeaf, Leaf, LeafValue, LightLeaf, NumberLeaf, SwitchLeaf, TextLeaf};
use chrono::NaiveDateTime;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Fallback poll period used by the wait helpers
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Vector-level attributes
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct VectorMeta {
    pub name: String,
    pub label: Option<String>,
    pub group: Option<String>,
    pub state: IndiState,
    pub perm: IndiPermission,
    /// Only meaningful for switch vectors
    pub rule: Option<SwitchRule>,
    /// Worst-case seconds the device expects an operation to take
    pub timeout: Option<f64>,
    pub timestamp: Option<NaiveDateTime>,
    pub message: Option<String>,
}

impl VectorMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Homogeneous vector of one leaf kind. Item names are unique.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypedVector<L> {
    pub meta: VectorMeta,
    items: Vec<L>,
}

impl<L: Leaf> TypedVector<L> {
    pub fn new(meta: VectorMeta) -> Self {
        Self {
            meta,
            items: Vec::new(),
        }
    }

    pub fn with_items(meta: VectorMeta, items: Vec<L>) -> IndiResult<Self> {
        let mut vector = Self::new(meta);
        for item in items {
            vector.insert(item)?;
        }
        Ok(vector)
    }

    pub fn insert(&mut self, item: L) -> IndiResult<()> {
        if self.get(item.name()).is_some() {
            return Err(IndiError::DuplicateElement {
                property: self.meta.name.clone(),
                element: item.name().to_string(),
            });
        }
        self.items.push(item);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&L> {
        self.items.iter().find(|item| item.name() == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut L> {
        self.items.iter_mut().find(|item| item.name() == name)
    }

    pub fn items(&self) -> &[L] {
        &self.items
    }

    pub fn iter(&self) -> std::slice::Iter<'_, L> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Merge updated items by name; unknown names are appended.
    pub fn merge_items(&mut self, updates: Vec<L>) {
        for update in updates {
            match self.get_mut(update.name()) {
                Some(existing) => existing.merge(&update),
                None => self.items.push(update),
            }
        }
    }
}

impl TypedVector<SwitchLeaf> {
    /// First switch that is On
    pub fn first_on(&self) -> Option<&SwitchLeaf> {
        self.items.iter().find(|s| s.value)
    }

    pub fn on_items(&self) -> impl Iterator<Item = &SwitchLeaf> {
        self.items.iter().filter(|s| s.value)
    }

    pub fn is_on(&self, name: &str) -> bool {
        self.get(name).map(|s| s.value).unwrap_or(false)
    }
}

/// A property vector of any kind
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Vector {
    Number(TypedVector<NumberLeaf>),
    Switch(TypedVector<SwitchLeaf>),
    Text(TypedVector<TextLeaf>),
    Light(TypedVector<LightLeaf>),
    Blob(TypedVector<BlobLeaf>),
}

macro_rules! each_vector {
    ($vector:expr, $v:ident => $body:expr) => {
        match $vector {
            Vector::Number($v) => $body,
            Vector::Switch($v) => $body,
            Vector::Text($v) => $body,
            Vector::Light($v) => $body,
            Vector::Blob($v) => $body,
        }
    };
}

impl Vector {
    /// Build a vector of `kind` from loosely typed items.
    pub fn from_items(meta: VectorMeta, kind: LeafKind, items: Vec<LeafValue>) -> IndiResult<Self> {
        fn build<L: Leaf>(meta: VectorMeta, items: Vec<LeafValue>) -> IndiResult<Vector> {
            let name = meta.name.clone();
            let typed = convert_items::<L>(&name, items)?;
            Ok(L::wrap(TypedVector::with_items(meta, typed)?))
        }

        match kind {
            LeafKind::Number => build::<NumberLeaf>(meta, items),
            LeafKind::Switch => build::<SwitchLeaf>(meta, items),
            LeafKind::Text => build::<TextLeaf>(meta, items),
            LeafKind::Light => build::<LightLeaf>(meta, items),
            LeafKind::Blob => build::<BlobLeaf>(meta, items),
        }
    }

    pub fn kind(&self) -> LeafKind {
        match self {
            Vector::Number(_) => LeafKind::Number,
            Vector::Switch(_) => LeafKind::Switch,
            Vector::Text(_) => LeafKind::Text,
            Vector::Light(_) => LeafKind::Light,
            Vector::Blob(_) => LeafKind::Blob,
        }
    }

    pub fn meta(&self) -> &VectorMeta {
        each_vector!(self, v => &v.meta)
    }

    pub fn meta_mut(&mut self) -> &mut VectorMeta {
        each_vector!(self, v => &mut v.meta)
    }

    pub fn name(&self) -> &str {
        &self.meta().name
    }

    pub fn state(&self) -> IndiState {
        self.meta().state
    }

    pub fn len(&self) -> usize {
        each_vector!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn item_names(&self) -> Vec<String> {
        each_vector!(self, v => v.iter().map(|i| i.name().to_string()).collect())
    }

    /// Copy of one item as a [`LeafValue`]
    pub fn item(&self, name: &str) -> Option<LeafValue> {
        each_vector!(self, v => v.get(name).cloned().map(Leaf::into_value))
    }

    pub fn values(&self) -> Vec<LeafValue> {
        each_vector!(self, v => v.iter().cloned().map(Leaf::into_value).collect())
    }

    pub fn as_typed<L: Leaf>(&self) -> Option<&TypedVector<L>> {
        L::items(self)
    }

    pub fn as_typed_mut<L: Leaf>(&mut self) -> Option<&mut TypedVector<L>> {
        L::items_mut(self)
    }

    /// Merge a `set*Vector` into this vector.
    ///
    /// On a kind mismatch nothing is changed.
    pub fn apply_update(&mut self, update: VectorUpdate) -> IndiResult<()> {
        if update.kind != self.kind() {
            return Err(IndiError::KindMismatch {
                property: update.name,
                expected: self.kind(),
                actual: update.kind,
            });
        }

        let name = self.name().to_string();
        let mut items = update.items;
        if let Vector::Number(numbers) = &*self {
            apply_defined_formats(numbers, &update.number_text, &mut items);
        }
        each_vector!(self, v => merge_values(v, &name, items)?);

        let meta = self.meta_mut();
        if let Some(state) = update.state {
            meta.state = state;
        }
        if update.timeout.is_some() {
            meta.timeout = update.timeout;
        }
        if update.timestamp.is_some() {
            meta.timestamp = update.timestamp;
        }
        if update.message.is_some() {
            meta.message = update.message;
        }
        Ok(())
    }
}

fn convert_items<L: Leaf>(vector: &str, items: Vec<LeafValue>) -> IndiResult<Vec<L>> {
    let mut typed = Vec::with_capacity(items.len());
    for item in items {
        let actual = item.kind();
        match L::from_value(item) {
            Some(leaf) => typed.push(leaf),
            None => {
                return Err(IndiError::KindMismatch {
                    property: vector.to_string(),
                    expected: L::KIND,
                    actual,
                })
            }
        }
    }
    Ok(typed)
}

/// Re-read number text with the format each element was defined with.
///
/// Items whose text still does not parse are dropped.
fn apply_defined_formats(
    defined: &TypedVector<NumberLeaf>,
    number_text: &[(String, String)],
    items: &mut Vec<LeafValue>,
) {
    if number_text.is_empty() {
        return;
    }
    items.retain_mut(|item| {
        let LeafValue::Number(leaf) = item else {
            return true;
        };
        let Some((_, text)) = number_text.iter().find(|(name, _)| *name == leaf.name) else {
            return true;
        };
        let format = defined
            .get(&leaf.name)
            .map(|d| d.format.as_str())
            .unwrap_or("%g");
        match parse_number(text, format) {
            Some(value) => {
                leaf.value = value;
                true
            }
            None => {
                tracing::warn!(
                    "Dropping {}.{}: '{}' is not a number for format {}",
                    defined.meta.name,
                    leaf.name,
                    text,
                    format
                );
                false
            }
        }
    });
}

fn merge_values<L: Leaf>(
    target: &mut TypedVector<L>,
    vector: &str,
    items: Vec<LeafValue>,
) -> IndiResult<()> {
    let typed = convert_items::<L>(vector, items)?;
    target.merge_items(typed);
    Ok(())
}

/// Partial update carried by a `set*Vector`
#[derive(Debug, Clone, PartialEq)]
pub struct VectorUpdate {
    /// Empty when the server addressed every device
    pub device: String,
    pub name: String,
    pub kind: LeafKind,
    pub state: Option<IndiState>,
    pub timeout: Option<f64>,
    pub timestamp: Option<NaiveDateTime>,
    pub message: Option<String>,
    pub items: Vec<LeafValue>,
    /// Wire text of number items, re-parsed with the defined format on merge
    pub number_text: Vec<(String, String)>,
}

impl VectorUpdate {
    pub fn new(device: impl Into<String>, name: impl Into<String>, kind: LeafKind) -> Self {
        Self {
            device: device.into(),
            name: name.into(),
            kind,
            state: None,
            timeout: None,
            timestamp: None,
            message: None,
            items: Vec::new(),
            number_text: Vec::new(),
        }
    }

    pub fn with_state(mut self, state: IndiState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_item(mut self, item: LeafValue) -> Self {
        self.items.push(item);
        self
    }
}

/// Result of waiting on a vector
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    /// The vector left Busy (or changed, for `wait_for_update`) and is not in Alert
    Completed(IndiState),
    /// The vector went to Alert; carries the vector message if any
    Alert(Option<String>),
    TimedOut { last_state: IndiState },
    Cancelled,
}

struct VectorCell {
    device: String,
    name: String,
    vector: RwLock<Vector>,
    changed: Notify,
    generation: AtomicU64,
    poll_interval: Duration,
}

/// Shared identity of a registered vector
#[derive(Clone)]
pub struct VectorHandle {
    inner: Arc<VectorCell>,
}

impl std::fmt::Debug for VectorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorHandle")
            .field("device", &self.inner.device)
            .field("name", &self.inner.name)
            .finish()
    }
}

impl VectorHandle {
    pub fn new(device: impl Into<String>, vector: Vector) -> Self {
        Self::with_poll_interval(device, vector, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(
        device: impl Into<String>,
        vector: Vector,
        poll_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(VectorCell {
                device: device.into(),
                name: vector.name().to_string(),
                vector: RwLock::new(vector),
                changed: Notify::new(),
                generation: AtomicU64::new(0),
                poll_interval,
            }),
        }
    }

    /// Same underlying vector?
    pub fn ptr_eq(a: &VectorHandle, b: &VectorHandle) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub fn device(&self) -> &str {
        &self.inner.device
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of changes applied since registration
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, Vector> {
        self.inner.vector.read().await
    }

    pub(crate) async fn write(&self) -> RwLockWriteGuard<'_, Vector> {
        self.inner.vector.write().await
    }

    /// Wake waiters after a mutation
    pub(crate) fn touch(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.changed.notify_waiters();
    }

    /// Apply a server update and wake waiters
    pub(crate) async fn apply(&self, update: VectorUpdate) -> IndiResult<()> {
        self.write().await.apply_update(update)?;
        self.touch();
        Ok(())
    }

    /// Replace the contents wholesale, keeping identity
    pub(crate) async fn replace(&self, vector: Vector) {
        *self.write().await = vector;
        self.touch();
    }

    pub(crate) async fn set_state(&self, state: IndiState) {
        self.write().await.meta_mut().state = state;
        self.touch();
    }

    pub async fn state(&self) -> IndiState {
        self.read().await.state()
    }

    pub async fn kind(&self) -> LeafKind {
        self.read().await.kind()
    }

    pub async fn snapshot(&self) -> Vector {
        self.read().await.clone()
    }

    /// Kind-checked view of this vector
    pub async fn typed<L: Leaf>(&self) -> Option<TypedHandle<L>> {
        if self.kind().await == L::KIND {
            Some(TypedHandle {
                handle: self.clone(),
                _kind: PhantomData,
            })
        } else {
            None
        }
    }

    /// Wait until the vector is no longer Busy.
    ///
    /// Wakes on every change to this vector and additionally polls, so a missed
    /// notification only costs one poll interval.
    pub async fn wait_while_busy(&self, timeout: Duration, cancel: &CancellationToken) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let vector = self.read().await;
                match vector.state() {
                    IndiState::Busy => {}
                    IndiState::Alert => return WaitOutcome::Alert(vector.meta().message.clone()),
                    state => return WaitOutcome::Completed(state),
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return WaitOutcome::Cancelled,
                _ = tokio::time::sleep_until(deadline) => {
                    return WaitOutcome::TimedOut { last_state: self.state().await };
                }
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.inner.poll_interval) => {}
            }
        }
    }

    /// Wait for the next change to this vector, whatever its state.
    pub async fn wait_for_update(&self, timeout: Duration, cancel: &CancellationToken) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let start = self.generation();
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.generation() != start {
                let vector = self.read().await;
                return match vector.state() {
                    IndiState::Alert => WaitOutcome::Alert(vector.meta().message.clone()),
                    state => WaitOutcome::Completed(state),
                };
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return WaitOutcome::Cancelled,
                _ = tokio::time::sleep_until(deadline) => {
                    return WaitOutcome::TimedOut { last_state: self.state().await };
                }
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.inner.poll_interval) => {}
            }
        }
    }
}

/// A [`VectorHandle`] known to hold leaves of kind `L`
pub struct TypedHandle<L> {
    handle: VectorHandle,
    _kind: PhantomData<fn() -> L>,
}

impl<L> Clone for TypedHandle<L> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            _kind: PhantomData,
        }
    }
}

impl<L: Leaf> TypedHandle<L> {
    pub fn handle(&self) -> &VectorHandle {
        &self.handle
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// Borrow the typed contents.
    ///
    /// Fails if the server has since redefined the vector with another kind.
    pub async fn read(&self) -> IndiResult<RwLockReadGuard<'_, TypedVector<L>>> {
        let guard = self.handle.read().await;
        let actual = guard.kind();
        RwLockReadGuard::try_map(guard, L::items).map_err(|_| IndiError::KindMismatch {
            property: self.handle.name().to_string(),
            expected: L::KIND,
            actual,
        })
    }

    pub async fn snapshot(&self) -> IndiResult<TypedVector<L>> {
        Ok(self.read().await?.clone())
    }

    pub async fn get(&self, element: &str) -> Option<L> {
        self.read().await.ok()?.get(element).cloned()
    }

    pub fn leaf(&self, element: impl Into<String>) -> LeafHandle<L> {
        LeafHandle {
            vector: self.handle.clone(),
            element: element.into(),
            _kind: PhantomData,
        }
    }
}

/// A leaf addressed by name inside a shared vector.
///
/// Every read resolves the leaf again, so values merged in by later updates are
/// always visible.
pub struct LeafHandle<L> {
    vector: VectorHandle,
    element: String,
    _kind: PhantomData<fn() -> L>,
}

impl<L> Clone for LeafHandle<L> {
    fn clone(&self) -> Self {
        Self {
            vector: self.vector.clone(),
            element: self.element.clone(),
            _kind: PhantomData,
        }
    }
}

impl<L: Leaf> LeafHandle<L> {
    pub fn element(&self) -> &str {
        &self.element
    }

    pub fn vector(&self) -> &VectorHandle {
        &self.vector
    }

    pub async fn get(&self) -> Option<L> {
        let vector = self.vector.read().await;
        L::items(&vector)?.get(&self.element).cloned()
    }
}
