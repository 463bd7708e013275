//! Leaf values: the typed atoms a vector is made of.
//!
//! Each leaf kind is its own struct. [`LeafValue`] is the closed union used
//! where kinds mix (decoded items, caller-supplied set items), and the [`Leaf`]
//! trait gives typed access into a [`Vector`] without runtime downcasts.

use crate::protocol::{IndiState, LeafKind};
use crate::vector::{TypedVector, Vector};
use serde::Serialize;

/// Number leaf with the limits announced by the device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NumberLeaf {
    pub name: String,
    pub label: Option<String>,
    pub value: f64,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    /// printf-style format (`%g`, `%010.6m`, ...)
    pub format: String,
}

impl NumberLeaf {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            label: None,
            value,
            min: 0.0,
            max: 0.0,
            step: 0.0,
            format: "%g".to_string(),
        }
    }

    /// Whether the device announced a usable range (`min < max`)
    pub fn has_limits(&self) -> bool {
        self.min < self.max
    }

    pub fn in_range(&self, value: f64) -> bool {
        !self.has_limits() || (value >= self.min && value <= self.max)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwitchLeaf {
    pub name: String,
    pub label: Option<String>,
    pub value: bool,
}

impl SwitchLeaf {
    pub fn new(name: impl Into<String>, value: bool) -> Self {
        Self {
            name: name.into(),
            label: None,
            value,
        }
    }

    pub fn wire_value(&self) -> &'static str {
        if self.value {
            "On"
        } else {
            "Off"
        }
    }
}

/// Parse `On`/`Off` switch text
pub fn parse_switch(text: &str) -> Option<bool> {
    match text.trim() {
        s if s.eq_ignore_ascii_case("on") => Some(true),
        s if s.eq_ignore_ascii_case("off") => Some(false),
        _ => None,
    }
}

/// Text leaf; `None` means the element carried no text at all
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextLeaf {
    pub name: String,
    pub label: Option<String>,
    pub value: Option<String>,
}

impl TextLeaf {
    pub fn new(name: impl Into<String>, value: Option<String>) -> Self {
        Self {
            name: name.into(),
            label: None,
            value,
        }
    }

    pub fn as_str(&self) -> &str {
        self.value.as_deref().unwrap_or("")
    }
}

/// Read-only status indicator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LightLeaf {
    pub name: String,
    pub label: Option<String>,
    pub value: IndiState,
}

impl LightLeaf {
    pub fn new(name: impl Into<String>, value: IndiState) -> Self {
        Self {
            name: name.into(),
            label: None,
            value,
        }
    }
}

/// Binary payload, already base64-decoded
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlobLeaf {
    pub name: String,
    pub label: Option<String>,
    #[serde(skip)]
    pub value: Vec<u8>,
    /// File suffix announced by the device (`.fits`, `.fits.z`, ...)
    pub format: String,
    pub size: usize,
}

impl BlobLeaf {
    pub fn new(name: impl Into<String>, value: Vec<u8>, format: impl Into<String>) -> Self {
        let size = value.len();
        Self {
            name: name.into(),
            label: None,
            value,
            format: format.into(),
            size,
        }
    }
}

/// A leaf of any kind
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum LeafValue {
    Number(NumberLeaf),
    Switch(SwitchLeaf),
    Text(TextLeaf),
    Light(LightLeaf),
    Blob(BlobLeaf),
}

impl LeafValue {
    pub fn number(name: impl Into<String>, value: f64) -> Self {
        LeafValue::Number(NumberLeaf::new(name, value))
    }

    pub fn switch(name: impl Into<String>, on: bool) -> Self {
        LeafValue::Switch(SwitchLeaf::new(name, on))
    }

    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        LeafValue::Text(TextLeaf::new(name, Some(value.into())))
    }

    pub fn light(name: impl Into<String>, state: IndiState) -> Self {
        LeafValue::Light(LightLeaf::new(name, state))
    }

    pub fn blob(name: impl Into<String>, data: Vec<u8>, format: impl Into<String>) -> Self {
        LeafValue::Blob(BlobLeaf::new(name, data, format))
    }

    pub fn name(&self) -> &str {
        match self {
            LeafValue::Number(l) => &l.name,
            LeafValue::Switch(l) => &l.name,
            LeafValue::Text(l) => &l.name,
            LeafValue::Light(l) => &l.name,
            LeafValue::Blob(l) => &l.name,
        }
    }

    pub fn label(&self) -> Option<&str> {
        match self {
            LeafValue::Number(l) => l.label.as_deref(),
            LeafValue::Switch(l) => l.label.as_deref(),
            LeafValue::Text(l) => l.label.as_deref(),
            LeafValue::Light(l) => l.label.as_deref(),
            LeafValue::Blob(l) => l.label.as_deref(),
        }
    }

    pub fn kind(&self) -> LeafKind {
        match self {
            LeafValue::Number(_) => LeafKind::Number,
            LeafValue::Switch(_) => LeafKind::Switch,
            LeafValue::Text(_) => LeafKind::Text,
            LeafValue::Light(_) => LeafKind::Light,
            LeafValue::Blob(_) => LeafKind::Blob,
        }
    }

    /// Human readable value, used by property dumps
    pub fn display_value(&self) -> String {
        match self {
            LeafValue::Number(l) => l.value.to_string(),
            LeafValue::Switch(l) => l.wire_value().to_string(),
            LeafValue::Text(l) => l.as_str().to_string(),
            LeafValue::Light(l) => l.value.to_string(),
            LeafValue::Blob(l) => format!("<{} bytes {}>", l.value.len(), l.format),
        }
    }
}

/// Behaviour shared by the five leaf structs.
///
/// `items`/`items_mut`/`wrap` project between a concrete `TypedVector<Self>` and
/// the [`Vector`] enum, so typed access is one match away.
pub trait Leaf: Clone + Send + Sync + 'static {
    const KIND: LeafKind;

    fn name(&self) -> &str;

    fn label(&self) -> Option<&str>;

    /// Copy the server-updatable payload of `update` into `self`.
    ///
    /// Names, labels and number limits are left alone: a `set*Vector` never
    /// carries them.
    fn merge(&mut self, update: &Self);

    fn into_value(self) -> LeafValue;

    fn from_value(value: LeafValue) -> Option<Self>;

    fn items(vector: &Vector) -> Option<&TypedVector<Self>>;

    fn items_mut(vector: &mut Vector) -> Option<&mut TypedVector<Self>>;

    fn wrap(vector: TypedVector<Self>) -> Vector;
}

macro_rules! impl_leaf {
    ($leaf:ty, $variant:ident, |$dst:ident, $src:ident| $merge:block) => {
        impl Leaf for $leaf {
            const KIND: LeafKind = LeafKind::$variant;

            fn name(&self) -> &str {
                &self.name
            }

            fn label(&self) -> Option<&str> {
                self.label.as_deref()
            }

            fn merge(&mut self, update: &Self) {
                let $dst = self;
                let $src = update;
                $merge
            }

            fn into_value(self) -> LeafValue {
                LeafValue::$variant(self)
            }

            fn from_value(value: LeafValue) -> Option<Self> {
                match value {
                    LeafValue::$variant(leaf) => Some(leaf),
                    _ => None,
                }
            }

            fn items(vector: &Vector) -> Option<&TypedVector<Self>> {
                match vector {
                    Vector::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn items_mut(vector: &mut Vector) -> Option<&mut TypedVector<Self>> {
                match vector {
                    Vector::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn wrap(vector: TypedVector<Self>) -> Vector {
                Vector::$variant(vector)
            }
        }
    };
}

impl_leaf!(NumberLeaf, Number, |dst, src| {
    dst.value = src.value;
});

impl_leaf!(SwitchLeaf, Switch, |dst, src| {
    dst.value = src.value;
});

impl_leaf!(TextLeaf, Text, |dst, src| {
    dst.value = src.value.clone();
});

impl_leaf!(LightLeaf, Light, |dst, src| {
    dst.value = src.value;
});

impl_leaf!(BlobLeaf, Blob, |dst, src| {
    dst.value = src.value.clone();
    dst.size = src.size;
    if !src.format.is_empty() {
        dst.format = src.format.clone();
    }
});
