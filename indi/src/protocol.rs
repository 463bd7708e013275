//! INDI XML Protocol definitions
//!
//! Enumerations that appear as attribute or text values on the wire, plus the
//! text parsers the codec shares.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// INDI protocol version sent with `getProperties`
pub const INDI_PROTOCOL_VERSION: &str = "1.7";

/// Timestamp layout used on the wire (UTC, no zone designator)
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// INDI property state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IndiState {
    #[default]
    Idle,
    Ok,
    Busy,
    Alert,
}

impl IndiState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndiState::Idle => "Idle",
            IndiState::Ok => "Ok",
            IndiState::Busy => "Busy",
            IndiState::Alert => "Alert",
        }
    }
}

impl fmt::Display for IndiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndiState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "idle" => Ok(IndiState::Idle),
            "ok" => Ok(IndiState::Ok),
            "busy" => Ok(IndiState::Busy),
            "alert" => Ok(IndiState::Alert),
            _ => Err(()),
        }
    }
}

/// INDI property permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IndiPermission {
    #[default]
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl IndiPermission {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndiPermission::ReadOnly => "ro",
            IndiPermission::WriteOnly => "wo",
            IndiPermission::ReadWrite => "rw",
        }
    }

    pub fn is_writable(&self) -> bool {
        !matches!(self, IndiPermission::ReadOnly)
    }
}

impl FromStr for IndiPermission {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ro" => Ok(IndiPermission::ReadOnly),
            "wo" => Ok(IndiPermission::WriteOnly),
            "rw" => Ok(IndiPermission::ReadWrite),
            _ => Err(()),
        }
    }
}

/// Switch vector behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SwitchRule {
    OneOfMany,
    AtMostOne,
    AnyOfMany,
}

impl SwitchRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwitchRule::OneOfMany => "OneOfMany",
            SwitchRule::AtMostOne => "AtMostOne",
            SwitchRule::AnyOfMany => "AnyOfMany",
        }
    }
}

impl FromStr for SwitchRule {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "OneOfMany" => Ok(SwitchRule::OneOfMany),
            "AtMostOne" => Ok(SwitchRule::AtMostOne),
            "AnyOfMany" => Ok(SwitchRule::AnyOfMany),
            _ => Err(()),
        }
    }
}

/// BLOB delivery policy requested with `enableBLOB`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlobMode {
    /// BLOBs interleaved with all other traffic
    Also,
    /// No BLOBs (server default)
    Never,
    /// Only BLOBs on this connection
    Only,
}

impl BlobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlobMode::Also => "Also",
            BlobMode::Never => "Never",
            BlobMode::Only => "Only",
        }
    }
}

impl FromStr for BlobMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Also" => Ok(BlobMode::Also),
            "Never" => Ok(BlobMode::Never),
            "Only" => Ok(BlobMode::Only),
            _ => Err(()),
        }
    }
}

/// Kind of leaf held by a vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeafKind {
    Number,
    Switch,
    Text,
    Light,
    Blob,
}

impl LeafKind {
    /// Name fragment used in element names (`defNumberVector`, `oneBLOB`, ...)
    pub fn tag(&self) -> &'static str {
        match self {
            LeafKind::Number => "Number",
            LeafKind::Switch => "Switch",
            LeafKind::Text => "Text",
            LeafKind::Light => "Light",
            LeafKind::Blob => "BLOB",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "Number" => Some(LeafKind::Number),
            "Switch" => Some(LeafKind::Switch),
            "Text" => Some(LeafKind::Text),
            "Light" => Some(LeafKind::Light),
            "BLOB" => Some(LeafKind::Blob),
            _ => None,
        }
    }
}

impl fmt::Display for LeafKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Parse the text of a number element.
///
/// Accepts plain decimals and exponents, sexagesimal `D:M[:S]` (also space
/// separated) and, when `format` is `%x`-style, hexadecimal. Empty text is 0.
pub fn parse_number(text: &str, format: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty() {
        return Some(0.0);
    }

    if format.trim().to_ascii_lowercase().ends_with('x') {
        let digits = text.trim_start_matches("0x").trim_start_matches("0X");
        return i64::from_str_radix(digits, 16).ok().map(|v| v as f64);
    }

    if let Ok(v) = text.parse::<f64>() {
        return Some(v);
    }

    parse_sexagesimal(text)
}

fn parse_sexagesimal(text: &str) -> Option<f64> {
    let mut fields = text
        .split(|c: char| c == ':' || c.is_whitespace())
        .filter(|f| !f.is_empty());

    let first = fields.next()?;
    let negative = first.starts_with('-');
    let mut total = first.parse::<f64>().ok()?.abs();

    let mut divisor = 60.0;
    for field in fields {
        let part = field.parse::<f64>().ok()?;
        if part < 0.0 {
            return None;
        }
        total += part / divisor;
        divisor *= 60.0;
    }

    Some(if negative { -total } else { total })
}

/// Parse a protocol timestamp; a trailing `Z` is tolerated.
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim().trim_end_matches('Z');
    if text.is_empty() {
        return None;
    }
    text.parse::<NaiveDateTime>().ok()
}

pub fn format_timestamp(timestamp: &NaiveDateTime) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

/// Standard INDI properties
pub mod standard_properties {
    /// Connection control switch
    pub const CONNECTION: &str = "CONNECTION";
    pub const CONNECT: &str = "CONNECT";
    pub const DISCONNECT: &str = "DISCONNECT";

    // Camera properties
    pub const CCD_INFO: &str = "CCD_INFO";
    pub const CCD_EXPOSURE: &str = "CCD_EXPOSURE";
    pub const CCD_ABORT_EXPOSURE: &str = "CCD_ABORT_EXPOSURE";
    pub const CCD_FRAME: &str = "CCD_FRAME";
    pub const CCD1: &str = "CCD1"; // BLOB property for image data

    // Mount properties
    pub const EQUATORIAL_EOD_COORD: &str = "EQUATORIAL_EOD_COORD";
    pub const ON_COORD_SET: &str = "ON_COORD_SET";
    pub const TELESCOPE_MOTION_NS: &str = "TELESCOPE_MOTION_NS";

    // Focuser properties
    pub const ABS_FOCUS_POSITION: &str = "ABS_FOCUS_POSITION";
    pub const REL_FOCUS_POSITION: &str = "REL_FOCUS_POSITION";
    pub const FOCUS_MOTION: &str = "FOCUS_MOTION";

    // Filter wheel properties
    pub const FILTER_SLOT: &str = "FILTER_SLOT";
    pub const FILTER_NAME: &str = "FILTER_NAME";

    // Dome properties
    pub const DOME_SHUTTER: &str = "DOME_SHUTTER";
    pub const DOME_MOTION: &str = "DOME_MOTION";
    pub const ABS_DOME_POSITION: &str = "ABS_DOME_POSITION";

    // Rotator properties
    pub const ABS_ROTATOR_ANGLE: &str = "ABS_ROTATOR_ANGLE";

    // Weather properties
    pub const WEATHER_STATUS: &str = "WEATHER_STATUS";
    pub const WEATHER_PARAMETERS: &str = "WEATHER_PARAMETERS";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_parse_and_display() {
        assert_eq!("Busy".parse::<IndiState>(), Ok(IndiState::Busy));
        assert_eq!("alert".parse::<IndiState>(), Ok(IndiState::Alert));
        assert!("Sleeping".parse::<IndiState>().is_err());
        assert_eq!(IndiState::Ok.to_string(), "Ok");
    }

    #[test]
    fn test_permission_parse() {
        assert_eq!("ro".parse::<IndiPermission>(), Ok(IndiPermission::ReadOnly));
        assert_eq!("RW".parse::<IndiPermission>(), Ok(IndiPermission::ReadWrite));
        assert!(!IndiPermission::ReadOnly.is_writable());
        assert!(IndiPermission::WriteOnly.is_writable());
    }

    #[test]
    fn test_leaf_kind_tags() {
        for kind in [
            LeafKind::Number,
            LeafKind::Switch,
            LeafKind::Text,
            LeafKind::Light,
            LeafKind::Blob,
        ] {
            assert_eq!(LeafKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(LeafKind::from_tag("Blob"), None);
    }

    #[test]
    fn test_parse_plain_numbers() {
        assert_eq!(parse_number("42", "%g"), Some(42.0));
        assert_eq!(parse_number("  -0.5 ", "%f"), Some(-0.5));
        assert_eq!(parse_number("1.5e-3", "%g"), Some(0.0015));
        assert_eq!(parse_number("", "%g"), Some(0.0));
        assert_eq!(parse_number("abc", "%g"), None);
    }

    #[test]
    fn test_parse_sexagesimal() {
        assert_eq!(parse_number("12:30", "%010.6m"), Some(12.5));
        let v = parse_number("-10:30:36", "%010.6m").unwrap();
        assert!((v + 10.51).abs() < 1e-9);
        let v = parse_number("5 15 00", "%9m").unwrap();
        assert!((v - 5.25).abs() < 1e-9);
        assert_eq!(parse_number("12:xx", "%m"), None);
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_number("1f", "%x"), Some(31.0));
        assert_eq!(parse_number("0x10", "%X"), Some(16.0));
        assert_eq!(parse_number("zz", "%x"), None);
    }

    #[test]
    fn test_timestamp_round_trip() {
        let ts = parse_timestamp("2024-03-01T21:04:05").unwrap();
        assert_eq!(format_timestamp(&ts), "2024-03-01T21:04:05");
        assert!(parse_timestamp("2024-03-01T21:04:05.250Z").is_some());
        assert!(parse_timestamp("yesterday").is_none());
        assert!(parse_timestamp("").is_none());
    }
}
