//! Incremental reader for the INDI fragment stream.
//!
//! The stream is a run of adjacent top-level elements with no enclosing
//! document. `FrameReader` pulls events from quick-xml and assembles one
//! fragment at a time. BLOB payloads bypass the XML tokenizer: their base64
//! text is pulled straight off the buffered socket and decoded as it arrives.
//!
//! A malformed fragment is read through to its closing tag before the error is
//! returned, so the next call starts cleanly at the following fragment. After a
//! tokenizer error the input is skipped up to the next `<` and a fresh
//! tokenizer takes over from there.

use crate::blob::Base64Stream;
use crate::error::{DecodeError, IndiError, ReadError};
use crate::message::{ClientCommand, Frame, ServerMessage};
use crate::protocol::{
    parse_number, parse_timestamp, BlobMode, IndiPermission, IndiState, LeafKind, SwitchRule,
};
use crate::value::{parse_switch, BlobLeaf, LeafValue, LightLeaf, NumberLeaf, SwitchLeaf, TextLeaf};
use crate::vector::{Vector, VectorMeta, VectorUpdate};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

const READ_BUFFER_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Def,
    Set,
    New,
}

impl Verb {
    fn item_tag(&self, kind: LeafKind) -> String {
        match self {
            Verb::Def => format!("def{}", kind.tag()),
            Verb::Set | Verb::New => format!("one{}", kind.tag()),
        }
    }
}

fn classify_vector(tag: &str) -> Option<(Verb, LeafKind)> {
    let (verb, rest) = if let Some(rest) = tag.strip_prefix("def") {
        (Verb::Def, rest)
    } else if let Some(rest) = tag.strip_prefix("set") {
        (Verb::Set, rest)
    } else if let Some(rest) = tag.strip_prefix("new") {
        (Verb::New, rest)
    } else {
        return None;
    };
    let kind = LeafKind::from_tag(rest.strip_suffix("Vector")?)?;
    Some((verb, kind))
}

/// Owned attribute list of one element
#[derive(Debug, Default)]
struct Attrs(Vec<(String, String)>);

impl Attrs {
    fn from_start(e: &BytesStart<'_>) -> Self {
        Attrs(
            e.attributes()
                .filter_map(|a| a.ok())
                .map(|a| {
                    let key = String::from_utf8_lossy(a.key.as_ref()).into_owned();
                    let value = a
                        .unescape_value()
                        .map(|v| v.into_owned())
                        .unwrap_or_else(|_| String::from_utf8_lossy(&a.value).into_owned());
                    (key, value)
                })
                .collect(),
        )
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn owned(&self, name: &str) -> Option<String> {
        self.get(name).map(str::to_string)
    }

    fn require(&self, element: &str, name: &str) -> Result<String, DecodeError> {
        self.owned(name).ok_or_else(|| DecodeError::MissingAttribute {
            element: element.to_string(),
            attribute: name.to_string(),
        })
    }
}

struct ItemFrame {
    tag: String,
    attrs: Attrs,
    text: String,
    blob: Option<Vec<u8>>,
}

struct VectorFrame {
    verb: Verb,
    kind: LeafKind,
    tag: String,
    attrs: Attrs,
    items: Vec<LeafValue>,
    /// Wire text of number items awaiting the defined format
    number_text: Vec<(String, String)>,
    current: Option<ItemFrame>,
    /// First problem found; reported once the closing tag has been read
    error: Option<DecodeError>,
    /// Nesting inside an unexpected child
    depth: usize,
}

impl VectorFrame {
    fn poison(&mut self, error: DecodeError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    fn push_item(&mut self, item: ItemFrame) {
        // Set items carry no format; the definition's is applied on merge
        if self.verb == Verb::Set && self.kind == LeafKind::Number && item.attrs.get("format").is_none() {
            if let Some(name) = item.attrs.get("name") {
                self.number_text.push((name.to_string(), item.text.clone()));
            }
        }
        match finish_item(self.verb, self.kind, item) {
            Ok(leaf) => self.items.push(leaf),
            Err(e) => self.poison(e),
        }
    }
}

struct SimpleFrame {
    tag: String,
    attrs: Attrs,
    text: String,
    depth: usize,
}

enum Pending {
    Vector(VectorFrame),
    Simple(SimpleFrame),
    Skip { depth: usize, error: DecodeError },
}

enum Step {
    Open { tag: String, attrs: Attrs, empty: bool },
    Close,
    Text(String),
    Eof,
    Ignore,
    /// Tokenizer error; the stream must be resynchronised
    Broken(String),
}

fn xml_reader<R>(inner: BufReader<R>) -> Reader<BufReader<R>> {
    let mut reader = Reader::from_reader(inner);
    reader.trim_text(true);
    reader.check_end_names(false);
    reader
}

fn reader_lost() -> ReadError {
    ReadError::Io(io::Error::new(
        io::ErrorKind::Other,
        "INDI reader lost while resynchronising",
    ))
}

/// Reads frames off an async byte stream
pub struct FrameReader<R> {
    /// Only `None` while being rebuilt after a syntax error
    reader: Option<Reader<BufReader<R>>>,
    buf: Vec<u8>,
    pending: Option<Pending>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: Some(xml_reader(BufReader::with_capacity(READ_BUFFER_CAPACITY, inner))),
            buf: Vec::new(),
            pending: None,
        }
    }

    /// Next server message. Client frames are reported as unknown elements.
    pub async fn next_message(&mut self) -> Result<ServerMessage, ReadError> {
        match self.next_frame().await? {
            Frame::Server(message) => Ok(message),
            Frame::Client(command) => Err(DecodeError::UnknownElement(command_tag(&command)).into()),
        }
    }

    /// Next client command. Server frames are reported as unknown elements.
    pub async fn next_command(&mut self) -> Result<ClientCommand, ReadError> {
        match self.next_frame().await? {
            Frame::Client(command) => Ok(command),
            Frame::Server(message) => Err(DecodeError::UnknownElement(message_tag(&message)).into()),
        }
    }

    /// Next complete fragment in either direction.
    pub async fn next_frame(&mut self) -> Result<Frame, ReadError> {
        loop {
            self.buf.clear();
            let reader = self.reader.as_mut().ok_or_else(reader_lost)?;
            let step = match reader.read_event_into_async(&mut self.buf).await {
                Ok(Event::Start(e)) => Step::Open {
                    tag: String::from_utf8_lossy(e.name().as_ref()).into_owned(),
                    attrs: Attrs::from_start(&e),
                    empty: false,
                },
                Ok(Event::Empty(e)) => Step::Open {
                    tag: String::from_utf8_lossy(e.name().as_ref()).into_owned(),
                    attrs: Attrs::from_start(&e),
                    empty: true,
                },
                Ok(Event::End(_)) => Step::Close,
                Ok(Event::Text(t)) => Step::Text(
                    t.unescape()
                        .map(|s| s.into_owned())
                        .unwrap_or_else(|_| String::from_utf8_lossy(&t).into_owned()),
                ),
                Ok(Event::CData(c)) => Step::Text(String::from_utf8_lossy(&c.into_inner()).into_owned()),
                Ok(Event::Eof) => Step::Eof,
                Ok(_) => Step::Ignore,
                Err(quick_xml::Error::Io(e)) => {
                    return Err(ReadError::Io(io::Error::new(e.kind(), e.to_string())));
                }
                Err(e) => Step::Broken(e.to_string()),
            };

            let done = match step {
                Step::Open { tag, attrs, empty } => self.open(tag, attrs, empty).await?,
                Step::Close => self.close(),
                Step::Text(text) => {
                    self.text(text);
                    None
                }
                Step::Eof => {
                    return Err(ReadError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "INDI stream closed",
                    )));
                }
                Step::Ignore => None,
                Step::Broken(reason) => {
                    self.pending = None;
                    self.resync().await?;
                    return Err(DecodeError::Xml(reason).into());
                }
            };

            if let Some(result) = done {
                return result.map_err(ReadError::from);
            }
        }
    }

    async fn open(
        &mut self,
        tag: String,
        attrs: Attrs,
        empty: bool,
    ) -> Result<Option<Result<Frame, DecodeError>>, ReadError> {
        match self.pending.as_mut() {
            None => {
                if let Some((verb, kind)) = classify_vector(&tag) {
                    let frame = VectorFrame {
                        verb,
                        kind,
                        tag,
                        attrs,
                        items: Vec::new(),
                        number_text: Vec::new(),
                        current: None,
                        error: None,
                        depth: 0,
                    };
                    if empty {
                        return Ok(Some(finish_vector(frame)));
                    }
                    self.pending = Some(Pending::Vector(frame));
                } else if matches!(
                    tag.as_str(),
                    "delProperty" | "message" | "getProperties" | "enableBLOB"
                ) {
                    let frame = SimpleFrame {
                        tag,
                        attrs,
                        text: String::new(),
                        depth: 0,
                    };
                    if empty {
                        return Ok(Some(finish_simple(frame)));
                    }
                    self.pending = Some(Pending::Simple(frame));
                } else if empty {
                    return Ok(Some(Err(DecodeError::UnknownElement(tag))));
                } else {
                    self.pending = Some(Pending::Skip {
                        depth: 1,
                        error: DecodeError::UnknownElement(tag),
                    });
                }
            }
            Some(Pending::Skip { depth, .. }) => {
                if !empty {
                    *depth += 1;
                }
            }
            Some(Pending::Simple(frame)) => {
                if !empty {
                    frame.depth += 1;
                }
            }
            Some(Pending::Vector(frame)) => {
                if frame.depth > 0 || frame.current.is_some() || tag != frame.verb.item_tag(frame.kind) {
                    if frame.depth == 0 {
                        frame.poison(DecodeError::UnknownElement(tag));
                    }
                    if !empty {
                        frame.depth += 1;
                    }
                    return Ok(None);
                }

                let mut item = ItemFrame {
                    tag,
                    attrs,
                    text: String::new(),
                    blob: None,
                };

                if frame.kind == LeafKind::Blob && frame.verb != Verb::Def && !empty {
                    let element = item.attrs.get("name").unwrap_or("").to_string();
                    let expected = item
                        .attrs
                        .get("len")
                        .or_else(|| item.attrs.get("size"))
                        .and_then(|s| s.trim().parse::<usize>().ok());
                    let payload = self.read_blob_payload(&element, expected).await?;
                    let Some(Pending::Vector(frame)) = self.pending.as_mut() else {
                        return Ok(None);
                    };
                    match payload {
                        Ok(bytes) => item.blob = Some(bytes),
                        Err(e) => frame.poison(e),
                    }
                    frame.current = Some(item);
                    return Ok(None);
                }

                if empty {
                    frame.push_item(item);
                } else {
                    frame.current = Some(item);
                }
            }
        }
        Ok(None)
    }

    fn text(&mut self, text: String) {
        match self.pending.as_mut() {
            Some(Pending::Vector(frame)) if frame.depth == 0 => {
                if let Some(item) = frame.current.as_mut() {
                    item.text.push_str(&text);
                }
            }
            Some(Pending::Simple(frame)) if frame.depth == 0 => frame.text.push_str(&text),
            _ => {}
        }
    }

    fn close(&mut self) -> Option<Result<Frame, DecodeError>> {
        match self.pending.as_mut() {
            None => {
                tracing::debug!("Ignoring stray closing tag outside any INDI element");
                None
            }
            Some(Pending::Skip { depth, .. }) => {
                *depth -= 1;
                if *depth > 0 {
                    return None;
                }
                match self.pending.take() {
                    Some(Pending::Skip { error, .. }) => Some(Err(error)),
                    _ => None,
                }
            }
            Some(Pending::Simple(frame)) => {
                if frame.depth > 0 {
                    frame.depth -= 1;
                    return None;
                }
                match self.pending.take() {
                    Some(Pending::Simple(frame)) => Some(finish_simple(frame)),
                    _ => None,
                }
            }
            Some(Pending::Vector(frame)) => {
                if frame.depth > 0 {
                    frame.depth -= 1;
                    return None;
                }
                if let Some(item) = frame.current.take() {
                    frame.push_item(item);
                    return None;
                }
                match self.pending.take() {
                    Some(Pending::Vector(frame)) => Some(finish_vector(frame)),
                    _ => None,
                }
            }
        }
    }

    /// Recover from a tokenizer error.
    ///
    /// quick-xml stops producing events after a syntax error, so the reader is
    /// rebuilt over the same buffered stream, positioned at the next `<` past
    /// the offending one.
    async fn resync(&mut self) -> Result<(), ReadError> {
        let mut inner = self.reader.take().ok_or_else(reader_lost)?.into_inner();
        let skipped = skip_to_next_tag(&mut inner).await;
        self.reader = Some(xml_reader(inner));
        let skipped = skipped?;
        tracing::debug!("Resynchronised INDI stream after skipping {} bytes", skipped);
        Ok(())
    }

    /// Pull base64 text up to the next `<` straight from the buffered stream.
    ///
    /// The outer error is fatal for the stream; the inner one only for this BLOB.
    async fn read_blob_payload(
        &mut self,
        element: &str,
        expected: Option<usize>,
    ) -> Result<Result<Vec<u8>, DecodeError>, ReadError> {
        let mut stream = Base64Stream::new(expected);
        let mut failure = None;

        loop {
            let inner = self.reader.as_mut().ok_or_else(reader_lost)?.get_mut();
            let available = inner.fill_buf().await?;
            if available.is_empty() {
                return Err(ReadError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "INDI stream closed inside BLOB payload",
                )));
            }

            let end = available.iter().position(|&b| b == b'<');
            let chunk = &available[..end.unwrap_or(available.len())];
            if failure.is_none() {
                if let Err(e) = stream.feed(chunk) {
                    failure = Some(e);
                }
            }
            let used = chunk.len();
            inner.consume(used);

            if end.is_some() {
                break;
            }
        }

        if let Some(e) = failure {
            return Ok(Err(e));
        }
        tracing::debug!(
            "BLOB payload for {} read: {} bytes decoded, {:?} announced",
            element,
            stream.decoded_len(),
            stream.expected()
        );
        Ok(stream.finish(element))
    }
}

/// Consume bytes up to, not including, the next `<`.
///
/// A `<` at the very start belongs to the broken element and is skipped.
async fn skip_to_next_tag<R: AsyncRead + Unpin>(inner: &mut BufReader<R>) -> io::Result<usize> {
    let mut skipped = 0;
    loop {
        let available = inner.fill_buf().await?;
        if available.is_empty() {
            return Ok(skipped);
        }
        let start = usize::from(skipped == 0 && available[0] == b'<');
        match available[start..].iter().position(|&b| b == b'<') {
            Some(at) => {
                inner.consume(start + at);
                return Ok(skipped + start + at);
            }
            None => {
                let used = available.len();
                inner.consume(used);
                skipped += used;
            }
        }
    }
}

fn finish_item(verb: Verb, kind: LeafKind, item: ItemFrame) -> Result<LeafValue, DecodeError> {
    let ItemFrame {
        tag,
        attrs,
        text,
        blob,
    } = item;
    let name = attrs.require(&tag, "name")?;
    let label = if verb == Verb::Def {
        attrs.owned("label")
    } else {
        None
    };

    let value = match kind {
        LeafKind::Number => {
            let deferred = verb == Verb::Set && attrs.get("format").is_none();
            let format = attrs.owned("format").unwrap_or_else(|| "%g".to_string());
            let number = |text: &str| {
                parse_number(text, &format).ok_or_else(|| DecodeError::InvalidNumber {
                    element: name.clone(),
                    text: text.to_string(),
                })
            };
            let value = match number(&text) {
                Ok(value) => value,
                // Hex text is resolved against the definition when merged
                Err(_) if deferred && parse_number(&text, "%x").is_some() => f64::NAN,
                Err(e) => return Err(e),
            };
            let min = attrs.get("min").map(&number).transpose()?.unwrap_or(0.0);
            let max = attrs.get("max").map(&number).transpose()?.unwrap_or(0.0);
            let step = attrs.get("step").map(&number).transpose()?.unwrap_or(0.0);
            LeafValue::Number(NumberLeaf {
                name,
                label,
                value,
                min,
                max,
                step,
                format,
            })
        }
        LeafKind::Switch => {
            let value = parse_switch(&text).ok_or_else(|| DecodeError::InvalidValue {
                kind,
                element: name.clone(),
                text: text.clone(),
            })?;
            LeafValue::Switch(SwitchLeaf { name, label, value })
        }
        LeafKind::Text => LeafValue::Text(TextLeaf {
            name,
            label,
            value: if text.is_empty() { None } else { Some(text) },
        }),
        LeafKind::Light => {
            let value = text.parse::<IndiState>().map_err(|_| DecodeError::InvalidValue {
                kind,
                element: name.clone(),
                text: text.clone(),
            })?;
            LeafValue::Light(LightLeaf { name, label, value })
        }
        LeafKind::Blob => {
            let format = attrs.owned("format").unwrap_or_default();
            let value = match blob {
                Some(bytes) => bytes,
                None if verb == Verb::Def => Vec::new(),
                None => {
                    let expected = attrs
                        .get("len")
                        .or_else(|| attrs.get("size"))
                        .and_then(|s| s.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if expected > 0 {
                        return Err(DecodeError::BlobSizeMismatch {
                            element: name,
                            expected,
                            actual: 0,
                        });
                    }
                    Vec::new()
                }
            };
            let size = value.len();
            LeafValue::Blob(BlobLeaf {
                name,
                label,
                value,
                format,
                size,
            })
        }
    };
    Ok(value)
}

fn vector_meta(frame: &VectorFrame, name: String) -> VectorMeta {
    let attrs = &frame.attrs;
    let state = match attrs.get("state") {
        Some(text) => text.parse::<IndiState>().unwrap_or_else(|_| {
            tracing::debug!("Unknown state '{}' on {}, using Idle", text, name);
            IndiState::Idle
        }),
        None => IndiState::Idle,
    };
    VectorMeta {
        label: attrs.owned("label"),
        group: attrs.owned("group"),
        state,
        perm: attrs
            .get("perm")
            .and_then(|p| p.parse::<IndiPermission>().ok())
            .unwrap_or_default(),
        rule: if frame.kind == LeafKind::Switch {
            attrs.get("rule").and_then(|r| r.parse::<SwitchRule>().ok())
        } else {
            None
        },
        timeout: attrs.get("timeout").and_then(|t| t.trim().parse::<f64>().ok()),
        timestamp: attrs.get("timestamp").and_then(parse_timestamp),
        message: attrs.owned("message"),
        name,
    }
}

fn finish_vector(frame: VectorFrame) -> Result<Frame, DecodeError> {
    if let Some(error) = frame.error {
        return Err(error);
    }

    let name = frame.attrs.require(&frame.tag, "name")?;
    match frame.verb {
        Verb::Def => {
            let device = frame.attrs.require(&frame.tag, "device")?;
            let meta = vector_meta(&frame, name.clone());
            let vector = Vector::from_items(meta, frame.kind, frame.items)
                .map_err(|e| vector_error(&name, e))?;
            Ok(Frame::Server(ServerMessage::DefVector { device, vector }))
        }
        Verb::Set => {
            let attrs = &frame.attrs;
            Ok(Frame::Server(ServerMessage::SetVector(VectorUpdate {
                device: attrs.owned("device").unwrap_or_default(),
                kind: frame.kind,
                state: attrs.get("state").and_then(|s| s.parse::<IndiState>().ok()),
                timeout: attrs.get("timeout").and_then(|t| t.trim().parse::<f64>().ok()),
                timestamp: attrs.get("timestamp").and_then(parse_timestamp),
                message: attrs.owned("message"),
                items: frame.items,
                number_text: frame.number_text,
                name,
            })))
        }
        Verb::New => {
            let device = frame.attrs.require(&frame.tag, "device")?;
            let timestamp = frame.attrs.get("timestamp").and_then(parse_timestamp);
            let vector = Vector::from_items(VectorMeta::new(name.clone()), frame.kind, frame.items)
                .map_err(|e| vector_error(&name, e))?;
            Ok(Frame::Client(ClientCommand::NewVector {
                device,
                timestamp,
                vector,
            }))
        }
    }
}

fn vector_error(vector: &str, error: IndiError) -> DecodeError {
    match error {
        IndiError::DuplicateElement { element, .. } => DecodeError::DuplicateElement {
            vector: vector.to_string(),
            element,
        },
        other => DecodeError::Xml(other.to_string()),
    }
}

fn finish_simple(frame: SimpleFrame) -> Result<Frame, DecodeError> {
    let attrs = &frame.attrs;
    let timestamp = attrs.get("timestamp").and_then(parse_timestamp);
    let frame = match frame.tag.as_str() {
        "delProperty" => Frame::Server(ServerMessage::DelProperty {
            device: attrs.owned("device"),
            name: attrs.owned("name"),
            timestamp,
            message: attrs.owned("message"),
        }),
        "message" => Frame::Server(ServerMessage::Message {
            device: attrs.owned("device"),
            timestamp,
            content: attrs.owned("message").unwrap_or_else(|| frame.text.clone()),
        }),
        "getProperties" => Frame::Client(ClientCommand::GetProperties {
            device: attrs.owned("device"),
            name: attrs.owned("name"),
        }),
        "enableBLOB" => {
            let mode = frame
                .text
                .parse::<BlobMode>()
                .map_err(|_| DecodeError::InvalidValue {
                    kind: LeafKind::Blob,
                    element: "enableBLOB".to_string(),
                    text: frame.text.clone(),
                })?;
            Frame::Client(ClientCommand::EnableBlob {
                device: attrs.owned("device"),
                name: attrs.owned("name"),
                mode,
            })
        }
        other => return Err(DecodeError::UnknownElement(other.to_string())),
    };
    Ok(frame)
}

fn command_tag(command: &ClientCommand) -> String {
    match command {
        ClientCommand::GetProperties { .. } => "getProperties".to_string(),
        ClientCommand::NewVector { vector, .. } => format!("new{}Vector", vector.kind().tag()),
        ClientCommand::EnableBlob { .. } => "enableBLOB".to_string(),
    }
}

fn message_tag(message: &ServerMessage) -> String {
    match message {
        ServerMessage::DefVector { vector, .. } => format!("def{}Vector", vector.kind().tag()),
        ServerMessage::SetVector(update) => format!("set{}Vector", update.kind.tag()),
        ServerMessage::DelProperty { .. } => "delProperty".to_string(),
        ServerMessage::Message { .. } => "message".to_string(),
    }
}
