//! XML serialization of protocol messages.
//!
//! `encode_command` is what a client puts on the wire. Outgoing `new*Vector`
//! items carry their name and value only: limits, formats, labels and states
//! belong to the device. `encode_message` writes the server side of the
//! vocabulary and exists so in-process servers (tests, simulators) can speak
//! to a client.

use crate::blob;
use crate::error::{IndiError, IndiResult};
use crate::message::{ClientCommand, ServerMessage};
use crate::protocol::{format_timestamp, LeafKind, INDI_PROTOCOL_VERSION};
use crate::value::LeafValue;
use crate::vector::Vector;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

type Attrs<'a> = Vec<(&'a str, String)>;

struct XmlOut {
    writer: Writer<Vec<u8>>,
}

impl XmlOut {
    fn new() -> Self {
        Self {
            writer: Writer::new(Vec::new()),
        }
    }

    fn start(&mut self, tag: &str, attrs: &Attrs<'_>) -> IndiResult<()> {
        self.writer.write_event(Event::Start(element(tag, attrs)))?;
        Ok(())
    }

    fn empty(&mut self, tag: &str, attrs: &Attrs<'_>) -> IndiResult<()> {
        self.writer.write_event(Event::Empty(element(tag, attrs)))?;
        Ok(())
    }

    fn text(&mut self, text: &str) -> IndiResult<()> {
        if !text.is_empty() {
            self.writer.write_event(Event::Text(BytesText::new(text)))?;
        }
        Ok(())
    }

    fn end(&mut self, tag: &str) -> IndiResult<()> {
        self.writer.write_event(Event::End(BytesEnd::new(tag)))?;
        Ok(())
    }

    /// `<tag attrs>text</tag>`
    fn leaf(&mut self, tag: &str, attrs: &Attrs<'_>, text: &str) -> IndiResult<()> {
        self.start(tag, attrs)?;
        self.text(text)?;
        self.end(tag)
    }

    fn finish(self) -> Vec<u8> {
        self.writer.into_inner()
    }
}

fn element(tag: &str, attrs: &Attrs<'_>) -> BytesStart<'static> {
    let mut start = BytesStart::new(tag.to_string());
    for (key, value) in attrs {
        start.push_attribute((*key, value.as_str()));
    }
    start
}

fn push_opt<'a>(attrs: &mut Attrs<'a>, key: &'a str, value: Option<String>) {
    if let Some(value) = value {
        attrs.push((key, value));
    }
}

/// Value text of a leaf as it appears between its tags
fn value_text(leaf: &LeafValue) -> String {
    match leaf {
        LeafValue::Number(l) => l.value.to_string(),
        LeafValue::Switch(l) => l.wire_value().to_string(),
        LeafValue::Text(l) => l.as_str().to_string(),
        LeafValue::Light(l) => l.value.to_string(),
        LeafValue::Blob(l) => blob::encode(&l.value),
    }
}

/// Serialize one client command.
pub fn encode_command(command: &ClientCommand) -> IndiResult<Vec<u8>> {
    let mut out = XmlOut::new();
    match command {
        ClientCommand::GetProperties { device, name } => {
            let mut attrs = vec![("version", INDI_PROTOCOL_VERSION.to_string())];
            push_opt(&mut attrs, "device", device.clone());
            push_opt(&mut attrs, "name", name.clone());
            out.empty("getProperties", &attrs)?;
        }
        ClientCommand::EnableBlob { device, name, mode } => {
            let mut attrs = Vec::new();
            push_opt(&mut attrs, "device", device.clone());
            push_opt(&mut attrs, "name", name.clone());
            out.leaf("enableBLOB", &attrs, mode.as_str())?;
        }
        ClientCommand::NewVector {
            device,
            timestamp,
            vector,
        } => {
            if vector.kind() == LeafKind::Light {
                return Err(IndiError::NotWritable(format!(
                    "{}.{}: light vectors are never sent by clients",
                    device,
                    vector.name()
                )));
            }

            let tag = format!("new{}Vector", vector.kind().tag());
            let item_tag = format!("one{}", vector.kind().tag());
            let mut attrs = vec![("device", device.clone()), ("name", vector.name().to_string())];
            push_opt(&mut attrs, "timestamp", timestamp.as_ref().map(format_timestamp));
            out.start(&tag, &attrs)?;

            for item in vector.values() {
                let mut item_attrs = vec![("name", item.name().to_string())];
                if let LeafValue::Blob(b) = &item {
                    item_attrs.push(("size", b.value.len().to_string()));
                    item_attrs.push(("format", b.format.clone()));
                }
                out.leaf(&item_tag, &item_attrs, &value_text(&item))?;
            }

            out.end(&tag)?;
        }
    }
    Ok(out.finish())
}

/// Serialize one server message.
pub fn encode_message(message: &ServerMessage) -> IndiResult<Vec<u8>> {
    let mut out = XmlOut::new();
    match message {
        ServerMessage::DefVector { device, vector } => write_definition(&mut out, device, vector)?,
        ServerMessage::SetVector(update) => {
            let tag = format!("set{}Vector", update.kind.tag());
            let item_tag = format!("one{}", update.kind.tag());
            let mut attrs = Vec::new();
            if !update.device.is_empty() {
                attrs.push(("device", update.device.clone()));
            }
            attrs.push(("name", update.name.clone()));
            push_opt(&mut attrs, "state", update.state.map(|s| s.to_string()));
            push_opt(&mut attrs, "timeout", update.timeout.map(|t| t.to_string()));
            push_opt(&mut attrs, "timestamp", update.timestamp.as_ref().map(format_timestamp));
            push_opt(&mut attrs, "message", update.message.clone());
            out.start(&tag, &attrs)?;
            for item in &update.items {
                let mut item_attrs = vec![("name", item.name().to_string())];
                if let LeafValue::Blob(b) = item {
                    item_attrs.push(("size", b.value.len().to_string()));
                    item_attrs.push(("format", b.format.clone()));
                }
                out.leaf(&item_tag, &item_attrs, &value_text(item))?;
            }
            out.end(&tag)?;
        }
        ServerMessage::DelProperty {
            device,
            name,
            timestamp,
            message,
        } => {
            let mut attrs = Vec::new();
            push_opt(&mut attrs, "device", device.clone());
            push_opt(&mut attrs, "name", name.clone());
            push_opt(&mut attrs, "timestamp", timestamp.as_ref().map(format_timestamp));
            push_opt(&mut attrs, "message", message.clone());
            out.empty("delProperty", &attrs)?;
        }
        ServerMessage::Message {
            device,
            timestamp,
            content,
        } => {
            let mut attrs = Vec::new();
            push_opt(&mut attrs, "device", device.clone());
            push_opt(&mut attrs, "timestamp", timestamp.as_ref().map(format_timestamp));
            attrs.push(("message", content.clone()));
            out.empty("message", &attrs)?;
        }
    }
    Ok(out.finish())
}

fn write_definition(out: &mut XmlOut, device: &str, vector: &Vector) -> IndiResult<()> {
    let kind = vector.kind();
    let meta = vector.meta();
    let tag = format!("def{}Vector", kind.tag());
    let item_tag = format!("def{}", kind.tag());

    let mut attrs = vec![("device", device.to_string()), ("name", meta.name.clone())];
    push_opt(&mut attrs, "label", meta.label.clone());
    push_opt(&mut attrs, "group", meta.group.clone());
    attrs.push(("state", meta.state.to_string()));
    if kind != LeafKind::Light {
        attrs.push(("perm", meta.perm.as_str().to_string()));
    }
    if kind == LeafKind::Switch {
        push_opt(&mut attrs, "rule", meta.rule.map(|r| r.as_str().to_string()));
    }
    push_opt(&mut attrs, "timeout", meta.timeout.map(|t| t.to_string()));
    push_opt(&mut attrs, "timestamp", meta.timestamp.as_ref().map(format_timestamp));
    push_opt(&mut attrs, "message", meta.message.clone());
    out.start(&tag, &attrs)?;

    for item in vector.values() {
        let mut item_attrs = vec![("name", item.name().to_string())];
        push_opt(&mut item_attrs, "label", item.label().map(str::to_string));
        match &item {
            LeafValue::Number(n) => {
                item_attrs.push(("format", n.format.clone()));
                item_attrs.push(("min", n.min.to_string()));
                item_attrs.push(("max", n.max.to_string()));
                item_attrs.push(("step", n.step.to_string()));
            }
            LeafValue::Blob(b) => {
                if !b.format.is_empty() {
                    item_attrs.push(("format", b.format.clone()));
                }
                // Definitions announce the element only; payloads come with set
                out.leaf(&item_tag, &item_attrs, "")?;
                continue;
            }
            _ => {}
        }
        out.leaf(&item_tag, &item_attrs, &value_text(&item))?;
    }

    out.end(&tag)
}
