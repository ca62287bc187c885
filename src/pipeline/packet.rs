//! Data packet and its wire encoding.
//!
//! A `Packet` is a JSON property set plus an opaque byte payload. Modules
//! receive packets by mutable reference, so a sink may annotate a packet
//! before the next sink on the same channel sees it.
//!
//! # Wire format
//!
//! ```text
//! [u32 BE props_len][props JSON][u32 BE payload_len][payload bytes]
//! ```
//!
//! Over a stream each encoded packet is wrapped in one more `u32 BE` length
//! prefix (see [`write_message`] / [`read_message`]).

use crate::pipeline::error::{PipelineError, PipelineResult};
use serde_json::{Map, Value};
use std::io::{Read, Write};

/// Property set carried alongside the payload.
pub type PropertySet = Map<String, Value>;

/// Upper bound on a single framed message, to reject garbage length prefixes.
pub const MAX_MESSAGE_LEN: usize = 256 * 1024 * 1024;

/// The unit of data flowing between modules.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Packet {
    pub properties: PropertySet,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            properties: PropertySet::new(),
            payload: payload.into(),
        }
    }

    pub fn from_text(text: &str) -> Self {
        Self::new(text.as_bytes().to_vec())
    }

    /// Payload interpreted as UTF-8, lossy.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn with_property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set_property(key, value);
        self
    }

    pub fn set_property(&mut self, key: &str, value: impl Into<Value>) {
        self.properties.insert(key.to_string(), value.into());
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// String property, with non-string JSON values rendered as text.
    pub fn property_str(&self, key: &str) -> Option<String> {
        self.properties.get(key).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Encode as `[props_len][props][payload_len][payload]`.
    pub fn encode(&self) -> PipelineResult<Vec<u8>> {
        let props = serde_json::to_vec(&self.properties)?;
        let mut out = Vec::with_capacity(8 + props.len() + self.payload.len());
        out.extend_from_slice(&frame_len(props.len())?.to_be_bytes());
        out.extend_from_slice(&props);
        out.extend_from_slice(&frame_len(self.payload.len())?.to_be_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> PipelineResult<Self> {
        let (props, rest) = split_prefixed(bytes, "property set")?;
        let (payload, rest) = split_prefixed(rest, "payload")?;
        if !rest.is_empty() {
            return Err(PipelineError::Protocol(format!(
                "{} trailing bytes after packet payload",
                rest.len()
            )));
        }
        let properties = match serde_json::from_slice::<Value>(props)? {
            Value::Object(map) => map,
            other => {
                return Err(PipelineError::Protocol(format!(
                    "property set must be a JSON object, got {}",
                    other
                )))
            }
        };
        Ok(Self {
            properties,
            payload: payload.to_vec(),
        })
    }
}

fn frame_len(len: usize) -> PipelineResult<u32> {
    u32::try_from(len)
        .map_err(|_| PipelineError::Protocol(format!("frame of {} bytes is too large", len)))
}

fn split_prefixed<'a>(bytes: &'a [u8], what: &str) -> PipelineResult<(&'a [u8], &'a [u8])> {
    if bytes.len() < 4 {
        return Err(PipelineError::Protocol(format!(
            "truncated {} length prefix",
            what
        )));
    }
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let body = &bytes[4..];
    if body.len() < len {
        return Err(PipelineError::Protocol(format!(
            "truncated {}: expected {} bytes, got {}",
            what,
            len,
            body.len()
        )));
    }
    Ok(body.split_at(len))
}

/// Write one length-prefixed message to a stream.
pub fn write_message<W: Write>(writer: &mut W, body: &[u8]) -> PipelineResult<()> {
    writer.write_all(&frame_len(body.len())?.to_be_bytes())?;
    writer.write_all(body)?;
    writer.flush()?;
    Ok(())
}

/// Read one length-prefixed message from a stream.
pub fn read_message<R: Read>(reader: &mut R) -> PipelineResult<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(PipelineError::Protocol(format!(
            "message of {} bytes exceeds limit",
            len
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(body)
}
