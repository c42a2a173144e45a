//! MIME-keyed serializers.
//!
//! # Design
//! Request bodies are described as `serde_json::Value` trees and turned into
//! bytes by the serializer registered for the request's content encoding.
//! Responses go the other way, selected by the response `Content-Type`. Any
//! MIME type without an explicit mapping falls back to raw passthrough.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::{Map, Value};

use crate::error::SerializationError;
use crate::http::{essence, Payload};

pub const MIME_JSON: &str = "application/json";
pub const MIME_FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_HTML: &str = "text/html";
pub const MIME_OCTET_STREAM: &str = "application/octet-stream";

/// Translates between wire bytes and in-memory values for one or more MIME types.
pub trait DataSerializer: Send + Sync {
    fn serialize(&self, value: &Value, mime_type: &str) -> Result<Bytes, SerializationError>;

    fn deserialize(&self, data: &[u8], mime_type: &str) -> Result<Payload, SerializationError>;

    /// Whether delegate-supplied parameters can be merged into the body this
    /// serializer produces.
    fn supports_additional_parameters(&self) -> bool {
        false
    }

    /// Whether `Content-Type` should carry `; charset=utf-8`.
    fn appends_charset(&self) -> bool {
        false
    }
}

#[derive(Debug, Default)]
pub struct JsonSerializer;

impl DataSerializer for JsonSerializer {
    fn serialize(&self, value: &Value, _mime_type: &str) -> Result<Bytes, SerializationError> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn deserialize(&self, data: &[u8], _mime_type: &str) -> Result<Payload, SerializationError> {
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(Payload::None);
        }
        Ok(Payload::Json(serde_json::from_slice(data)?))
    }

    fn supports_additional_parameters(&self) -> bool {
        true
    }

    fn appends_charset(&self) -> bool {
        true
    }
}

#[derive(Debug, Default)]
pub struct WebFormSerializer;

impl DataSerializer for WebFormSerializer {
    fn serialize(&self, value: &Value, _mime_type: &str) -> Result<Bytes, SerializationError> {
        let Value::Object(map) = value else {
            return Err(SerializationError::Unsupported("web form"));
        };
        let pairs = form_pairs(map)?;
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        Ok(Bytes::from(encoded))
    }

    fn deserialize(&self, data: &[u8], _mime_type: &str) -> Result<Payload, SerializationError> {
        if data.is_empty() {
            return Ok(Payload::None);
        }
        let map: Map<String, Value> = url::form_urlencoded::parse(data)
            .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
            .collect();
        Ok(Payload::Json(Value::Object(map)))
    }

    fn appends_charset(&self) -> bool {
        true
    }
}

#[derive(Debug, Default)]
pub struct TextSerializer;

impl DataSerializer for TextSerializer {
    fn serialize(&self, value: &Value, _mime_type: &str) -> Result<Bytes, SerializationError> {
        match value {
            Value::String(text) => Ok(Bytes::from(text.clone())),
            _ => Err(SerializationError::Unsupported("text")),
        }
    }

    fn deserialize(&self, data: &[u8], _mime_type: &str) -> Result<Payload, SerializationError> {
        if data.is_empty() {
            return Ok(Payload::None);
        }
        let text = std::str::from_utf8(data).map_err(|_| SerializationError::InvalidUtf8)?;
        Ok(Payload::Text(text.to_string()))
    }

    fn appends_charset(&self) -> bool {
        true
    }
}

/// Passthrough: bytes in, bytes out.
#[derive(Debug, Default)]
pub struct RawSerializer;

impl DataSerializer for RawSerializer {
    fn serialize(&self, value: &Value, _mime_type: &str) -> Result<Bytes, SerializationError> {
        match value {
            Value::String(text) => Ok(Bytes::from(text.clone())),
            _ => Err(SerializationError::Unsupported("raw data")),
        }
    }

    fn deserialize(&self, data: &[u8], _mime_type: &str) -> Result<Payload, SerializationError> {
        if data.is_empty() {
            return Ok(Payload::None);
        }
        Ok(Payload::Data(Bytes::copy_from_slice(data)))
    }
}

/// Flattens a parameter object into `(key, value)` pairs for query strings and
/// web forms. Arrays repeat the key; nested objects are not representable.
pub(crate) fn form_pairs(map: &Map<String, Value>) -> Result<Vec<(String, String)>, SerializationError> {
    let mut pairs = Vec::with_capacity(map.len());
    for (key, value) in map {
        match value {
            Value::Array(items) => {
                for item in items {
                    pairs.push((key.clone(), scalar(item)?));
                }
            }
            other => pairs.push((key.clone(), scalar(other)?)),
        }
    }
    Ok(pairs)
}

fn scalar(value: &Value) -> Result<String, SerializationError> {
    match value {
        Value::Null => Ok(String::new()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => Ok(s.clone()),
        Value::Array(_) | Value::Object(_) => {
            Err(SerializationError::Unsupported("a form parameter"))
        }
    }
}

/// MIME type → serializer map with a raw passthrough fallback.
#[derive(Clone)]
pub struct SerializerRegistry {
    serializers: HashMap<String, Arc<dyn DataSerializer>>,
    fallback: Arc<dyn DataSerializer>,
}

impl SerializerRegistry {
    /// Registry without any explicit mapping.
    pub fn empty() -> Self {
        Self {
            serializers: HashMap::new(),
            fallback: Arc::new(RawSerializer),
        }
    }

    pub fn register(&mut self, mime_type: &str, serializer: Arc<dyn DataSerializer>) {
        self.serializers.insert(essence(mime_type), serializer);
    }

    /// Serializer for `mime_type`, or the raw fallback.
    pub fn serializer_for(&self, mime_type: &str) -> Arc<dyn DataSerializer> {
        self.explicit_serializer_for(mime_type)
            .unwrap_or_else(|| self.fallback.clone())
    }

    /// Serializer for `mime_type` only if one was registered for it.
    pub fn explicit_serializer_for(&self, mime_type: &str) -> Option<Arc<dyn DataSerializer>> {
        self.serializers.get(&essence(mime_type)).cloned()
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        let text: Arc<dyn DataSerializer> = Arc::new(TextSerializer);
        registry.register(MIME_JSON, Arc::new(JsonSerializer));
        registry.register(MIME_FORM_URLENCODED, Arc::new(WebFormSerializer));
        registry.register(MIME_TEXT, text.clone());
        registry.register(MIME_HTML, text);
        registry.register(MIME_OCTET_STREAM, Arc::new(RawSerializer));
        registry
    }
}

impl fmt::Debug for SerializerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.serializers.keys().collect();
        keys.sort();
        f.debug_struct("SerializerRegistry").field("mime_types", &keys).finish()
    }
}
