//! Deserialization targets for JSON responses.
//!
//! # Design
//! A request that wants a typed result registers a `DeserializeTarget`
//! monomorphized for that type when the request is built, so the completion
//! path only calls a plain function pointer. `JsonDeserializable::from_json`
//! returning `None` means the JSON was well-formed but semantically invalid
//! (a mandatory field is missing, say); that surfaces as
//! `SerializationError::InvalidPayload`, distinct from malformed JSON.

use std::any::{type_name, Any};
use std::fmt;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::SerializationError;
use crate::http::Payload;

/// Types that can be built from a JSON object.
pub trait JsonDeserializable: Sized {
    fn from_json(json: &Map<String, Value>) -> Option<Self>;
}

type Decoder = fn(&Value) -> Result<Box<dyn Any + Send>, SerializationError>;

/// Compile-time checked factory turning a JSON value into a typed object.
#[derive(Clone, Copy)]
pub struct DeserializeTarget {
    type_name: &'static str,
    decode: Decoder,
}

impl DeserializeTarget {
    /// Target for a `JsonDeserializable` type. A JSON object yields `T`,
    /// a JSON array of objects yields `Vec<T>`.
    pub fn of<T: JsonDeserializable + Send + 'static>() -> Self {
        Self {
            type_name: type_name::<T>(),
            decode: decode_factory::<T>,
        }
    }

    /// Target for any serde-deserializable type.
    pub fn serde<T: DeserializeOwned + Send + 'static>() -> Self {
        Self {
            type_name: type_name::<T>(),
            decode: decode_serde::<T>,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn decode(&self, value: &Value) -> Result<Payload, SerializationError> {
        (self.decode)(value).map(Payload::Object)
    }
}

impl fmt::Debug for DeserializeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DeserializeTarget").field(&self.type_name).finish()
    }
}

fn decode_factory<T: JsonDeserializable + Send + 'static>(
    value: &Value,
) -> Result<Box<dyn Any + Send>, SerializationError> {
    match value {
        Value::Object(map) => Ok(Box::new(build::<T>(map)?)),
        Value::Array(items) => {
            let objects = items
                .iter()
                .map(|item| match item {
                    Value::Object(map) => build::<T>(map),
                    _ => Err(not_an_object::<T>()),
                })
                .collect::<Result<Vec<T>, _>>()?;
            Ok(Box::new(objects))
        }
        _ => Err(not_an_object::<T>()),
    }
}

fn build<T: JsonDeserializable>(map: &Map<String, Value>) -> Result<T, SerializationError> {
    T::from_json(map).ok_or_else(|| {
        SerializationError::InvalidPayload(format!("{} refused the payload", type_name::<T>()))
    })
}

fn not_an_object<T>() -> SerializationError {
    SerializationError::InvalidPayload(format!("{} needs a JSON object", type_name::<T>()))
}

fn decode_serde<T: DeserializeOwned + Send + 'static>(
    value: &Value,
) -> Result<Box<dyn Any + Send>, SerializationError> {
    let object: T = serde_json::from_value(value.clone())
        .map_err(|e| SerializationError::InvalidPayload(e.to_string()))?;
    Ok(Box::new(object))
}
