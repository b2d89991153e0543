// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! Every message exchanged over the broker is wrapped in a CloudEvents-style
//! JSON envelope. Field names are fixed; decoding tolerates unknown and
//! missing fields and matches top-level field names case-insensitively.

use crate::errors::AmqpError;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::error;

/// CloudEvents spec version written by the publisher
pub const SPEC_VERSION: &str = "1.0";
/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// The wire envelope.
///
/// `data` is opaque to the engine; its shape is defined by `event_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T = Value> {
    #[serde(default)]
    pub specversion: String,
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub datacontenttype: String,
    pub data: T,
}

impl<T> Envelope<T> {
    /// Builds an envelope stamped with the current UTC instant.
    pub fn new(id: &str, event_type: &str, source: &str, data: T) -> Envelope<T> {
        Envelope {
            specversion: SPEC_VERSION.to_owned(),
            event_type: event_type.to_owned(),
            source: source.to_owned(),
            id: id.to_owned(),
            time: Utc::now(),
            datacontenttype: JSON_CONTENT_TYPE.to_owned(),
            data,
        }
    }
}

impl<T: Serialize> Envelope<T> {
    pub fn encode(&self) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(self).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize envelope");
            AmqpError::ParsePayloadError(err.to_string())
        })
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    /// Decodes raw bytes into an envelope.
    ///
    /// Anything that is not a JSON object (including `null`) is rejected.
    pub fn decode(bytes: &[u8]) -> Result<Envelope<T>, AmqpError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))?;

        let Value::Object(fields) = value else {
            return Err(AmqpError::ParsePayloadError(
                "envelope is not a json object".to_owned(),
            ));
        };

        let normalized: Map<String, Value> = fields
            .into_iter()
            .map(|(key, value)| (key.to_lowercase(), value))
            .collect();

        let data_missing = !normalized.contains_key("data");
        let mut object = Value::Object(normalized);
        if data_missing {
            object["data"] = Value::Null;
        }

        serde_json::from_value(object).map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }
}
