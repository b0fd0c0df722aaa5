//! Job descriptor decoding.
//!
//! A descriptor is parsed once into a JSON document. The typed payload and
//! the start attributes are both read out of that document, and the document
//! itself is kept for fields the typed views don't model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::JobError;

/// Repository the build belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Repository {
    pub id: u64,
    pub slug: String,
}

/// Per-job limits requested by the producer, in seconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hard_limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_silence: Option<u64>,
}

/// Typed view of a build request.
///
/// Every field is optional on the wire so that producers may send partial
/// documents; unknown fields are ignored here and stay reachable through
/// [`RawPayload`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobPayload {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<Repository>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeouts: Option<Timeouts>,
}

/// How to provision the execution environment, read from the nested
/// `config` object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartAttributes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dist: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_class: Option<String>,
}

/// The untyped original document.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPayload(Value);

impl RawPayload {
    /// Look up a nested field by object keys, e.g. `&["config", "image"]`.
    pub fn get(&self, path: &[&str]) -> Option<&Value> {
        path.iter()
            .try_fold(&self.0, |value, key| value.as_object()?.get(*key))
    }

    /// Look up a nested field with a JSON pointer, e.g. `/config/env/0`.
    pub fn pointer(&self, pointer: &str) -> Option<&Value> {
        self.0.pointer(pointer)
    }
}

/// A fully decoded job descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDescriptor {
    pub payload: JobPayload,
    pub start_attributes: StartAttributes,
    pub raw: RawPayload,
}

impl JobDescriptor {
    /// Decode descriptor bytes.
    ///
    /// A missing `config` yields default start attributes; a `config` that is
    /// present but has the wrong shape is an error.
    pub fn parse(bytes: &[u8]) -> Result<Self, JobError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, JobError> {
        let payload = JobPayload::deserialize(&value)?;

        let start_attributes = match value.get("config") {
            None | Some(Value::Null) => StartAttributes::default(),
            Some(config) => StartAttributes::deserialize(config)
                .map_err(|e| JobError::StartAttributes(e.to_string()))?,
        };

        Ok(Self {
            payload,
            start_attributes,
            raw: RawPayload(value),
        })
    }
}
