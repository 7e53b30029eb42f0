//! Core data model for cursor-paginated bulk fetches.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "pagesweep-core";

/// Record identifier as returned by the upstream API.
///
/// `Text("1")` and `Number(1)` are distinct ids. Numbers outside `i64`
/// (large unsigned values, fractions) are kept verbatim as `Wide`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Number(i64),
    Wide(Number),
    Text(String),
}

impl RecordId {
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::String(s) => Some(Self::Text(s.clone())),
            JsonValue::Number(n) => Some(n.as_i64().map_or_else(|| Self::Wide(n.clone()), Self::Number)),
            _ => None,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Wide(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RecordId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Opaque continuation token. `None` at the call site means "start from the beginning".
///
/// Fractional timestamps and unsigned values past `i64::MAX` are `Wide` and
/// are echoed back to the server exactly as received.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cursor {
    Number(i64),
    Wide(Number),
    Text(String),
}

impl Cursor {
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::String(s) if !s.is_empty() => Some(Self::Text(s.clone())),
            JsonValue::Number(n) => Some(n.as_i64().map_or_else(|| Self::Wide(n.clone()), Self::Number)),
            _ => None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Number(n) => JsonValue::from(*n),
            Self::Wide(n) => JsonValue::Number(n.clone()),
            Self::Text(s) => JsonValue::String(s.clone()),
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Wide(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Cursor {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<i64> for Cursor {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

/// Pass-through key that holds an upstream `id` field when the record id is read from another key.
pub const SHADOWED_ID_KEY: &str = "upstream_id";

/// One upstream record. Only `id` is interpreted; everything else passes through.
///
/// `fields` never holds an `id` key, so the flattened JSON form round-trips.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    #[serde(flatten)]
    pub fields: Map<String, JsonValue>,
}

impl Record {
    pub fn new(id: impl Into<RecordId>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.insert_field(key, value);
        self
    }

    /// Inserts a pass-through field. An `id` key is stored under [`SHADOWED_ID_KEY`].
    pub fn insert_field(&mut self, key: impl Into<String>, value: impl Into<JsonValue>) {
        let key = key.into();
        self.fields.insert(pass_through_key(&key).to_string(), value.into());
    }

    /// Builds a record from a JSON object, reading the id from `id_field`.
    /// The id key is removed from the pass-through fields, and a separate
    /// upstream `id` key moves to [`SHADOWED_ID_KEY`].
    pub fn from_json_object(
        mut object: Map<String, JsonValue>,
        id_field: &str,
    ) -> Result<Self, FetchError> {
        let raw_id = object
            .remove(id_field)
            .ok_or_else(|| FetchError::MalformedPage(format!("record is missing `{id_field}`")))?;
        let id = RecordId::from_json(&raw_id).ok_or_else(|| {
            FetchError::MalformedPage(format!("record `{id_field}` must be a string or number, got {raw_id}"))
        })?;
        if let Some(upstream_id) = object.remove("id") {
            if object.contains_key(SHADOWED_ID_KEY) {
                return Err(FetchError::MalformedPage(format!(
                    "record {id} carries both `id` and `{SHADOWED_ID_KEY}` next to `{id_field}`"
                )));
            }
            object.insert(SHADOWED_ID_KEY.to_string(), upstream_id);
        }
        Ok(Self { id, fields: object })
    }

    pub fn field(&self, key: &str) -> Option<&JsonValue> {
        self.fields.get(key)
    }
}

/// Maps a field name to the key it is stored under in [`Record::fields`].
pub fn pass_through_key(key: &str) -> &str {
    if key == "id" {
        SHADOWED_ID_KEY
    } else {
        key
    }
}

/// Result of one page fetch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Page {
    pub records: Vec<Record>,
    /// True when the server returned no structure at all, distinct from zero records.
    pub raw_empty: bool,
    /// Cursor value associated with the last record of this page.
    pub last_record_cursor: Option<Cursor>,
}

impl Page {
    pub fn new(records: Vec<Record>, last_record_cursor: Option<Cursor>) -> Self {
        Self {
            records,
            raw_empty: false,
            last_record_cursor,
        }
    }

    pub fn raw_empty() -> Self {
        Self {
            records: Vec::new(),
            raw_empty: true,
            last_record_cursor: None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.raw_empty || self.records.is_empty()
    }
}

type BoxedSource = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport failure: {0}")]
    Transport(#[source] BoxedSource),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed page: {0}")]
    MalformedPage(String),
}

impl FetchError {
    pub fn transport(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Transport(Box::new(err))
    }
}

/// Why a bulk fetch stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Empty page, or no next cursor could be derived.
    Exhausted,
    /// A non-empty page contributed zero new records.
    Stuck,
    Cancelled,
    PageLimit,
    Failed,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exhausted => "exhausted",
            Self::Stuck => "stuck",
            Self::Cancelled => "cancelled",
            Self::PageLimit => "page_limit",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
