//! Page fetcher contracts + JSON endpoint and fixture implementations.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use pagesweep_core::{pass_through_key, Cursor, FetchError, Page, Record};
use pagesweep_storage::{HttpFetcher, HttpMethod, HttpRequestSpec};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "pagesweep-adapters";

/// Fetches one page for a cursor. Per-session parameters are fixed at construction.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, cursor: Option<&Cursor>) -> Result<Page, FetchError>;
}

/// Fetches a per-record detail payload, independent of any cursor.
#[async_trait]
pub trait DetailFetcher: Send + Sync {
    async fn fetch_detail(&self, record: &Record) -> Result<JsonValue, FetchError>;
}

#[async_trait]
impl<T: PageFetcher + ?Sized> PageFetcher for Arc<T> {
    async fn fetch_page(&self, cursor: Option<&Cursor>) -> Result<Page, FetchError> {
        (**self).fetch_page(cursor).await
    }
}

#[async_trait]
impl<T: DetailFetcher + ?Sized> DetailFetcher for Arc<T> {
    async fn fetch_detail(&self, record: &Record) -> Result<JsonValue, FetchError> {
        (**self).fetch_detail(record).await
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("environment variable {var} for header {header} is not set")]
    MissingHeaderEnv { header: String, var: String },
    #[error("endpoint {endpoint_id}: {message}")]
    InvalidConfig { endpoint_id: String, message: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorMode {
    /// Next cursor is a field of the last record on the page.
    #[default]
    RecordField,
    /// Next cursor is the requested page number plus one.
    PageNumber,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailConfig {
    /// Must contain an `{id}` placeholder.
    pub url_template: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub body: Option<JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub endpoint_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub header_env: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<JsonValue>,
    pub cursor_param: String,
    #[serde(default)]
    pub cursor_mode: CursorMode,
    #[serde(default)]
    pub initial_cursor: Option<Cursor>,
    #[serde(default)]
    pub records_pointer: String,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default)]
    pub cursor_field: Option<String>,
    #[serde(default)]
    pub detail: Option<DetailConfig>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_id_field() -> String {
    "id".to_string()
}

const FIRST_PAGE: i64 = 1;

/// Page-shape rules shared by the HTTP adapter and fixture replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageShape {
    pub records_pointer: String,
    pub id_field: String,
    pub cursor_mode: CursorMode,
    pub cursor_field: Option<String>,
}

impl PageShape {
    pub fn from_endpoint(config: &EndpointConfig) -> Self {
        Self {
            records_pointer: config.records_pointer.clone(),
            id_field: config.id_field.clone(),
            cursor_mode: config.cursor_mode,
            cursor_field: config.cursor_field.clone(),
        }
    }

    /// Normalize a raw response body into a [`Page`].
    ///
    /// Empty body, `null`, or a missing records pointer is a raw-empty page.
    pub fn normalize(&self, body: &[u8], requested: Option<&Cursor>) -> Result<Page, FetchError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Page::raw_empty());
        }
        let root: JsonValue = serde_json::from_slice(body)
            .map_err(|e| FetchError::MalformedPage(format!("response is not JSON: {e}")))?;
        self.normalize_value(root, requested)
    }

    pub fn normalize_value(&self, root: JsonValue, requested: Option<&Cursor>) -> Result<Page, FetchError> {
        if root.is_null() {
            return Ok(Page::raw_empty());
        }
        let Some(items) = root.pointer(&self.records_pointer) else {
            return Ok(Page::raw_empty());
        };
        let JsonValue::Array(items) = items else {
            return Err(FetchError::MalformedPage(format!(
                "`{}` is not an array",
                display_pointer(&self.records_pointer)
            )));
        };

        let records = items
            .iter()
            .enumerate()
            .map(|(idx, item)| match item {
                JsonValue::Object(object) => Record::from_json_object(object.clone(), &self.id_field),
                other => Err(FetchError::MalformedPage(format!(
                    "record #{idx} is not an object: {other}"
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let last_record_cursor = match self.cursor_mode {
            CursorMode::RecordField => records
                .last()
                .and_then(|r| self.cursor_field.as_deref().and_then(|f| self.record_cursor(r, f))),
            CursorMode::PageNumber => {
                let current = match requested {
                    Some(Cursor::Number(n)) => *n,
                    Some(Cursor::Text(t)) => t.parse().map_err(|_| {
                        FetchError::MalformedPage(format!("page cursor `{t}` is not a number"))
                    })?,
                    Some(Cursor::Wide(n)) => {
                        return Err(FetchError::MalformedPage(format!(
                            "page cursor {n} is not an i64 page number"
                        )));
                    }
                    None => FIRST_PAGE,
                };
                let next = current.checked_add(1).ok_or_else(|| {
                    FetchError::MalformedPage(format!("page cursor {current} has no successor"))
                })?;
                Some(Cursor::Number(next))
            }
        };

        Ok(Page::new(records, last_record_cursor))
    }

    /// Reads a cursor from a record field: a plain key, or a JSON pointer when it starts with `/`.
    fn record_cursor(&self, record: &Record, field: &str) -> Option<Cursor> {
        if field == self.id_field {
            let id = serde_json::to_value(&record.id).ok()?;
            return Cursor::from_json(&id);
        }
        if field.starts_with('/') {
            let object = JsonValue::Object(record.fields.clone());
            object.pointer(field).and_then(Cursor::from_json)
        } else {
            record.field(pass_through_key(field)).and_then(Cursor::from_json)
        }
    }
}

fn display_pointer(pointer: &str) -> &str {
    if pointer.is_empty() {
        "<root>"
    } else {
        pointer
    }
}


/// Replays a captured JSON endpoint over HTTP.
#[derive(Debug)]
pub struct JsonEndpointAdapter {
    config: EndpointConfig,
    shape: PageShape,
    headers: Vec<(String, String)>,
    http: Arc<HttpFetcher>,
    run_id: Uuid,
}

impl JsonEndpointAdapter {
    pub fn new(config: EndpointConfig, http: Arc<HttpFetcher>, run_id: Uuid) -> Result<Self, AdapterError> {
        Self::with_env(config, http, run_id, |var| std::env::var(var).ok())
    }

    /// Like [`JsonEndpointAdapter::new`] but resolves `header_env` through `lookup`.
    pub fn with_env(
        config: EndpointConfig,
        http: Arc<HttpFetcher>,
        run_id: Uuid,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, AdapterError> {
        if config.cursor_param.trim().is_empty() {
            return Err(AdapterError::InvalidConfig {
                endpoint_id: config.endpoint_id.clone(),
                message: "cursor_param must not be empty".into(),
            });
        }
        if config.cursor_mode == CursorMode::RecordField && config.cursor_field.is_none() {
            return Err(AdapterError::InvalidConfig {
                endpoint_id: config.endpoint_id.clone(),
                message: "cursor_field is required for record_field cursor mode".into(),
            });
        }
        if config.method == HttpMethod::Post
            && !matches!(config.body, None | Some(JsonValue::Object(_)))
        {
            return Err(AdapterError::InvalidConfig {
                endpoint_id: config.endpoint_id.clone(),
                message: "body must be a JSON object for POST endpoints".into(),
            });
        }
        if let Some(detail) = &config.detail {
            if !detail.url_template.contains("{id}") {
                return Err(AdapterError::InvalidConfig {
                    endpoint_id: config.endpoint_id.clone(),
                    message: "detail.url_template must contain {id}".into(),
                });
            }
        }

        let mut headers: Vec<(String, String)> = config
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (header, var) in &config.header_env {
            let value = lookup(var).ok_or_else(|| AdapterError::MissingHeaderEnv {
                header: header.clone(),
                var: var.clone(),
            })?;
            headers.push((header.clone(), value));
        }

        Ok(Self {
            shape: PageShape::from_endpoint(&config),
            config,
            headers,
            http,
            run_id,
        })
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn has_detail(&self) -> bool {
        self.config.detail.is_some()
    }

    /// Builds the page request, placing the cursor in the body (POST) or query (GET).
    pub fn page_request(&self, cursor: Option<&Cursor>) -> HttpRequestSpec {
        let mut spec = HttpRequestSpec {
            method: self.config.method,
            url: self.config.url.clone(),
            headers: self.headers.clone(),
            ..Default::default()
        };

        match self.config.method {
            HttpMethod::Post => {
                let mut body = match &self.config.body {
                    Some(JsonValue::Object(map)) => map.clone(),
                    _ => Map::new(),
                };
                if let Some(cursor) = cursor {
                    body.insert(self.config.cursor_param.clone(), cursor.to_json());
                }
                spec.json_body = Some(JsonValue::Object(body));
            }
            HttpMethod::Get => {
                if let Some(cursor) = cursor {
                    spec.query
                        .push((self.config.cursor_param.clone(), cursor.to_string()));
                }
            }
        }
        spec
    }

    fn detail_request(&self, detail: &DetailConfig, record: &Record) -> HttpRequestSpec {
        HttpRequestSpec {
            method: detail.method,
            url: detail.url_template.replace("{id}", &record.id.to_string()),
            headers: self.headers.clone(),
            query: Vec::new(),
            json_body: detail.body.clone(),
        }
    }
}

#[async_trait]
impl PageFetcher for JsonEndpointAdapter {
    async fn fetch_page(&self, cursor: Option<&Cursor>) -> Result<Page, FetchError> {
        let spec = self.page_request(cursor);
        let response = self
            .http
            .send(self.run_id, &self.config.endpoint_id, &spec)
            .await?;
        self.shape.normalize(&response.body, cursor)
    }
}

#[async_trait]
impl DetailFetcher for JsonEndpointAdapter {
    async fn fetch_detail(&self, record: &Record) -> Result<JsonValue, FetchError> {
        let Some(detail) = &self.config.detail else {
            return Err(FetchError::MalformedPage(format!(
                "endpoint {} has no detail configuration",
                self.config.endpoint_id
            )));
        };
        let spec = self.detail_request(detail, record);
        let response = self
            .http
            .send(self.run_id, &self.config.endpoint_id, &spec)
            .await?;
        if response.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(JsonValue::Null);
        }
        serde_json::from_slice(&response.body)
            .map_err(|e| FetchError::MalformedPage(format!("detail for {} is not JSON: {e}", record.id)))
    }
}

/// Replays captured `page_*.json` files in sorted order; past the last file it
/// returns a raw-empty page.
#[derive(Debug)]
pub struct FixturePageFetcher {
    pages: Vec<(PathBuf, Vec<u8>)>,
    shape: PageShape,
    next: AtomicUsize,
}

impl FixturePageFetcher {
    pub fn load(dir: impl AsRef<Path>, shape: PageShape) -> Result<Self> {
        let dir = dir.as_ref();
        let mut paths = fs::read_dir(dir)
            .with_context(|| format!("reading fixture directory {}", dir.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .map(|n| n.to_string_lossy())
                    .is_some_and(|n| n.starts_with("page_") && n.ends_with(".json"))
            })
            .collect::<Vec<_>>();
        paths.sort();

        let pages = paths
            .into_iter()
            .map(|path| {
                let bytes = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
                Ok((path, bytes))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            pages,
            shape,
            next: AtomicUsize::new(0),
        })
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

#[async_trait]
impl PageFetcher for FixturePageFetcher {
    async fn fetch_page(&self, cursor: Option<&Cursor>) -> Result<Page, FetchError> {
        let idx = self.next.fetch_add(1, Ordering::SeqCst);
        match self.pages.get(idx) {
            Some((path, bytes)) => self.shape.normalize(bytes, cursor).map_err(|err| match err {
                FetchError::MalformedPage(msg) => {
                    FetchError::MalformedPage(format!("{}: {msg}", path.display()))
                }
                other => other,
            }),
            None => Ok(Page::raw_empty()),
        }
    }
}
