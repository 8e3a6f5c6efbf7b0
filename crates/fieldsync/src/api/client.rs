//! Remote API HTTP client
//!
//! Wraps every call with bearer authorization from the shared
//! [`CredentialCache`] and implements [`PageSource`] for the fetcher.
//! Uses synchronous HTTP so the engine stays executor-agnostic.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use log::{debug, warn};
use serde_json::Value;
use url::Url;

use super::auth::CredentialCache;
use super::transport::HttpTransport;
use crate::entities::{EntitySpec, Termination};
use crate::error::{FetchError, RequestError};
use crate::sync::{Page, PageRequest, PageSource};

/// Header carrying the static application key
pub const APP_KEY_HEADER: &str = "ST-App-Key";

/// Attempts allowed for one request when the API answers 401
pub const MAX_AUTH_ATTEMPTS: u32 = 3;

/// Longest response body kept in an error message
const ERROR_BODY_LIMIT: usize = 512;

/// Authenticated client for the tenant's REST API
pub struct ApiClient {
    base_url: Url,
    tenant: String,
    app_key: String,
    credentials: Arc<CredentialCache>,
    transport: Box<dyn HttpTransport>,
}

impl ApiClient {
    /// Create a client rooted at `base_url` for `tenant`
    pub fn new(
        base_url: &str,
        tenant: impl Into<String>,
        app_key: impl Into<String>,
        credentials: Arc<CredentialCache>,
        transport: Box<dyn HttpTransport>,
    ) -> Result<Self> {
        let base_url =
            Url::parse(base_url).with_context(|| format!("Invalid API base URL: {}", base_url))?;

        Ok(Self {
            base_url,
            tenant: tenant.into(),
            app_key: app_key.into(),
            credentials,
            transport,
        })
    }

    /// Expand `{tenant}` in an endpoint path and join it to the base URL
    pub fn endpoint_url(&self, path: &str) -> String {
        let path = path.replace("{tenant}", &urlencoding::encode(&self.tenant));
        format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Send one authenticated GET and decode the JSON body.
    ///
    /// A 401 forces exactly one credential refresh before the next attempt,
    /// up to [`MAX_AUTH_ATTEMPTS`]. Every other failure is returned as is.
    pub fn authenticated_get(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<Value, RequestError> {
        let url = self.endpoint_url(path);
        let mut force_refresh = false;

        for attempt in 1..=MAX_AUTH_ATTEMPTS {
            let credential = self.credentials.get_credential(force_refresh)?;
            let headers = [
                ("Authorization", format!("Bearer {}", credential.token())),
                (APP_KEY_HEADER, self.app_key.clone()),
            ];

            let reply = self.transport.get(&url, query, &headers)?;
            match reply.status {
                200..=299 => {
                    return serde_json::from_str(&reply.body)
                        .map_err(|e| RequestError::Decode(e.to_string()));
                }
                401 => {
                    warn!(
                        "Unauthorized response from {} (attempt {}/{}), refreshing token",
                        path, attempt, MAX_AUTH_ATTEMPTS
                    );
                    force_refresh = true;
                }
                status => {
                    return Err(RequestError::Status {
                        status,
                        body: truncate(reply.body),
                    });
                }
            }
        }

        Err(RequestError::Unauthorized {
            attempts: MAX_AUTH_ATTEMPTS,
        })
    }

    fn page_query(entity: &EntitySpec, request: &PageRequest) -> Vec<(String, String)> {
        let mut query = Vec::new();
        if entity.termination != Termination::SinglePage {
            query.push(("page".to_string(), request.page.to_string()));
            query.push(("pageSize".to_string(), request.page_size.to_string()));
        }
        for (key, value) in entity.query {
            query.push((key.to_string(), value.to_string()));
        }
        if let (Some(param), Some(since)) = (entity.watermark_param, request.watermark) {
            query.push((
                param.to_string(),
                since.to_rfc3339_opts(SecondsFormat::Secs, true),
            ));
        }
        query
    }
}

impl ApiClient {
    /// GET the first available candidate path, expanding `{parent}`
    fn first_available(
        &self,
        entity: &EntitySpec,
        parent: Option<&str>,
        query: &[(String, String)],
    ) -> Result<Page, FetchError> {
        let mut unavailable = None;

        for template in entity.paths {
            let path = match parent {
                Some(parent) => template.replace("{parent}", &urlencoding::encode(parent)),
                None => template.to_string(),
            };
            match self.authenticated_get(&path, query) {
                Ok(body) => return parse_page(body),
                Err(e) if e.is_unavailable() => {
                    debug!("{} unavailable at {}: {}", entity.name, path, e);
                    unavailable = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(unavailable
            .map(FetchError::from)
            .unwrap_or(FetchError::Unavailable { status: 404 }))
    }
}

impl PageSource for ApiClient {
    /// Fetch one page, trying each candidate path until one is available
    fn fetch_page(&self, entity: &EntitySpec, request: &PageRequest) -> Result<Page, FetchError> {
        self.first_available(entity, None, &Self::page_query(entity, request))
    }

    fn fetch_children(&self, entity: &EntitySpec, parent: &str) -> Result<Page, FetchError> {
        self.first_available(entity, Some(parent), &[])
    }
}

/// Decode a page body: `{data: [...], hasMore}` or a bare array
pub fn parse_page(body: Value) -> Result<Page, FetchError> {
    match body {
        Value::Array(records) => Ok(Page {
            records,
            has_more: None,
        }),
        Value::Object(mut map) => {
            let has_more = map.get("hasMore").and_then(Value::as_bool);
            match map.remove("data") {
                Some(Value::Array(records)) => Ok(Page { records, has_more }),
                Some(Value::Null) => Ok(Page {
                    records: Vec::new(),
                    has_more,
                }),
                _ => Err(FetchError::Transient(
                    "response has no `data` array".to_string(),
                )),
            }
        }
        other => Err(FetchError::Transient(format!(
            "unexpected response body: {}",
            truncate(other.to_string())
        ))),
    }
}

fn truncate(mut body: String) -> String {
    if body.len() > ERROR_BODY_LIMIT {
        let mut cut = ERROR_BODY_LIMIT;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}
