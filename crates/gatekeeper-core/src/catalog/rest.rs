//! PostgREST catalog client.
//!
//! Rows live in `{url}/rest/v1/{table}`. Every request carries the `apikey`
//! and `Authorization: Bearer` headers; rows are addressed with
//! `filename=eq.<name>` filters.

use super::{Catalog, CatalogRow, FileRecord};
use crate::config::CatalogConfig;
use crate::error::{CatalogError, CatalogResult, truncate_body};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response, Url};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, trace};

const COLUMNS: &str = "filename,is_locked,last_accessed";
const PREFER_IGNORE_DUPLICATES: &str = "resolution=ignore-duplicates,return=minimal";
const PREFER_MINIMAL: &str = "return=minimal";

/// Catalog backed by a PostgREST endpoint.
#[derive(Debug, Clone)]
pub struct RestCatalog {
    client: Client,
    endpoint: Url,
    row_limit: Option<usize>,
    fetch_timeout: Duration,
    write_timeout: Duration,
    touch_timeout: Duration,
}

impl RestCatalog {
    /// Builds a client from configuration.
    ///
    /// Fails if the URL or API key is missing or malformed.
    pub fn new(config: &CatalogConfig) -> CatalogResult<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| CatalogError::Config("catalog.url is not set".into()))?;
        let api_key = config
            .api_key
            .as_deref()
            .ok_or_else(|| CatalogError::Config("catalog.api_key is not set".into()))?;
        let bearer = config.effective_bearer().unwrap_or(api_key);

        let endpoint = table_endpoint(url, &config.table)?;

        let mut headers = HeaderMap::new();
        headers.insert(HeaderName::from_static("apikey"), sensitive(api_key)?);
        headers.insert(AUTHORIZATION, sensitive(&format!("Bearer {bearer}"))?);

        let client = Client::builder()
            .default_headers(headers)
            .user_agent(concat!("gatekeeper/", env!("CARGO_PKG_VERSION")))
            .build()?;

        debug!(endpoint = %endpoint, "Catalog client ready");

        Ok(Self {
            client,
            endpoint,
            row_limit: config.row_limit,
            fetch_timeout: config.fetch_timeout,
            write_timeout: config.write_timeout,
            touch_timeout: config.touch_timeout,
        })
    }

    /// The table endpoint requests are sent to.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn list_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("select", COLUMNS);
            if let Some(limit) = self.row_limit {
                query.append_pair("limit", &limit.to_string());
            }
        }
        url
    }

    fn insert_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair("on_conflict", "filename");
        url
    }

    fn row_url(&self, filename: &str) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("filename", &eq_filter(filename));
        url
    }
}

#[async_trait]
impl Catalog for RestCatalog {
    async fn fetch_all(&self) -> CatalogResult<Vec<FileRecord>> {
        let resp = self
            .client
            .get(self.list_url())
            .timeout(self.fetch_timeout)
            .send()
            .await?;
        let resp = check_status("fetch", resp).await?;
        let body = resp.text().await?;
        let rows: Vec<CatalogRow> =
            serde_json::from_str(&body).map_err(|e| CatalogError::Decode(e.to_string()))?;
        trace!(rows = rows.len(), "Fetched catalog");
        Ok(rows.into_iter().map(FileRecord::from).collect())
    }

    async fn insert(&self, filename: &str) -> CatalogResult<()> {
        let body = json!([{
            "filename": filename,
            "is_locked": false,
            "last_accessed": now_rfc3339(),
        }]);
        let resp = self
            .client
            .post(self.insert_url())
            .header("Prefer", PREFER_IGNORE_DUPLICATES)
            .json(&body)
            .timeout(self.write_timeout)
            .send()
            .await?;
        check_status("insert", resp).await?;
        Ok(())
    }

    async fn delete(&self, filename: &str) -> CatalogResult<()> {
        let resp = self
            .client
            .delete(self.row_url(filename))
            .header("Prefer", PREFER_MINIMAL)
            .timeout(self.write_timeout)
            .send()
            .await?;
        check_status("delete", resp).await?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> CatalogResult<()> {
        let resp = self
            .client
            .patch(self.row_url(from))
            .header("Prefer", PREFER_MINIMAL)
            .json(&json!({ "filename": to }))
            .timeout(self.write_timeout)
            .send()
            .await?;
        check_status("rename", resp).await?;
        Ok(())
    }

    async fn touch(&self, filename: &str) -> CatalogResult<()> {
        let resp = self
            .client
            .patch(self.row_url(filename))
            .header("Prefer", PREFER_MINIMAL)
            .json(&json!({ "last_accessed": now_rfc3339() }))
            .timeout(self.touch_timeout)
            .send()
            .await?;
        check_status("touch", resp).await?;
        Ok(())
    }
}

/// Builds `{base}/rest/v1/{table}`.
fn table_endpoint(base: &str, table: &str) -> CatalogResult<Url> {
    let mut url =
        Url::parse(base).map_err(|e| CatalogError::Config(format!("invalid catalog url {base:?}: {e}")))?;
    url.set_query(None);
    url.set_fragment(None);
    url.path_segments_mut()
        .map_err(|()| CatalogError::Config(format!("catalog url {base:?} cannot be a base")))?
        .pop_if_empty()
        .extend(["rest", "v1", table]);
    Ok(url)
}

/// Formats an equality filter, quoting values PostgREST would otherwise
/// split or misparse.
fn eq_filter(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| matches!(c, ',' | '(' | ')' | '"' | '\\' | ':') || c.is_whitespace());
    if needs_quotes {
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        format!("eq.\"{escaped}\"")
    } else {
        format!("eq.{value}")
    }
}

fn sensitive(value: &str) -> CatalogResult<HeaderValue> {
    let mut header = HeaderValue::from_str(value)
        .map_err(|_| CatalogError::Config("credential contains invalid header characters".into()))?;
    header.set_sensitive(true);
    Ok(header)
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

async fn check_status(operation: &'static str, resp: Response) -> CatalogResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(CatalogError::Status {
        operation,
        status: status.as_u16(),
        body: truncate_body(body),
    })
}
