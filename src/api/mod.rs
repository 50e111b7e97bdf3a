pub mod models;
pub mod paginate;

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::error::{Error, Result};
use crate::sync::rate_limit::RateLimiter;
use crate::sync::retry::{retry_call, DEFAULT_MAX_ATTEMPTS};

/// Provider page size maximum; requesting more is silently clamped upstream,
/// so ask for exactly this.
pub const DEFAULT_PER_PAGE: u32 = 50;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const ERROR_BODY_SNIPPET: usize = 200;

#[derive(Debug, Clone, Deserialize)]
pub struct Pagination {
    pub current_page: Option<u32>,
    pub per_page: Option<u32>,
    #[serde(default)]
    pub has_more: bool,
    pub total_pages: Option<u32>,
}

/// The provider's own usage accounting, echoed on some responses. Used to
/// reconcile the local rate windows; every field may be absent.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitInfo {
    pub remaining: Option<u32>,
    pub resets_in_seconds: Option<u64>,
    pub requested_entity: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    data: Value,
    pagination: Option<Pagination>,
    rate_limit: Option<RateLimitInfo>,
}

/// One fetched page of raw items. The pipeline depends only on `items`,
/// `has_more`, and the optional `rate_limit` block; `total_pages` feeds
/// progress reporting and never the termination condition.
#[derive(Debug, Clone)]
pub struct Page {
    pub page: u32,
    pub items: Vec<Value>,
    pub has_more: bool,
    pub total_pages: Option<u32>,
    pub rate_limit: Option<RateLimitInfo>,
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Parse a response body into a `Page`. A missing `data` field reads as an
/// empty page; a present-but-non-array `data` is malformed and aborts the
/// caller's pagination loop.
fn parse_envelope(body: &str, page: u32) -> Result<Page> {
    let envelope: RawEnvelope = serde_json::from_str(body)?;
    let items = match envelope.data {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => {
            return Err(Error::Decode(format!(
                "page {page}: data is not an array (got {})",
                json_type_name(&other)
            )))
        }
    };
    let pagination = envelope.pagination;
    Ok(Page {
        page,
        has_more: pagination.as_ref().map(|p| p.has_more).unwrap_or(false),
        total_pages: pagination.as_ref().and_then(|p| p.total_pages),
        items,
        rate_limit: envelope.rate_limit,
    })
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= ERROR_BODY_SNIPPET {
        trimmed.to_string()
    } else {
        let mut end = ERROR_BODY_SNIPPET;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &trimmed[..end])
    }
}

/// Authenticated client for the provider's REST API. One endpoint per call;
/// pagination, budgets, and retries live in the layers above.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    api_token: String,
    per_page: u32,
}

impl ApiClient {
    pub fn new(base_url: &str, api_token: impl Into<String>) -> Result<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("invalid API base URL: {e}")))?;
        // A trailing slash makes Url::join treat the last segment as a
        // directory instead of replacing it.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url,
            api_token: api_token.into(),
            per_page: DEFAULT_PER_PAGE,
        })
    }

    pub fn with_per_page(mut self, per_page: u32) -> Self {
        self.per_page = per_page.clamp(1, DEFAULT_PER_PAGE);
        self
    }

    fn endpoint_url(&self, endpoint: &str) -> Result<Url> {
        self.base_url
            .join(endpoint.trim_start_matches('/'))
            .map_err(|e| Error::Config(format!("invalid endpoint {endpoint}: {e}")))
    }

    /// GET one page of `endpoint`. Extra query parameters (`include`,
    /// `filters`, ...) ride along with the token and paging fields.
    pub async fn fetch_page(
        &self,
        endpoint: &str,
        params: &[(String, String)],
        page: u32,
    ) -> Result<Page> {
        let url = self.endpoint_url(endpoint)?;
        let mut query: Vec<(&str, String)> = vec![
            ("api_token", self.api_token.clone()),
            ("page", page.to_string()),
            ("per_page", self.per_page.to_string()),
        ];
        for (key, value) in params {
            query.push((key.as_str(), value.clone()));
        }

        let response = self.http.get(url).query(&query).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status.as_u16() == 429 {
            let resets = serde_json::from_str::<RawEnvelope>(&body)
                .ok()
                .and_then(|e| e.rate_limit)
                .and_then(|r| r.resets_in_seconds);
            return Err(Error::RateLimited {
                resets_in_seconds: resets,
            });
        }
        if !status.is_success() {
            return Err(Error::Api {
                status: status.as_u16(),
                message: snippet(&body),
            });
        }

        parse_envelope(&body, page)
    }
}

/// Seam between the fetch engines and the transport: anything that can
/// produce numbered pages. Tests supply synthetic sources.
#[async_trait::async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, page: u32) -> Result<Page>;
}

/// Production page source: routes every call through the entity rate limiter
/// and the retry wrapper, and reconciles the local budget with the
/// provider's rate_limit block after each page.
pub struct ApiPageSource<'a> {
    client: &'a ApiClient,
    limiter: &'a RateLimiter,
    entity: &'a str,
    endpoint: &'a str,
    params: Vec<(String, String)>,
    max_attempts: u32,
}

impl<'a> ApiPageSource<'a> {
    pub fn new(
        client: &'a ApiClient,
        limiter: &'a RateLimiter,
        entity: &'a str,
        endpoint: &'a str,
    ) -> Self {
        Self {
            client,
            limiter,
            entity,
            endpoint,
            params: Vec::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_params(mut self, params: Vec<(String, String)>) -> Self {
        self.params = params;
        self
    }
}

#[async_trait::async_trait]
impl PageSource for ApiPageSource<'_> {
    async fn fetch_page(&self, page: u32) -> Result<Page> {
        let context = format!("{} page {page}", self.entity);
        let fetched = retry_call!(
            self.limiter.execute(self.entity, || {
                self.client.fetch_page(self.endpoint, &self.params, page)
            }),
            context,
            self.max_attempts
        )?;
        if let Some(ref info) = fetched.rate_limit {
            self.limiter.reconcile(self.entity, info);
        }
        Ok(fetched)
    }
}
