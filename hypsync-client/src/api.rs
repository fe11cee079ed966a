//! Authenticated REST access to the annotation service.

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

use crate::SyncConfig;
use crate::annotation::TextQuote;
use crate::error::{Error, Result};

/// Largest per-page row count the search endpoint honors.
pub const PAGE_LIMIT: usize = 200;

/// Connection-level failures are retried this many times, with no backoff.
const TRANSPORT_RETRIES: usize = 5;

/// Sort direction for search queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    Asc,
    Desc,
}

/// Query parameters accepted by the search endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct SearchParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub sort: String,
    pub order: Order,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_after: Option<String>,
    /// Numeric offset, kept for older deployments; cursor pagination does
    /// not use it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            group: None,
            user: None,
            sort: "updated".to_owned(),
            order: Order::Asc,
            limit: None,
            search_after: None,
            offset: None,
        }
    }
}

/// One page of search results.
#[derive(Debug, Default, Deserialize)]
pub struct SearchPage {
    #[serde(default)]
    pub rows: Vec<Value>,
    #[serde(default)]
    pub total: Option<u64>,
}

/// Bearer-authenticated client for the annotation API.
#[derive(Clone, Debug)]
pub struct HypApi {
    http: Client,
    api_root: Url,
    token: String,
    username: String,
    group: String,
    domain: String,
}

impl HypApi {
    /// Builds a client for `https://{domain}/api/`.
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let api_root = Url::parse(&format!("https://{}/api/", config.domain))
            .map_err(|e| Error::Usage(format!("bad domain {:?}: {e}", config.domain)))?;
        Self::with_api_root(api_root, config)
    }

    /// Builds a client against an explicit API root, e.g. a local test server.
    pub fn with_api_root(api_root: Url, config: &SyncConfig) -> Result<Self> {
        let http = Client::builder().build().map_err(Error::transport)?;
        Ok(Self {
            http,
            api_root,
            token: config.api_token.clone(),
            username: config.username.clone(),
            group: config.group.clone(),
            domain: config.domain.clone(),
        })
    }

    /// Group this client is bound to.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Authenticated username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Service domain, e.g. `hypothes.is`.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .header(CONTENT_TYPE, "application/json;charset=utf-8")
    }

    fn annotation_url(&self, id: &str) -> Result<Url> {
        self.api_root
            .join(&format!("annotations/{id}"))
            .map_err(|e| Error::Usage(format!("bad annotation id {id:?}: {e}")))
    }

    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response> {
        let mut attempt = 0;
        loop {
            let request = builder
                .try_clone()
                .ok_or_else(|| Error::Usage("request body is not retryable".to_owned()))?;
            match request.send().await {
                Ok(response) => return Ok(response),
                Err(e) if is_transport(&e) && attempt < TRANSPORT_RETRIES => {
                    attempt += 1;
                    warn!(attempt, "transport failure, retrying: {e}");
                }
                Err(e) => return Err(Error::transport(e)),
            }
        }
    }

    async fn expect_json(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| Error::Decode(e.to_string()))
        } else {
            Err(Error::NotOk {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("unknown").to_owned(),
            })
        }
    }

    /// Fetches one page of search results.
    pub async fn search(&self, params: &SearchParams) -> Result<SearchPage> {
        let mut params = params.clone();
        if params.limit.is_none() {
            params.limit = Some(PAGE_LIMIT);
        }
        let url = self
            .api_root
            .join("search")
            .map_err(|e| Error::Usage(e.to_string()))?;
        let response = self.send(self.request(Method::GET, url).query(&params)).await?;
        let obj = Self::expect_json(response).await?;
        serde_json::from_value(obj).map_err(Error::from)
    }

    /// Fetches one annotation row by id.
    pub async fn get(&self, id: &str) -> Result<Value> {
        let response = self.send(self.request(Method::GET, self.annotation_url(id)?)).await?;
        Self::expect_json(response).await
    }

    /// Probes an annotation id without a body.
    ///
    /// Returns the raw status so callers can look for deleted annotations
    /// without tripping the non-2xx error path.
    pub async fn head(&self, id: &str) -> Result<StatusCode> {
        let response = self.send(self.request(Method::HEAD, self.annotation_url(id)?)).await?;
        Ok(response.status())
    }

    /// Creates an annotation from a prepared payload.
    pub async fn post(&self, payload: &Value) -> Result<Value> {
        let url = self
            .api_root
            .join("annotations")
            .map_err(|e| Error::Usage(e.to_string()))?;
        let response = self.send(self.request(Method::POST, url).json(payload)).await?;
        Self::expect_json(response).await
    }

    /// Applies a partial update to an annotation.
    pub async fn patch(&self, id: &str, payload: &Value) -> Result<Value> {
        let response = self
            .send(self.request(Method::PATCH, self.annotation_url(id)?).json(payload))
            .await?;
        Self::expect_json(response).await
    }

    /// Deletes an annotation by id.
    pub async fn delete(&self, id: &str) -> Result<Value> {
        let response = self.send(self.request(Method::DELETE, self.annotation_url(id)?)).await?;
        Self::expect_json(response).await
    }

    /// Builds the outbound payload for a create or patch call.
    ///
    /// Without a quote anchor the target degrades to a bare source address.
    pub fn annotation_payload(
        &self,
        uri: &str,
        quote: Option<&TextQuote>,
        text: &str,
        tags: &[String],
    ) -> Value {
        let acct = format!("acct:{}@{}", self.username, self.domain);
        let target = match quote {
            Some(quote) => json!([{
                "scope": [uri],
                "selector": [{
                    "type": "TextQuoteSelector",
                    "prefix": &quote.prefix,
                    "exact": &quote.exact,
                    "suffix": &quote.suffix,
                }],
            }]),
            None => json!([{ "source": uri }]),
        };
        json!({
            "uri": uri,
            "user": &acct,
            "permissions": {
                "read": [format!("group:{}", self.group)],
                "update": [&acct],
                "delete": [&acct],
                "admin": [&acct],
            },
            "group": self.group,
            "target": target,
            "tags": tags,
            "text": text,
        })
    }

    /// Builds and posts an annotation in one step.
    pub async fn create_annotation(
        &self,
        uri: &str,
        quote: Option<&TextQuote>,
        text: &str,
        tags: &[String],
    ) -> Result<Value> {
        let payload = self.annotation_payload(uri, quote, text, tags);
        self.post(&payload).await
    }
}

fn is_transport(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout() || (err.is_request() && err.status().is_none())
}
