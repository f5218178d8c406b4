//! Realtime Database REST client.
//!
//! Versioned reads ask for an `ETag` with `X-Firebase-ETag: true`; conditional
//! writes send it back in `if-match` and get `412 Precondition Failed` when the
//! node changed in between.

use async_trait::async_trait;
use reqwest::{header::ETAG, Client, RequestBuilder, Response, StatusCode, Url};
use serde_json::Value as JsonValue;
use swipe_core::RawResultsTree;
use swipe_storage::{
    build_client, classify_reqwest_error, classify_status, HttpClientConfig, RetryDisposition,
};
use tracing::{debug, info_span, warn, Instrument};

use crate::{ResultsSource, SourceError, SwapOutcome, Versioned};

const ETAG_REQUEST_HEADER: &str = "X-Firebase-ETag";
const IF_MATCH: &str = "if-match";

#[derive(Debug, Clone)]
pub struct FirebaseConfig {
    /// e.g. `https://project-id.firebaseio.com`
    pub database_url: String,
    /// Database secret or ID token, sent as the `auth` query parameter.
    pub auth_token: Option<String>,
    /// Slash separated, e.g. `v2/results`.
    pub results_path: String,
    pub http: HttpClientConfig,
}

pub struct FirebaseSource {
    client: Client,
    base: Url,
    auth_token: Option<String>,
    results_path: String,
    root_segments: Vec<String>,
    http: HttpClientConfig,
}

impl std::fmt::Debug for FirebaseSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirebaseSource")
            .field("base", &self.base.as_str())
            .field("results_path", &self.results_path)
            .finish_non_exhaustive()
    }
}

impl FirebaseSource {
    pub fn new(config: FirebaseConfig) -> Result<Self, SourceError> {
        let base = Url::parse(&config.database_url)
            .map_err(|_| SourceError::InvalidUrl(config.database_url.clone()))?;
        if base.cannot_be_a_base() {
            return Err(SourceError::InvalidUrl(config.database_url));
        }
        let root_segments: Vec<String> = config
            .results_path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if root_segments.is_empty() {
            return Err(SourceError::InvalidUrl(config.results_path));
        }
        let client = build_client(&config.http).map_err(|source| SourceError::Request {
            url: base.to_string(),
            source,
        })?;

        Ok(Self {
            client,
            base,
            auth_token: config.auth_token,
            results_path: root_segments.join("/"),
            root_segments,
            http: config.http,
        })
    }

    /// REST url of the node at `path` below the results root.
    fn node_url(&self, path: &[String]) -> Result<Url, SourceError> {
        let mut url = self.base.clone();
        let mut segments: Vec<&str> = self
            .root_segments
            .iter()
            .chain(path.iter())
            .map(String::as_str)
            .collect();
        let last = segments.pop().map(|s| format!("{s}.json")).unwrap_or_default();
        url.path_segments_mut()
            .map_err(|_| SourceError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments)
            .push(&last);
        if let Some(token) = &self.auth_token {
            url.query_pairs_mut().append_pair("auth", token);
        }
        Ok(url)
    }

    /// Send with retries on transport failures and retryable statuses.
    /// Any other response is returned for the caller to interpret.
    async fn send<F>(&self, url: &Url, build: F) -> Result<Response, SourceError>
    where
        F: Fn(&Client, Url) -> RequestBuilder,
    {
        let backoff = self.http.backoff;
        let mut attempt = 0;
        loop {
            match build(&self.client, url.clone()).send().await {
                Ok(resp) => {
                    let retry = classify_status(resp.status()) == RetryDisposition::Retryable;
                    if retry && attempt < backoff.max_retries {
                        warn!(status = resp.status().as_u16(), attempt, "retrying source request");
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    let retry = classify_reqwest_error(&err) == RetryDisposition::Retryable;
                    if retry && attempt < backoff.max_retries {
                        warn!(error = %err, attempt, "retrying source request");
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(SourceError::Request {
                        url: redacted(url),
                        source: err.without_url(),
                    });
                }
            }
        }
    }
}

/// The url without its query string, so the auth token never reaches logs.
fn redacted(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

fn status_error(status: StatusCode, url: &Url) -> SourceError {
    SourceError::HttpStatus {
        status: status.as_u16(),
        url: redacted(url),
    }
}

#[async_trait]
impl ResultsSource for FirebaseSource {
    fn root_path(&self) -> &str {
        &self.results_path
    }

    async fn get_subtree(&self) -> Result<Versioned, SourceError> {
        let url = self.node_url(&[])?;
        let span = info_span!("source_read", path = %self.results_path);
        async {
            let resp = self
                .send(&url, |client, url| {
                    client.get(url).header(ETAG_REQUEST_HEADER, "true")
                })
                .await?;
            if !resp.status().is_success() {
                return Err(status_error(resp.status(), &url));
            }
            let version = resp
                .headers()
                .get(ETAG)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| SourceError::MissingEtag { url: redacted(&url) })?;
            let tree: JsonValue = resp.json().await.map_err(|source| SourceError::Json {
                url: redacted(&url),
                source: source.without_url(),
            })?;
            debug!(%version, "read results subtree");
            Ok(Versioned {
                tree: RawResultsTree::new(tree),
                version,
            })
        }
        .instrument(span)
        .await
    }

    async fn compare_and_swap(
        &self,
        expected_version: &str,
        replacement: &JsonValue,
    ) -> Result<SwapOutcome, SourceError> {
        let url = self.node_url(&[])?;
        let resp = self
            .send(&url, |client, url| {
                client
                    .put(url)
                    .header(IF_MATCH, expected_version)
                    .json(replacement)
            })
            .await?;
        match resp.status() {
            StatusCode::PRECONDITION_FAILED => Ok(SwapOutcome::Conflict),
            status if status.is_success() => Ok(SwapOutcome::Committed),
            status => Err(status_error(status, &url)),
        }
    }

    async fn delete_path(&self, path: &[String]) -> Result<(), SourceError> {
        let url = self.node_url(path)?;
        let resp = self.send(&url, |client, url| client.delete(url)).await?;
        if resp.status().is_success() {
            debug!(path = %path.join("/"), "deleted source node");
            Ok(())
        } else {
            Err(status_error(resp.status(), &url))
        }
    }
}
