//! HTTP client shared across downloads
//!
//! hyper with rustls and native roots. Registries commonly hand tarball
//! downloads off to CDNs, so redirects are followed manually with a bound.

use hyper::body::Incoming;
use hyper::{header, Request, Response};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;
use url::Url;

type HttpsConnector =
    hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>;

const USER_AGENT: &str = concat!("figc/", env!("CARGO_PKG_VERSION"));
const MAX_REDIRECTS: usize = 5;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid URI: {0}")]
    InvalidUri(#[from] hyper::http::uri::InvalidUri),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("HTTP request failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),

    #[error("HTTP builder error: {0}")]
    Builder(#[from] hyper::http::Error),

    #[error("redirect without Location from {0}")]
    MissingLocation(String),

    #[error("too many redirects starting from {0}")]
    TooManyRedirects(String),
}

/// Shared HTTPS client. Cheap to clone; all downloads in the agent reuse
/// one connection pool.
#[derive(Clone)]
pub struct HttpClient {
    inner: Client<HttpsConnector, String>,
}

impl HttpClient {
    pub fn new() -> Self {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .expect("failed to load native roots")
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();

        Self {
            inner: Client::builder(TokioExecutor::new()).build(https),
        }
    }

    /// GET `url` with the given Accept header, following up to
    /// [`MAX_REDIRECTS`] redirects. The response body is not buffered.
    pub async fn get(&self, url: &str, accept: &str) -> Result<Response<Incoming>, HttpError> {
        let mut current = url.to_string();
        for _ in 0..=MAX_REDIRECTS {
            let request = Request::builder()
                .uri(current.as_str())
                .header(header::ACCEPT, accept)
                .header(header::USER_AGENT, USER_AGENT)
                .body(String::new())?;

            let response = self.inner.request(request).await?;
            if !response.status().is_redirection() {
                return Ok(response);
            }

            let location = response
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| HttpError::MissingLocation(current.clone()))?;
            let next = Url::parse(&current)?.join(location)?.to_string();
            tracing::debug!(from = %current, to = %next, "following redirect");
            current = next;
        }
        Err(HttpError::TooManyRedirects(url.to_string()))
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}
