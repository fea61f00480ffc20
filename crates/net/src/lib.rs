//! HTTP client abstraction for sinks that speak a wire protocol over HTTP
//! (currently just `http_stream`). A trait rather than a bare `reqwest::Client`
//! so sink tests can substitute a fake client instead of binding a port.
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{
    HeaderMap,
    StatusCode,
};

#[async_trait]
pub trait FetchClient: Send + Sync {
    async fn post(
        &self,
        url: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> anyhow::Result<FetchResponse>;
}

pub struct FetchResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

/// `reqwest`-backed [`FetchClient`]. Maintains a connection pool internally
/// and is cheap to clone, so construct one per sink and share it across that
/// sink's batch-loop workers.
#[derive(Clone)]
pub struct ReqwestFetchClient {
    client: reqwest::Client,
}

impl ReqwestFetchClient {
    pub fn new(request_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FetchClient for ReqwestFetchClient {
    async fn post(
        &self,
        url: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> anyhow::Result<FetchResponse> {
        let response = self
            .client
            .post(url)
            .headers(headers.clone())
            .body(body)
            .send()
            .await?;
        let status = response.status();
        let body = response.bytes().await?;
        Ok(FetchResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_builds_with_a_timeout() {
        ReqwestFetchClient::new(Duration::from_secs(30)).unwrap();
    }
}
