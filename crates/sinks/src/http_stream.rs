use std::sync::Arc;

use async_trait::async_trait;
use core_types::Record;
use http::{
    header::CONTENT_TYPE,
    HeaderMap,
    HeaderValue,
};
use net::FetchClient;

use crate::transport::{
    Transport,
    TransportError,
};

/// POSTs newline-delimited JSON batches to a single HTTP/1.1 endpoint,
/// relying on the fetch client's connection pool for keep-alive. Grounded in
/// the teacher's webhook/Axiom sinks: 4xx is the caller's fault and is
/// permanent, 5xx and transport errors are retried.
pub struct HttpStreamTransport {
    name: String,
    url: String,
    fetch_client: Arc<dyn FetchClient>,
}

impl HttpStreamTransport {
    pub fn new(name: impl Into<String>, url: String, fetch_client: Arc<dyn FetchClient>) -> Self {
        Self {
            name: name.into(),
            url,
            fetch_client,
        }
    }
}

#[async_trait]
impl Transport for HttpStreamTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_batch(&self, records: &[Arc<Record>]) -> Result<(), TransportError> {
        let mut payload = Vec::new();
        for record in records {
            serde_json::to_writer(&mut payload, record.as_ref())
                .map_err(|e| TransportError::Permanent(e.into()))?;
            payload.push(b'\n');
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/x-ndjson"));

        let response = self
            .fetch_client
            .post(&self.url, &headers, bytes::Bytes::from(payload))
            .await
            .map_err(TransportError::Transient)?;

        if response.status.is_success() {
            Ok(())
        } else if response.status.is_client_error() {
            Err(TransportError::Permanent(anyhow::anyhow!(
                "http_stream sink {} rejected the batch with {}",
                self.url,
                response.status
            )))
        } else {
            Err(TransportError::Transient(anyhow::anyhow!(
                "http_stream sink {} returned {}",
                self.url,
                response.status
            )))
        }
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{
        AtomicUsize,
        Ordering,
    };

    use chrono::Utc;
    use core_types::SourceKind;
    use http::StatusCode;
    use net::FetchResponse;

    use super::*;

    struct FakeClient {
        status: StatusCode,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FetchClient for FakeClient {
        async fn post(
            &self,
            _url: &str,
            _headers: &HeaderMap,
            _body: bytes::Bytes,
        ) -> anyhow::Result<FetchResponse> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(FetchResponse {
                status: self.status,
                body: bytes::Bytes::new(),
            })
        }
    }

    fn sample_record() -> Arc<Record> {
        Arc::new(Record::new(SourceKind::File, "/a.log", b"hi".to_vec(), Utc::now(), Utc::now()))
    }

    #[tokio::test]
    async fn client_error_is_permanent() {
        let client = Arc::new(FakeClient {
            status: StatusCode::BAD_REQUEST,
            calls: AtomicUsize::new(0),
        });
        let transport = HttpStreamTransport::new("http_stream", "http://example.test".into(), client);
        let err = transport.send_batch(&[sample_record()]).await.unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let client = Arc::new(FakeClient {
            status: StatusCode::SERVICE_UNAVAILABLE,
            calls: AtomicUsize::new(0),
        });
        let transport = HttpStreamTransport::new("http_stream", "http://example.test".into(), client);
        let err = transport.send_batch(&[sample_record()]).await.unwrap_err();
        assert!(!err.is_permanent());
    }
}
