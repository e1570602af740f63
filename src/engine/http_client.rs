use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::{HeaderMap, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::error::TransportError;
use crate::stats::RequestTimings;

/// A response with its body fully read (or drained, when discarded).
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub timings: RequestTimings,
}

impl TransportResponse {
    /// Parse the body as JSON. `None` for empty or non-JSON bodies.
    pub fn json(&self) -> Option<serde_json::Value> {
        if self.body.is_empty() {
            return None;
        }
        serde_json::from_slice(&self.body).ok()
    }
}

/// Outbound HTTP collaborator. The engine never talks to the network directly.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `req`. With `discard_body` the body is read off the wire for
    /// connection reuse but not kept.
    async fn send(
        &self,
        req: Request<Bytes>,
        discard_body: bool,
    ) -> Result<TransportResponse, TransportError>;
}

/// Approximate on-the-wire size of a request head plus body.
pub fn request_size(req: &Request<Bytes>) -> usize {
    let mut size = req.body().len();
    size += req.method().as_str().len() + 1 + req.uri().to_string().len() + 11;
    for (k, v) in req.headers() {
        size += k.as_str().len() + 2 + v.len() + 2;
    }
    size + 2
}

fn response_size(headers: &HeaderMap, body_len: usize) -> usize {
    // Status line plus headers plus the closing CRLF.
    let mut size = body_len + 15;
    for (k, v) in headers {
        size += k.as_str().len() + 2 + v.len() + 2;
    }
    size + 2
}

/// Default transport: a pooled hyper client over rustls.
#[derive(Clone)]
pub struct HyperTransport {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl HyperTransport {
    /// `pool_size` is the maximum number of idle connections kept per host.
    /// `concurrency` is the expected number of simultaneous VUs; HTTP/2 windows
    /// shrink as it grows to bound memory.
    pub fn new(pool_size: usize, concurrency: usize) -> anyhow::Result<Self> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut http = HttpConnector::new();
        http.enforce_http(false);
        let builder = match hyper_rustls::HttpsConnectorBuilder::new().with_native_roots() {
            Ok(builder) => builder,
            Err(e) => {
                // Plain http still works; https fails certificate verification.
                tracing::warn!(error = %e, "no native root certificates found, https peers will not verify");
                let tls = rustls::ClientConfig::builder()
                    .with_root_certificates(rustls::RootCertStore::empty())
                    .with_no_client_auth();
                hyper_rustls::HttpsConnectorBuilder::new().with_tls_config(tls)
            }
        };
        let https = builder
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http);

        let (conn_window, stream_window) = if concurrency > 5000 {
            (128 * 1024, 64 * 1024)
        } else if concurrency > 2000 {
            (256 * 1024, 128 * 1024)
        } else {
            (512 * 1024, 256 * 1024)
        };

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(pool_size)
            .http2_initial_connection_window_size(conn_window)
            .http2_initial_stream_window_size(stream_window)
            .build(https);

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn send(
        &self,
        req: Request<Bytes>,
        discard_body: bool,
    ) -> Result<TransportResponse, TransportError> {
        let request_start = Instant::now();
        let req_size = request_size(&req);
        let req = req.map(Full::new);

        let response = self
            .client
            .request(req)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let headers_received = Instant::now();

        let (parts, mut body_stream) = response.into_parts();

        // The body is always read to completion so the connection goes back to the pool.
        let (body, body_len) = if discard_body {
            let mut total = 0usize;
            while let Some(frame) = body_stream.frame().await {
                let frame = frame.map_err(|e| TransportError::Body(e.to_string()))?;
                if let Some(data) = frame.data_ref() {
                    total += data.len();
                }
            }
            (Bytes::new(), total)
        } else {
            let body = body_stream
                .collect()
                .await
                .map_err(|e| TransportError::Body(e.to_string()))?
                .to_bytes();
            let len = body.len();
            (body, len)
        };
        let receive_end = Instant::now();

        let timings = RequestTimings {
            waiting: headers_received.duration_since(request_start),
            receiving: receive_end.duration_since(headers_received),
            duration: receive_end.duration_since(request_start),
            response_size: response_size(&parts.headers, body_len),
            request_size: req_size,
        };

        Ok(TransportResponse {
            status: parts.status,
            headers: parts.headers,
            body,
            timings,
        })
    }
}
