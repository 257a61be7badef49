//! The reverse-proxy transport: moves one admitted request to its chosen
//! replica over a shared connection pool and hands the buffered response
//! back to the engine.

use async_trait::async_trait;
use flowgate_core::{ProxyPayload, ProxyResponse, Transport, TransportError};
use std::time::Duration;
use tracing::debug;

/// Replicas terminate TLS on a dedicated port.
const BACKEND_HTTPS_PORT: u16 = 8112;

/// Marks the request as proxied by the activator so replicas can tell
/// activated traffic from direct traffic.
pub const HEADER_PROXY: &str = "x-flowgate-proxy";
pub const PROXY_NAME: &str = "activator";

/// Hop-by-hop headers that must not be forwarded.
const HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    backend_tls: bool,
}

impl ReqwestTransport {
    pub fn new(backend_tls: bool) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(64)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            backend_tls,
        })
    }

    /// Base URL for a destination, rewriting to the HTTPS backend port when
    /// TLS to replicas is enabled.
    fn target_base(&self, dest: &str) -> String {
        if self.backend_tls {
            let host = dest.split(':').next().unwrap_or(dest);
            format!("https://{host}:{BACKEND_HTTPS_PORT}")
        } else {
            format!("http://{dest}")
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn proxy(
        &self,
        dest: &str,
        payload: &ProxyPayload,
    ) -> Result<ProxyResponse, TransportError> {
        let url = format!("{}{}", self.target_base(dest), payload.path_and_query);
        debug!(%url, "proxying request");

        let mut headers = http::HeaderMap::with_capacity(payload.headers.len() + 1);
        for (name, value) in payload.headers.iter() {
            if !HOP_HEADERS.contains(&name.as_str()) {
                headers.append(name, value.clone());
            }
        }
        headers.insert(HEADER_PROXY, http::HeaderValue::from_static(PROXY_NAME));

        let response = self
            .client
            .request(payload.method.clone(), url)
            .headers(headers)
            .body(payload.body.clone())
            .send()
            .await
            .map_err(|err| TransportError::new(dest, err.to_string()))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|err| TransportError::new(dest, err.to_string()))?;

        Ok(ProxyResponse {
            status,
            headers,
            body,
        })
    }
}
