use std::time::Duration;

use moka::future::Cache;
use nestfeed_core::error::{AppError, TransportError};
use nestfeed_core::models::ProxyRecord;
use nestfeed_core::traits::{RequestOptions, Response, Transport};
use reqwest::{Client, Proxy};
use url::Url;

const PROXY_CLIENT_CAPACITY: u64 = 512;
const PROXY_CLIENT_IDLE: Duration = Duration::from_secs(60 * 60);

/// HTTP transport using reqwest.
///
/// Requests without a proxy share one client. Each proxy gets its own
/// client (reqwest binds proxies at build time), cached by proxy URL so
/// connection pools survive across requests.
#[derive(Clone)]
pub struct ReqwestTransport {
    direct: Client,
    proxied: Cache<String, Client>,
    user_agent: String,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str) -> Result<Self, AppError> {
        let direct = build_client(user_agent, None)
            .map_err(|e| AppError::ConfigError(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            direct,
            proxied: Cache::builder()
                .max_capacity(PROXY_CLIENT_CAPACITY)
                .time_to_idle(PROXY_CLIENT_IDLE)
                .build(),
            user_agent: user_agent.to_string(),
        })
    }

    async fn client_for(&self, proxy: Option<&ProxyRecord>) -> Result<Client, TransportError> {
        let Some(proxy) = proxy else {
            return Ok(self.direct.clone());
        };

        let proxy_url = proxy.url();
        let user_agent = self.user_agent.clone();
        let key = proxy_url.clone();
        self.proxied
            .try_get_with(key, async move { build_client(&user_agent, Some(&proxy_url)) })
            .await
            .map_err(|e| {
                TransportError::Protocol(format!("Invalid proxy {}: {e}", proxy.label()))
            })
    }
}

fn build_client(user_agent: &str, proxy_url: Option<&str>) -> Result<Client, reqwest::Error> {
    let mut builder = Client::builder().user_agent(user_agent);
    if let Some(url) = proxy_url {
        builder = builder.proxy(Proxy::all(url)?);
    }
    builder.build()
}

impl Transport for ReqwestTransport {
    async fn request(
        &self,
        url: &str,
        options: &RequestOptions,
        proxy: Option<&ProxyRecord>,
    ) -> Result<Response, TransportError> {
        let parsed =
            Url::parse(url).map_err(|e| TransportError::Protocol(format!("Invalid URL: {e}")))?;
        match parsed.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(TransportError::Protocol(format!(
                    "URL scheme '{scheme}' is not allowed (only http/https)"
                )));
            }
        }

        let client = self.client_for(proxy).await?;
        let mut request = client.get(parsed).timeout(options.timeout);
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let timeout_ms = u64::try_from(options.timeout.as_millis()).unwrap_or(u64::MAX);
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(timeout_ms)
            } else if e.is_connect() {
                TransportError::Refused(e.to_string())
            } else {
                TransportError::Protocol(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(url, status = status.as_u16(), "Non-success response");
            return Err(TransportError::BadStatus(status.as_u16()));
        }

        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(timeout_ms)
            } else {
                TransportError::Protocol(format!("Failed to read response body: {e}"))
            }
        })?;

        Ok(Response {
            status: status.as_u16(),
            body,
        })
    }
}
