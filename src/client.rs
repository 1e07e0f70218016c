//! Downstream HTTP: per-provider clients and the model-client cache.

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::{AdapterKind, ProviderConfig, TimeoutsConfig};
use crate::error::{map_upstream_status, Error, Result};

type HttpsClient =
    Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

/// One constructed downstream client, bound to a provider config and model.
pub struct ProviderClient {
    http: HttpsClient,
    base_url: String,
    api_key_env: Option<String>,
    adapter: AdapterKind,
    read_timeout: Duration,
}

impl ProviderClient {
    pub fn new(provider: &ProviderConfig, timeouts: &TimeoutsConfig) -> Self {
        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);
        http_connector.set_connect_timeout(Some(Duration::from_millis(timeouts.connect)));

        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http_connector);

        let http = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            http,
            base_url: provider.base_url.trim_end_matches('/').to_string(),
            api_key_env: provider.api_key_env.clone(),
            adapter: provider.adapter,
            read_timeout: Duration::from_millis(timeouts.read),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Resolve this provider's API key from the environment, at request time.
    /// A named-but-unset variable is an authentication failure.
    pub fn resolve_api_key(&self) -> Result<Option<String>> {
        match &self.api_key_env {
            Some(env_name) => std::env::var(env_name).map(Some).map_err(|_| {
                Error::Authentication(format!(
                    "environment variable '{}' is not set",
                    env_name
                ))
            }),
            None => Ok(None),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn build_request(
        &self,
        path: &str,
        body: Bytes,
        extra_headers: &[(&str, String)],
    ) -> Result<Request<Full<Bytes>>> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(self.url(path))
            .header("content-type", "application/json");

        if let Some(key) = self.resolve_api_key()? {
            match self.adapter {
                AdapterKind::AnthropicPassthrough => {
                    builder = builder.header("x-api-key", key);
                }
                AdapterKind::Openai | AdapterKind::OpenaiCompatible => {
                    builder = builder.header("authorization", format!("Bearer {}", key));
                }
            }
        }
        for (name, value) in extra_headers {
            builder = builder.header(*name, value.as_str());
        }

        builder
            .body(Full::new(body))
            .map_err(|e| Error::Http(e.to_string()))
    }

    /// POST and return the raw response without status mapping. Streaming
    /// callers consume the body frame by frame under their own read timeout.
    pub async fn post_raw(
        &self,
        path: &str,
        body: Bytes,
        extra_headers: &[(&str, String)],
    ) -> Result<hyper::Response<Incoming>> {
        let request = self.build_request(path, body, extra_headers)?;
        debug!(url = %self.url(path), "sending downstream request");

        match tokio::time::timeout(self.read_timeout, self.http.request(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(Error::Http(e.to_string())),
            Err(_) => Err(Error::Timeout(self.read_timeout)),
        }
    }

    /// POST and fully read the response, mapping non-success statuses onto
    /// the proxy error taxonomy.
    pub async fn post_json(
        &self,
        path: &str,
        body: Bytes,
        extra_headers: &[(&str, String)],
    ) -> Result<Bytes> {
        let response = self.post_raw(path, body, extra_headers).await?;
        let status = response.status();

        let collected = tokio::time::timeout(self.read_timeout, response.into_body().collect())
            .await
            .map_err(|_| Error::Timeout(self.read_timeout))?
            .map_err(|e| Error::Http(e.to_string()))?;
        let bytes = collected.to_bytes();

        if !status.is_success() {
            let preview: String = String::from_utf8_lossy(&bytes).chars().take(500).collect();
            return Err(map_upstream_status(status.as_u16(), &preview));
        }
        Ok(bytes)
    }

    /// Like `post_raw`, but a non-success status is read out and mapped.
    /// Used by the streaming paths before the SSE relay starts.
    pub async fn post_streaming(
        &self,
        path: &str,
        body: Bytes,
        extra_headers: &[(&str, String)],
    ) -> Result<hyper::Response<Incoming>> {
        let response = self.post_raw(path, body, extra_headers).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let collected = tokio::time::timeout(self.read_timeout, response.into_body().collect())
            .await
            .map_err(|_| Error::Timeout(self.read_timeout))?
            .map_err(|e| Error::Http(e.to_string()))?;
        let preview: String = String::from_utf8_lossy(&collected.to_bytes())
            .chars()
            .take(500)
            .collect();
        Err(map_upstream_status(status.as_u16(), &preview))
    }
}

/// Memoises constructed downstream clients keyed by the whole provider config
/// plus the model name. Discarded wholesale on config reload.
///
/// A miss may race: both builders construct a client, the first insert wins
/// and the loser's client is dropped. Correctness does not depend on dedup.
pub struct ClientCache {
    inner: RwLock<HashMap<(ProviderConfig, String), Arc<ProviderClient>>>,
}

impl ClientCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_or_create(
        &self,
        provider: &ProviderConfig,
        model: &str,
        timeouts: &TimeoutsConfig,
    ) -> Arc<ProviderClient> {
        let key = (provider.clone(), model.to_string());
        if let Some(client) = self.inner.read().get(&key) {
            return client.clone();
        }

        let client = Arc::new(ProviderClient::new(provider, timeouts));
        let mut cache = self.inner.write();
        cache.entry(key).or_insert_with(|| client.clone()).clone()
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }
}

impl Default for ClientCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ensure_crypto_provider() {
        static INIT: std::sync::Once = std::sync::Once::new();
        INIT.call_once(|| {
            let _ = rustls::crypto::ring::default_provider().install_default();
        });
    }

    fn provider(adapter: AdapterKind) -> ProviderConfig {
        ProviderConfig {
            base_url: "https://api.example.com/v1/".to_string(),
            adapter,
            api_key_env: None,
            tools: None,
            timeouts_ms: None,
        }
    }

    #[test]
    fn test_url_join_trims_trailing_slash() {
        ensure_crypto_provider();
        let client = ProviderClient::new(&provider(AdapterKind::Openai), &TimeoutsConfig::default());
        assert_eq!(client.url("/responses"), "https://api.example.com/v1/responses");
    }

    #[test]
    fn test_resolve_api_key_missing_env_is_auth_error() {
        ensure_crypto_provider();
        let mut config = provider(AdapterKind::Openai);
        config.api_key_env = Some("AMUX_TEST_KEY_THAT_DOES_NOT_EXIST".to_string());
        let client = ProviderClient::new(&config, &TimeoutsConfig::default());
        let err = client.resolve_api_key().unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[test]
    fn test_resolve_api_key_absent_env_name_is_ok() {
        ensure_crypto_provider();
        let client = ProviderClient::new(&provider(AdapterKind::Openai), &TimeoutsConfig::default());
        assert!(client.resolve_api_key().unwrap().is_none());
    }

    #[test]
    fn test_cache_memoises_by_provider_and_model() {
        ensure_crypto_provider();
        let cache = ClientCache::new();
        let timeouts = TimeoutsConfig::default();
        let p = provider(AdapterKind::Openai);

        let a = cache.get_or_create(&p, "gpt-5", &timeouts);
        let b = cache.get_or_create(&p, "gpt-5", &timeouts);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);

        let _ = cache.get_or_create(&p, "gpt-5-mini", &timeouts);
        assert_eq!(cache.len(), 2);

        // Same base URL, different adapter: distinct entry.
        let q = provider(AdapterKind::OpenaiCompatible);
        let _ = cache.get_or_create(&q, "gpt-5", &timeouts);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_cache_clear() {
        ensure_crypto_provider();
        let cache = ClientCache::new();
        let timeouts = TimeoutsConfig::default();
        let _ = cache.get_or_create(&provider(AdapterKind::Openai), "m", &timeouts);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert_eq!(cache.len(), 0);
    }
}
