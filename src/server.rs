//! HTTP dispatch: accepts Anthropic Messages requests, applies filters, asks
//! the router for a decision, and either forwards to Anthropic verbatim or
//! translates to the decided OpenAI dialect.

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use serde_json::Value;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::client::{ClientCache, ProviderClient};
use crate::config::{AdapterKind, Config};
use crate::error::{Error, Result};
use crate::filters::{filter_system_prompt, filter_tools};
use crate::format::anthropic::monotonic_nanos;
use crate::format::stream::{
    format_sse_event, ChatStreamTranslator, ResponsesStreamTranslator,
};
use crate::format::to_anthropic::{convert_chat_response, convert_responses_response};
use crate::format::to_openai::{build_chat_request, build_responses_request};
use crate::router::{apply_config_patch, decide};

/// Maximum inbound request body size (10 MB).
const MAX_REQUEST_SIZE: usize = 10 * 1024 * 1024;

pub type ProxyBody = BoxBody<Bytes, Infallible>;

/// Shared server state: the atomically swapped config snapshot and the
/// model-client cache. This is the only process-wide mutable state.
pub struct ServerState {
    config: RwLock<Arc<Config>>,
    pub clients: ClientCache,
}

impl ServerState {
    pub fn new(config: Config) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
            clients: ClientCache::new(),
        }
    }

    /// Capture the current config snapshot. A request holds this for its
    /// whole lifetime; a mid-flight reload never affects it.
    pub fn config(&self) -> Arc<Config> {
        self.config.read().clone()
    }

    /// Atomically swap in a validated config and drop all cached clients.
    pub fn swap_config(&self, config: Config) {
        *self.config.write() = Arc::new(config);
        self.clients.clear();
    }
}

/// Handle one TCP connection: HTTP/1.1 with keep-alive.
pub async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    state: Arc<ServerState>,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req| {
        let state = state.clone();
        let remote = remote_addr;
        async move { handle_request(req, state, remote).await }
    });

    http1::Builder::new()
        .keep_alive(true)
        .serve_connection(io, service)
        .await?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ServerState>,
    remote_addr: SocketAddr,
) -> std::result::Result<Response<ProxyBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(generate_request_id);

    debug!(
        method = %method,
        path = %path,
        remote = %remote_addr,
        request_id = %request_id,
        "received request"
    );

    let start = std::time::Instant::now();

    let response = match (method.clone(), path.as_str()) {
        (Method::POST, "/v1/messages") | (Method::POST, "/messages") => {
            handle_messages(req, &state, &request_id).await
        }
        (Method::GET, "/") | (Method::GET, "/health") => Ok(json_response(
            StatusCode::OK,
            r#"{"status":"ok"}"#,
            &request_id,
        )),
        _ => Ok(json_response(
            StatusCode::NOT_FOUND,
            r#"{"type":"error","error":{"type":"not_found_error","message":"Not found"}}"#,
            &request_id,
        )),
    };

    let duration = start.elapsed();
    match response {
        Ok(resp) => {
            let status = resp.status().as_u16();
            if status >= 400 {
                warn!(
                    method = %method,
                    path = %path,
                    status = status,
                    duration_ms = duration.as_millis(),
                    request_id = %request_id,
                    "request failed"
                );
            } else {
                info!(
                    method = %method,
                    path = %path,
                    status = status,
                    duration_ms = duration.as_millis(),
                    request_id = %request_id,
                    "request completed"
                );
            }
            Ok(resp)
        }
        Err(e) => {
            warn!(
                method = %method,
                path = %path,
                status = e.status().as_u16(),
                duration_ms = duration.as_millis(),
                request_id = %request_id,
                error = %e,
                "request error"
            );
            Ok(error_response(&e, &request_id))
        }
    }
}

async fn handle_messages(
    req: Request<Incoming>,
    state: &Arc<ServerState>,
    request_id: &str,
) -> Result<Response<ProxyBody>> {
    let content_type = req
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.contains("application/json") {
        return Err(Error::InvalidRequest(
            "Content-Type must be application/json".to_string(),
        ));
    }

    if let Some(len) = req.headers().get("content-length")
        && let Ok(len) = len.to_str().unwrap_or("").parse::<usize>()
        && len > MAX_REQUEST_SIZE
    {
        return Err(Error::InvalidRequest(format!(
            "request body too large: {} bytes (max {})",
            len, MAX_REQUEST_SIZE
        )));
    }

    let headers = req.headers().clone();
    let body_bytes = read_body_limited(req.into_body(), MAX_REQUEST_SIZE).await?;
    let body: Value = serde_json::from_slice(&body_bytes)
        .map_err(|e| Error::InvalidRequest(format!("malformed JSON body: {}", e)))?;

    // Snapshot the config for the whole request.
    let config = state.config();

    // Global tool policy first; provider selection may depend on the
    // post-filter tool list via has_tool, so the provider-specific policy is
    // re-applied after routing when it differs.
    let body = filter_tools(&body, &config.tools);
    let mut body = filter_system_prompt(&body, &config.system_prompt_filters.clause_filters);

    let decision = decide(&config, &headers, &body)?;

    if let Some(provider_policy) = &decision.provider.tools
        && *provider_policy != config.tools
    {
        body = filter_tools(&body, provider_policy);
    }

    if let Some(patch) = decision.config_patch {
        apply_config_patch(&mut body, patch);
    }

    info!(
        provider = %decision.provider_name,
        adapter = decision.adapter.as_str(),
        model = %decision.effective_model,
        request_id = %request_id,
        "routing decision"
    );

    let timeouts = config.timeouts_for(decision.provider);
    let client = state
        .clients
        .get_or_create(decision.provider, &decision.effective_model, timeouts);

    match decision.adapter {
        AdapterKind::AnthropicPassthrough => {
            forward_passthrough(&client, &body, &headers, request_id).await
        }
        AdapterKind::Openai => {
            let request = build_responses_request(&config, &body, &decision.effective_model)?;
            let payload = Bytes::from(serde_json::to_vec(&request)?);
            if request.stream {
                let upstream = client.post_streaming("/responses", payload, &[]).await?;
                Ok(sse_response(
                    relay_sse(
                        upstream.into_body(),
                        SseTranslator::Responses(ResponsesStreamTranslator::new(
                            &decision.effective_model,
                        )),
                        client.read_timeout(),
                    ),
                    request_id,
                ))
            } else {
                let bytes = client.post_json("/responses", payload, &[]).await?;
                let response = serde_json::from_slice(&bytes).map_err(|e| Error::Api {
                    status: 502,
                    message: format!("unparseable downstream response: {}", e),
                })?;
                let message =
                    convert_responses_response(&response, &decision.effective_model);
                Ok(json_response(
                    StatusCode::OK,
                    &serde_json::to_string(&message)?,
                    request_id,
                ))
            }
        }
        AdapterKind::OpenaiCompatible => {
            let request = build_chat_request(&config, &body, &decision.effective_model)?;
            let payload = Bytes::from(serde_json::to_vec(&request)?);
            if request.stream {
                let upstream = client
                    .post_streaming("/chat/completions", payload, &[])
                    .await?;
                Ok(sse_response(
                    relay_sse(
                        upstream.into_body(),
                        SseTranslator::Chat(ChatStreamTranslator::new(
                            &decision.effective_model,
                        )),
                        client.read_timeout(),
                    ),
                    request_id,
                ))
            } else {
                let bytes = client
                    .post_json("/chat/completions", payload, &[])
                    .await?;
                let response = serde_json::from_slice(&bytes).map_err(|e| Error::Api {
                    status: 502,
                    message: format!("unparseable downstream response: {}", e),
                })?;
                let message = convert_chat_response(&response, &decision.effective_model);
                Ok(json_response(
                    StatusCode::OK,
                    &serde_json::to_string(&message)?,
                    request_id,
                ))
            }
        }
    }
}

/// Passthrough: re-encode the filtered body and forward it to the Anthropic
/// backend verbatim, relaying status and body bytes unmodified (streamed
/// frame by frame in both directions' framing).
async fn forward_passthrough(
    client: &Arc<ProviderClient>,
    body: &Value,
    inbound_headers: &HeaderMap,
    request_id: &str,
) -> Result<Response<ProxyBody>> {
    let payload = Bytes::from(serde_json::to_vec(body)?);

    // Carry the caller's own credentials and API directives through. The
    // provider's api_key_env, when set, takes precedence over an inbound
    // x-api-key (the client adds it itself).
    let mut extra: Vec<(&str, String)> = Vec::new();
    let has_provider_key = client.resolve_api_key()?.is_some();
    for name in ["x-api-key", "authorization", "anthropic-version", "anthropic-beta"] {
        if has_provider_key && name == "x-api-key" {
            continue;
        }
        if let Some(value) = inbound_headers.get(name).and_then(|v| v.to_str().ok()) {
            extra.push((name, value.to_string()));
        }
    }

    let upstream = client.post_raw("/v1/messages", payload, &extra).await?;
    let status = upstream.status();
    let content_type = upstream
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();

    let read_timeout = client.read_timeout();
    let (tx, rx) = mpsc::channel::<Bytes>(32);
    let mut upstream_body = upstream.into_body();
    tokio::spawn(async move {
        loop {
            match tokio::time::timeout(read_timeout, upstream_body.frame()).await {
                Ok(Some(Ok(frame))) => {
                    if let Ok(data) = frame.into_data()
                        && tx.send(data).await.is_err()
                    {
                        // Client disconnected; dropping the upstream body
                        // cancels the downstream call.
                        return;
                    }
                }
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "passthrough relay error");
                    return;
                }
                Ok(None) => return,
                Err(_) => {
                    warn!("passthrough read timeout");
                    return;
                }
            }
        }
    });

    Ok(Response::builder()
        .status(status)
        .header("content-type", content_type)
        .header("x-request-id", request_id)
        .body(channel_body(rx))
        .expect("valid passthrough response"))
}

/// The two streaming translators behind one relay loop.
enum SseTranslator {
    Responses(ResponsesStreamTranslator),
    Chat(ChatStreamTranslator),
}

impl SseTranslator {
    fn feed(&mut self, chunk: &str) -> Vec<crate::format::anthropic::StreamEvent> {
        match self {
            SseTranslator::Responses(t) => t.feed(chunk),
            SseTranslator::Chat(t) => t.feed(chunk),
        }
    }

    fn finish(&mut self) -> Vec<crate::format::anthropic::StreamEvent> {
        match self {
            SseTranslator::Responses(t) => t.finish(),
            SseTranslator::Chat(t) => t.finish(),
        }
    }

    fn fail(&mut self, error: &Error) -> Vec<crate::format::anthropic::StreamEvent> {
        match self {
            SseTranslator::Responses(t) => t.fail(error),
            SseTranslator::Chat(t) => t.fail(error),
        }
    }
}

/// Pump downstream frames through the translator, writing each Anthropic SSE
/// event as soon as it is produced. The `read` timeout bounds the gap between
/// consecutive downstream frames; exceeding it closes the stream with the
/// mid-stream error epilogue.
fn relay_sse(
    mut upstream: Incoming,
    mut translator: SseTranslator,
    read_timeout: Duration,
) -> ProxyBody {
    let (tx, rx) = mpsc::channel::<Bytes>(32);

    tokio::spawn(async move {
        let send_events = |events: Vec<crate::format::anthropic::StreamEvent>,
                           tx: mpsc::Sender<Bytes>| async move {
            for event in events {
                if tx
                    .send(Bytes::from(format_sse_event(&event)))
                    .await
                    .is_err()
                {
                    return false;
                }
            }
            true
        };

        loop {
            match tokio::time::timeout(read_timeout, upstream.frame()).await {
                Ok(Some(Ok(frame))) => {
                    let Ok(data) = frame.into_data() else {
                        continue;
                    };
                    let chunk = String::from_utf8_lossy(&data).into_owned();
                    let events = translator.feed(&chunk);
                    if !send_events(events, tx.clone()).await {
                        return;
                    }
                }
                Ok(Some(Err(e))) => {
                    let error = Error::Http(e.to_string());
                    let _ = send_events(translator.fail(&error), tx.clone()).await;
                    return;
                }
                Ok(None) => {
                    let _ = send_events(translator.finish(), tx.clone()).await;
                    return;
                }
                Err(_) => {
                    let error = Error::Timeout(read_timeout);
                    let _ = send_events(translator.fail(&error), tx.clone()).await;
                    return;
                }
            }
        }
    });

    channel_body(rx)
}

fn channel_body(rx: mpsc::Receiver<Bytes>) -> ProxyBody {
    let stream = ReceiverStream::new(rx).map(|bytes| Ok::<_, Infallible>(Frame::data(bytes)));
    BoxBody::new(StreamBody::new(stream))
}

fn full_body(content: impl Into<Bytes>) -> ProxyBody {
    BoxBody::new(Full::new(content.into()).map_err(|never| match never {}))
}

fn json_response(status: StatusCode, body: &str, request_id: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .header("x-request-id", request_id)
        .body(full_body(body.to_string()))
        .expect("valid json response")
}

fn sse_response(body: ProxyBody, request_id: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("x-request-id", request_id)
        .body(body)
        .expect("valid sse response")
}

/// Render a proxy error as an Anthropic-format error object.
pub fn error_response(error: &Error, request_id: &str) -> Response<ProxyBody> {
    let body = serde_json::json!({
        "type": "error",
        "error": {
            "type": error.kind(),
            "message": error.to_string(),
        }
    });
    json_response(error.status(), &body.to_string(), request_id)
}

async fn read_body_limited(body: Incoming, max_size: usize) -> Result<Bytes> {
    let collected = body
        .collect()
        .await
        .map_err(|e| Error::Http(format!("failed to read request body: {}", e)))?;
    let bytes = collected.to_bytes();
    if bytes.len() > max_size {
        return Err(Error::InvalidRequest(format!(
            "request body too large: {} bytes (max {})",
            bytes.len(),
            max_size
        )));
    }
    Ok(bytes)
}

fn generate_request_id() -> String {
    format!("req_{:016x}", monotonic_nanos() as u64)
}
