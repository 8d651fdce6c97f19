use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, RawQuery, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;

use crate::error::{GatewayError, Result};
use crate::manager::ServiceManager;
use crate::sse::{classify_line, is_event_stream, rewrite_endpoint_data, SseLine};

/// Headers that describe the hop between gateway and backend, not the
/// resource itself — never copied onto the client-facing response.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn copy_response_headers(upstream: &HeaderMap, out: &mut HeaderMap) {
    for (key, value) in upstream.iter() {
        if HOP_BY_HOP_HEADERS.contains(&key.as_str()) {
            continue;
        }
        out.insert(key, value.clone());
    }
}

pub struct AppState {
    pub manager: Arc<ServiceManager>,
    pub http_client: reqwest::Client,
}

/// `/{name}/{*rest}` — reverse proxy one request straight through to the
/// named backend. Non-SSE responses pass through verbatim; `text/event-stream`
/// responses are parsed line by line so `endpoint` events can be rewritten to
/// route back through the gateway.
///
/// Target URL is chosen by the *last* path segment: `sse` and `message` map
/// to the backend's dedicated SSE/message URLs, anything else is joined onto
/// the backend's base URL verbatim.
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    Path((name, rest)): Path<(String, String)>,
    method: Method,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Body,
) -> Result<Response> {
    let service = state.manager.get(&name).await?;

    let mut target = match rest.rsplit('/').next() {
        Some("sse") => service.get_sse_url().await,
        Some("message") => service.get_message_url().await,
        _ => {
            let base = service.get_url().await;
            if base.is_empty() {
                String::new()
            } else {
                format!("{base}/{rest}")
            }
        }
    };
    if target.is_empty() {
        return Err(GatewayError::NotRunning(name));
    }
    if let Some(query) = query {
        if !query.is_empty() {
            target.push(if target.contains('?') { '&' } else { '?' });
            target.push_str(&query);
        }
    }

    let mut request = state.http_client.request(method, &target);
    for (key, value) in headers.iter() {
        if key == axum::http::header::HOST {
            continue;
        }
        request = request.header(key, value);
    }
    let body_bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| GatewayError::Other(anyhow::anyhow!(e)))?;
    if !body_bytes.is_empty() {
        request = request.body(body_bytes);
    }

    let upstream = request.send().await?;
    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = upstream
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let upstream_headers = upstream.headers().clone();

    if is_event_stream(content_type.as_deref()) {
        let name = name.clone();
        let stream = upstream.bytes_stream();
        let reader = tokio_util::io::StreamReader::new(
            stream.map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))),
        );
        let rewritten = rewrite_sse_body(name, reader);
        let mut response = Response::new(Body::from_stream(rewritten));
        *response.status_mut() = status;
        copy_response_headers(&upstream_headers, response.headers_mut());
        response
            .headers_mut()
            .insert(axum::http::header::CONTENT_TYPE, "text/event-stream".parse().unwrap());
        response
            .headers_mut()
            .insert(axum::http::header::CACHE_CONTROL, "no-cache".parse().unwrap());
        response
            .headers_mut()
            .insert(axum::http::header::CONNECTION, "keep-alive".parse().unwrap());
        return Ok(response);
    }

    let bytes = upstream
        .bytes()
        .await
        .map_err(|e| GatewayError::Other(anyhow::anyhow!(e)))?;
    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    copy_response_headers(&upstream_headers, response.headers_mut());
    Ok(response)
}

fn rewrite_sse_body<R>(
    service_name: String,
    reader: R,
) -> impl futures::Stream<Item = std::result::Result<bytes::Bytes, std::io::Error>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    use tokio::io::{AsyncBufReadExt, BufReader};
    let mut lines = BufReader::new(reader).lines();
    async_stream::stream! {
        let mut current_event: Option<String> = None;
        loop {
            match lines.next_line().await {
                Ok(Some(raw)) => match classify_line(&raw) {
                    SseLine::Event(name) => {
                        yield Ok(bytes::Bytes::from(format!("event: {name}\n")));
                        current_event = Some(name);
                    }
                    SseLine::Data(payload) => {
                        let rewritten =
                            rewrite_endpoint_data(&service_name, current_event.as_deref(), &payload);
                        yield Ok(bytes::Bytes::from(format!("data: {rewritten}\n")));
                    }
                    SseLine::Blank => yield Ok(bytes::Bytes::from("\n")),
                    SseLine::Other(line) => yield Ok(bytes::Bytes::from(format!("{line}\n"))),
                },
                Ok(None) => break,
                Err(error) => {
                    yield Err(error);
                    break;
                }
            }
        }
    }
}

/// Closes a global proxy session when dropped, not when the generator runs to
/// completion: axum drops the response body stream mid-`.await` on client
/// disconnect without resuming it, so cleanup tied to code after the last
/// reached `yield` would never run. Spawns the close rather than awaiting it
/// since `Drop` cannot be async.
struct SessionGuard {
    manager: Arc<ServiceManager>,
    session_id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let manager = self.manager.clone();
        let session_id = std::mem::take(&mut self.session_id);
        tokio::spawn(async move {
            manager.close_proxy_session(&session_id).await;
        });
    }
}

/// `GET /sse` — open a new global session, stream its fan-in channel back to
/// the client as SSE, leading with an `endpoint` event the client uses to
/// address future `POST /message` calls.
pub async fn global_sse_handler(State(state): State<Arc<AppState>>) -> Response {
    let (session, rx) = state.manager.create_proxy_session().await;
    let session_id = session.id.clone();

    let endpoint_event = format!("event: endpoint\ndata: /message?sessionId={session_id}\n\n");
    let stream = async_stream::stream! {
        let _guard = SessionGuard { manager: state.manager.clone(), session_id };
        yield Ok::<_, std::io::Error>(bytes::Bytes::from(endpoint_event));
        let mut rx = rx;
        while let Some(data) = rx.recv().await {
            yield Ok(bytes::Bytes::from(format!("data: {data}\n\n")));
        }
    };

    let mut response = Response::new(Body::from_stream(stream));
    response
        .headers_mut()
        .insert(axum::http::header::CONTENT_TYPE, "text/event-stream".parse().unwrap());
    response
}

#[derive(serde::Deserialize)]
pub struct MessageQuery {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

/// `POST /message?sessionId=<id>` — broadcast the request body to every
/// backend registered when that session was opened.
pub async fn global_message_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MessageQuery>,
    body: Body,
) -> Result<StatusCode> {
    let session_id = query.session_id.ok_or(GatewayError::MissingSessionId)?;
    let session = state.manager.get_proxy_session(&session_id).await?;
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| GatewayError::Other(anyhow::anyhow!(e)))?;
    let text = String::from_utf8_lossy(&bytes).to_string();
    state.manager.broadcast(&session, &text).await?;
    Ok(StatusCode::ACCEPTED)
}
