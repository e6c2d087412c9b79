use colored::*;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::characters;
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::providers::{ErrorBody, RelayRequest};
use crate::relay::Relay;

/// Path of the chat relay endpoint.
pub const RELAY_PATH: &str = "/roleplay-chat";

/// Custom headers browser clients send with the relay request.
pub const CORS_ALLOW_HEADERS: &str = "authorization, x-client-info, apikey, content-type, \
x-supabase-client-platform, x-supabase-client-platform-version, \
x-supabase-client-runtime, x-supabase-client-runtime-version";

/// Cap on the request line plus headers.
pub const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Cap on a request body. Images travel as URLs, so chat bodies stay small.
pub const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// A parsed HTTP/1.1 request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    /// Path without the query string.
    pub path: String,
    pub body: Vec<u8>,
}

/// Read one request head with `httparse`, then the body up to `Content-Length`.
///
/// Returns `Ok(None)` when the peer closes the connection before sending a
/// complete head.
pub async fn read_request<R>(stream: &mut R) -> Result<Option<HttpRequest>>
where
    R: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(&buf) {
            Ok(httparse::Status::Complete(head_len)) => {
                let method = req.method.unwrap_or("GET").to_string();
                let target = req.path.unwrap_or("/");
                let path = target.split('?').next().unwrap_or("/").to_string();
                let content_length = req
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("content-length"))
                    .and_then(|h| std::str::from_utf8(h.value).ok())
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);

                if content_length > MAX_BODY_BYTES {
                    return Err(RelayError::PayloadTooLarge(content_length));
                }

                let mut body = buf[head_len..].to_vec();
                while body.len() < content_length {
                    let n = stream.read(&mut chunk).await?;
                    if n == 0 {
                        break;
                    }
                    body.extend_from_slice(&chunk[..n]);
                }
                body.truncate(content_length);

                return Ok(Some(HttpRequest { method, path, body }));
            }
            Ok(httparse::Status::Partial) => {
                if buf.len() > MAX_HEAD_BYTES {
                    return Err(RelayError::BadRequest("request head too large".to_string()));
                }
            }
            Err(e) => {
                return Err(RelayError::BadRequest(format!("malformed request: {e}")));
            }
        }
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        402 => "Payment Required",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

fn cors_headers() -> String {
    format!(
        "Access-Control-Allow-Origin: *\r\nAccess-Control-Allow-Headers: {}\r\nAccess-Control-Allow-Methods: GET, POST, OPTIONS\r\n",
        CORS_ALLOW_HEADERS
    )
}

async fn write_empty<W>(stream: &mut W, status: u16) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {} {}\r\n{}Content-Length: 0\r\nConnection: close\r\n\r\n",
        status,
        reason_phrase(status),
        cors_headers(),
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

async fn write_json<W, T>(stream: &mut W, status: u16, body: &T, extra_headers: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let body = serde_json::to_string(body)?;
    let response = format!(
        "HTTP/1.1 {} {}\r\n{}{}Content-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason_phrase(status),
        cors_headers(),
        extra_headers,
        body.len(),
        body,
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

/// `{"error": ...}` with the error's status; rate limits also carry `Retry-After`.
async fn write_error<W>(stream: &mut W, err: &RelayError) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let retry_after = err.retry_after_secs();
    let extra = retry_after
        .map(|secs| format!("Retry-After: {secs}\r\n"))
        .unwrap_or_default();
    let body = ErrorBody::new(err.user_message(), retry_after);
    write_json(stream, err.status_code(), &body, &extra).await
}

/// Copy the upstream event stream to the client chunk by chunk, as it arrives.
async fn pipe_event_stream<W>(stream: &mut W, upstream: reqwest::Response, relay: &Relay) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let head = format!(
        "HTTP/1.1 200 OK\r\n{}Content-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n",
        cors_headers(),
    );
    stream.write_all(head.as_bytes()).await?;

    let idle = relay.idle_timeout();
    let mut body = upstream.bytes_stream();
    let mut forwarded = 0usize;

    loop {
        let next = match tokio::time::timeout(idle, body.next()).await {
            Ok(next) => next,
            Err(_) => {
                warn!(?idle, forwarded, "upstream stream went idle, closing");
                break;
            }
        };
        match next {
            Some(Ok(bytes)) => {
                if stream.write_all(&bytes).await.is_err() {
                    debug!(forwarded, "client went away mid-stream");
                    break;
                }
                forwarded += bytes.len();
            }
            Some(Err(e)) => {
                warn!(error = %e, forwarded, "upstream stream failed mid-flight");
                break;
            }
            None => break,
        }
    }

    debug!(forwarded, "event stream finished");
    let _ = stream.flush().await;
    Ok(())
}

async fn relay_chat<W>(stream: &mut W, relay: &Relay, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let request: RelayRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => {
            let err = RelayError::BadRequest(format!("invalid request body: {e}"));
            return write_error(stream, &err).await;
        }
    };

    match relay.forward(&request).await {
        Ok(upstream) => pipe_event_stream(stream, upstream, relay).await,
        Err(err) => write_error(stream, &err).await,
    }
}

/// Serve one connection: read a request, route it, write the response.
pub async fn handle_connection<S>(mut stream: S, relay: Relay) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = match read_request(&mut stream).await {
        Ok(Some(r)) => r,
        Ok(None) => return Ok(()),
        Err(err) => {
            write_error(&mut stream, &err).await?;
            return Ok(());
        }
    };

    debug!(method = %request.method, path = %request.path, "request");

    match (request.method.as_str(), request.path.as_str()) {
        ("OPTIONS", _) => write_empty(&mut stream, 204).await?,
        ("POST", RELAY_PATH) => relay_chat(&mut stream, &relay, &request.body).await?,
        (_, RELAY_PATH) => write_empty(&mut stream, 405).await?,
        ("GET", "/health") => {
            write_json(&mut stream, 200, &serde_json::json!({"status": "ok"}), "").await?
        }
        ("GET", "/characters") => write_json(&mut stream, 200, characters::all(), "").await?,
        _ => {
            write_json(&mut stream, 404, &ErrorBody::new("Not Found", None), "").await?
        }
    }

    let _ = stream.shutdown().await;
    Ok(())
}

/// Accept connections forever, one task per connection.
pub async fn serve(listener: TcpListener, relay: Relay) -> Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        let relay = relay.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, relay).await {
                warn!(peer = %addr, error = %e, "connection error");
            }
        });
    }
}

/// Bind `config.bind` and run the relay.
pub async fn run(config: RelayConfig) -> Result<()> {
    if config.api_key().is_none() {
        warn!("no upstream API key configured; every chat request will fail with a configuration error");
    }
    let listener = TcpListener::bind(&config.bind).await?;
    let addr = listener.local_addr()?;
    let relay = Relay::new(config)?;

    eprintln!(
        "{}",
        format!("  Relay listening on http://{}{}", addr, RELAY_PATH).bright_green()
    );
    eprintln!("{}", "  Press Ctrl+C to stop.".bright_blue());
    info!(%addr, upstream = %relay.config().upstream_url, model = %relay.config().model, "relay started");

    serve(listener, relay).await
}
