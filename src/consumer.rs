//! Stream consumer: turns a relay response body into a lazy sequence of text deltas.
//!
//! The sequence is pull-based. Each network read is bounded by a read timeout and
//! raced against a [`CancellationToken`]; cancelling ends the sequence at once and
//! drops the body, which releases the connection.

use std::pin::Pin;
use std::time::Duration;

use async_stream::try_stream;
use futures_util::Stream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{RelayError, Result};
use crate::sse::{SseFrame, SseParser};

/// Boxed delta sequence handed out by [`crate::client::RelayClient`].
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Drive `body` through an [`SseParser`], yielding each non-empty delta.
///
/// Ends after `[DONE]`, at end of body, or on cancellation. A read that takes
/// longer than `read_timeout` fails with [`RelayError::Timeout`].
pub fn delta_stream<S, B, E>(
    mut body: S,
    cancel: CancellationToken,
    read_timeout: Duration,
) -> impl Stream<Item = Result<String>> + Send
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Into<RelayError> + Send,
{
    try_stream! {
        let mut parser = SseParser::new();
        let mut cancelled = false;

        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                read = tokio::time::timeout(read_timeout, body.next()) => Some(read),
            };
            let Some(read) = read else {
                debug!("delta stream cancelled");
                cancelled = true;
                break;
            };

            let chunk: B = match read {
                Err(_) => Err(RelayError::Timeout(read_timeout))?,
                Ok(None) => break,
                Ok(Some(Err(e))) => Err::<B, RelayError>(e.into())?,
                Ok(Some(Ok(chunk))) => chunk,
            };

            for frame in parser.feed(chunk.as_ref())? {
                if let SseFrame::Delta(text) = frame {
                    yield text;
                }
            }
            if parser.is_done() {
                debug!("received [DONE], closing delta stream");
                break;
            }
        }

        if !cancelled {
            for frame in parser.finish()? {
                if let SseFrame::Delta(text) = frame {
                    yield text;
                }
            }
        }
    }
}

/// [`delta_stream`] over a live HTTP response.
pub fn from_response(
    response: reqwest::Response,
    cancel: CancellationToken,
    read_timeout: Duration,
) -> DeltaStream {
    Box::pin(delta_stream(response.bytes_stream(), cancel, read_timeout))
}

/// Accumulate every delta into the final assistant content, pushing each one to
/// `on_delta` as it arrives.
///
/// The returned text always equals the concatenation of the deltas seen, in order.
pub async fn collect_text<S, F>(mut stream: S, mut on_delta: F) -> Result<String>
where
    S: Stream<Item = Result<String>> + Unpin,
    F: FnMut(&str),
{
    let mut content = String::new();
    while let Some(delta) = stream.next().await {
        let delta = delta?;
        content.push_str(&delta);
        on_delta(&delta);
    }
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(content: &str) -> Vec<u8> {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices":[{"delta":{"content":content}}]})
        )
        .into_bytes()
    }

    fn body(chunks: Vec<Vec<u8>>) -> impl Stream<Item = std::result::Result<Vec<u8>, RelayError>> + Unpin + Send {
        tokio_stream::iter(chunks.into_iter().map(Ok))
    }

    #[tokio::test]
    async fn test_collects_deltas_in_order() {
        let stream = delta_stream(
            body(vec![frame("Hi"), frame(" there")]),
            CancellationToken::new(),
            Duration::from_secs(5),
        );
        let mut seen = Vec::new();
        let text = collect_text(Box::pin(stream), |d| seen.push(d.to_string())).await.unwrap();
        assert_eq!(text, "Hi there");
        assert_eq!(seen, vec!["Hi", " there"]);
    }

    #[tokio::test]
    async fn test_stops_at_done() {
        let mut tail = b"data: [DONE]\n\n".to_vec();
        tail.extend(frame("never"));
        let stream = delta_stream(
            body(vec![frame("a"), tail]),
            CancellationToken::new(),
            Duration::from_secs(5),
        );
        let text = collect_text(Box::pin(stream), |_| {}).await.unwrap();
        assert_eq!(text, "a");
    }

    #[tokio::test]
    async fn test_done_stops_reading_the_body() {
        // A body that would hang forever after [DONE] must not be polled again.
        let head = tokio_stream::iter(vec![Ok::<_, RelayError>(b"data: [DONE]\n\n".to_vec())]);
        let endless = head.chain(tokio_stream::pending());
        let stream = delta_stream(endless, CancellationToken::new(), Duration::from_secs(30));
        let text = tokio::time::timeout(
            Duration::from_secs(2),
            collect_text(Box::pin(stream), |_| {}),
        )
        .await
        .expect("stream should end at [DONE]")
        .unwrap();
        assert!(text.is_empty());
    }

    #[tokio::test]
    async fn test_byte_at_a_time_chunks() {
        let data = [frame("chunk"), frame("ed ✨")].concat();
        let chunks: Vec<Vec<u8>> = data.iter().map(|b| vec![*b]).collect();
        let stream = delta_stream(body(chunks), CancellationToken::new(), Duration::from_secs(5));
        let text = collect_text(Box::pin(stream), |_| {}).await.unwrap();
        assert_eq!(text, "chunked ✨");
    }

    #[tokio::test]
    async fn test_transport_error_is_surfaced() {
        let chunks = vec![
            Ok(frame("partial")),
            Err(RelayError::Network("connection reset".into())),
        ];
        let stream = delta_stream(
            tokio_stream::iter(chunks),
            CancellationToken::new(),
            Duration::from_secs(5),
        );
        let err = collect_text(Box::pin(stream), |_| {}).await.unwrap_err();
        assert!(matches!(err, RelayError::Network(_)));
    }

    #[tokio::test]
    async fn test_read_timeout_fails_the_stream() {
        let stalled = tokio_stream::pending::<std::result::Result<Vec<u8>, RelayError>>();
        let stream = delta_stream(stalled, CancellationToken::new(), Duration::from_millis(50));
        let err = collect_text(Box::pin(stream), |_| {}).await.unwrap_err();
        assert!(matches!(err, RelayError::Timeout(_)));
        assert_eq!(err.status_code(), 503);
    }

    #[tokio::test]
    async fn test_cancellation_ends_stream_without_error() {
        let cancel = CancellationToken::new();
        let head = tokio_stream::iter(vec![Ok::<_, RelayError>(frame("first"))]);
        let endless = head.chain(tokio_stream::pending());
        let mut stream = Box::pin(delta_stream(endless, cancel.clone(), Duration::from_secs(30)));

        assert_eq!(stream.next().await.unwrap().unwrap(), "first");
        cancel.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_yields_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let stream = delta_stream(body(vec![frame("x")]), cancel, Duration::from_secs(5));
        let text = collect_text(Box::pin(stream), |_| {}).await.unwrap();
        assert!(text.is_empty());
    }

    #[tokio::test]
    async fn test_truncated_stream_is_malformed() {
        let stream = delta_stream(
            body(vec![frame("ok"), b"data: {\"choices\":[{\"delta\":".to_vec()]),
            CancellationToken::new(),
            Duration::from_secs(5),
        );
        let err = collect_text(Box::pin(stream), |_| {}).await.unwrap_err();
        assert!(matches!(err, RelayError::MalformedFrame { .. }));
    }
}
