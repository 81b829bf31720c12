//! SSE `endpoint` event rewriting.
//!
//! MCP servers on the SSE transport announce the URL for follow-up POSTs in
//! an `endpoint` event:
//!
//! ```text
//! event: endpoint
//! data: http://backend:9000/messages?sessionId=abc
//! ```
//!
//! The backend host in that URL is replaced with the host the client used to
//! reach the proxy. Every other byte of the stream is forwarded untouched,
//! line terminators included.

use std::borrow::Cow;
use std::io;

use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Buffered chunks between the producer and the response body
const CHANNEL_CAPACITY: usize = 16;

/// Line-by-line rewriter for one SSE stream
#[derive(Debug, Clone)]
pub struct EndpointRewriter {
    backend_host: String,
    proxy_host: String,
    after_endpoint_event: bool,
}

impl EndpointRewriter {
    /// Replace `backend_host` with `proxy_host` in endpoint URLs
    pub fn new(backend_host: impl Into<String>, proxy_host: impl Into<String>) -> Self {
        Self {
            backend_host: backend_host.into(),
            proxy_host: proxy_host.into(),
            after_endpoint_event: false,
        }
    }

    /// Rewrite one line; `line` includes its terminator, if any
    pub fn rewrite_line<'a>(&mut self, line: &'a [u8]) -> Cow<'a, [u8]> {
        let content_len = line
            .iter()
            .rposition(|b| *b != b'\n' && *b != b'\r')
            .map_or(0, |i| i + 1);
        let (content, terminator) = line.split_at(content_len);
        let Ok(text) = std::str::from_utf8(content) else {
            self.after_endpoint_event = false;
            return Cow::Borrowed(line);
        };

        if std::mem::take(&mut self.after_endpoint_event) {
            if let Some(rewritten) = self.rewrite_data(text) {
                let mut out = rewritten.into_bytes();
                out.extend_from_slice(terminator);
                return Cow::Owned(out);
            }
        }

        if text
            .strip_prefix("event:")
            .is_some_and(|name| name.trim() == "endpoint")
        {
            self.after_endpoint_event = true;
        }
        Cow::Borrowed(line)
    }

    fn rewrite_data(&self, text: &str) -> Option<String> {
        let url = text.strip_prefix("data:")?;
        if self.backend_host.is_empty() || !url.contains(&self.backend_host) {
            return None;
        }
        let replaced = url.replacen(&self.backend_host, &self.proxy_host, 1);
        debug!(endpoint = %replaced.trim(), "Rewrote SSE endpoint");
        Some(format!("data:{replaced}"))
    }
}

/// Run `rewriter` over `upstream` on a background task.
///
/// The task ends when the upstream ends or fails, when the receiving side is
/// dropped (client went away), or when `shutdown` fires.
pub fn spawn_rewriter<S>(
    upstream: S,
    mut rewriter: EndpointRewriter,
    shutdown: CancellationToken,
) -> (ReceiverStream<io::Result<Bytes>>, JoinHandle<()>)
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    let task = tokio::spawn(async move {
        let mut reader = StreamReader::new(Box::pin(upstream.map_err(io::Error::other)));
        let mut line = Vec::new();

        loop {
            line.clear();
            let read = tokio::select! {
                () = tx.closed() => {
                    debug!("SSE client disconnected");
                    break;
                }
                () = shutdown.cancelled() => break,
                read = reader.read_until(b'\n', &mut line) => read,
            };

            let chunk = match read {
                Ok(0) => break,
                Ok(_) => Ok(Bytes::copy_from_slice(&rewriter.rewrite_line(&line))),
                Err(e) => Err(e),
            };
            let failed = chunk.is_err();

            tokio::select! {
                sent = tx.send(chunk) => {
                    if sent.is_err() || failed {
                        break;
                    }
                }
                () = shutdown.cancelled() => break,
            }
        }
        debug!("SSE stream closed");
    });

    (ReceiverStream::new(rx), task)
}
