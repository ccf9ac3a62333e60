//! Shared line-framed streaming infrastructure for both adapters.
//!
//! Both upstream dialects frame their streams on newlines: the generate
//! style is newline-delimited JSON, and the chat-completion style sends
//! one SSE `data:` payload per line. This module owns the byte-buffering
//! and cancellation plumbing; adapters supply a `parse_line` closure that
//! turns one line into a chunk (or `None` for framing noise).

use std::sync::Arc;

use weft_domain::stream::{BoxStream, StreamChunk};
use weft_domain::Result;
use weft_session::CancellationToken;

use crate::util::from_reqwest;

/// Extract complete lines from the buffer, leaving any partial tail for
/// the next call. Trailing `\r` is stripped.
pub(crate) fn drain_lines(buffer: &mut String) -> Vec<String> {
    let mut out = Vec::new();
    while let Some(pos) = buffer.find('\n') {
        let line: String = buffer.drain(..pos).collect();
        buffer.drain(..1); // the newline itself
        out.push(line.trim_end_matches('\r').to_owned());
    }
    out
}

/// Build a chunk stream from a streaming HTTP response.
///
/// The cancellation token is checked before each yield; once cancellation
/// is observed the remainder of the body is dropped silently. If the
/// upstream closes without a `done` chunk, a synthetic terminal chunk is
/// emitted so consumers always see exactly one `done`.
pub(crate) fn chunk_stream<F>(
    provider: &'static str,
    response: reqwest::Response,
    token: Arc<CancellationToken>,
    parse_line: F,
) -> BoxStream<'static, Result<StreamChunk>>
where
    F: Fn(&str) -> Option<StreamChunk> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut response = response;
        let mut buffer = String::new();
        let mut done_emitted = false;

        'body: loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    for line in drain_lines(&mut buffer) {
                        if let Some(chunk) = parse_line(&line) {
                            if token.check().is_err() {
                                tracing::debug!(
                                    provider,
                                    session_id = token.session_id(),
                                    "stream cancelled, dropping remainder"
                                );
                                break 'body;
                            }
                            if chunk.done {
                                done_emitted = true;
                            }
                            yield Ok(chunk);
                        }
                    }
                }
                Ok(None) => {
                    // Body closed: flush a partial final line, if any.
                    if !buffer.trim().is_empty() {
                        if let Some(chunk) = parse_line(buffer.trim_end()) {
                            if token.check().is_ok() {
                                if chunk.done {
                                    done_emitted = true;
                                }
                                yield Ok(chunk);
                            }
                        }
                    }
                    if !done_emitted && token.check().is_ok() {
                        yield Ok(StreamChunk {
                            done: true,
                            ..Default::default()
                        });
                    }
                    break;
                }
                Err(e) => {
                    yield Err(from_reqwest(provider, e));
                    break;
                }
            }
        }
    };

    Box::pin(stream)
}
