use crate::error::LlmError;
use bytes::{Buf, BytesMut};
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

/// One parsed Server-Sent-Event frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

type ByteChunk = Result<bytes::Bytes, LlmError>;
type InnerStream = Pin<Box<dyn Stream<Item = ByteChunk> + Send>>;

/// Decodes an arbitrary byte stream into complete SSE events, splitting on
/// blank-line (`\n\n`) event boundaries and concatenating multiple `data:`
/// lines per event. Pull-driven: nothing is parsed until polled. Dropping
/// the decoder drops the inner stream, which is this crate's equivalent of
/// an explicit `cancel()`.
pub struct SseDecoder {
    inner: InnerStream,
    buf: BytesMut,
    finished: bool,
}

impl SseDecoder {
    pub fn new(inner: impl Stream<Item = ByteChunk> + Send + 'static) -> Self {
        Self {
            inner: Box::pin(inner),
            buf: BytesMut::new(),
            finished: false,
        }
    }

    fn try_take_event(&mut self) -> Option<SseEvent> {
        let haystack = &self.buf[..];
        let boundary = find_subslice(haystack, b"\n\n").or_else(|| find_subslice(haystack, b"\r\n\r\n"));
        let (raw, consumed) = match boundary {
            Some((pos, len)) => (self.buf.split_to(pos).freeze(), len),
            None => return None,
        };
        self.buf.advance(consumed);
        Some(parse_event(&raw))
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<(usize, usize)> {
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| (pos, needle.len()))
}

fn parse_event(raw: &[u8]) -> SseEvent {
    let text = String::from_utf8_lossy(raw);
    let mut event = SseEvent::default();
    let mut data_lines = Vec::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("event:") {
            event.event = Some(rest.trim_start().to_string());
        } else if let Some(rest) = line.strip_prefix("id:") {
            event.id = Some(rest.trim_start().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start().to_string());
        }
    }
    event.data = data_lines.join("\n");
    event
}

impl Stream for SseDecoder {
    type Item = Result<SseEvent, LlmError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(event) = self.try_take_event() {
                if event.data.is_empty() && event.event.is_none() {
                    continue;
                }
                return Poll::Ready(Some(Ok(event)));
            }
            if self.finished {
                if self.buf.is_empty() {
                    return Poll::Ready(None);
                }
                let remainder = std::mem::take(&mut self.buf);
                let event = parse_event(&remainder);
                if event.data.is_empty() && event.event.is_none() {
                    return Poll::Ready(None);
                }
                return Poll::Ready(Some(Ok(event)));
            }
            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => self.buf.extend_from_slice(&chunk),
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => self.finished = true,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Decodes a byte stream of newline-delimited JSON values. Lines that fail
/// to parse are silently skipped, matching the permissive behavior of
/// provider NDJSON streams that may emit keep-alive blank lines.
pub struct NdjsonDecoder {
    inner: InnerStream,
    buf: BytesMut,
    finished: bool,
}

impl NdjsonDecoder {
    pub fn new(inner: impl Stream<Item = ByteChunk> + Send + 'static) -> Self {
        Self {
            inner: Box::pin(inner),
            buf: BytesMut::new(),
            finished: false,
        }
    }

    fn try_take_line(&mut self) -> Option<bytes::Bytes> {
        let pos = self.buf.iter().position(|b| *b == b'\n')?;
        let line = self.buf.split_to(pos).freeze();
        self.buf.advance(1);
        Some(line)
    }
}

impl Stream for NdjsonDecoder {
    type Item = Result<serde_json::Value, LlmError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(line) = self.try_take_line() {
                if let Some(value) = parse_ndjson_line(&line) {
                    return Poll::Ready(Some(Ok(value)));
                }
                continue;
            }
            if self.finished {
                if self.buf.is_empty() {
                    return Poll::Ready(None);
                }
                let remainder = std::mem::take(&mut self.buf);
                return match parse_ndjson_line(&remainder) {
                    Some(value) => Poll::Ready(Some(Ok(value))),
                    None => Poll::Ready(None),
                };
            }
            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => self.buf.extend_from_slice(&chunk),
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => self.finished = true,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

fn parse_ndjson_line(line: &[u8]) -> Option<serde_json::Value> {
    let text = std::str::from_utf8(line).ok()?.trim();
    if text.is_empty() {
        return None;
    }
    serde_json::from_str(text).ok()
}

/// Wraps an [`SseDecoder`], parses each frame's `data` as JSON, drops the
/// `[DONE]` sentinel, and silently skips invalid JSON payloads.
pub fn parse_json_sse_stream(
    inner: impl Stream<Item = ByteChunk> + Send + 'static,
) -> impl Stream<Item = Result<serde_json::Value, LlmError>> {
    use futures::StreamExt;
    SseDecoder::new(inner).filter_map(|event| async move {
        match event {
            Ok(event) => {
                let data = event.data.trim();
                if data.is_empty() || data == "[DONE]" {
                    None
                } else {
                    serde_json::from_str(data).ok().map(Ok)
                }
            }
            Err(e) => Some(Err(e)),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{StreamExt, stream};

    fn bytes_stream(chunks: Vec<&'static str>) -> InnerStream {
        Box::pin(stream::iter(
            chunks.into_iter().map(|c| Ok(bytes::Bytes::from(c))),
        ))
    }

    #[tokio::test]
    async fn sse_decoder_splits_on_blank_line_and_joins_multi_data() {
        let src = bytes_stream(vec!["data: Hel", "lo\ndata: world\n\n"]);
        let mut decoder = SseDecoder::new(src);
        let event = decoder.next().await.unwrap().unwrap();
        assert_eq!(event.data, "Hello\nworld");
    }

    #[tokio::test]
    async fn sse_decoder_flushes_trailing_incomplete_event_on_end() {
        let src = bytes_stream(vec!["data: trailing"]);
        let mut decoder = SseDecoder::new(src);
        let event = decoder.next().await.unwrap().unwrap();
        assert_eq!(event.data, "trailing");
        assert!(decoder.next().await.is_none());
    }

    #[tokio::test]
    async fn json_sse_stream_drops_done_sentinel_and_skips_invalid_json() {
        let src = bytes_stream(vec![
            "data: {\"a\":1}\n\n",
            "data: not json\n\n",
            "data: [DONE]\n\n",
        ]);
        let values: Vec<_> = parse_json_sse_stream(src).collect().await;
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].as_ref().unwrap()["a"], 1);
    }

    #[tokio::test]
    async fn ndjson_decoder_parses_one_value_per_line_and_skips_bad_lines() {
        let src = bytes_stream(vec!["{\"a\":1}\nnot json\n{\"b\":2}\n"]);
        let values: Vec<_> = NdjsonDecoder::new(src).collect().await;
        assert_eq!(values.len(), 2);
    }

    #[tokio::test]
    async fn ndjson_decoder_flushes_final_unterminated_line() {
        let src = bytes_stream(vec!["{\"a\":1}"]);
        let values: Vec<_> = NdjsonDecoder::new(src).collect().await;
        assert_eq!(values.len(), 1);
    }
}
