use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::Stream;

/// One dispatched `text/event-stream` message from the node runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: String,
}

/// Incremental, line-oriented event-stream decoder.
///
/// Fields accumulate until a blank line dispatches them. Only `event` and
/// `data` are kept; comments and `id`/`retry` fields are dropped.
#[derive(Default)]
pub struct SseParser {
    line: String,
    undecoded: Vec<u8>,
    event_type: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode raw body bytes. A multi-byte character split across chunks
    /// is held back until the rest of it arrives.
    pub fn feed_bytes(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.undecoded.extend_from_slice(chunk);
        let decodable = match std::str::from_utf8(&self.undecoded) {
            Ok(_) => self.undecoded.len(),
            // Invalid bytes are replaced rather than held forever
            Err(e) if e.error_len().is_some() => self.undecoded.len(),
            Err(e) => e.valid_up_to(),
        };
        let tail = self.undecoded.split_off(decodable);
        let head = std::mem::replace(&mut self.undecoded, tail);
        self.feed(&String::from_utf8_lossy(&head))
    }

    pub fn feed(&mut self, text: &str) -> Vec<SseEvent> {
        let mut dispatched = Vec::new();
        for ch in text.chars() {
            match ch {
                '\r' => {}
                '\n' => {
                    let line = std::mem::take(&mut self.line);
                    dispatched.extend(self.process_line(&line));
                }
                c => self.line.push(c),
            }
        }
        dispatched
    }

    /// Dispatch whatever the server left unterminated at end of body.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let line = std::mem::take(&mut self.line);
        if !line.is_empty() {
            if let Some(event) = self.process_line(&line) {
                return Some(event);
            }
        }
        self.process_line("")
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            let event_type = self.event_type.take();
            if self.data.is_empty() {
                return None;
            }
            let data = std::mem::take(&mut self.data).join("\n");
            return Some(SseEvent { event_type, data });
        }

        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => self.event_type = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }
}

/// Adapts a reqwest body stream into decoded events. A transport error is
/// yielded once and ends the stream.
pub struct SseStream<S> {
    body: S,
    parser: SseParser,
    ready: VecDeque<SseEvent>,
    exhausted: bool,
}

impl<S> SseStream<S> {
    pub fn new(body: S) -> Self {
        Self {
            body,
            parser: SseParser::new(),
            ready: VecDeque::new(),
            exhausted: false,
        }
    }
}

impl<S> Stream for SseStream<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    type Item = Result<SseEvent, reqwest::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        while this.ready.is_empty() && !this.exhausted {
            match Pin::new(&mut this.body).poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(chunk))) => this.ready.extend(this.parser.feed_bytes(&chunk)),
                Poll::Ready(Some(Err(e))) => {
                    this.exhausted = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    this.exhausted = true;
                    this.ready.extend(this.parser.finish());
                }
            }
        }
        Poll::Ready(this.ready.pop_front().map(Ok))
    }
}
