use std::collections::VecDeque;
use std::pin::Pin;

use futures_util::{Stream, StreamExt};

use crate::provider::{EventStream, ProviderError, StreamEvent};

// ---------------------------------------------------------------------------
// SseFrame / SseParser
// ---------------------------------------------------------------------------

/// One dispatched server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    /// OpenAI-style end-of-stream sentinel.
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Incremental SSE line parser.
///
/// Bytes are buffered until a full line is available, so multi-byte
/// characters split across network chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every frame completed by them.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            if let Some(frame) = self.process_line(line.trim_end_matches(&['\n', '\r'][..])) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush a trailing frame that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&raw).into_owned();
            if let Some(frame) = self.process_line(line.trim_end_matches('\r')) {
                return Some(frame);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame {
            event: self.event.take(),
            data,
        })
    }
}

// ---------------------------------------------------------------------------
// StreamDecoder
// ---------------------------------------------------------------------------

/// Turns one backend's SSE frames into normalized events.
pub trait StreamDecoder: Send {
    fn decode(&mut self, frame: &SseFrame) -> Result<Vec<StreamEvent>, ProviderError>;

    /// Called once the body ends. Fails if no termination signal was seen.
    fn finish(&mut self) -> Result<Vec<StreamEvent>, ProviderError>;
}

struct DecodeState<S, D> {
    body: Pin<Box<S>>,
    parser: SseParser,
    decoder: D,
    pending: VecDeque<StreamEvent>,
    done: bool,
}

impl<S, D: StreamDecoder> DecodeState<S, D> {
    fn absorb(&mut self, frames: Vec<SseFrame>) -> Result<(), ProviderError> {
        for frame in frames {
            let events = self.decoder.decode(&frame)?;
            self.pending.extend(events);
        }
        Ok(())
    }
}

/// Adapt an HTTP byte stream into an [`EventStream`] through `decoder`.
///
/// The first error ends the stream.
pub fn decode_stream<S, B, D>(body: S, decoder: D) -> EventStream
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    D: StreamDecoder + 'static,
{
    let state = DecodeState {
        body: Box::pin(body),
        parser: SseParser::new(),
        decoder,
        pending: VecDeque::new(),
        done: false,
    };

    Box::pin(futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                return Some((Ok(event), st));
            }
            if st.done {
                return None;
            }
            match st.body.next().await {
                Some(Ok(chunk)) => {
                    let frames = st.parser.feed(chunk.as_ref());
                    if let Err(e) = st.absorb(frames) {
                        st.done = true;
                        return Some((Err(e), st));
                    }
                }
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(ProviderError::from(e)), st));
                }
                None => {
                    st.done = true;
                    let tail: Vec<SseFrame> = st.parser.finish().into_iter().collect();
                    let flushed = st.absorb(tail).and_then(|_| st.decoder.finish());
                    match flushed {
                        Ok(events) => st.pending.extend(events),
                        Err(e) => return Some((Err(e), st)),
                    }
                }
            }
        }
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
