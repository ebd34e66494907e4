//! Server-sent-event decoding for the streaming analysis endpoint.
//!
//! Frames are separated by a blank line. `event: token` (or an unnamed event)
//! carries a fragment, `event: final` the terminal payload and `event: error`
//! a backend error message. Chunk boundaries may fall anywhere, including
//! inside a UTF-8 sequence.

use super::{ApiError, EventStream};
use crate::model::StreamEvent;
use bytes::Bytes;
use futures::{stream, Stream, StreamExt};
use std::collections::VecDeque;
use tracing::debug;

#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    pending: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feed raw bytes; returns every event completed by this chunk, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.pending.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            if let Some(event) = self.process_line(line) {
                out.push(event);
            }
        }
        out
    }

    /// Flush a trailing frame that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        if !self.pending.is_empty() {
            let raw = std::mem::take(&mut self.pending);
            let line = String::from_utf8_lossy(&raw);
            let line = line.strip_suffix('\r').unwrap_or(&line).to_string();
            if let Some(event) = self.process_line(&line) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<StreamEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            // id / retry carry nothing the client acts on
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<StreamEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        match event.as_deref() {
            None | Some("token") | Some("message") | Some("chunk") => {
                (data != "[DONE]").then_some(StreamEvent::TokenChunk(data))
            }
            Some("final") | Some("result") | Some("done") => Some(StreamEvent::FinalResult(data)),
            Some("error") => Some(StreamEvent::ErrorEvent(data)),
            Some(other) => {
                debug!(event = other, "ignoring unknown analysis stream event");
                None
            }
        }
    }
}

/// Turn a byte stream into an [`EventStream`]. A transport error ends the stream.
pub(crate) fn decode_stream<S>(bytes: S) -> EventStream
where
    S: Stream<Item = Result<Bytes, ApiError>> + Send + 'static,
{
    struct State<S> {
        bytes: std::pin::Pin<Box<S>>,
        decoder: SseDecoder,
        pending: VecDeque<StreamEvent>,
        finished: bool,
    }

    let state = State {
        bytes: Box::pin(bytes),
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let events = state.decoder.push(&chunk);
                    state.pending.extend(events);
                }
                Some(Err(err)) => {
                    state.finished = true;
                    return Some((Err(err), state));
                }
                None => {
                    state.finished = true;
                    let tail = state.decoder.finish();
                    state.pending.extend(tail);
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn decode_all(chunks: &[&[u8]]) -> Vec<StreamEvent> {
        let mut decoder = SseDecoder::default();
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(decoder.push(chunk));
        }
        out.extend(decoder.finish());
        out
    }

    #[test]
    fn decodes_tokens_and_final_across_arbitrary_splits() {
        let body = "event: token\ndata: Analy\n\nevent: token\ndata: zing \n\n\
                    data: payment-svc\n\nevent: final\ndata: {\"cause\":\"DB timeout\"}\n\n";
        let bytes = body.as_bytes();
        let expected = vec![
            StreamEvent::TokenChunk("Analy".into()),
            StreamEvent::TokenChunk("zing ".into()),
            StreamEvent::TokenChunk("payment-svc".into()),
            StreamEvent::FinalResult("{\"cause\":\"DB timeout\"}".into()),
        ];

        assert_eq!(decode_all(&[bytes]), expected);
        for split in 1..bytes.len() {
            let (a, b) = bytes.split_at(split);
            assert_eq!(decode_all(&[a, b]), expected, "split at {split}");
        }
    }

    #[test]
    fn multibyte_characters_survive_chunk_splits() {
        let body = "data: caf\u{e9} \u{2192} ok\n\n".as_bytes();
        // split inside the two-byte é
        let (a, b) = body.split_at(10);
        assert_eq!(
            decode_all(&[a, b]),
            vec![StreamEvent::TokenChunk("caf\u{e9} \u{2192} ok".into())]
        );
    }

    #[test]
    fn handles_crlf_comments_multiline_data_and_errors() {
        let body = b": keep-alive\r\nid: 7\r\nevent: final\r\ndata: line one\r\ndata: line two\r\n\r\n\
                     event: error\r\ndata: model overloaded\r\n\r\n";
        assert_eq!(
            decode_all(&[body]),
            vec![
                StreamEvent::FinalResult("line one\nline two".into()),
                StreamEvent::ErrorEvent("model overloaded".into()),
            ]
        );
    }

    #[test]
    fn done_sentinel_and_unknown_events_are_skipped_and_tail_is_flushed() {
        let body = b"data: [DONE]\n\nevent: ping\ndata: x\n\nevent: final\ndata: tail";
        assert_eq!(
            decode_all(&[body]),
            vec![StreamEvent::FinalResult("tail".into())]
        );
    }

    #[tokio::test]
    async fn decode_stream_yields_events_then_transport_error() {
        let chunks = vec![
            Ok(Bytes::from_static(b"data: a\n\ndata: b")),
            Ok(Bytes::from_static(b"\n\n")),
            Err(ApiError::Transport("connection reset".into())),
            Ok(Bytes::from_static(b"data: never\n\n")),
        ];
        let items: Vec<_> = decode_stream(stream::iter(chunks)).collect().await;
        assert_eq!(
            items,
            vec![
                Ok(StreamEvent::TokenChunk("a".into())),
                Ok(StreamEvent::TokenChunk("b".into())),
                Err(ApiError::Transport("connection reset".into())),
            ]
        );
    }
}
