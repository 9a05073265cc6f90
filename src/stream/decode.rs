//! Wire-format decoders. Each turns raw body chunks into ordered deltas.

use super::extract::Extractor;
use super::sse::{SseEvent, SseParser};
use super::StreamDelta;
use crate::error::{truncate, TransportError};
use serde_json::Value;

const RAW_SNIPPET: usize = 512;

/// Framing of a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    EventStream,
    JsonLines,
    /// One JSON document for the whole reply.
    Json,
    Text,
}

impl Framing {
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let ct = content_type.to_ascii_lowercase();
        let essence = ct.split(';').next().unwrap_or_default().trim();
        match essence {
            "text/event-stream" => Some(Framing::EventStream),
            "application/x-ndjson" | "application/ndjson" | "application/jsonl" | "application/x-jsonlines"
            | "application/stream+json" | "application/json-seq" => Some(Framing::JsonLines),
            "application/json" => Some(Framing::Json),
            _ => None,
        }
    }

    /// Guess from the first bytes when the content type says nothing useful.
    pub fn sniff(first: &[u8]) -> Self {
        let text = String::from_utf8_lossy(first);
        let head = text.trim_start();
        if head.starts_with("data:") || head.starts_with("event:") || head.starts_with(':') || head.starts_with("id:") {
            Framing::EventStream
        } else if head.starts_with('{') {
            Framing::JsonLines
        } else {
            Framing::Text
        }
    }

    pub fn decoder(self, extractor: Extractor) -> Box<dyn FrameDecoder> {
        match self {
            Framing::EventStream => Box::new(SseDecoder::new(extractor)),
            Framing::JsonLines => Box::new(NdjsonDecoder::new(extractor)),
            Framing::Json => Box::new(AggregateDecoder::new(extractor)),
            Framing::Text => Box::new(TextDecoder::default()),
        }
    }
}

pub trait FrameDecoder: Send {
    fn push(&mut self, chunk: &[u8]) -> Result<Vec<StreamDelta>, TransportError>;

    /// Called once the body has ended.
    fn finish(&mut self) -> Result<Vec<StreamDelta>, TransportError> {
        Ok(Vec::new())
    }

    /// The stream signalled its own end (e.g. `[DONE]`).
    fn is_done(&self) -> bool {
        false
    }
}

fn decode_error(message: impl Into<String>, raw: &str) -> TransportError {
    TransportError::Decode {
        message: message.into(),
        raw: truncate(raw, RAW_SNIPPET),
    }
}

fn push_text(out: &mut Vec<StreamDelta>, text: Option<String>) {
    if let Some(text) = text.filter(|t| !t.is_empty()) {
        out.push(StreamDelta { text });
    }
}

pub struct SseDecoder {
    parser: SseParser,
    extractor: Extractor,
    done: bool,
}

impl SseDecoder {
    pub fn new(extractor: Extractor) -> Self {
        Self {
            parser: SseParser::new(),
            extractor,
            done: false,
        }
    }

    fn events(
        &mut self,
        events: Vec<Result<SseEvent, std::str::Utf8Error>>,
    ) -> Result<Vec<StreamDelta>, TransportError> {
        let mut out = Vec::new();
        for ev in events {
            if self.done {
                break;
            }
            let data = match ev {
                Ok(SseEvent::Data(d)) => d,
                Ok(SseEvent::Other) => continue,
                Err(e) => return Err(decode_error(format!("SSE line is not valid UTF-8: {e}"), "")),
            };
            let data = data.trim();
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                self.done = true;
                break;
            }
            match serde_json::from_str::<Value>(data) {
                Ok(v) => push_text(&mut out, self.extractor.text(&v)?),
                Err(e) if data.starts_with('{') || data.starts_with('[') => {
                    return Err(decode_error(format!("invalid JSON in SSE event: {e}"), data));
                }
                // Some servers stream bare text in `data:` fields.
                Err(_) => push_text(&mut out, Some(data.to_string())),
            }
        }
        Ok(out)
    }
}

impl FrameDecoder for SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Result<Vec<StreamDelta>, TransportError> {
        let events = self.parser.push(chunk);
        self.events(events)
    }

    fn finish(&mut self) -> Result<Vec<StreamDelta>, TransportError> {
        let events = self.parser.finish();
        self.events(events)
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

/// Newline-delimited JSON objects.
pub struct NdjsonDecoder {
    buf: Vec<u8>,
    extractor: Extractor,
}

impl NdjsonDecoder {
    pub fn new(extractor: Extractor) -> Self {
        Self {
            buf: Vec::new(),
            extractor,
        }
    }

    fn line(&self, line: &[u8], out: &mut Vec<StreamDelta>) -> Result<(), TransportError> {
        let text = std::str::from_utf8(line)
            .map_err(|e| decode_error(format!("line is not valid UTF-8: {e}"), ""))?;
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let v: Value = serde_json::from_str(text)
            .map_err(|e| decode_error(format!("invalid JSON line: {e}"), text))?;
        push_text(out, self.extractor.text(&v)?);
        Ok(())
    }
}

impl FrameDecoder for NdjsonDecoder {
    fn push(&mut self, chunk: &[u8]) -> Result<Vec<StreamDelta>, TransportError> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.line(&line, &mut out)?;
        }
        Ok(out)
    }

    fn finish(&mut self) -> Result<Vec<StreamDelta>, TransportError> {
        let rest = std::mem::take(&mut self.buf);
        let mut out = Vec::new();
        self.line(&rest, &mut out)?;
        Ok(out)
    }
}

/// A single JSON body; the reply arrives as one terminal delta.
pub struct AggregateDecoder {
    body: Vec<u8>,
    extractor: Extractor,
}

impl AggregateDecoder {
    pub fn new(extractor: Extractor) -> Self {
        Self {
            body: Vec::new(),
            extractor,
        }
    }
}

impl FrameDecoder for AggregateDecoder {
    fn push(&mut self, chunk: &[u8]) -> Result<Vec<StreamDelta>, TransportError> {
        self.body.extend_from_slice(chunk);
        Ok(Vec::new())
    }

    fn finish(&mut self) -> Result<Vec<StreamDelta>, TransportError> {
        let body = std::mem::take(&mut self.body);
        let raw = String::from_utf8_lossy(&body).into_owned();

        match serde_json::from_slice::<Value>(&body) {
            Ok(v) => match self.extractor.text(&v)? {
                Some(text) if !text.is_empty() => Ok(vec![StreamDelta { text }]),
                _ => Err(decode_error("no reply text found in response", &raw)),
            },
            Err(e) => {
                // Streaming servers sometimes label JSON lines as application/json.
                let mut lines = NdjsonDecoder::new(self.extractor.clone());
                match lines.push(&body).and_then(|mut out| {
                    out.extend(lines.finish()?);
                    Ok(out)
                }) {
                    Ok(out) => Ok(out),
                    Err(_) => Err(decode_error(format!("invalid JSON body: {e}"), &raw)),
                }
            }
        }
    }
}

/// Anything else is passed through as text.
#[derive(Default)]
pub struct TextDecoder {
    pending: Vec<u8>,
}

impl FrameDecoder for TextDecoder {
    fn push(&mut self, chunk: &[u8]) -> Result<Vec<StreamDelta>, TransportError> {
        self.pending.extend_from_slice(chunk);
        let valid = match std::str::from_utf8(&self.pending) {
            Ok(s) => s.len(),
            // Keep a split multi-byte sequence for the next chunk.
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(e) => {
                return Err(decode_error(
                    format!("body is not valid UTF-8: {e}"),
                    &String::from_utf8_lossy(&self.pending),
                ))
            }
        };
        let bytes: Vec<u8> = self.pending.drain(..valid).collect();
        let mut out = Vec::new();
        push_text(&mut out, String::from_utf8(bytes).ok());
        Ok(out)
    }

    fn finish(&mut self) -> Result<Vec<StreamDelta>, TransportError> {
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }
        let rest = std::mem::take(&mut self.pending);
        Err(decode_error(
            "body ends inside a UTF-8 sequence",
            &String::from_utf8_lossy(&rest),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(decoder: &mut dyn FrameDecoder, chunks: &[&[u8]]) -> Result<Vec<String>, TransportError> {
        let mut out = Vec::new();
        for c in chunks {
            out.extend(decoder.push(c)?.into_iter().map(|d| d.text));
            if decoder.is_done() {
                return Ok(out);
            }
        }
        out.extend(decoder.finish()?.into_iter().map(|d| d.text));
        Ok(out)
    }

    fn sse_frame(text: &str) -> String {
        format!("data: {}\n\n", serde_json::json!({"response": text}))
    }

    fn ndjson_frame(text: &str) -> String {
        format!("{}\n", serde_json::json!({"response": text}))
    }

    #[test]
    fn sse_and_ndjson_yield_identical_deltas() {
        let pieces = ["Hel", "lo", " wor", "ld"];
        let sse: Vec<String> = pieces.iter().map(|p| sse_frame(p)).collect();
        let nd: Vec<String> = pieces.iter().map(|p| ndjson_frame(p)).collect();

        let sse_chunks: Vec<&[u8]> = sse.iter().map(|s| s.as_bytes()).collect();
        let nd_chunks: Vec<&[u8]> = nd.iter().map(|s| s.as_bytes()).collect();

        let a = run(&mut SseDecoder::new(Extractor::default()), &sse_chunks).unwrap();
        let b = run(&mut NdjsonDecoder::new(Extractor::default()), &nd_chunks).unwrap();
        assert_eq!(a, vec!["Hel", "lo", " wor", "ld"]);
        assert_eq!(a, b);
        assert_eq!(a.concat(), "Hello world");
    }

    #[test]
    fn frames_split_mid_object() {
        let body = format!("{}{}", ndjson_frame("He"), ndjson_frame("llo"));
        let (x, y) = body.as_bytes().split_at(7);
        let out = run(&mut NdjsonDecoder::new(Extractor::default()), &[x, y]).unwrap();
        assert_eq!(out, vec!["He", "llo"]);

        let body = format!("{}{}", sse_frame("He"), sse_frame("llo"));
        let (x, y) = body.as_bytes().split_at(9);
        let out = run(&mut SseDecoder::new(Extractor::default()), &[x, y]).unwrap();
        assert_eq!(out, vec!["He", "llo"]);
    }

    #[test]
    fn sse_done_marker_stops_decoding() {
        let body = b"data: {\"text\":\"a\"}\n\ndata: [DONE]\n\ndata: {\"text\":\"late\"}\n\n";
        let mut d = SseDecoder::new(Extractor::default());
        let out = run(&mut d, &[body.as_slice()]).unwrap();
        assert_eq!(out, vec!["a"]);
        assert!(d.is_done());
    }

    #[test]
    fn sse_bad_json_reports_raw_fragment() {
        let err = run(
            &mut SseDecoder::new(Extractor::default()),
            &[b"data: {\"text\": oops}\n\n".as_slice()],
        )
        .unwrap_err();
        match err {
            TransportError::Decode { raw, .. } => assert_eq!(raw, "{\"text\": oops}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn aggregate_body_is_one_terminal_delta() {
        let mut d = AggregateDecoder::new(Extractor::default());
        let out = run(
            &mut d,
            &[
                b"{\"choices\":[{\"message\":{\"content\":\"Hello".as_slice(),
                b" world\"}}]}".as_slice(),
            ],
        )
        .unwrap();
        assert_eq!(out, vec!["Hello world"]);
    }

    #[test]
    fn aggregate_falls_back_to_json_lines() {
        let mut d = AggregateDecoder::new(Extractor::default());
        let out = run(&mut d, &[b"{\"response\":\"a\"}\n{\"response\":\"b\"}\n".as_slice()]).unwrap();
        assert_eq!(out, vec!["a", "b"]);
    }

    #[test]
    fn aggregate_without_text_is_a_decode_error() {
        let mut d = AggregateDecoder::new(Extractor::new(Some("result")));
        let err = run(&mut d, &[b"{\"other\":1}".as_slice()]).unwrap_err();
        assert!(matches!(err, TransportError::Decode { .. }));
    }

    #[test]
    fn text_decoder_handles_split_utf8() {
        let bytes = "héllo".as_bytes();
        let out = run(&mut TextDecoder::default(), &[&bytes[..2], &bytes[2..]]).unwrap();
        assert_eq!(out.concat(), "héllo");
    }

    #[test]
    fn framing_from_headers_and_bytes() {
        assert_eq!(
            Framing::from_content_type("text/event-stream; charset=utf-8"),
            Some(Framing::EventStream)
        );
        assert_eq!(Framing::from_content_type("application/x-ndjson"), Some(Framing::JsonLines));
        assert_eq!(Framing::from_content_type("application/json"), Some(Framing::Json));
        assert_eq!(Framing::from_content_type("text/plain"), None);
        assert_eq!(Framing::sniff(b"\ndata: x"), Framing::EventStream);
        assert_eq!(Framing::sniff(b"{\"a\":1}\n"), Framing::JsonLines);
        assert_eq!(Framing::sniff(b"plain words"), Framing::Text);
    }
}
