#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Data(String),
    Other,
}

/// Minimal SSE parser.
///
/// - Collects UTF-8 lines across chunk boundaries
/// - Emits Data events when a blank line ends an event
#[derive(Debug, Default)]
pub struct SseParser {
    buf: Vec<u8>,
    cur_data: String,
    has_data: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<SseEvent, std::str::Utf8Error>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line = self.buf.drain(..=pos).collect::<Vec<u8>>();
            line.pop();
            if line.ends_with(b"\r") {
                line.pop();
            }
            self.line(&line, &mut out);
        }

        out
    }

    /// Flush a trailing event that was not terminated by a blank line.
    pub fn finish(&mut self) -> Vec<Result<SseEvent, std::str::Utf8Error>> {
        let mut out = Vec::new();
        if !self.buf.is_empty() {
            let mut line = std::mem::take(&mut self.buf);
            if line.ends_with(b"\r") {
                line.pop();
            }
            self.line(&line, &mut out);
        }
        self.line(b"", &mut out);
        out
    }

    fn line(&mut self, line: &[u8], out: &mut Vec<Result<SseEvent, std::str::Utf8Error>>) {
        if line.is_empty() {
            if self.has_data {
                let data = std::mem::take(&mut self.cur_data);
                self.has_data = false;
                out.push(Ok(SseEvent::Data(data)));
            }
            return;
        }

        let s = match std::str::from_utf8(line) {
            Ok(s) => s,
            Err(e) => {
                out.push(Err(e));
                return;
            }
        };

        if let Some(rest) = s.strip_prefix("data:") {
            // Optional single leading space.
            let rest = rest.strip_prefix(' ').unwrap_or(rest);
            if self.has_data {
                self.cur_data.push('\n');
            }
            self.cur_data.push_str(rest);
            self.has_data = true;
        } else {
            // event:, id:, retry:, comments
            out.push(Ok(SseEvent::Other));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(events: Vec<Result<SseEvent, std::str::Utf8Error>>) -> Vec<String> {
        events
            .into_iter()
            .filter_map(|e| match e.unwrap() {
                SseEvent::Data(d) => Some(d),
                SseEvent::Other => None,
            })
            .collect()
    }

    #[test]
    fn events_split_across_chunks() {
        let mut p = SseParser::new();
        assert!(data(p.push(b"data: {\"a\"")).is_empty());
        assert_eq!(data(p.push(b":1}\r\n\r\nevent: ping\n")), vec!["{\"a\":1}"]);
        assert_eq!(data(p.push(b"data: x\ndata: y\n\n")), vec!["x\ny"]);
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut p = SseParser::new();
        assert!(data(p.push(b"data: tail")).is_empty());
        assert_eq!(data(p.finish()), vec!["tail"]);
    }

    #[test]
    fn empty_data_line_still_counts() {
        let mut p = SseParser::new();
        assert_eq!(data(p.push(b"data:\n\n")), vec![""]);
    }
}
