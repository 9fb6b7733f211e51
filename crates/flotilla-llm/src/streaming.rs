/// Incremental parser for the `event: <name>` / `data: <json>` wire feed.
///
/// Bytes are buffered until a full line is available, so chunk boundaries may
/// fall anywhere, including inside a multi-byte UTF-8 sequence. Every `data:`
/// line yields one [`SseEvent`] tagged with the most recent `event:` name; the
/// name is consumed by that data line.
#[derive(Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no newline.
    scanned: usize,
    event_type: Option<String>,
}

/// A parsed wire event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes into the parser and extract complete events.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = self.buffer[from..].iter().position(|b| *b == b'\n') {
            let end = from + offset;
            if let Some(event) = parse_line(&mut self.event_type, &self.buffer[start..end]) {
                events.push(event);
            }
            start = end + 1;
            from = start;
        }

        self.buffer.drain(..start);
        self.scanned = self.buffer.len();
        events
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        if self.buffer.is_empty() {
            return Vec::new();
        }
        let line = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        parse_line(&mut self.event_type, &line).into_iter().collect()
    }
}

fn parse_line(event_type: &mut Option<String>, raw: &[u8]) -> Option<SseEvent> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end_matches('\r');

    if line.is_empty() {
        *event_type = None;
        return None;
    }

    if let Some(val) = line.strip_prefix("event:") {
        *event_type = Some(val.trim_start().to_string());
        None
    } else if let Some(val) = line.strip_prefix("data:") {
        // "data:" with or without a space after the colon
        let data = val.strip_prefix(' ').unwrap_or(val);
        Some(SseEvent {
            event_type: event_type.take(),
            data: data.to_string(),
        })
    } else {
        // Comments (": keepalive") and unknown fields
        None
    }
}

/// Render one event the way it appears on the wire.
pub fn encode_event(name: &str, data: &str) -> String {
    format!("event: {}\ndata: {}\n\n", name, data)
}
