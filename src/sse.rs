//! Server-sent events framing and reconnect backoff.
//!
//! Frames are separated by a blank line. Inside a frame only the `event:`,
//! `data:` and `id:` fields are kept; comment lines (`: ping`) and empty
//! frames are keep-alives and produce nothing.

use std::time::Duration;

/// One decoded SSE frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// `None` for unlabeled frames (default `message` type)
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl SseEvent {
    pub fn is(&self, name: &str) -> bool {
        self.event.as_deref() == Some(name)
    }
}

/// Incremental parser fed with raw body chunks
#[derive(Debug, Default)]
pub struct SseParser {
    buf: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every frame it completed
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        while let Some(pos) = self.buf.windows(2).position(|w| w == b"\n\n") {
            let frame: Vec<u8> = self.buf.drain(..pos + 2).collect();
            if let Some(event) = parse_frame(&String::from_utf8_lossy(&frame[..pos])) {
                events.push(event);
            }
        }
        events
    }

    /// Bytes waiting for a frame terminator
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

fn parse_frame(frame: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();
    let mut id = None;

    for line in frame.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            "id" => id = Some(value.to_string()),
            _ => {}
        }
    }

    if event.is_none() && data.is_empty() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data.join("\n"),
        id,
    })
}

/// Doubling reconnect delay with an upper bound
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: base,
        }
    }

    /// Delay to wait now; the following one doubles up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    /// Back to the base delay after a successful connection
    pub fn reset(&mut self) {
        self.current = self.base;
    }

    pub fn peek(&self) -> Duration {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assignment_event() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"event: assignment\ndata: {\"id\":\"a1\"}\n\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: Some("assignment".to_string()),
                data: "{\"id\":\"a1\"}".to_string(),
                id: None,
            }]
        );
        assert!(events[0].is("assignment"));
        assert_eq!(parser.pending(), 0);
    }

    #[test]
    fn test_frames_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"event: assign").is_empty());
        assert!(parser.feed(b"ment\ndata: x\n").is_empty());
        let events = parser.feed(b"\nevent: other\ndata: y\n\n");
        assert_eq!(events.len(), 2);
        assert!(events[0].is("assignment"));
        assert!(events[1].is("other"));
    }

    #[test]
    fn test_crlf_and_multiline_data() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"id: 7\r\ndata: line1\r\ndata: line2\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, None);
        assert_eq!(events[0].data, "line1\nline2");
        assert_eq!(events[0].id.as_deref(), Some("7"));
    }

    #[test]
    fn test_keep_alives_are_dropped() {
        let mut parser = SseParser::new();
        let events = parser.feed(b": ping\n\n\n\n: keep-alive\n\ndata: real\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "real");
    }

    #[test]
    fn test_backoff_doubles_caps_and_resets() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(10));
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 10, 10]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.peek(), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_cap_below_base() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    }
}
