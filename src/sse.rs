use tracing::warn;

/// Default scratch capacity, matching the engine's streaming buffer.
const DEFAULT_CAPACITY: usize = 15 * 1024;

/// One server-sent event frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

/// Incremental SSE frame parser over a bounded scratch buffer.
///
/// Bytes are appended as they arrive off the wire; every complete frame
/// (terminated by `\r\n\r\n` or `\n\n`, whichever comes first) is handed
/// to the sink and the remainder shifted left. Frames split across reads
/// at arbitrary offsets reassemble correctly.
pub struct SseParser {
    buf: Vec<u8>,
    capacity: usize,
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl SseParser {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity.min(DEFAULT_CAPACITY)),
            capacity,
        }
    }

    /// Bytes currently buffered awaiting a frame terminator.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    /// Append incoming bytes and emit every complete frame.
    pub fn push<F: FnMut(SseFrame)>(&mut self, incoming: &[u8], mut emit: F) {
        self.reserve(incoming.len());
        if incoming.len() > self.capacity {
            // Oversized arrival: only the newest capacity bytes can fit.
            warn!(
                dropped = incoming.len() - self.capacity,
                "SSE scratch overflow, dropping oldest bytes"
            );
            self.buf.clear();
            self.buf.extend_from_slice(&incoming[incoming.len() - self.capacity..]);
        } else {
            self.buf.extend_from_slice(incoming);
        }
        self.drain(&mut emit);
    }

    fn reserve(&mut self, incoming: usize) {
        let total = self.buf.len() + incoming;
        if total <= self.capacity || incoming > self.capacity {
            return;
        }
        let excess = total - self.capacity;
        warn!(dropped = excess, "SSE scratch overflow, dropping oldest bytes");
        self.buf.drain(..excess);
    }

    fn drain<F: FnMut(SseFrame)>(&mut self, emit: &mut F) {
        loop {
            let Some((end, term_len)) = find_terminator(&self.buf) else {
                return;
            };
            if let Some(frame) = parse_frame(&self.buf[..end]) {
                emit(frame);
            }
            self.buf.drain(..end + term_len);
        }
    }
}

/// Offset and length of the first frame terminator, `\r\n\r\n` or `\n\n`.
fn find_terminator(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = find_subslice(buf, b"\r\n\r\n");
    let lf = find_subslice(buf, b"\n\n");
    match (crlf, lf) {
        (Some(a), Some(b)) if a < b => Some((a, 4)),
        (Some(_), Some(b)) => Some((b, 2)),
        (Some(a), None) => Some((a, 4)),
        (None, Some(b)) => Some((b, 2)),
        (None, None) => None,
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Parse one terminated frame body. Returns `None` when no recognised
/// field is present (comment or keep-alive frames).
fn parse_frame(body: &[u8]) -> Option<SseFrame> {
    let mut frame = SseFrame::default();
    let mut data_lines: Vec<String> = Vec::new();
    let mut seen = false;

    for raw in body.split(|&b| b == b'\n') {
        let raw = match raw.last() {
            Some(b'\r') => &raw[..raw.len() - 1],
            _ => raw,
        };
        if raw.is_empty() {
            continue;
        }
        let line = String::from_utf8_lossy(raw);
        let (key, value) = match line.find(':') {
            Some(pos) => (line[..pos].trim(), line[pos + 1..].trim()),
            None => (line.trim(), ""),
        };
        match key {
            "event" => {
                frame.event = Some(value.to_string());
                seen = true;
            }
            "id" => {
                frame.id = Some(value.to_string());
                seen = true;
            }
            "data" => {
                data_lines.push(value.to_string());
                seen = true;
            }
            _ => {}
        }
    }

    if !seen {
        return None;
    }
    frame.data = data_lines.join("\n");
    Some(frame)
}
