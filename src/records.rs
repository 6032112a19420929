//! Incremental decoding of the engine's structured log stream
//!
//! The engine writes JSON objects to stdout. Objects may arrive several per
//! write or split across writes, and the stream can also carry plain text
//! (panics, banners). The decoder buffers undecoded bytes between reads and
//! yields either complete records or raw byte runs that should be copied
//! verbatim to the diagnostic stream.

use futures::Stream;
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, error, info, trace, warn};

/// Message of the record the engine logs once its HTTP frontend is bound
pub const STARTUP_MESSAGE: &str = "Started HTTP server.";

/// Read size for the engine's stdout
const READ_CHUNK: usize = 8 * 1024;

/// Undecodable bytes without a newline are flushed once the buffer grows past this
const MAX_PENDING_RAW: usize = 64 * 1024;

/// Engine log levels, ordered from finest to coarsest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    /// Level the startup record is logged at
    pub const STARTUP: LogLevel = LogLevel::Info;

    /// Spelling understood by the engine's `logging.level` setting
    pub fn as_config_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" | "trace" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "fatal" | "panic" => Ok(LogLevel::Fatal),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_config_str())
    }
}

/// Lower a coarse `logging.level` so the startup record stays observable.
///
/// Returns the level the user asked for when it had to be rewritten.
pub fn startup_level_override(config: &mut Value) -> Option<LogLevel> {
    let logging = config.get_mut("logging")?.as_object_mut()?;
    let requested: LogLevel = logging.get("level")?.as_str()?.parse().ok()?;

    if requested <= LogLevel::STARTUP {
        return None;
    }

    logging.insert(
        "level".to_string(),
        Value::String(LogLevel::STARTUP.as_config_str().to_string()),
    );
    Some(requested)
}

/// A single structured record from the engine
#[derive(Debug, Clone, PartialEq)]
pub struct EngineRecord {
    fields: Map<String, Value>,
}

impl EngineRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn message(&self) -> Option<&str> {
        self.fields.get("msg").and_then(Value::as_str)
    }

    /// Record level; records without a recognised level count as info
    pub fn level(&self) -> LogLevel {
        self.fields
            .get("level")
            .and_then(Value::as_str)
            .and_then(|l| l.parse().ok())
            .unwrap_or(LogLevel::Info)
    }

    /// Bound address if this is the engine's readiness record
    pub fn startup_address(&self) -> Option<&str> {
        if self.message() != Some(STARTUP_MESSAGE) {
            return None;
        }
        self.fields.get("address").and_then(Value::as_str)
    }

    /// Echo the record through `tracing`, tagged as engine output
    pub fn emit(&self) {
        let message = self.message().unwrap_or("");
        let extra: Map<String, Value> = self
            .fields
            .iter()
            .filter(|(k, _)| !matches!(k.as_str(), "msg" | "level" | "time"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let fields = Value::Object(extra);

        match self.level() {
            LogLevel::Debug => debug!(target: "engine", %fields, "{}", message),
            LogLevel::Info => info!(target: "engine", %fields, "{}", message),
            LogLevel::Warn => warn!(target: "engine", %fields, "{}", message),
            LogLevel::Error | LogLevel::Fatal => error!(target: "engine", %fields, "{}", message),
        }
    }
}

/// One decoded unit of the engine's stdout
#[derive(Debug, Clone, PartialEq)]
pub enum LogChunk {
    /// A complete JSON object
    Record(EngineRecord),
    /// Bytes that are not a JSON object, to be copied verbatim
    Raw(Vec<u8>),
}

/// Resumable decoder holding undecoded trailing bytes between reads
#[derive(Debug, Default)]
pub struct RecordDecoder {
    buf: Vec<u8>,
}

impl RecordDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes waiting for more input
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Append bytes and return every chunk that is now complete
    pub fn push(&mut self, bytes: &[u8]) -> Vec<LogChunk> {
        self.buf.extend_from_slice(bytes);
        let mut chunks = Vec::new();
        while let Some(chunk) = self.next_chunk(false) {
            chunks.push(chunk);
        }
        chunks
    }

    /// Drain everything left at end of stream
    pub fn finish(&mut self) -> Vec<LogChunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.next_chunk(true) {
            chunks.push(chunk);
        }
        chunks
    }

    fn next_chunk(&mut self, eof: bool) -> Option<LogChunk> {
        // Whitespace is only looked past here; it belongs to raw text unless an object follows
        let Some(start) = self.buf.iter().position(|b| !b.is_ascii_whitespace()) else {
            if eof {
                self.buf.clear();
            }
            return None;
        };

        if self.buf[start] == b'{' {
            let mut stream = serde_json::Deserializer::from_slice(&self.buf[start..])
                .into_iter::<Map<String, Value>>();
            match stream.next() {
                Some(Ok(fields)) => {
                    let consumed = start + stream.byte_offset();
                    self.buf.drain(..consumed);
                    self.skip_line_end();
                    return Some(LogChunk::Record(EngineRecord::new(fields)));
                }
                Some(Err(e)) if e.is_eof() && !eof => {
                    if self.buf.len() <= MAX_PENDING_RAW {
                        return None;
                    }
                    return Some(LogChunk::Raw(std::mem::take(&mut self.buf)));
                }
                _ => {}
            }
        }

        self.take_raw(eof)
    }

    /// Drop the line terminator that follows a record
    fn skip_line_end(&mut self) {
        let blanks = self
            .buf
            .iter()
            .take_while(|&&b| b == b' ' || b == b'\t' || b == b'\r')
            .count();
        if self.buf.get(blanks) == Some(&b'\n') {
            self.buf.drain(..=blanks);
        }
    }

    fn take_raw(&mut self, eof: bool) -> Option<LogChunk> {
        // A run of text ends at the newline, or right before the next object
        let end = self
            .buf
            .iter()
            .skip(1)
            .position(|&b| b == b'\n' || b == b'{')
            .map(|i| i + 1);

        match end {
            Some(end) if self.buf[end] == b'\n' => {
                Some(LogChunk::Raw(self.buf.drain(..=end).collect()))
            }
            Some(end) => Some(LogChunk::Raw(self.buf.drain(..end).collect())),
            None if eof || self.buf.len() > MAX_PENDING_RAW => {
                Some(LogChunk::Raw(std::mem::take(&mut self.buf)))
            }
            None => None,
        }
    }
}

/// Decode a reader into a finite stream of chunks, ending with the reader
pub fn decode_records<R>(reader: R) -> impl Stream<Item = LogChunk>
where
    R: AsyncRead + Unpin,
{
    struct State<R> {
        reader: R,
        decoder: RecordDecoder,
        ready: std::collections::VecDeque<LogChunk>,
        done: bool,
    }

    let state = State {
        reader,
        decoder: RecordDecoder::new(),
        ready: std::collections::VecDeque::new(),
        done: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            if let Some(chunk) = state.ready.pop_front() {
                return Some((chunk, state));
            }
            if state.done {
                return None;
            }

            match state.reader.read(&mut buf).await {
                Ok(0) => {
                    state.done = true;
                    state.ready.extend(state.decoder.finish());
                }
                Ok(n) => {
                    state.ready.extend(state.decoder.push(&buf[..n]));
                }
                Err(e) => {
                    trace!(error = %e, "engine log stream read failed");
                    state.done = true;
                    state.ready.extend(state.decoder.finish());
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn record(chunk: &LogChunk) -> &EngineRecord {
        match chunk {
            LogChunk::Record(r) => r,
            LogChunk::Raw(raw) => panic!("expected record, got raw {:?}", String::from_utf8_lossy(raw)),
        }
    }

    #[test]
    fn test_level_parsing_and_order() {
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("INFO".parse::<LogLevel>().unwrap(), LogLevel::Info);
        assert_eq!("panic".parse::<LogLevel>().unwrap(), LogLevel::Fatal);
        assert!("invalid".parse::<LogLevel>().is_err());

        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Warn > LogLevel::STARTUP);
        assert!(LogLevel::Fatal > LogLevel::Error);
    }

    #[test]
    fn test_startup_level_override() {
        let mut config = serde_json::json!({"logging": {"level": "WARN"}});
        assert_eq!(startup_level_override(&mut config), Some(LogLevel::Warn));
        assert_eq!(config["logging"]["level"], "INFO");

        let mut config = serde_json::json!({"logging": {"level": "debug"}});
        assert_eq!(startup_level_override(&mut config), None);
        assert_eq!(config["logging"]["level"], "debug");

        let mut config = serde_json::json!({"logging": {"level": "bogus"}});
        assert_eq!(startup_level_override(&mut config), None);
        assert_eq!(config["logging"]["level"], "bogus");

        let mut config = serde_json::json!({"apiKey": "x"});
        assert_eq!(startup_level_override(&mut config), None);
    }

    #[test]
    fn test_startup_record() {
        let mut decoder = RecordDecoder::new();
        let chunks = decoder.push(
            br#"{"level":"info","msg":"Started HTTP server.","address":"127.0.0.1:4100"}"#,
        );

        assert_eq!(chunks.len(), 1);
        let rec = record(&chunks[0]);
        assert_eq!(rec.startup_address(), Some("127.0.0.1:4100"));
        assert_eq!(rec.level(), LogLevel::Info);
    }

    #[test]
    fn test_other_records_are_not_startup() {
        let mut decoder = RecordDecoder::new();
        let chunks = decoder.push(br#"{"msg":"Started reporting.","address":"x"}"#);
        assert!(record(&chunks[0]).startup_address().is_none());
    }

    #[test]
    fn test_multiple_records_per_write() {
        let mut decoder = RecordDecoder::new();
        let chunks = decoder.push(b"{\"msg\":\"a\"}\n{\"msg\":\"b\"}{\"msg\":\"c\"}\n");

        let messages: Vec<_> = chunks.iter().map(|c| record(c).message().unwrap()).collect();
        assert_eq!(messages, vec!["a", "b", "c"]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_record_split_across_writes() {
        let mut decoder = RecordDecoder::new();

        assert!(decoder.push(b"{\"level\":\"warn\",\"ms").is_empty());
        assert!(decoder.push(b"g\":\"slow ").is_empty());
        let chunks = decoder.push(b"origin\"}\n");

        assert_eq!(chunks.len(), 1);
        let rec = record(&chunks[0]);
        assert_eq!(rec.message(), Some("slow origin"));
        assert_eq!(rec.level(), LogLevel::Warn);
    }

    #[test]
    fn test_plain_text_is_raw() {
        let mut decoder = RecordDecoder::new();
        let chunks = decoder.push(b"panic: runtime error\n{\"msg\":\"after\"}\n");

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], LogChunk::Raw(b"panic: runtime error\n".to_vec()));
        assert_eq!(record(&chunks[1]).message(), Some("after"));
    }

    #[test]
    fn test_broken_object_is_raw_and_decoding_resumes() {
        let mut decoder = RecordDecoder::new();
        let chunks = decoder.push(b"{not json}\n{\"msg\":\"ok\"}\n");

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], LogChunk::Raw(b"{not json}\n".to_vec()));
        assert_eq!(record(&chunks[1]).message(), Some("ok"));
    }

    #[test]
    fn test_text_waits_for_newline_until_finish() {
        let mut decoder = RecordDecoder::new();
        assert!(decoder.push(b"partial line").is_empty());

        let chunks = decoder.finish();
        assert_eq!(chunks, vec![LogChunk::Raw(b"partial line".to_vec())]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_truncated_object_flushed_at_finish() {
        let mut decoder = RecordDecoder::new();
        assert!(decoder.push(b"{\"msg\":\"cut").is_empty());

        let chunks = decoder.finish();
        assert_eq!(chunks, vec![LogChunk::Raw(b"{\"msg\":\"cut".to_vec())]);
    }

    fn raw_text(chunks: &[LogChunk]) -> Vec<u8> {
        chunks
            .iter()
            .flat_map(|c| match c {
                LogChunk::Raw(bytes) => bytes.clone(),
                LogChunk::Record(_) => panic!("expected raw bytes, got {:?}", c),
            })
            .collect()
    }

    #[test]
    fn test_raw_whitespace_is_kept() {
        let input: &[u8] = b"goroutine 1 [running]:\n\tmain.main()\n\n  indented\n";
        let mut decoder = RecordDecoder::new();

        let mut chunks = decoder.push(input);
        chunks.extend(decoder.finish());

        assert_eq!(raw_text(&chunks), input);
    }

    #[test]
    fn test_indented_text_between_records() {
        let mut decoder = RecordDecoder::new();
        let chunks = decoder.push(b"{\"msg\":\"a\"}\n\tat frame\n  {\"msg\":\"b\"}\n");

        assert_eq!(chunks.len(), 3);
        assert_eq!(record(&chunks[0]).message(), Some("a"));
        assert_eq!(chunks[1], LogChunk::Raw(b"\tat frame\n".to_vec()));
        assert_eq!(record(&chunks[2]).message(), Some("b"));
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_unterminated_object_is_capped() {
        let mut decoder = RecordDecoder::new();
        assert!(decoder.push(b"{\"msg\":\"").is_empty());

        let filler = vec![b'x'; MAX_PENDING_RAW + 1];
        let chunks = decoder.push(&filler);

        assert_eq!(chunks.len(), 1);
        let LogChunk::Raw(bytes) = &chunks[0] else {
            panic!("expected raw bytes, got {:?}", chunks[0]);
        };
        assert!(bytes.starts_with(b"{\"msg\":\"xxx"));
        assert_eq!(bytes.len(), MAX_PENDING_RAW + 9);
        assert_eq!(decoder.pending(), 0);

        // Decoding continues normally afterwards
        let chunks = decoder.push(b"{\"msg\":\"ok\"}\n");
        assert_eq!(record(&chunks[0]).message(), Some("ok"));
    }

    #[tokio::test]
    async fn test_decode_records_stream() {
        let input: &[u8] = b"boot\n{\"msg\":\"one\"}\n{\"msg\":\"Started HTTP server.\",\"address\":\"127.0.0.1:9\"}";
        let chunks: Vec<LogChunk> = decode_records(input).collect().await;

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], LogChunk::Raw(b"boot\n".to_vec()));
        assert_eq!(record(&chunks[1]).message(), Some("one"));
        assert_eq!(record(&chunks[2]).startup_address(), Some("127.0.0.1:9"));
    }
}
