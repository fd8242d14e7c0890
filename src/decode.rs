//! Content decoding: raw response bytes into structured values.
//!
//! The engine consumes decoding through the [`ContentDecoder`] contract:
//! `(bytes, hint) → Value`, never failing; unknown formats come back as
//! text. [`DefaultDecoder`] covers the formats the engine meets in the
//! wild: gzip/deflate wrapping, JSON, CSV, and HTML/XML passthrough.

use std::io::Read;

use serde_json::{Map, Value};

/// Decoder contract. Implementations must be infallible: anything they
/// cannot interpret is returned as text so downstream consumers never
/// see raw byte buffers.
pub trait ContentDecoder: Send + Sync {
    /// Decode `bytes` using an optional content-type hint.
    fn parse(&self, bytes: &[u8], hint: Option<&str>) -> Value;
}

/// Parse text as JSON when it looks like JSON.
///
/// Round-trip stable: parsing the serialization of a parsed value yields
/// the same value.
pub fn parse_json(text: &str) -> Option<Value> {
    let sniff = text.trim_start();
    if sniff.starts_with('{') || sniff.starts_with('[') || sniff.starts_with('"') {
        serde_json::from_str(text).ok()
    } else {
        None
    }
}

/// Content-type inference decoder used by the HTTP and FTP transports.
#[derive(Debug, Clone, Default)]
pub struct DefaultDecoder;

impl DefaultDecoder {
    pub fn new() -> Self {
        Self
    }

    fn parse_inner(&self, bytes: &[u8], hint: Option<&str>, depth: u8) -> Value {
        if bytes.is_empty() {
            return Value::Null;
        }

        // Compressed payloads unwrap and re-enter inference once.
        if depth == 0 {
            if let Some(decompressed) = decompress(bytes) {
                return self.parse_inner(&decompressed, hint, 1);
            }
        }

        let hint = hint.map(|h| h.to_ascii_lowercase());
        let hint = hint.as_deref();

        if hint_matches(hint, "json") {
            if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
                return value;
            }
        }
        if hint_matches(hint, "csv") {
            if let Some(value) = parse_csv(bytes) {
                return value;
            }
        }

        // No usable hint: sniff.
        let text = String::from_utf8_lossy(bytes);
        let sniffed = text.trim_start();
        if sniffed.starts_with('{') || sniffed.starts_with('[') {
            if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
                return value;
            }
        }
        if hint.is_none() && looks_like_csv(sniffed) {
            if let Some(value) = parse_csv(bytes) {
                return value;
            }
        }

        // HTML, XML, plain text, and everything unknown: text.
        Value::String(text.into_owned())
    }
}

impl ContentDecoder for DefaultDecoder {
    fn parse(&self, bytes: &[u8], hint: Option<&str>) -> Value {
        self.parse_inner(bytes, hint, 0)
    }
}

fn hint_matches(hint: Option<&str>, needle: &str) -> bool {
    hint.map(|h| h.contains(needle)).unwrap_or(false)
}

/// Unwrap gzip (`1f 8b`) or zlib (`78 ..`) framing. Returns `None` when
/// the bytes are not compressed or decompression fails.
fn decompress(bytes: &[u8]) -> Option<Vec<u8>> {
    if bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b {
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(bytes)
            .read_to_end(&mut out)
            .ok()?;
        return Some(out);
    }
    if bytes.len() >= 2 && bytes[0] == 0x78 && matches!(bytes[1], 0x01 | 0x5e | 0x9c | 0xda) {
        let mut out = Vec::new();
        flate2::read::ZlibDecoder::new(bytes)
            .read_to_end(&mut out)
            .ok()?;
        return Some(out);
    }
    None
}

/// Decode CSV with a header row into an array of objects. Numeric and
/// boolean cells are typed; everything else stays a string.
fn parse_csv(bytes: &[u8]) -> Option<Value> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes);
    let headers: Vec<String> = reader
        .headers()
        .ok()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    if headers.is_empty() {
        return None;
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.ok()?;
        let mut row = Map::new();
        for (i, header) in headers.iter().enumerate() {
            let cell = record.get(i).unwrap_or("");
            row.insert(header.clone(), type_cell(cell));
        }
        rows.push(Value::Object(row));
    }
    Some(Value::Array(rows))
}

fn type_cell(cell: &str) -> Value {
    if cell == "true" {
        return Value::Bool(true);
    }
    if cell == "false" {
        return Value::Bool(false);
    }
    if let Ok(int) = cell.parse::<i64>() {
        return Value::Number(int.into());
    }
    if let Ok(float) = cell.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(float) {
            return Value::Number(n);
        }
    }
    Value::String(cell.to_string())
}

/// Heuristic for unhinted CSV: at least two lines whose comma counts
/// agree, and no JSON/markup leader.
fn looks_like_csv(text: &str) -> bool {
    if text.starts_with('<') {
        return false;
    }
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let first = match lines.next() {
        Some(l) => l,
        None => return false,
    };
    let commas = first.matches(',').count();
    if commas == 0 {
        return false;
    }
    match lines.next() {
        Some(second) => second.matches(',').count() == commas,
        None => false,
    }
}
