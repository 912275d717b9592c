//! Per-line record deserialization.
//!
//! The pipeline only depends on [`RecordDeserializer`]; [`CsvLineDeserializer`]
//! is the header-driven implementation used by the ingest worker.

use serde_json::{Map, Value};
use thiserror::Error;

/// One successfully parsed line.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    /// 1-based line on which the record starts
    pub line_number: i64,
    pub fields: Map<String, Value>,
}

/// A line that could not be parsed. Only this line is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line_number}: {reason}")]
pub struct LineError {
    pub line_number: i64,
    pub reason: String,
}

pub trait RecordDeserializer: Send + Sync {
    /// Parse a whole batch body into per-line results.
    fn deserialize(&self, body: &str) -> Vec<Result<ParsedLine, LineError>>;
}

/// Comma-separated records with a header row, read with the `csv` crate.
///
/// RFC 4180 quoting applies, so a quoted field may contain commas, doubled
/// quotes and line breaks. Fields are trimmed and blank lines are skipped.
/// A record whose field count differs from the header is rejected alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvLineDeserializer;

impl CsvLineDeserializer {
    fn reader<'a>(&self, body: &'a str) -> csv::Reader<&'a [u8]> {
        csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(body.as_bytes())
    }
}

impl RecordDeserializer for CsvLineDeserializer {
    fn deserialize(&self, body: &str) -> Vec<Result<ParsedLine, LineError>> {
        let mut reader = self.reader(body);

        let header = match reader.headers() {
            Ok(header) if header.is_empty() => return Vec::new(),
            Ok(header) => header.clone(),
            Err(e) => {
                return vec![Err(LineError {
                    line_number: error_line(&e),
                    reason: format!("invalid header: {}", e),
                })];
            }
        };
        if let Err(reason) = validate_header(&header) {
            return vec![Err(LineError {
                line_number: header.position().map_or(1, |p| p.line() as i64),
                reason: format!("invalid header: {}", reason),
            })];
        }

        reader
            .records()
            .map(|result| {
                let record = result.map_err(|e| LineError {
                    line_number: error_line(&e),
                    reason: e.to_string(),
                })?;
                let line_number = record.position().map_or(0, |p| p.line() as i64);

                if record.len() != header.len() {
                    return Err(LineError {
                        line_number,
                        reason: format!(
                            "expected {} fields, found {}",
                            header.len(),
                            record.len()
                        ),
                    });
                }

                let fields = header
                    .iter()
                    .zip(record.iter())
                    .map(|(name, value)| (name.to_string(), Value::String(value.to_string())))
                    .collect();
                Ok(ParsedLine {
                    line_number,
                    fields,
                })
            })
            .collect()
    }
}

fn validate_header(header: &csv::StringRecord) -> Result<(), String> {
    for (i, name) in header.iter().enumerate() {
        if name.is_empty() {
            return Err(format!("column {} has no name", i + 1));
        }
        if header.iter().take(i).any(|earlier| earlier == name) {
            return Err(format!("duplicate column '{}'", name));
        }
    }
    Ok(())
}

fn error_line(error: &csv::Error) -> i64 {
    error.position().map_or(0, |p| p.line() as i64)
}
