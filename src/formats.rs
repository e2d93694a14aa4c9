// dpau: Event file formats
//
// JSONL (one event object per line) and CSV with columns user_id,op,day plus
// optional metadata.* columns folded into the metadata object.

use crate::error::{EngineError, EngineResult};
use crate::ledger::Op;
use crate::pipeline::Event;
use chrono::NaiveDate;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

#[derive(Debug, Deserialize)]
struct EventLine {
    user_id: String,
    op: String,
    day: String,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

impl EventLine {
    fn into_event(self) -> EngineResult<Event> {
        let day = parse_day(&self.day)?;
        Ok(Event {
            user_id: self.user_id,
            op: Op::parse(&self.op)?,
            day,
            metadata: self.metadata,
        })
    }
}

pub fn parse_day(raw: &str) -> EngineResult<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| EngineError::Validation(format!("invalid day '{}', expected YYYY-MM-DD", raw)))
}

/// Read events from a file, dispatching on the extension.
pub fn read_events(path: &Path) -> EngineResult<Vec<Event>> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("jsonl") | Some("json") => read_jsonl(path),
        Some("csv") => read_csv(path),
        _ => Err(EngineError::Validation(format!(
            "unsupported event file '{}', expected .jsonl or .csv",
            path.display()
        ))),
    }
}

pub fn read_jsonl(path: &Path) -> EngineResult<Vec<Event>> {
    let file = File::open(path)?;
    let mut events = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: EventLine = serde_json::from_str(&line).map_err(|e| {
            EngineError::Validation(format!("line {}: {}", lineno + 1, e))
        })?;
        events.push(parsed.into_event()?);
    }
    Ok(events)
}

pub fn read_csv(path: &Path) -> EngineResult<Vec<Event>> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| EngineError::Validation(format!("cannot read csv: {}", e)))?;
    let headers = reader
        .headers()
        .map_err(|e| EngineError::Validation(format!("csv headers: {}", e)))?
        .clone();
    let mut events = Vec::new();
    for (lineno, record) in reader.records().enumerate() {
        let record =
            record.map_err(|e| EngineError::Validation(format!("row {}: {}", lineno + 2, e)))?;
        let mut user_id = None;
        let mut op = None;
        let mut day = None;
        let mut metadata = serde_json::Map::new();
        for (header, field) in headers.iter().zip(record.iter()) {
            match header {
                "user_id" => user_id = Some(field.to_string()),
                "op" => op = Some(field.to_string()),
                "day" => day = Some(field.to_string()),
                other => {
                    if let Some(name) = other.strip_prefix("metadata.") {
                        if !field.is_empty() {
                            metadata.insert(
                                name.to_string(),
                                serde_json::Value::String(field.to_string()),
                            );
                        }
                    }
                }
            }
        }
        let missing = |what: &str, row: usize| {
            EngineError::Validation(format!("row {}: missing column '{}'", row, what))
        };
        let user_id = user_id.ok_or_else(|| missing("user_id", lineno + 2))?;
        let op = op.ok_or_else(|| missing("op", lineno + 2))?;
        let day = day.ok_or_else(|| missing("day", lineno + 2))?;
        events.push(Event {
            user_id,
            op: Op::parse(&op)?,
            day: parse_day(&day)?,
            metadata: if metadata.is_empty() {
                None
            } else {
                Some(serde_json::Value::Object(metadata))
            },
        });
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_jsonl_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        let mut file = File::create(&path).unwrap();
        writeln!(file, r#"{{"user_id":"u1","op":"+","day":"2025-10-01"}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(
            file,
            r#"{{"user_id":"u2","op":"-","day":"2025-10-02","metadata":{{"source":"web"}}}}"#
        )
        .unwrap();
        let events = read_events(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].op, Op::Plus);
        assert_eq!(events[1].op, Op::Minus);
        assert!(events[1].metadata.is_some());
    }

    #[test]
    fn test_csv_with_metadata_columns() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.csv");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "user_id,op,day,metadata.source").unwrap();
        writeln!(file, "u1,+,2025-10-01,web").unwrap();
        writeln!(file, "u2,+,2025-10-01,").unwrap();
        let events = read_events(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0]
                .metadata
                .as_ref()
                .and_then(|m| m.get("source"))
                .and_then(|v| v.as_str()),
            Some("web")
        );
        assert!(events[1].metadata.is_none());
    }

    #[test]
    fn test_bad_op_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        let mut file = File::create(&path).unwrap();
        writeln!(file, r#"{{"user_id":"u1","op":"x","day":"2025-10-01"}}"#).unwrap();
        assert!(matches!(
            read_events(&path),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_unknown_extension_rejected() {
        assert!(read_events(Path::new("events.parquet")).is_err());
    }
}
