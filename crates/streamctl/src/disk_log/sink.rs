//! Append-only event files with size-based rotation.
//!
//! Each [`FileSink`] owns one file and one representation (CSV or JSON
//! lines). Before every write the file is archived to
//! `<name>.<YYYYmmdd_HHMMSS>` if it has grown past the threshold; a missing
//! file is created with a one-line provenance header.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::client::ClientError;
use crate::config::OperatingMode;
use crate::registry::StreamDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFormat {
    Csv,
    Json,
}

impl EventFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "jsonl",
        }
    }
}

/// Events as returned by a worker in one representation.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Csv(String),
    Json(Vec<serde_json::Value>),
}

impl EventPayload {
    pub fn format(&self) -> EventFormat {
        match self {
            Self::Csv(_) => EventFormat::Csv,
            Self::Json(_) => EventFormat::Json,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("failed to fetch events: {0}")]
    Fetch(#[from] ClientError),
    #[error("i/o error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("{sink:?} sink cannot write {got:?} events")]
    WrongFormat { sink: EventFormat, got: EventFormat },
}

pub trait EventSink: Send {
    fn format(&self) -> EventFormat;

    fn write(&mut self, stream: &StreamDescriptor, payload: &EventPayload) -> Result<(), SinkError>;
}

pub struct FileSink {
    format: EventFormat,
    path: PathBuf,
    rotate_bytes: u64,
    mode: OperatingMode,
}

impl FileSink {
    pub fn new(
        format: EventFormat,
        path: impl Into<PathBuf>,
        rotate_bytes: u64,
        mode: OperatingMode,
    ) -> Self {
        Self {
            format,
            path: path.into(),
            rotate_bytes,
            mode,
        }
    }

    /// `<dir>/<mode>_events.<ext>`
    pub fn for_mode(
        format: EventFormat,
        dir: &Path,
        mode: OperatingMode,
        rotate_bytes: u64,
    ) -> Self {
        let path = dir.join(format!("{}_events.{}", mode.as_str(), format.extension()));
        Self::new(format, path, rotate_bytes, mode)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: io::Error) -> SinkError {
        SinkError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn rotate_if_needed(&self) -> io::Result<Option<PathBuf>> {
        let size = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        if size <= self.rotate_bytes {
            return Ok(None);
        }

        let archived = archive_path(&self.path);
        fs::rename(&self.path, &archived)?;
        tracing::info!(
            from = %self.path.display(),
            to = %archived.display(),
            size,
            "Rotated event log"
        );
        Ok(Some(archived))
    }

    fn header(&self) -> String {
        let created = Utc::now().to_rfc3339();
        let version = crate::STREAMCTL_VERSION;
        let mode = self.mode.as_str();
        match self.format {
            EventFormat::Csv => {
                format!("# streamctl {version} {mode} event log, created {created}\n")
            }
            EventFormat::Json => {
                let header = serde_json::json!({
                    "provenance": format!("streamctl {version} {mode} event log"),
                    "createdAt": created,
                });
                format!("{header}\n")
            }
        }
    }

    fn open(&self) -> io::Result<File> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let fresh = !self.path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        if fresh {
            file.write_all(self.header().as_bytes())?;
        }
        Ok(file)
    }

    fn render(&self, stream: &StreamDescriptor, payload: &EventPayload) -> Result<String, SinkError> {
        let mut out = String::new();
        match payload {
            EventPayload::Csv(text) => {
                for line in text.lines().filter(|l| !l.trim().is_empty()) {
                    out.push_str(&format!("{},{},{}\n", stream.stream_id, stream.kind, line));
                }
            }
            EventPayload::Json(events) => {
                for event in events {
                    let mut event = event.clone();
                    if let Some(obj) = event.as_object_mut() {
                        obj.entry("streamID").or_insert(stream.stream_id.into());
                        obj.entry("streamType")
                            .or_insert(stream.kind.as_str().into());
                    }
                    out.push_str(&serde_json::to_string(&event)?);
                    out.push('\n');
                }
            }
        }
        Ok(out)
    }
}

impl EventSink for FileSink {
    fn format(&self) -> EventFormat {
        self.format
    }

    fn write(&mut self, stream: &StreamDescriptor, payload: &EventPayload) -> Result<(), SinkError> {
        if payload.format() != self.format {
            return Err(SinkError::WrongFormat {
                sink: self.format,
                got: payload.format(),
            });
        }

        let rendered = self.render(stream, payload)?;
        if rendered.is_empty() {
            return Ok(());
        }

        self.rotate_if_needed().map_err(|e| self.io_err(e))?;
        let mut file = self.open().map_err(|e| self.io_err(e))?;
        file.write_all(rendered.as_bytes())
            .and_then(|_| file.sync_data())
            .map_err(|e| self.io_err(e))?;
        Ok(())
    }
}

fn archive_path(path: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let base = path.as_os_str().to_string_lossy().into_owned();
    let mut candidate = PathBuf::from(format!("{base}.{stamp}"));
    let mut n = 1;
    while candidate.exists() {
        candidate = PathBuf::from(format!("{base}.{stamp}.{n}"));
        n += 1;
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StreamKind;

    fn stream() -> StreamDescriptor {
        StreamDescriptor::new(3, 9003, StreamKind::Receiver)
    }

    #[test]
    fn new_file_gets_header_then_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::for_mode(EventFormat::Csv, dir.path(), OperatingMode::Receive, 1 << 20);
        assert!(sink.path().ends_with("receive_events.csv"));

        sink.write(&stream(), &EventPayload::Csv("10,glitch,4\n11,glitch,2\n".into()))
            .unwrap();
        sink.write(&stream(), &EventPayload::Csv("12,glitch,1".into()))
            .unwrap();

        let text = fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("# streamctl "));
        assert!(lines[0].contains("receive event log"));
        assert_eq!(&lines[1..], ["3,receiver,10,glitch,4", "3,receiver,11,glitch,2", "3,receiver,12,glitch,1"]);
    }

    #[test]
    fn json_lines_are_tagged_with_stream() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::for_mode(EventFormat::Json, dir.path(), OperatingMode::Generate, 1 << 20);

        sink.write(
            &stream(),
            &EventPayload::Json(vec![serde_json::json!({"seq": 1}), serde_json::json!({"seq": 2})]),
        )
        .unwrap();

        let text = fs::read_to_string(sink.path()).unwrap();
        let values: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert!(values[0]["provenance"].as_str().unwrap().contains("generate"));
        assert_eq!(values[1], serde_json::json!({"seq": 1, "streamID": 3, "streamType": "receiver"}));
        assert_eq!(values.len(), 3);
    }

    #[test]
    fn rotates_when_over_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::for_mode(EventFormat::Csv, dir.path(), OperatingMode::Receive, 64);

        let row = "x".repeat(100);
        sink.write(&stream(), &EventPayload::Csv(row.clone())).unwrap();
        sink.write(&stream(), &EventPayload::Csv(row)).unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2, "files: {names:?}");
        assert!(names.iter().any(|n| n.starts_with("receive_events.csv.")));

        let current = fs::read_to_string(sink.path()).unwrap();
        assert_eq!(current.lines().count(), 2);
        assert!(current.starts_with("# streamctl "));
    }

    #[test]
    fn rejects_mismatched_payload() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::for_mode(EventFormat::Csv, dir.path(), OperatingMode::Receive, 64);
        let err = sink
            .write(&stream(), &EventPayload::Json(vec![]))
            .unwrap_err();
        assert!(matches!(err, SinkError::WrongFormat { .. }));
        assert!(!sink.path().exists());
    }

    #[test]
    fn empty_batch_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::for_mode(EventFormat::Csv, dir.path(), OperatingMode::Receive, 64);
        sink.write(&stream(), &EventPayload::Csv(String::new())).unwrap();
        assert!(!sink.path().exists());
    }
}
