//! File-backed telemetry for one session.
//!
//! Layout under the log directory, `<sid>` being the session id:
//!
//! - `button_presses_<sid>.json` / `alias_executions_<sid>.json`: the full
//!   stream as a JSON array, replaced on every append
//! - `button_mapping_<sid>.log` / `alias_execution_<sid>.log`: one
//!   human-readable entry per record, appended
//! - `session_summary_<sid>.json`: final roll-up, written at shutdown

use crate::error::TelemetryError;
use crate::telemetry::{AliasEvent, ButtonEvent, ButtonEventKind, SessionSummary, TelemetrySink};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct FileSink {
    dir: PathBuf,
    session_id: String,
    button_log: File,
    alias_log: File,
}

impl FileSink {
    pub fn create(dir: impl Into<PathBuf>, session_id: &str) -> Result<Self, TelemetryError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let open_log = |name: String| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(name))
        };
        let button_log = open_log(format!("button_mapping_{}.log", session_id))?;
        let alias_log = open_log(format!("alias_execution_{}.log", session_id))?;

        debug!("Telemetry files for session {} in {}", session_id, dir.display());
        Ok(Self {
            dir,
            session_id: session_id.to_string(),
            button_log,
            alias_log,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn button_events_path(&self) -> PathBuf {
        self.dir.join(format!("button_presses_{}.json", self.session_id))
    }

    pub fn alias_events_path(&self) -> PathBuf {
        self.dir.join(format!("alias_executions_{}.json", self.session_id))
    }

    pub fn summary_path(&self) -> PathBuf {
        self.dir.join(format!("session_summary_{}.json", self.session_id))
    }

    pub fn button_log_path(&self) -> PathBuf {
        self.dir.join(format!("button_mapping_{}.log", self.session_id))
    }

    pub fn alias_log_path(&self) -> PathBuf {
        self.dir.join(format!("alias_execution_{}.log", self.session_id))
    }
}

impl TelemetrySink for FileSink {
    fn persist_button_events(&mut self, events: &[ButtonEvent]) -> Result<(), TelemetryError> {
        if let Some(event) = events.last() {
            write_entry(&mut self.button_log, &format_button_entry(event))?;
        }
        write_json_atomic(&self.button_events_path(), events)
    }

    fn persist_alias_events(&mut self, events: &[AliasEvent]) -> Result<(), TelemetryError> {
        if let Some(event) = events.last() {
            write_entry(&mut self.alias_log, &format_alias_entry(event))?;
        }
        write_json_atomic(&self.alias_events_path(), events)
    }

    fn persist_summary(&mut self, summary: &SessionSummary) -> Result<(), TelemetryError> {
        write_json_atomic(&self.summary_path(), summary)
    }
}

/// Serializes to a sibling temp file, syncs it, then renames it over `path`,
/// so a reader only ever sees the previous or the new complete document.
fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), TelemetryError> {
    let tmp = path.with_extension("json.tmp");
    {
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn write_entry(log: &mut File, body: &str) -> Result<(), TelemetryError> {
    let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    writeln!(log, "{} | INFO | {}\n{}", stamp, body, "-".repeat(50))?;
    log.flush()?;
    Ok(())
}

fn format_button_entry(event: &ButtonEvent) -> String {
    let heading = match event.event_type {
        ButtonEventKind::MappingCreated => "Mapping created",
        ButtonEventKind::ButtonPressed => "Button Press",
    };
    let mut entry = format!(
        "{} at ({}, {})\nMIDI Note: {}\nMapped Alias: {}\nQuadrant: {}\nColor: {}",
        heading,
        event.x,
        event.y,
        event.note,
        event.alias.as_deref().unwrap_or("None"),
        event.quadrant,
        event.color
    );
    if let Some(velocity) = event.velocity {
        entry.push_str(&format!("\nVelocity: {}", velocity));
    }
    entry
}

fn format_alias_entry(event: &AliasEvent) -> String {
    format!(
        "Alias: {} | Status: {}\nOutput: {}\nError: {}",
        event.alias,
        if event.success { "SUCCESS" } else { "FAILED" },
        event.output.as_deref().unwrap_or("None"),
        event.error.as_deref().unwrap_or("None")
    )
}
