//! Session telemetry: the press and execution streams of one run, persisted
//! as they grow, plus roll-ups computed from them on demand.

use crate::button::Button;
use crate::error::TelemetryError;
use crate::grid::{Coordinate, Quadrant};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonEventKind {
    MappingCreated,
    ButtonPressed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonEvent {
    pub timestamp: DateTime<Utc>,
    pub x: u8,
    pub y: u8,
    pub note: u16,
    pub color: u8,
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub velocity: Option<u8>,
    pub quadrant: Quadrant,
    pub event_type: ButtonEventKind,
}

impl ButtonEvent {
    pub fn mapping_created(button: &Button) -> Self {
        Self::from_button(button, ButtonEventKind::MappingCreated, None)
    }

    pub fn pressed(button: &Button, velocity: u8) -> Self {
        Self::from_button(button, ButtonEventKind::ButtonPressed, Some(velocity))
    }

    fn from_button(button: &Button, kind: ButtonEventKind, velocity: Option<u8>) -> Self {
        Self {
            timestamp: Utc::now(),
            x: button.coordinate.x,
            y: button.coordinate.y,
            note: button.note,
            color: button.color,
            alias: button.alias.clone(),
            velocity,
            quadrant: button.coordinate.quadrant(),
            event_type: kind,
        }
    }

    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.x, self.y)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasEvent {
    pub timestamp: DateTime<Utc>,
    pub alias: String,
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonCount {
    pub coordinates: Coordinate,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasCount {
    pub alias: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub mappings_created: usize,
    pub total_button_presses: usize,
    pub total_alias_executions: usize,
    pub successful_aliases: usize,
    pub failed_aliases: usize,
    pub top_buttons: Vec<ButtonCount>,
    pub top_aliases: Vec<AliasCount>,
}

/// Where the session streams end up. Each call receives the whole stream so
/// far; implementations replace what they stored before rather than patch it.
pub trait TelemetrySink: Send {
    fn persist_button_events(&mut self, events: &[ButtonEvent]) -> Result<(), TelemetryError>;
    fn persist_alias_events(&mut self, events: &[AliasEvent]) -> Result<(), TelemetryError>;
    fn persist_summary(&mut self, summary: &SessionSummary) -> Result<(), TelemetryError>;
}

/// Keeps telemetry in memory only.
#[derive(Debug, Default)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn persist_button_events(&mut self, _events: &[ButtonEvent]) -> Result<(), TelemetryError> {
        Ok(())
    }

    fn persist_alias_events(&mut self, _events: &[AliasEvent]) -> Result<(), TelemetryError> {
        Ok(())
    }

    fn persist_summary(&mut self, _summary: &SessionSummary) -> Result<(), TelemetryError> {
        Ok(())
    }
}

struct TelemetryState {
    button_events: Vec<ButtonEvent>,
    alias_events: Vec<AliasEvent>,
    sink: Box<dyn TelemetrySink>,
}

pub struct SessionTelemetry {
    session_id: String,
    started_at: DateTime<Utc>,
    state: Mutex<TelemetryState>,
}

impl SessionTelemetry {
    pub fn new(started_at: DateTime<Utc>, sink: Box<dyn TelemetrySink>) -> Self {
        Self {
            session_id: session_id_for(started_at),
            started_at,
            state: Mutex::new(TelemetryState {
                button_events: Vec::new(),
                alias_events: Vec::new(),
                sink,
            }),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Utc::now(), Box::new(NullSink))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// The event is kept in memory even when persisting it fails.
    pub fn record_button_event(&self, event: ButtonEvent) -> Result<(), TelemetryError> {
        let mut state = self.lock_state();
        state.button_events.push(event);
        let TelemetryState {
            button_events,
            sink,
            ..
        } = &mut *state;
        sink.persist_button_events(button_events)
    }

    pub fn record_alias_event(&self, event: AliasEvent) -> Result<(), TelemetryError> {
        let mut state = self.lock_state();
        state.alias_events.push(event);
        let TelemetryState {
            alias_events, sink, ..
        } = &mut *state;
        sink.persist_alias_events(alias_events)
    }

    pub fn button_events(&self) -> Vec<ButtonEvent> {
        self.lock_state().button_events.clone()
    }

    pub fn alias_events(&self) -> Vec<AliasEvent> {
        self.lock_state().alias_events.clone()
    }

    pub fn summary(&self) -> SessionSummary {
        let state = self.lock_state();
        let presses: Vec<&ButtonEvent> = state
            .button_events
            .iter()
            .filter(|e| e.event_type == ButtonEventKind::ButtonPressed)
            .collect();
        let successful = state.alias_events.iter().filter(|e| e.success).count();

        let top_buttons = rank(presses.iter().map(|e| e.coordinate()))
            .into_iter()
            .map(|(coordinates, count)| ButtonCount { coordinates, count })
            .collect();
        let top_aliases = rank(state.alias_events.iter().map(|e| e.alias.clone()))
            .into_iter()
            .map(|(alias, count)| AliasCount { alias, count })
            .collect();

        SessionSummary {
            session_id: self.session_id.clone(),
            started_at: self.started_at,
            duration_secs: (Utc::now() - self.started_at).num_milliseconds() as f64 / 1000.0,
            mappings_created: state.button_events.len() - presses.len(),
            total_button_presses: presses.len(),
            total_alias_executions: state.alias_events.len(),
            successful_aliases: successful,
            failed_aliases: state.alias_events.len() - successful,
            top_buttons,
            top_aliases,
        }
    }

    /// Computes the summary and writes it as the session snapshot.
    pub fn finalize(&self) -> SessionSummary {
        let summary = self.summary();
        if let Err(e) = self.lock_state().sink.persist_summary(&summary) {
            warn!("Failed to write session summary snapshot: {}", e);
        }
        info!("Session {} finalized", self.session_id);
        summary
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, TelemetryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Second resolution, safe in file names.
pub fn session_id_for(started_at: DateTime<Utc>) -> String {
    started_at.format("%Y%m%d_%H%M%S").to_string()
}

/// Frequency table, highest count first, ties in first-seen order.
fn rank<K: Eq + Hash + Clone>(keys: impl Iterator<Item = K>) -> Vec<(K, usize)> {
    let mut index: HashMap<K, usize> = HashMap::new();
    let mut counts: Vec<(K, usize)> = Vec::new();
    for key in keys {
        match index.get(&key) {
            Some(&i) => counts[i].1 += 1,
            None => {
                index.insert(key.clone(), counts.len());
                counts.push((key, 1));
            }
        }
    }
    // sort_by is stable, so first-seen order survives among equal counts
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts
}
