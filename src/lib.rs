//! Maps pads on a grid MIDI controller (Launchpad Mini MK3) to shell aliases,
//! lights them, and records every press and execution of the session.

pub mod button;
pub mod controller;
pub mod error;
pub mod executor;
pub mod grid;
pub mod midi;
pub mod sink;
pub mod telemetry;

pub use button::{Button, ButtonRegistry, LastPress};
pub use controller::{ControllerConfig, Dispatch, DispatchController, IgnoreReason, SessionPhase};
pub use error::{ConnectionError, ControllerError, ExecutionError, TelemetryError, TransportError};
pub use executor::{AliasExecutor, ExecutionRecord, ExecutionResult, ExecutionStats, ExecutorConfig};
pub use grid::{decode, encode, palette, Coordinate, Quadrant};
pub use midi::{InputCallback, MidiTransport, MidirTransport};
pub use sink::FileSink;
pub use telemetry::{
    AliasCount, AliasEvent, ButtonCount, ButtonEvent, ButtonEventKind, NullSink, SessionSummary,
    SessionTelemetry, TelemetrySink,
};
