//! Error types for the dispatch engine.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortDirection::Input => write!(f, "input"),
            PortDirection::Output => write!(f, "output"),
        }
    }
}

/// Fatal to the run: reported to the caller, never retried.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("no MIDI {direction} port matching '{pattern}' (available: {available:?})")]
    NoMatchingPort {
        direction: PortDirection,
        pattern: String,
        available: Vec<String>,
    },

    #[error("failed to open MIDI {direction} port '{name}': {source}")]
    Open {
        direction: PortDirection,
        name: String,
        #[source]
        source: TransportError,
    },

    #[error("MIDI transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("controller is {0} and cannot connect")]
    InvalidState(&'static str),
}

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("controller has been shut down")]
    Terminated,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("MIDI device error: {0}")]
    Device(String),

    #[error("MIDI {0} port is not open")]
    NotOpen(PortDirection),

    #[error("MIDI {0} port is already open")]
    AlreadyOpen(PortDirection),

    #[error("no MIDI {direction} port at index {index}")]
    InvalidPort {
        direction: PortDirection,
        index: usize,
    },

    #[error("MIDI port error: {0}")]
    Port(String),

    #[error("MIDI send failed: {0}")]
    Send(String),
}

impl From<midir::InitError> for TransportError {
    fn from(e: midir::InitError) -> Self {
        TransportError::Device(e.to_string())
    }
}

impl From<midir::PortInfoError> for TransportError {
    fn from(e: midir::PortInfoError) -> Self {
        TransportError::Port(e.to_string())
    }
}

impl From<midir::SendError> for TransportError {
    fn from(e: midir::SendError) -> Self {
        TransportError::Send(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Never fatal: every variant is recorded as a failed execution.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Execution timeout")]
    Timeout,

    #[error("failed to launch {shell}: {source}")]
    Spawn {
        shell: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to collect process output: {0}")]
    Wait(#[from] std::io::Error),
}
