//! Grid coordinates, MIDI note framing and the Launchpad palette.
//!
//! A pad at column `x`, row `y` is addressed by note `x + 10 * y`. The codec
//! does no bounds checking: a column of 10 or more aliases onto the next row.

use serde::{Deserialize, Serialize};
use std::fmt;

// MIDI status bytes
pub const NOTE_ON: u8 = 0x90;
pub const NOTE_OFF: u8 = 0x80;

pub const GRID_SIZE: u8 = 8;

/// Launchpad Mini MK3 color codes, sent as Note-On velocity.
pub mod palette {
    pub const OFF: u8 = 0;
    pub const WHITE: u8 = 3;
    pub const RED: u8 = 5;
    pub const YELLOW: u8 = 13;
    pub const GREEN: u8 = 21;
    pub const CYAN: u8 = 33;
    pub const BLUE: u8 = 45;
    pub const PURPLE: u8 = 49;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinate {
    pub x: u8,
    pub y: u8,
}

impl Coordinate {
    pub fn new(x: u8, y: u8) -> Self {
        Self { x, y }
    }

    pub fn note(&self) -> u16 {
        encode(self.x, self.y)
    }

    pub fn quadrant(&self) -> Quadrant {
        Quadrant::of(*self)
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

pub fn encode(x: u8, y: u8) -> u16 {
    u16::from(x) + 10 * u16::from(y)
}

/// Rows past 255 saturate; a 7-bit wire note never gets there.
pub fn decode(note: u16) -> Coordinate {
    let x = (note % 10) as u8;
    let y = u8::try_from(note / 10).unwrap_or(u8::MAX);
    Coordinate { x, y }
}

/// Frames a Note-On on channel 1. `None` when the note cannot be a data byte.
pub fn note_on(note: u16, velocity: u8) -> Option<[u8; 3]> {
    let note = u8::try_from(note).ok().filter(|n| *n < 0x80)?;
    Some([NOTE_ON, note, velocity & 0x7F])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quadrant {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

impl Quadrant {
    pub fn of(coordinate: Coordinate) -> Self {
        let top = coordinate.y < 4;
        let left = coordinate.x < 4;
        match (top, left) {
            (true, true) => Quadrant::TopLeft,
            (true, false) => Quadrant::TopRight,
            (false, true) => Quadrant::BottomLeft,
            (false, false) => Quadrant::BottomRight,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Quadrant::TopLeft => "Top Left",
            Quadrant::TopRight => "Top Right",
            Quadrant::BottomLeft => "Bottom Left",
            Quadrant::BottomRight => "Bottom Right",
        }
    }
}

impl fmt::Display for Quadrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl Serialize for Quadrant {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

impl<'de> Deserialize<'de> for Quadrant {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        match label.as_str() {
            "Top Left" => Ok(Quadrant::TopLeft),
            "Top Right" => Ok(Quadrant::TopRight),
            "Bottom Left" => Ok(Quadrant::BottomLeft),
            "Bottom Right" => Ok(Quadrant::BottomRight),
            other => Err(serde::de::Error::custom(format!("unknown quadrant: {}", other))),
        }
    }
}
