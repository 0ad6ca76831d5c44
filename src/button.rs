use crate::grid::Coordinate;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LastPress {
    pub velocity: u8,
    pub timestamp: DateTime<Utc>,
}

/// A mapped pad. `note` is fixed at registration; the counters only ever grow
/// until the coordinate is registered again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Button {
    pub coordinate: Coordinate,
    pub color: u8,
    pub alias: Option<String>,
    pub note: u16,
    pub press_count: u64,
    pub last_press: Option<LastPress>,
}

impl Button {
    pub fn new(coordinate: Coordinate, color: u8, alias: Option<String>) -> Self {
        Self {
            coordinate,
            color,
            alias,
            note: coordinate.note(),
            press_count: 0,
            last_press: None,
        }
    }
}

impl fmt::Display for Button {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(50);
        writeln!(f, "{}", rule)?;
        writeln!(f, "Button Debug Info:")?;
        writeln!(f, "  Position: {}", self.coordinate)?;
        writeln!(f, "  MIDI Note: {}", self.note)?;
        writeln!(f, "  Color: {}", self.color)?;
        writeln!(f, "  Press Count: {}", self.press_count)?;
        writeln!(f, "  Quadrant: {}", self.coordinate.quadrant())?;
        writeln!(f, "  Alias: {}", self.alias.as_deref().unwrap_or("None"))?;
        match &self.last_press {
            Some(press) => {
                writeln!(f, "  Last Press: {}", press.timestamp.to_rfc3339())?;
                writeln!(f, "  Last Velocity: {}", press.velocity)?;
            }
            None => {
                writeln!(f, "  Last Press: None")?;
                writeln!(f, "  Last Velocity: 0")?;
            }
        }
        write!(f, "{}", rule)
    }
}

/// Mapped pads keyed by coordinate, iterated in first-registration order.
#[derive(Debug, Default)]
pub struct ButtonRegistry {
    buttons: HashMap<Coordinate, Button>,
    order: Vec<Coordinate>,
}

impl ButtonRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or replaces the pad at `coordinate`. A replaced pad keeps its
    /// position in iteration order but starts over with zeroed counters.
    pub fn register(&mut self, coordinate: Coordinate, color: u8, alias: Option<String>) -> Button {
        let button = Button::new(coordinate, color, alias);
        if self.buttons.insert(coordinate, button.clone()).is_none() {
            self.order.push(coordinate);
        }
        button
    }

    pub fn lookup(&self, coordinate: Coordinate) -> Option<&Button> {
        self.buttons.get(&coordinate)
    }

    /// `None` means the coordinate is not mapped; nothing changes in that case.
    pub fn record_press(
        &mut self,
        coordinate: Coordinate,
        velocity: u8,
        timestamp: DateTime<Utc>,
    ) -> Option<&Button> {
        let button = self.buttons.get_mut(&coordinate)?;
        button.press_count += 1;
        button.last_press = Some(LastPress {
            velocity,
            timestamp,
        });
        Some(button)
    }

    pub fn all(&self) -> impl Iterator<Item = &Button> + '_ {
        self.order.iter().filter_map(|c| self.buttons.get(c))
    }

    pub fn len(&self) -> usize {
        self.buttons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buttons.is_empty()
    }
}
