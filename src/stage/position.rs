//! Position tracking for the two-axis stage.
//!
//! The tracker mirrors what the controller is told, not what an encoder
//! reports: every transmitted command line is fed through [`PositionTracker::apply`]
//! and the X/Y words are folded into the current position according to the
//! active coordinate mode.

use serde::{Deserialize, Serialize};

/// Absolute stage position in millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another position.
    pub fn distance_to(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "X: {:.3}, Y: {:.3}", self.x, self.y)
    }
}

/// How axis words in a command line are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinateMode {
    /// G90: axis words set the coordinate.
    Absolute,
    /// G91: axis words add to the coordinate.
    Relative,
}

/// Tracks position, coordinate mode and active feed rate from outgoing
/// command text. Performs no I/O.
#[derive(Debug, Clone)]
pub struct PositionTracker {
    position: Position,
    mode: CoordinateMode,
    feed_rate: f64,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self {
            position: Position::default(),
            mode: CoordinateMode::Absolute,
            feed_rate: 0.0,
        }
    }

    /// Fold one command line into the tracked state.
    ///
    /// Recognized tokens, case-insensitive and whitespace-delimited:
    /// `g90`/`g91` switch the coordinate mode (and apply to axis words in
    /// the same line), `x<n>`/`y<n>` move an axis, `f<n>` sets the feed
    /// rate. Anything else is passed over without error; the controller is
    /// the validation surface, not this tracker.
    pub fn apply(&mut self, line: &str) {
        let tokens: Vec<String> = line
            .split_whitespace()
            .map(|t| t.to_ascii_lowercase())
            .collect();

        // Mode switches win over axis words regardless of token order,
        // matching how GRBL treats a G90/G91 on the same line.
        if tokens.iter().any(|t| t == "g90") {
            self.mode = CoordinateMode::Absolute;
        }
        if tokens.iter().any(|t| t == "g91") {
            self.mode = CoordinateMode::Relative;
        }

        for token in &tokens {
            let Some(prefix) = token.chars().next() else {
                continue;
            };
            if !prefix.is_ascii_alphabetic() {
                continue;
            }
            let Ok(value) = token[1..].parse::<f64>() else {
                continue;
            };
            match prefix {
                'x' => match self.mode {
                    CoordinateMode::Absolute => self.position.x = value,
                    CoordinateMode::Relative => self.position.x += value,
                },
                'y' => match self.mode {
                    CoordinateMode::Absolute => self.position.y = value,
                    CoordinateMode::Relative => self.position.y += value,
                },
                'f' => self.feed_rate = value,
                _ => {}
            }
        }
    }

    pub fn position(&self) -> Position {
        self.position
    }

    /// Overwrite the tracked position, used when restoring the last known
    /// position at connect time.
    pub fn set_position(&mut self, position: Position) {
        self.position = position;
    }

    pub fn mode(&self) -> CoordinateMode {
        self.mode
    }

    /// Active feed rate in mm/min; 0.0 until an `f` word or the startup
    /// configuration sets one.
    pub fn feed_rate(&self) -> f64 {
        self.feed_rate
    }

    pub fn set_feed_rate(&mut self, feed_rate: f64) {
        self.feed_rate = feed_rate;
    }
}

impl Default for PositionTracker {
    fn default() -> Self {
        Self::new()
    }
}
