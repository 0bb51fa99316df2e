use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Physical block number on a line. Block 0 is the yard.
pub type BlockId = usize;

/// Registration identity of a wayside controller.
pub type ControllerId = u32;

/// The lines this system dispatches on.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum Line {
    Green,
    Red,
}

impl Line {
    /// The letter trains of this line carry in their id.
    pub fn letter(&self) -> char {
        match self {
            Line::Green => 'G',
            Line::Red => 'R',
        }
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Line::Green => write!(f, "Green"),
            Line::Red => write!(f, "Red"),
        }
    }
}

impl FromStr for Line {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Green" | "green" => Ok(Line::Green),
            "Red" | "red" => Ok(Line::Red),
            other => Err(format!("unknown line: {other}")),
        }
    }
}

/// Train identifier: a line letter followed by three digits.
///
/// ```
/// # use raildispatch::general::{Line, TrainId};
/// let id: TrainId = "G001".parse().unwrap();
/// assert_eq!(id.line(), Some(Line::Green));
/// assert!("L001".parse::<TrainId>().is_err());
/// assert!("G01".parse::<TrainId>().is_err());
/// ```
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TrainId(String);

impl TrainId {
    /// The line encoded in the id letter.
    pub fn line(&self) -> Option<Line> {
        match self.0.chars().next() {
            Some('G') => Some(Line::Green),
            Some('R') => Some(Line::Red),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TrainId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let letter_ok = matches!(chars.next(), Some('G' | 'R'));
        let digits: Vec<char> = chars.collect();
        if letter_ok && digits.len() == 3 && digits.iter().all(|c| c.is_ascii_digit()) {
            Ok(TrainId(s.to_owned()))
        } else {
            Err(format!("train id must match [GR]ddd, got {s:?}"))
        }
    }
}

pub const MPH_PER_KMH: f64 = 0.621371;
pub const YARDS_PER_METER: f64 = 1.09361;

pub fn kmh_to_mph(kmh: f64) -> f64 {
    kmh * MPH_PER_KMH
}

pub fn kmh_to_mps(kmh: f64) -> f64 {
    kmh / 3.6
}

pub fn meters_to_yards(m: f64) -> f64 {
    m * YARDS_PER_METER
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn train_id_shapes() {
        for ok in ["G001", "R001", "G002", "R042", "G999"] {
            assert!(ok.parse::<TrainId>().is_ok(), "{ok} should parse");
        }
        for bad in ["", "123", "T", "R1", "L001", "G00", "G0001", "g001"] {
            assert!(bad.parse::<TrainId>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn line_roundtrip() {
        assert_eq!("Green".parse::<Line>().unwrap(), Line::Green);
        assert_eq!("red".parse::<Line>().unwrap(), Line::Red);
        assert_eq!(Line::Green.to_string(), "Green");
        assert_eq!(Line::Red.letter(), 'R');
    }
}
