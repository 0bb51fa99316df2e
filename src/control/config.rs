use crate::control::error::{ControlError, Result};
use crate::general::Line;
use chrono::NaiveTime;
use serde::Deserialize;
use std::path::PathBuf;

/// Launch configuration, typically deserialized from a TOML file.
///
/// ```
/// # use raildispatch::control::config::SystemConfig;
/// # use raildispatch::general::Line;
/// let config = SystemConfig::from_toml_str(
///     "lines = [\"Green\", \"Red\"]\ntime_multiplier = 4.0\n",
/// )
/// .unwrap();
/// assert_eq!(config.lines, vec![Line::Green, Line::Red]);
/// assert_eq!(config.time_multiplier, 4.0);
/// assert_eq!(config.start_of_day, "05:00");
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SystemConfig {
    /// Lines to load. The built-in layouts cover Green and Red.
    pub lines: Vec<Line>,
    /// Optional external track geometry; `None` uses the built-in layouts.
    pub track_file: Option<PathBuf>,
    /// Clock rate against wall time, clamped to 1x-10x at validation.
    pub time_multiplier: f64,
    /// Simulated time of day at startup, `HH:MM`.
    pub start_of_day: String,
}

impl Default for SystemConfig {
    fn default() -> SystemConfig {
        SystemConfig {
            lines: vec![Line::Green],
            track_file: None,
            time_multiplier: 1.0,
            start_of_day: "05:00".to_owned(),
        }
    }
}

impl SystemConfig {
    pub fn from_toml_str(raw: &str) -> Result<SystemConfig> {
        let config: SystemConfig = toml::from_str(raw)
            .map_err(|err| ControlError::InvalidInput(format!("config: {err}")))?;
        config.validated()
    }

    /// Clamps the multiplier and checks the start-of-day format.
    pub fn validated(mut self) -> Result<SystemConfig> {
        if self.lines.is_empty() {
            return Err(ControlError::InvalidInput("config names no lines".into()));
        }
        if NaiveTime::parse_from_str(&self.start_of_day, "%H:%M").is_err() {
            return Err(ControlError::InvalidInput(format!(
                "start_of_day {:?} is not HH:MM",
                self.start_of_day
            )));
        }
        self.time_multiplier = self.time_multiplier.clamp(1.0, 10.0);
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = SystemConfig::default().validated().unwrap();
        assert_eq!(config.lines, vec![Line::Green]);
        assert_eq!(config.time_multiplier, 1.0);
    }

    #[test]
    fn multiplier_clamps_instead_of_failing() {
        let config = SystemConfig::from_toml_str("time_multiplier = 99.0").unwrap();
        assert_eq!(config.time_multiplier, 10.0);
    }

    #[test]
    fn bad_input_is_rejected() {
        assert!(SystemConfig::from_toml_str("lines = []").is_err());
        assert!(SystemConfig::from_toml_str("start_of_day = \"25:99\"").is_err());
        assert!(SystemConfig::from_toml_str("no_such_field = 1").is_err());
    }
}
